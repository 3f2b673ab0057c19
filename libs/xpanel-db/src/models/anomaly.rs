use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use sqlx::types::Json;

use super::text_enum;

text_enum!(
    AnomalyType, "anomaly type" {
        Spike => "SPIKE",
        Ddos => "DDOS",
        UnusualTime => "UNUSUAL_TIME",
        SustainedHigh => "SUSTAINED_HIGH",
    }
);

text_enum!(
    Severity, "severity" {
        Low => "LOW",
        Medium => "MEDIUM",
        High => "HIGH",
        Critical => "CRITICAL",
    }
);

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Anomaly {
    pub id: i64,
    pub client_id: i64,
    #[serde(rename = "type")]
    #[sqlx(try_from = "String")]
    pub anomaly_type: AnomalyType,
    #[sqlx(try_from = "String")]
    pub severity: Severity,
    pub score: f64,
    pub description: String,
    pub metrics: Json<Value>,
    pub detected_at: DateTime<Utc>,
    pub resolved: bool,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewAnomaly {
    pub client_id: i64,
    pub anomaly_type: AnomalyType,
    pub severity: Severity,
    pub score: f64,
    pub description: String,
    pub metrics: Value,
    pub detected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AnomalyWithClient {
    #[serde(flatten)]
    #[sqlx(flatten)]
    pub anomaly: Anomaly,
    pub client_email: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AnomalyCount {
    #[serde(rename = "type")]
    #[sqlx(try_from = "String")]
    pub anomaly_type: AnomalyType,
    #[sqlx(try_from = "String")]
    pub severity: Severity,
    pub count: i64,
}
