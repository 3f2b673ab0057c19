use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use sqlx::types::Json;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AiModel {
    pub id: i64,
    pub name: String,
    pub version: String,
    pub model_path: String,
    pub accuracy: f64,
    pub sample_count: i64,
    pub config: Json<Value>,
    pub is_active: bool,
    pub trained_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewAiModel {
    pub name: String,
    pub version: String,
    pub model_path: String,
    pub accuracy: f64,
    pub sample_count: i64,
    pub config: Value,
    pub trained_at: DateTime<Utc>,
}
