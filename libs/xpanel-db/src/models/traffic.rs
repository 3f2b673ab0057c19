use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TrafficSnapshot {
    pub id: i64,
    pub client_id: i64,
    pub timestamp: DateTime<Utc>,
    pub up_rate: f64,
    pub down_rate: f64,
    pub total_rate: f64,
    pub connection_count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewSnapshot {
    pub client_id: i64,
    pub timestamp: DateTime<Utc>,
    pub up_rate: f64,
    pub down_rate: f64,
    pub total_rate: f64,
    pub connection_count: i64,
}

/// Mean rate and connection estimate over a window; `None` when the window is empty.
#[derive(Debug, Clone, Default, Serialize, Deserialize, FromRow)]
pub struct WindowAverages {
    pub avg_rate: Option<f64>,
    pub avg_connections: Option<f64>,
    pub samples: i64,
}
