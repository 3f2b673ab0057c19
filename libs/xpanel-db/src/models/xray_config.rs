use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use sqlx::types::Json;

/// A stored proxy configuration document. At most one row is active.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct XrayConfigRecord {
    pub id: i64,
    pub document: Json<Value>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
