use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::text_enum;

text_enum!(
    ServerType, "server type" {
        Master => "MASTER",
        Slave => "SLAVE",
    }
);

text_enum!(
    ServerStatus, "server status" {
        Pending => "PENDING",
        Online => "ONLINE",
        Offline => "OFFLINE",
        Error => "ERROR",
    }
);

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Server {
    pub id: i64,
    pub name: String,
    pub hostname: String,
    pub port: u16,
    #[sqlx(try_from = "String")]
    pub server_type: ServerType,
    #[sqlx(try_from = "String")]
    pub status: ServerStatus,
    pub api_key: String,
    #[serde(skip_serializing)]
    pub api_secret_hash: String,
    pub max_clients: i64,
    pub current_clients: i64,
    pub country: Option<String>,
    pub city: Option<String>,
    pub cpu_usage: f64,
    pub ram_usage: f64,
    pub disk_usage: f64,
    /// Milliseconds.
    pub response_time: Option<i64>,
    pub version: Option<String>,
    pub uptime: Option<i64>,
    pub notes: Option<String>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub config_version: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewServer {
    pub name: String,
    pub hostname: String,
    pub port: u16,
    pub server_type: ServerType,
    pub api_key: String,
    pub api_secret_hash: String,
    pub max_clients: i64,
    pub country: Option<String>,
    pub city: Option<String>,
    pub notes: Option<String>,
}

/// Figures reported by a successful health probe.
#[derive(Debug, Clone, Default)]
pub struct ServerHealth {
    pub response_time: i64,
    pub version: Option<String>,
    pub uptime: Option<i64>,
    pub cpu_usage: Option<f64>,
    pub ram_usage: Option<f64>,
    pub disk_usage: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ServerClient {
    pub server_id: i64,
    pub client_id: i64,
    pub assigned_at: DateTime<Utc>,
}
