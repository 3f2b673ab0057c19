use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::counters;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Client {
    pub id: i64,
    pub inbound_id: i64,
    pub email: String,
    pub uuid: Option<String>,
    pub password: Option<String>,
    pub flow: Option<String>,
    /// Byte cap, 0 = unlimited.
    pub traffic_limit: i64,
    pub expiry_time: Option<DateTime<Utc>>,
    pub enable: bool,
    pub up: i64,
    pub down: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Client {
    pub fn up_bytes(&self) -> u64 {
        counters::from_column(self.up)
    }

    pub fn down_bytes(&self) -> u64 {
        counters::from_column(self.down)
    }

    pub fn total_bytes(&self) -> u64 {
        self.up_bytes().saturating_add(self.down_bytes())
    }

    pub fn limit_bytes(&self) -> u64 {
        counters::from_column(self.traffic_limit)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiry_time.is_some_and(|at| at <= now)
    }

    pub fn is_over_limit(&self) -> bool {
        let limit = self.limit_bytes();
        limit > 0 && self.total_bytes() >= limit
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewClient {
    pub inbound_id: i64,
    pub email: String,
    pub uuid: Option<String>,
    pub password: Option<String>,
    pub flow: Option<String>,
    pub traffic_limit: u64,
    pub expiry_time: Option<DateTime<Utc>>,
    pub enable: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ClientFilter {
    pub inbound_id: Option<i64>,
    /// Restricts to clients of inbounds owned by this user.
    pub owner_id: Option<i64>,
    pub search: Option<String>,
    pub enable: Option<bool>,
    pub expired: Option<bool>,
    pub page: u32,
    pub limit: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn client(limit: u64, up: u64, down: u64) -> Client {
        let now = Utc::now();
        Client {
            id: 1,
            inbound_id: 1,
            email: "a@example.com".into(),
            uuid: None,
            password: Some("secret".into()),
            flow: None,
            traffic_limit: counters::to_column(limit),
            expiry_time: None,
            enable: true,
            up: counters::to_column(up),
            down: counters::to_column(down),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn zero_limit_means_unlimited() {
        assert!(!client(0, u64::MAX, u64::MAX).is_over_limit());
    }

    #[test]
    fn cap_is_reached_at_equality() {
        assert!(client(1_000, 600, 400).is_over_limit());
        assert!(!client(1_000, 600, 399).is_over_limit());
    }

    #[test]
    fn expiry_in_the_past_is_expired() {
        let now = Utc::now();
        let mut c = client(0, 0, 0);
        assert!(!c.is_expired(now));
        c.expiry_time = Some(now - Duration::seconds(1));
        assert!(c.is_expired(now));
        c.expiry_time = Some(now + Duration::days(1));
        assert!(!c.is_expired(now));
    }
}
