use async_trait::async_trait;
use std::time::Duration;
use sysinfo::System;
use tracing::debug;
use xpanel_shared::stats::{StatsQuery, StatsResponse};
use xpanel_shared::status::SystemStats;

use crate::error::{PanelError, Result};

/// Counter source for the traffic pipeline.
#[async_trait]
pub trait StatsSource: Send + Sync {
    async fn user_stats(&self, email: &str) -> Result<StatsResponse>;
    async fn inbound_stats(&self, tag: &str) -> Result<StatsResponse>;
}

/// HTTP client for the proxy's loopback stats endpoint.
#[derive(Debug, Clone)]
pub struct XrayStatsClient {
    http: reqwest::Client,
    endpoint: String,
}

impl XrayStatsClient {
    pub fn new(host: &str, port: u16, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build stats HTTP client: {}", e))?;
        Ok(Self {
            http,
            endpoint: format!("http://{}:{}/stats", host, port),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub async fn query(&self, query: &StatsQuery) -> Result<StatsResponse> {
        debug!("Querying Xray stats: pattern='{}' reset={}", query.pattern, query.reset);

        let response = self
            .http
            .post(&self.endpoint)
            .json(query)
            .send()
            .await
            .map_err(|e| PanelError::StatsUnreachable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PanelError::StatsUnreachable(format!("{} answered HTTP {}", self.endpoint, status)));
        }

        response
            .json::<StatsResponse>()
            .await
            .map_err(|e| PanelError::StatsUnreachable(format!("malformed stats response: {}", e)))
    }

    pub async fn get_user_stats(&self, email: &str) -> Result<StatsResponse> {
        self.query(&StatsQuery::user(email)).await
    }

    pub async fn get_inbound_stats(&self, tag: &str) -> Result<StatsResponse> {
        self.query(&StatsQuery::inbound(tag)).await
    }

    pub async fn get_all_stats(&self) -> Result<StatsResponse> {
        self.query(&StatsQuery::all()).await
    }

    /// Reads and zeroes the proxy-side counters of one user.
    pub async fn reset_stats(&self, email: &str) -> Result<StatsResponse> {
        let mut query = StatsQuery::user(email);
        query.reset = true;
        self.query(&query).await
    }
}

#[async_trait]
impl StatsSource for XrayStatsClient {
    async fn user_stats(&self, email: &str) -> Result<StatsResponse> {
        self.get_user_stats(email).await
    }

    async fn inbound_stats(&self, tag: &str) -> Result<StatsResponse> {
        self.get_inbound_stats(tag).await
    }
}

/// Host load, memory and uptime.
pub fn system_stats() -> SystemStats {
    let mut sys = System::new();
    sys.refresh_memory();
    let load = System::load_average();

    SystemStats {
        load_average: [load.one, load.five, load.fifteen],
        total_memory: sys.total_memory(),
        used_memory: sys.used_memory(),
        uptime_secs: System::uptime(),
    }
}
