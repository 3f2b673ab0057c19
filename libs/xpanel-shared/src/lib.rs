use serde::{Deserialize, Serialize};

/// Wire format of the proxy's local stats endpoint.
pub mod stats {
    use super::*;

    pub const QUERY_STATS: &str = "QueryStats";

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct StatsQuery {
        pub command: String,
        pub pattern: String,
        pub reset: bool,
    }

    impl StatsQuery {
        pub fn new(pattern: impl Into<String>, reset: bool) -> Self {
            Self {
                command: QUERY_STATS.to_string(),
                pattern: pattern.into(),
                reset,
            }
        }

        pub fn user(email: &str) -> Self {
            Self::new(format!("user>>>{}>>>traffic>>>", email), false)
        }

        pub fn inbound(tag: &str) -> Self {
            Self::new(format!("inbound>>>{}>>>traffic>>>", tag), false)
        }

        pub fn all() -> Self {
            Self::new("", false)
        }
    }

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    pub struct StatsResponse {
        #[serde(default)]
        pub stat: Vec<Stat>,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Stat {
        pub name: String,
        #[serde(default, deserialize_with = "counter::deserialize")]
        pub value: u64,
    }

    impl StatsResponse {
        /// Sum of the counters whose name contains `direction` ("uplink" / "downlink").
        pub fn total(&self, direction: &str) -> u64 {
            self.stat
                .iter()
                .filter(|s| s.name.contains(direction))
                .fold(0u64, |acc, s| acc.saturating_add(s.value))
        }

        pub fn uplink(&self) -> u64 {
            self.total("uplink")
        }

        pub fn downlink(&self) -> u64 {
            self.total("downlink")
        }
    }

    mod counter {
        use serde::{Deserialize, Deserializer, de};

        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(u64),
            Signed(i64),
            Text(String),
        }

        /// Counters arrive as JSON numbers or as decimal strings.
        pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
            match Raw::deserialize(deserializer)? {
                Raw::Number(v) => Ok(v),
                Raw::Signed(v) => Ok(v.max(0) as u64),
                Raw::Text(s) => s.trim().parse::<u64>().map_err(de::Error::custom),
            }
        }
    }
}

/// Process status reported by the panel.
pub mod status {
    use super::*;

    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    pub enum ProcessPhase {
        #[default]
        Stopped,
        Starting,
        Running,
        Stopping,
        Crashed,
    }

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    pub struct ProcessStatus {
        pub running: bool,
        pub phase: ProcessPhase,
        pub pid: Option<u32>,
        pub uptime_ms: u64,
        pub restart_attempts: u32,
        /// Last failure nobody was waiting on, e.g. an exhausted restart budget.
        pub last_error: Option<String>,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct SystemStats {
        pub load_average: [f64; 3],
        pub total_memory: u64,
        pub used_memory: u64,
        pub uptime_secs: u64,
    }
}

/// Slave node health endpoint.
pub mod node {
    use super::*;

    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    pub struct HealthReport {
        pub version: Option<String>,
        pub uptime: Option<i64>,
        pub cpu: Option<f64>,
        pub ram: Option<f64>,
        pub disk: Option<f64>,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct ConfigSyncRequest {
        pub inbounds: Vec<serde_json::Value>,
        pub timestamp: String,
    }
}

#[cfg(test)]
mod tests {
    use super::stats::*;

    #[test]
    fn user_pattern_matches_xray_naming() {
        let q = StatsQuery::user("alice@example.com");
        assert_eq!(q.pattern, "user>>>alice@example.com>>>traffic>>>");
        assert_eq!(q.command, "QueryStats");
        assert!(!q.reset);
    }

    #[test]
    fn counters_accept_numbers_and_strings() {
        let raw = r#"{"stat":[
            {"name":"user>>>a>>>traffic>>>uplink","value":"18446744073709551615"},
            {"name":"user>>>a>>>traffic>>>downlink","value":2048},
            {"name":"user>>>b>>>traffic>>>downlink"}
        ]}"#;
        let resp: StatsResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(resp.uplink(), u64::MAX);
        assert_eq!(resp.downlink(), 2048);
    }

    #[test]
    fn empty_body_has_no_counters() {
        let resp: StatsResponse = serde_json::from_str("{}").unwrap();
        assert_eq!(resp.uplink(), 0);
    }
}
