use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};
use xpanel_db::models::traffic::NewSnapshot;
use xpanel_db::repositories::client_repo::ClientRepository;
use xpanel_db::repositories::traffic_repo::TrafficRepository;

use crate::error::Result;
use crate::xray::stats::StatsSource;

/// Bytes per second attributed to one connection by the estimate below.
pub const BYTES_PER_CONNECTION: f64 = 50_000.0;
pub const RETENTION_DAYS: i64 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterReading {
    pub up: u64,
    pub down: u64,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateSample {
    pub up_delta: u64,
    pub down_delta: u64,
    pub up_rate: f64,
    pub down_rate: f64,
    pub total_rate: f64,
    pub connection_count: i64,
}

/// A counter that went backwards was reset by a proxy restart; everything
/// it shows now is new traffic.
pub fn counter_delta(previous: u64, current: u64) -> u64 {
    if current >= previous { current - previous } else { current }
}

/// `max(1, ceil(rate / 50 kB/s))`. Not a real connection count.
pub fn estimate_connections(total_rate: f64) -> i64 {
    (total_rate / BYTES_PER_CONNECTION).ceil().max(1.0) as i64
}

/// Rates between two readings, `None` unless time moved forward.
pub fn compute_sample(previous: &CounterReading, current: &CounterReading) -> Option<RateSample> {
    let elapsed_ms = (current.at - previous.at).num_milliseconds();
    if elapsed_ms <= 0 {
        return None;
    }
    let secs = elapsed_ms as f64 / 1000.0;

    let up_delta = counter_delta(previous.up, current.up);
    let down_delta = counter_delta(previous.down, current.down);
    let up_rate = up_delta as f64 / secs;
    let down_rate = down_delta as f64 / secs;
    let total_rate = up_rate + down_rate;

    Some(RateSample {
        up_delta,
        down_delta,
        up_rate,
        down_rate,
        total_rate,
        connection_count: estimate_connections(total_rate),
    })
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectionReport {
    pub polled: usize,
    pub recorded: u64,
    pub seeded: usize,
    pub failed: usize,
    pub purged: u64,
}

/// Turns cumulative per-user counters into rate snapshots.
pub struct TrafficCollector {
    clients: ClientRepository,
    traffic: TrafficRepository,
    stats: Arc<dyn StatsSource>,
    /// Last reading per client id. Lives as long as this collector.
    last_seen: Mutex<HashMap<i64, CounterReading>>,
}

impl TrafficCollector {
    pub fn new(clients: ClientRepository, traffic: TrafficRepository, stats: Arc<dyn StatsSource>) -> Self {
        Self {
            clients,
            traffic,
            stats,
            last_seen: Mutex::new(HashMap::new()),
        }
    }

    pub async fn collect(&self) -> Result<CollectionReport> {
        self.collect_at(Utc::now()).await
    }

    pub async fn collect_at(&self, now: DateTime<Utc>) -> Result<CollectionReport> {
        let clients = self.clients.get_enabled().await?;
        let mut report = CollectionReport::default();
        let mut snapshots = Vec::new();

        for client in &clients {
            report.polled += 1;
            let counters = match self.stats.user_stats(&client.email).await {
                Ok(counters) => counters,
                Err(e) => {
                    debug!("Stats unavailable for {}: {}", client.email, e);
                    report.failed += 1;
                    continue;
                }
            };
            let reading = CounterReading {
                up: counters.uplink(),
                down: counters.downlink(),
                at: now,
            };

            let previous = self.remember(client.id, reading);
            let Some(previous) = previous else {
                report.seeded += 1;
                continue;
            };
            let Some(sample) = compute_sample(&previous, &reading) else {
                continue;
            };

            if sample.up_delta > 0 || sample.down_delta > 0 {
                if let Err(e) = self.clients.add_traffic(client.id, sample.up_delta, sample.down_delta).await {
                    warn!("⚠️ Failed to add traffic for {}: {}", client.email, e);
                }
            }
            snapshots.push(NewSnapshot {
                client_id: client.id,
                timestamp: now,
                up_rate: sample.up_rate,
                down_rate: sample.down_rate,
                total_rate: sample.total_rate,
                connection_count: sample.connection_count,
            });
        }

        let enabled: HashSet<i64> = clients.iter().map(|c| c.id).collect();
        self.lock().retain(|id, _| enabled.contains(id));

        report.recorded = self.traffic.insert_many(&snapshots).await?;
        report.purged = self
            .traffic
            .delete_older_than(now - Duration::days(RETENTION_DAYS))
            .await?;

        if report.failed > 0 && report.failed == report.polled {
            warn!("⚠️ Traffic collection: stats endpoint unreachable for all {} clients", report.failed);
        } else if report.recorded > 0 || report.purged > 0 {
            info!(
                "📈 Traffic collected: {} snapshots, {} purged, {} failed",
                report.recorded, report.purged, report.failed
            );
        }
        Ok(report)
    }

    /// Stores `reading` unless it is not newer than what we have; returns the previous one.
    fn remember(&self, client_id: i64, reading: CounterReading) -> Option<CounterReading> {
        let mut seen = self.lock();
        match seen.get(&client_id).copied() {
            Some(previous) if reading.at <= previous.at => Some(previous),
            previous => {
                seen.insert(client_id, reading);
                previous
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<i64, CounterReading>> {
        self.last_seen.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
