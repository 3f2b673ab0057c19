use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::models::traffic::{NewSnapshot, TrafficSnapshot, WindowAverages};

#[derive(Debug, Clone)]
pub struct TrafficRepository {
    pool: SqlitePool,
}

impl TrafficRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert_many(&self, snapshots: &[NewSnapshot]) -> Result<u64> {
        if snapshots.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        for snapshot in snapshots {
            sqlx::query(
                r#"
                INSERT INTO traffic_snapshots (client_id, timestamp, up_rate, down_rate, total_rate, connection_count)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(snapshot.client_id)
            .bind(snapshot.timestamp)
            .bind(snapshot.up_rate)
            .bind(snapshot.down_rate)
            .bind(snapshot.total_rate)
            .bind(snapshot.connection_count)
            .execute(&mut *tx)
            .await
            .context("Failed to insert traffic snapshot")?;
        }
        tx.commit().await?;

        Ok(snapshots.len() as u64)
    }

    /// All snapshots at or after `since`, oldest first.
    pub async fn since(&self, since: DateTime<Utc>) -> Result<Vec<TrafficSnapshot>> {
        sqlx::query_as::<_, TrafficSnapshot>(
            "SELECT * FROM traffic_snapshots WHERE timestamp >= ? ORDER BY timestamp ASC, id ASC",
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch traffic snapshots")
    }

    pub async fn for_client_since(&self, client_id: i64, since: DateTime<Utc>) -> Result<Vec<TrafficSnapshot>> {
        sqlx::query_as::<_, TrafficSnapshot>(
            "SELECT * FROM traffic_snapshots WHERE client_id = ? AND timestamp >= ? ORDER BY timestamp ASC, id ASC",
        )
        .bind(client_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch client snapshots")
    }

    /// Mean total rate and connection estimate in `[from, to)`.
    pub async fn averages(&self, client_id: i64, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<WindowAverages> {
        sqlx::query_as::<_, WindowAverages>(
            r#"
            SELECT AVG(total_rate) AS avg_rate,
                   AVG(CAST(connection_count AS REAL)) AS avg_connections,
                   COUNT(*) AS samples
            FROM traffic_snapshots
            WHERE client_id = ? AND timestamp >= ? AND timestamp < ?
            "#,
        )
        .bind(client_id)
        .bind(from)
        .bind(to)
        .fetch_one(&self.pool)
        .await
        .context("Failed to compute traffic averages")
    }

    pub async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM traffic_snapshots WHERE timestamp < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .context("Failed to purge traffic snapshots")?;
        tracing::debug!("Purged {} traffic snapshots older than {}", result.rows_affected(), cutoff);
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::client::NewClient;
    use crate::models::inbound::{NewInbound, Network, Protocol, Security};
    use crate::repositories::{client_repo::ClientRepository, inbound_repo::InboundRepository};
    use chrono::Duration;
    use serde_json::json;

    async fn setup() -> (TrafficRepository, i64) {
        let pool = crate::connect_memory().await.unwrap();
        let inbound = InboundRepository::new(pool.clone())
            .create(&NewInbound {
                user_id: 1,
                remark: None,
                protocol: Protocol::Vmess,
                port: 10086,
                listen: "0.0.0.0".into(),
                tag: "vmess-in".into(),
                settings: json!({}),
                network: Network::Ws,
                security: Security::None,
                stream_settings: None,
                tls_settings: None,
                reality_settings: None,
                sniffing: None,
                is_active: true,
            })
            .await
            .unwrap();
        let client = ClientRepository::new(pool.clone())
            .create(&NewClient {
                inbound_id: inbound.id,
                email: "c@x".into(),
                uuid: Some("0b0f5a3e-9f49-4b8b-8d0e-7d3f3c6b2c11".into()),
                password: None,
                flow: None,
                traffic_limit: 0,
                expiry_time: None,
                enable: true,
            })
            .await
            .unwrap();
        (TrafficRepository::new(pool), client.id)
    }

    fn snapshot(client_id: i64, at: DateTime<Utc>, rate: f64) -> NewSnapshot {
        NewSnapshot {
            client_id,
            timestamp: at,
            up_rate: rate / 2.0,
            down_rate: rate / 2.0,
            total_rate: rate,
            connection_count: 1,
        }
    }

    #[tokio::test]
    async fn averages_cover_half_open_window() {
        let (repo, client_id) = setup().await;
        let now = Utc::now();
        repo.insert_many(&[
            snapshot(client_id, now - Duration::minutes(50), 1000.0),
            snapshot(client_id, now - Duration::minutes(20), 3000.0),
            snapshot(client_id, now - Duration::minutes(5), 90_000.0),
        ])
        .await
        .unwrap();

        let avg = repo
            .averages(client_id, now - Duration::hours(1), now - Duration::minutes(10))
            .await
            .unwrap();
        assert_eq!(avg.samples, 2);
        assert_eq!(avg.avg_rate, Some(2000.0));
        assert_eq!(avg.avg_connections, Some(1.0));
    }

    #[tokio::test]
    async fn empty_window_has_no_average() {
        let (repo, client_id) = setup().await;
        let now = Utc::now();
        let avg = repo.averages(client_id, now - Duration::hours(1), now).await.unwrap();
        assert_eq!(avg.samples, 0);
        assert!(avg.avg_rate.is_none());
    }

    #[tokio::test]
    async fn purge_removes_only_old_rows() {
        let (repo, client_id) = setup().await;
        let now = Utc::now();
        repo.insert_many(&[
            snapshot(client_id, now - Duration::days(8), 1.0),
            snapshot(client_id, now - Duration::days(1), 1.0),
        ])
        .await
        .unwrap();

        let removed = repo.delete_older_than(now - Duration::days(7)).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(repo.since(now - Duration::days(30)).await.unwrap().len(), 1);
    }
}
