use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use sqlx::types::Json;

use crate::models::anomaly::{Anomaly, AnomalyCount, AnomalyType, AnomalyWithClient, NewAnomaly};

#[derive(Debug, Clone)]
pub struct AnomalyRepository {
    pool: SqlitePool,
}

impl AnomalyRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, anomaly: &NewAnomaly) -> Result<Anomaly> {
        sqlx::query_as::<_, Anomaly>(
            r#"
            INSERT INTO anomalies (client_id, anomaly_type, severity, score, description, metrics, detected_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(anomaly.client_id)
        .bind(anomaly.anomaly_type.as_str())
        .bind(anomaly.severity.as_str())
        .bind(anomaly.score)
        .bind(&anomaly.description)
        .bind(Json(&anomaly.metrics))
        .bind(anomaly.detected_at)
        .fetch_one(&self.pool)
        .await
        .context("Failed to create anomaly")
    }

    pub async fn get_by_id(&self, id: i64) -> Result<Option<Anomaly>> {
        sqlx::query_as::<_, Anomaly>("SELECT * FROM anomalies WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch anomaly by ID")
    }

    /// Unresolved anomaly of the same kind for the client recorded at or after `since`.
    pub async fn find_recent_unresolved(
        &self,
        client_id: i64,
        anomaly_type: AnomalyType,
        since: DateTime<Utc>,
    ) -> Result<Option<Anomaly>> {
        sqlx::query_as::<_, Anomaly>(
            r#"
            SELECT * FROM anomalies
            WHERE client_id = ? AND anomaly_type = ? AND resolved = 0 AND detected_at >= ?
            ORDER BY detected_at DESC
            LIMIT 1
            "#,
        )
        .bind(client_id)
        .bind(anomaly_type.as_str())
        .bind(since)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to look up recent anomaly")
    }

    pub async fn list_recent(&self, limit: i64) -> Result<Vec<AnomalyWithClient>> {
        sqlx::query_as::<_, AnomalyWithClient>(
            r#"
            SELECT a.*, c.email AS client_email
            FROM anomalies a
            JOIN clients c ON c.id = a.client_id
            ORDER BY a.detected_at DESC, a.id DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list anomalies")
    }

    pub async fn resolve(
        &self,
        id: i64,
        resolved_by: &str,
        notes: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<Option<Anomaly>> {
        sqlx::query_as::<_, Anomaly>(
            r#"
            UPDATE anomalies
            SET resolved = 1, resolved_at = ?, resolved_by = ?, notes = ?
            WHERE id = ?
            RETURNING *
            "#,
        )
        .bind(at)
        .bind(resolved_by)
        .bind(notes)
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to resolve anomaly")
    }

    pub async fn counts_since(&self, since: DateTime<Utc>) -> Result<Vec<AnomalyCount>> {
        sqlx::query_as::<_, AnomalyCount>(
            r#"
            SELECT anomaly_type, severity, COUNT(*) AS count
            FROM anomalies
            WHERE detected_at >= ?
            GROUP BY anomaly_type, severity
            ORDER BY anomaly_type ASC, severity ASC
            "#,
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .context("Failed to count anomalies")
    }

    pub async fn unresolved_count(&self) -> Result<i64> {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM anomalies WHERE resolved = 0")
            .fetch_one(&self.pool)
            .await
            .context("Failed to count unresolved anomalies")
    }
}
