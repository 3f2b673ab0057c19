use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::Value;
use sqlx::types::Json;
use sqlx::{Sqlite, SqliteConnection, SqlitePool, Transaction};

use crate::models::xray_config::XrayConfigRecord;

/// Stored proxy configurations.
///
/// Activation goes through a caller-owned transaction so the caller can put
/// the file write between "row is active" and "commit".
#[derive(Debug, Clone)]
pub struct ConfigRepository {
    pool: SqlitePool,
}

impl ConfigRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>> {
        self.pool.begin().await.context("Failed to start transaction")
    }

    pub async fn get_active(&self) -> Result<Option<XrayConfigRecord>> {
        sqlx::query_as::<_, XrayConfigRecord>("SELECT * FROM xray_configs WHERE is_active = 1 LIMIT 1")
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch active config")
    }

    pub async fn get_by_id(&self, id: i64) -> Result<Option<XrayConfigRecord>> {
        sqlx::query_as::<_, XrayConfigRecord>("SELECT * FROM xray_configs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch config by ID")
    }

    pub async fn count_active(&self) -> Result<i64> {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM xray_configs WHERE is_active = 1")
            .fetch_one(&self.pool)
            .await
            .context("Failed to count active configs")
    }

    pub async fn deactivate_all(conn: &mut SqliteConnection) -> Result<()> {
        sqlx::query("UPDATE xray_configs SET is_active = 0, updated_at = ? WHERE is_active = 1")
            .bind(Utc::now())
            .execute(&mut *conn)
            .await
            .context("Failed to deactivate configs")?;
        Ok(())
    }

    pub async fn insert_active(conn: &mut SqliteConnection, document: &Value) -> Result<XrayConfigRecord> {
        let now = Utc::now();
        sqlx::query_as::<_, XrayConfigRecord>(
            "INSERT INTO xray_configs (document, is_active, created_at, updated_at) VALUES (?, 1, ?, ?) RETURNING *",
        )
        .bind(Json(document))
        .bind(now)
        .bind(now)
        .fetch_one(&mut *conn)
        .await
        .context("Failed to store config")
    }

    pub async fn activate(conn: &mut SqliteConnection, id: i64, document: &Value) -> Result<XrayConfigRecord> {
        sqlx::query_as::<_, XrayConfigRecord>(
            "UPDATE xray_configs SET is_active = 1, document = ?, updated_at = ? WHERE id = ? RETURNING *",
        )
        .bind(Json(document))
        .bind(Utc::now())
        .bind(id)
        .fetch_one(&mut *conn)
        .await
        .context("Failed to activate config")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn only_one_row_stays_active() {
        let pool = crate::connect_memory().await.unwrap();
        let repo = ConfigRepository::new(pool);

        for n in 0..3 {
            let mut tx = repo.begin().await.unwrap();
            ConfigRepository::deactivate_all(&mut tx).await.unwrap();
            ConfigRepository::insert_active(&mut tx, &json!({"n": n})).await.unwrap();
            tx.commit().await.unwrap();
        }

        assert_eq!(repo.count_active().await.unwrap(), 1);
        let active = repo.get_active().await.unwrap().unwrap();
        assert_eq!(active.document.0["n"], 2);
    }

    #[tokio::test]
    async fn second_active_row_is_rejected_by_the_schema() {
        let pool = crate::connect_memory().await.unwrap();
        let repo = ConfigRepository::new(pool);

        let mut tx = repo.begin().await.unwrap();
        ConfigRepository::insert_active(&mut tx, &json!({})).await.unwrap();
        assert!(ConfigRepository::insert_active(&mut tx, &json!({})).await.is_err());
    }
}
