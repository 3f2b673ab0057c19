use anyhow::{Context, Result};
use sqlx::SqlitePool;
use sqlx::types::Json;

use crate::models::ai_model::{AiModel, NewAiModel};

#[derive(Debug, Clone)]
pub struct ModelRepository {
    pool: SqlitePool,
}

impl ModelRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get_active(&self) -> Result<Option<AiModel>> {
        sqlx::query_as::<_, AiModel>("SELECT * FROM ai_models WHERE is_active = 1 LIMIT 1")
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch active model")
    }

    /// Stores `model` as the only active model.
    pub async fn create_active(&self, model: &NewAiModel) -> Result<AiModel> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("UPDATE ai_models SET is_active = 0 WHERE is_active = 1")
            .execute(&mut *tx)
            .await
            .context("Failed to deactivate models")?;

        let created = sqlx::query_as::<_, AiModel>(
            r#"
            INSERT INTO ai_models (name, version, model_path, accuracy, sample_count, config, is_active, trained_at)
            VALUES (?, ?, ?, ?, ?, ?, 1, ?)
            RETURNING *
            "#,
        )
        .bind(&model.name)
        .bind(&model.version)
        .bind(&model.model_path)
        .bind(model.accuracy)
        .bind(model.sample_count)
        .bind(Json(&model.config))
        .bind(model.trained_at)
        .fetch_one(&mut *tx)
        .await
        .context("Failed to store model")?;

        tx.commit().await?;
        Ok(created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    #[tokio::test]
    async fn newest_model_replaces_active_one() {
        let pool = crate::connect_memory().await.unwrap();
        let repo = ModelRepository::new(pool);
        let model = |path: &str| NewAiModel {
            name: "Traffic Anomaly Detector".into(),
            version: "1.0".into(),
            model_path: path.into(),
            accuracy: 0.9,
            sample_count: 250,
            config: json!({"epochs": 50}),
            trained_at: Utc::now(),
        };

        repo.create_active(&model("a/model.json")).await.unwrap();
        repo.create_active(&model("b/model.json")).await.unwrap();

        let active = repo.get_active().await.unwrap().unwrap();
        assert_eq!(active.model_path, "b/model.json");
    }
}
