use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::SqlitePool;
use sqlx::types::Json;

use crate::counters;
use crate::models::inbound::{Inbound, InboundFilter, NewInbound};

#[derive(Debug, Clone)]
pub struct InboundRepository {
    pool: SqlitePool,
}

impl InboundRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, inbound: &NewInbound) -> Result<Inbound> {
        let now = Utc::now();
        sqlx::query_as::<_, Inbound>(
            r#"
            INSERT INTO inbounds (
                user_id, remark, protocol, port, listen, tag, settings,
                network, security, stream_settings, tls_settings, reality_settings,
                sniffing, is_active, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(inbound.user_id)
        .bind(&inbound.remark)
        .bind(inbound.protocol.as_str())
        .bind(inbound.port)
        .bind(&inbound.listen)
        .bind(&inbound.tag)
        .bind(Json(&inbound.settings))
        .bind(inbound.network.as_str())
        .bind(inbound.security.as_str())
        .bind(inbound.stream_settings.as_ref().map(Json))
        .bind(inbound.tls_settings.as_ref().map(Json))
        .bind(inbound.reality_settings.as_ref().map(Json))
        .bind(inbound.sniffing.as_ref().map(Json))
        .bind(inbound.is_active)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .context("Failed to create inbound")
    }

    pub async fn get_by_id(&self, id: i64) -> Result<Option<Inbound>> {
        sqlx::query_as::<_, Inbound>("SELECT * FROM inbounds WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch inbound by ID")
    }

    pub async fn get_active(&self) -> Result<Vec<Inbound>> {
        sqlx::query_as::<_, Inbound>("SELECT * FROM inbounds WHERE is_active = 1 ORDER BY port ASC")
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch active inbounds")
    }

    pub async fn get_all(&self) -> Result<Vec<Inbound>> {
        sqlx::query_as::<_, Inbound>("SELECT * FROM inbounds ORDER BY port ASC")
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch inbounds")
    }

    /// Filtered page plus the total number of matching rows.
    pub async fn list(&self, filter: &InboundFilter) -> Result<(Vec<Inbound>, i64)> {
        let mut conditions = Vec::new();
        if filter.user_id.is_some() {
            conditions.push("user_id = ?");
        }
        if filter.protocol.is_some() {
            conditions.push("protocol = ?");
        }
        if filter.is_active.is_some() {
            conditions.push("is_active = ?");
        }
        if filter.search.is_some() {
            conditions.push("(remark LIKE ? OR tag LIKE ?)");
        }
        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        let limit = filter.limit.clamp(1, 500) as i64;
        let offset = filter.page.saturating_sub(1) as i64 * limit;
        let search = filter.search.as_ref().map(|s| format!("%{}%", s));

        let select_sql = format!(
            "SELECT * FROM inbounds {} ORDER BY created_at DESC, id DESC LIMIT ? OFFSET ?",
            where_clause
        );
        let count_sql = format!("SELECT COUNT(*) FROM inbounds {}", where_clause);

        let mut select = sqlx::query_as::<_, Inbound>(&select_sql);
        let mut count = sqlx::query_scalar::<_, i64>(&count_sql);
        if let Some(user_id) = filter.user_id {
            select = select.bind(user_id);
            count = count.bind(user_id);
        }
        if let Some(protocol) = filter.protocol {
            select = select.bind(protocol.as_str());
            count = count.bind(protocol.as_str());
        }
        if let Some(active) = filter.is_active {
            select = select.bind(active);
            count = count.bind(active);
        }
        if let Some(pattern) = &search {
            select = select.bind(pattern).bind(pattern);
            count = count.bind(pattern).bind(pattern);
        }

        let rows = select
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await
            .context("Failed to list inbounds")?;
        let total = count
            .fetch_one(&self.pool)
            .await
            .context("Failed to count inbounds")?;

        Ok((rows, total))
    }

    pub async fn port_taken(&self, port: u16, exclude_id: Option<i64>) -> Result<bool> {
        sqlx::query_scalar::<_, bool>("SELECT EXISTS(SELECT 1 FROM inbounds WHERE port = ? AND id != ?)")
            .bind(port)
            .bind(exclude_id.unwrap_or(-1))
            .fetch_one(&self.pool)
            .await
            .context("Failed to check inbound port")
    }

    pub async fn tag_taken(&self, tag: &str, exclude_id: Option<i64>) -> Result<bool> {
        sqlx::query_scalar::<_, bool>("SELECT EXISTS(SELECT 1 FROM inbounds WHERE tag = ? AND id != ?)")
            .bind(tag)
            .bind(exclude_id.unwrap_or(-1))
            .fetch_one(&self.pool)
            .await
            .context("Failed to check inbound tag")
    }

    /// Writes every mutable column of `inbound` back to its row.
    pub async fn update(&self, inbound: &Inbound) -> Result<Inbound> {
        sqlx::query_as::<_, Inbound>(
            r#"
            UPDATE inbounds SET
                remark = ?, protocol = ?, port = ?, listen = ?, tag = ?, settings = ?,
                network = ?, security = ?, stream_settings = ?, tls_settings = ?,
                reality_settings = ?, sniffing = ?, is_active = ?, updated_at = ?
            WHERE id = ?
            RETURNING *
            "#,
        )
        .bind(&inbound.remark)
        .bind(inbound.protocol.as_str())
        .bind(inbound.port)
        .bind(&inbound.listen)
        .bind(&inbound.tag)
        .bind(&inbound.settings)
        .bind(inbound.network.as_str())
        .bind(inbound.security.as_str())
        .bind(&inbound.stream_settings)
        .bind(&inbound.tls_settings)
        .bind(&inbound.reality_settings)
        .bind(&inbound.sniffing)
        .bind(inbound.is_active)
        .bind(Utc::now())
        .bind(inbound.id)
        .fetch_one(&self.pool)
        .await
        .context("Failed to update inbound")
    }

    pub async fn set_active(&self, id: i64, active: bool) -> Result<()> {
        sqlx::query("UPDATE inbounds SET is_active = ?, updated_at = ? WHERE id = ?")
            .bind(active)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to toggle inbound")?;
        Ok(())
    }

    pub async fn set_traffic(&self, id: i64, up: u64, down: u64) -> Result<()> {
        sqlx::query("UPDATE inbounds SET up = ?, down = ? WHERE id = ?")
            .bind(counters::to_column(up))
            .bind(counters::to_column(down))
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to update inbound traffic")?;
        Ok(())
    }

    pub async fn delete(&self, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM inbounds WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to delete inbound")?;
        Ok(result.rows_affected() > 0)
    }
}
