use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::counters;
use crate::models::client::{Client, ClientFilter, NewClient};

#[derive(Debug, Clone)]
pub struct ClientRepository {
    pool: SqlitePool,
}

impl ClientRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, client: &NewClient) -> Result<Client> {
        let now = Utc::now();
        sqlx::query_as::<_, Client>(
            r#"
            INSERT INTO clients (
                inbound_id, email, uuid, password, flow, traffic_limit,
                expiry_time, enable, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(client.inbound_id)
        .bind(&client.email)
        .bind(&client.uuid)
        .bind(&client.password)
        .bind(&client.flow)
        .bind(counters::to_column(client.traffic_limit))
        .bind(client.expiry_time)
        .bind(client.enable)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .context("Failed to create client")
    }

    /// Inserts all clients in one transaction; nothing is written if any insert fails.
    pub async fn create_many(&self, clients: &[NewClient]) -> Result<Vec<Client>> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        let mut created = Vec::with_capacity(clients.len());

        for client in clients {
            let row = sqlx::query_as::<_, Client>(
                r#"
                INSERT INTO clients (
                    inbound_id, email, uuid, password, flow, traffic_limit,
                    expiry_time, enable, created_at, updated_at
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                RETURNING *
                "#,
            )
            .bind(client.inbound_id)
            .bind(&client.email)
            .bind(&client.uuid)
            .bind(&client.password)
            .bind(&client.flow)
            .bind(counters::to_column(client.traffic_limit))
            .bind(client.expiry_time)
            .bind(client.enable)
            .bind(now)
            .bind(now)
            .fetch_one(&mut *tx)
            .await
            .with_context(|| format!("Failed to create client {}", client.email))?;
            created.push(row);
        }

        tx.commit().await?;
        tracing::debug!("Inserted {} clients in one transaction", created.len());
        Ok(created)
    }

    pub async fn get_by_id(&self, id: i64) -> Result<Option<Client>> {
        sqlx::query_as::<_, Client>("SELECT * FROM clients WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch client by ID")
    }

    pub async fn find_by_email(&self, inbound_id: i64, email: &str) -> Result<Option<Client>> {
        sqlx::query_as::<_, Client>("SELECT * FROM clients WHERE inbound_id = ? AND email = ?")
            .bind(inbound_id)
            .bind(email)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch client by email")
    }

    /// Every row with this email, one per inbound at most.
    pub async fn get_by_email(&self, email: &str) -> Result<Vec<Client>> {
        sqlx::query_as::<_, Client>("SELECT * FROM clients WHERE email = ? ORDER BY inbound_id ASC")
            .bind(email)
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch clients by email")
    }

    pub async fn get_by_inbound(&self, inbound_id: i64) -> Result<Vec<Client>> {
        sqlx::query_as::<_, Client>("SELECT * FROM clients WHERE inbound_id = ? ORDER BY id ASC")
            .bind(inbound_id)
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch inbound clients")
    }

    pub async fn get_enabled(&self) -> Result<Vec<Client>> {
        sqlx::query_as::<_, Client>("SELECT * FROM clients WHERE enable = 1 ORDER BY id ASC")
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch enabled clients")
    }

    /// Enabled clients whose inbound is active, ordered for stable config output.
    pub async fn get_deployable(&self) -> Result<Vec<Client>> {
        sqlx::query_as::<_, Client>(
            r#"
            SELECT c.* FROM clients c
            JOIN inbounds i ON i.id = c.inbound_id
            WHERE c.enable = 1 AND i.is_active = 1
            ORDER BY c.inbound_id ASC, c.id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch deployable clients")
    }

    /// Filtered page plus the total number of matching rows, newest first.
    pub async fn list(&self, filter: &ClientFilter, now: DateTime<Utc>) -> Result<(Vec<Client>, i64)> {
        let mut conditions = Vec::new();
        if filter.inbound_id.is_some() {
            conditions.push("c.inbound_id = ?");
        }
        if filter.owner_id.is_some() {
            conditions.push("i.user_id = ?");
        }
        if filter.search.is_some() {
            conditions.push("c.email LIKE ?");
        }
        if filter.enable.is_some() {
            conditions.push("c.enable = ?");
        }
        match filter.expired {
            Some(true) => conditions.push("(c.expiry_time IS NOT NULL AND c.expiry_time <= ?)"),
            Some(false) => conditions.push("(c.expiry_time IS NULL OR c.expiry_time > ?)"),
            None => {}
        }
        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        let limit = filter.limit.clamp(1, 500) as i64;
        let offset = filter.page.saturating_sub(1) as i64 * limit;
        let search = filter.search.as_ref().map(|s| format!("%{}%", s));

        let from = "FROM clients c JOIN inbounds i ON i.id = c.inbound_id";
        let select_sql = format!(
            "SELECT c.* {} {} ORDER BY c.created_at DESC, c.id DESC LIMIT ? OFFSET ?",
            from, where_clause
        );
        let count_sql = format!("SELECT COUNT(*) {} {}", from, where_clause);

        let mut select = sqlx::query_as::<_, Client>(&select_sql);
        let mut count = sqlx::query_scalar::<_, i64>(&count_sql);
        if let Some(inbound_id) = filter.inbound_id {
            select = select.bind(inbound_id);
            count = count.bind(inbound_id);
        }
        if let Some(owner_id) = filter.owner_id {
            select = select.bind(owner_id);
            count = count.bind(owner_id);
        }
        if let Some(pattern) = &search {
            select = select.bind(pattern);
            count = count.bind(pattern);
        }
        if let Some(enable) = filter.enable {
            select = select.bind(enable);
            count = count.bind(enable);
        }
        if filter.expired.is_some() {
            select = select.bind(now);
            count = count.bind(now);
        }

        let rows = select
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await
            .context("Failed to list clients")?;
        let total = count
            .fetch_one(&self.pool)
            .await
            .context("Failed to count clients")?;

        Ok((rows, total))
    }

    pub async fn count_by_inbound(&self, inbound_id: i64) -> Result<i64> {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM clients WHERE inbound_id = ?")
            .bind(inbound_id)
            .fetch_one(&self.pool)
            .await
            .context("Failed to count inbound clients")
    }

    pub async fn update(&self, client: &Client) -> Result<Client> {
        sqlx::query_as::<_, Client>(
            r#"
            UPDATE clients SET
                email = ?, uuid = ?, password = ?, flow = ?, traffic_limit = ?,
                expiry_time = ?, enable = ?, updated_at = ?
            WHERE id = ?
            RETURNING *
            "#,
        )
        .bind(&client.email)
        .bind(&client.uuid)
        .bind(&client.password)
        .bind(&client.flow)
        .bind(client.traffic_limit)
        .bind(client.expiry_time)
        .bind(client.enable)
        .bind(Utc::now())
        .bind(client.id)
        .fetch_one(&self.pool)
        .await
        .context("Failed to update client")
    }

    pub async fn set_enabled(&self, id: i64, enable: bool) -> Result<()> {
        sqlx::query("UPDATE clients SET enable = ?, updated_at = ? WHERE id = ?")
            .bind(enable)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to toggle client")?;
        Ok(())
    }

    /// Zeroes the up/down counters; cap and expiry are left alone.
    pub async fn reset_traffic(&self, id: i64) -> Result<Client> {
        sqlx::query_as::<_, Client>("UPDATE clients SET up = 0, down = 0, updated_at = ? WHERE id = ? RETURNING *")
            .bind(Utc::now())
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .context("Failed to reset client traffic")
    }

    /// Adds byte deltas to the cumulative counters, saturating at `u64::MAX`.
    pub async fn add_traffic(&self, id: i64, up_delta: u64, down_delta: u64) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let current: Option<(i64, i64)> = sqlx::query_as("SELECT up, down FROM clients WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .context("Failed to read client counters")?;

        if let Some((up, down)) = current {
            sqlx::query("UPDATE clients SET up = ?, down = ? WHERE id = ?")
                .bind(counters::accumulate(up, up_delta))
                .bind(counters::accumulate(down, down_delta))
                .bind(id)
                .execute(&mut *tx)
                .await
                .context("Failed to update client counters")?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Enabled clients past their expiry at `now`.
    pub async fn get_expired(&self, now: DateTime<Utc>) -> Result<Vec<Client>> {
        sqlx::query_as::<_, Client>(
            "SELECT * FROM clients WHERE enable = 1 AND expiry_time IS NOT NULL AND expiry_time <= ?",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch expired clients")
    }

    pub async fn delete(&self, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM clients WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to delete client")?;
        Ok(result.rows_affected() > 0)
    }
}
