use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::SqlitePool;

use crate::models::inbound::Inbound;
use crate::models::server::{NewServer, Server, ServerClient, ServerHealth, ServerStatus, ServerType};

#[derive(Debug, Clone)]
pub struct ServerRepository {
    pool: SqlitePool,
}

impl ServerRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, server: &NewServer) -> Result<Server> {
        sqlx::query_as::<_, Server>(
            r#"
            INSERT INTO servers (
                name, hostname, port, server_type, api_key, api_secret_hash,
                max_clients, country, city, notes, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(&server.name)
        .bind(&server.hostname)
        .bind(server.port)
        .bind(server.server_type.as_str())
        .bind(&server.api_key)
        .bind(&server.api_secret_hash)
        .bind(server.max_clients)
        .bind(&server.country)
        .bind(&server.city)
        .bind(&server.notes)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await
        .context("Failed to register server")
    }

    pub async fn get_by_id(&self, id: i64) -> Result<Option<Server>> {
        sqlx::query_as::<_, Server>("SELECT * FROM servers WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch server by ID")
    }

    pub async fn get_all(&self) -> Result<Vec<Server>> {
        sqlx::query_as::<_, Server>("SELECT * FROM servers ORDER BY id ASC")
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch servers")
    }

    /// Online slaves, optionally limited to one country.
    pub async fn get_online_slaves(&self, country: Option<&str>) -> Result<Vec<Server>> {
        sqlx::query_as::<_, Server>(
            r#"
            SELECT * FROM servers
            WHERE status = ? AND server_type = ? AND (? IS NULL OR country = ?)
            ORDER BY id ASC
            "#,
        )
        .bind(ServerStatus::Online.as_str())
        .bind(ServerType::Slave.as_str())
        .bind(country)
        .bind(country)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch online servers")
    }

    pub async fn update(&self, server: &Server) -> Result<Server> {
        sqlx::query_as::<_, Server>(
            r#"
            UPDATE servers SET
                name = ?, hostname = ?, port = ?, max_clients = ?, country = ?, city = ?, notes = ?
            WHERE id = ?
            RETURNING *
            "#,
        )
        .bind(&server.name)
        .bind(&server.hostname)
        .bind(server.port)
        .bind(server.max_clients)
        .bind(&server.country)
        .bind(&server.city)
        .bind(&server.notes)
        .bind(server.id)
        .fetch_one(&self.pool)
        .await
        .context("Failed to update server")
    }

    pub async fn record_health(&self, id: i64, health: &ServerHealth) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE servers SET
                status = ?, last_heartbeat = ?, response_time = ?,
                version = COALESCE(?, version), uptime = COALESCE(?, uptime),
                cpu_usage = COALESCE(?, cpu_usage), ram_usage = COALESCE(?, ram_usage),
                disk_usage = COALESCE(?, disk_usage)
            WHERE id = ?
            "#,
        )
        .bind(ServerStatus::Online.as_str())
        .bind(Utc::now())
        .bind(health.response_time)
        .bind(&health.version)
        .bind(health.uptime)
        .bind(health.cpu_usage)
        .bind(health.ram_usage)
        .bind(health.disk_usage)
        .bind(id)
        .execute(&self.pool)
        .await
        .context("Failed to record server health")?;
        Ok(())
    }

    pub async fn set_status(&self, id: i64, status: ServerStatus) -> Result<()> {
        sqlx::query("UPDATE servers SET status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to update server status")?;
        Ok(())
    }

    pub async fn mark_synced(&self, id: i64, config_version: &str) -> Result<()> {
        sqlx::query("UPDATE servers SET last_sync_at = ?, config_version = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(config_version)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to mark server synced")?;
        Ok(())
    }

    pub async fn delete(&self, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM servers WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to delete server")?;
        Ok(result.rows_affected() > 0)
    }

    // ==================== ASSIGNMENTS ====================

    pub async fn client_count(&self, server_id: i64) -> Result<i64> {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM server_clients WHERE server_id = ?")
            .bind(server_id)
            .fetch_one(&self.pool)
            .await
            .context("Failed to count server clients")
    }

    pub async fn inbound_count(&self, server_id: i64) -> Result<i64> {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM server_inbounds WHERE server_id = ?")
            .bind(server_id)
            .fetch_one(&self.pool)
            .await
            .context("Failed to count server inbounds")
    }

    pub async fn get_assignments(&self, server_id: i64) -> Result<Vec<ServerClient>> {
        sqlx::query_as::<_, ServerClient>(
            "SELECT * FROM server_clients WHERE server_id = ? ORDER BY assigned_at ASC, client_id ASC",
        )
        .bind(server_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch server assignments")
    }

    /// Returns `false` when the client was already assigned to the server.
    pub async fn assign_client(&self, server_id: i64, client_id: i64) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let inserted = sqlx::query(
            "INSERT INTO server_clients (server_id, client_id, assigned_at) VALUES (?, ?, ?) ON CONFLICT DO NOTHING",
        )
        .bind(server_id)
        .bind(client_id)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await
        .context("Failed to assign client")?
        .rows_affected()
            > 0;

        if inserted {
            sqlx::query("UPDATE servers SET current_clients = current_clients + 1 WHERE id = ?")
                .bind(server_id)
                .execute(&mut *tx)
                .await
                .context("Failed to bump server load")?;
        }
        tx.commit().await?;
        Ok(inserted)
    }

    pub async fn unassign_client(&self, server_id: i64, client_id: i64) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let removed = sqlx::query("DELETE FROM server_clients WHERE server_id = ? AND client_id = ?")
            .bind(server_id)
            .bind(client_id)
            .execute(&mut *tx)
            .await
            .context("Failed to unassign client")?
            .rows_affected()
            > 0;

        if removed {
            sqlx::query("UPDATE servers SET current_clients = MAX(current_clients - 1, 0) WHERE id = ?")
                .bind(server_id)
                .execute(&mut *tx)
                .await
                .context("Failed to lower server load")?;
        }
        tx.commit().await?;
        Ok(removed)
    }

    pub async fn attach_inbound(&self, server_id: i64, inbound_id: i64) -> Result<()> {
        sqlx::query("INSERT INTO server_inbounds (server_id, inbound_id) VALUES (?, ?) ON CONFLICT DO NOTHING")
            .bind(server_id)
            .bind(inbound_id)
            .execute(&self.pool)
            .await
            .context("Failed to attach inbound to server")?;
        Ok(())
    }

    pub async fn get_inbounds(&self, server_id: i64) -> Result<Vec<Inbound>> {
        sqlx::query_as::<_, Inbound>(
            r#"
            SELECT i.* FROM inbounds i
            JOIN server_inbounds si ON si.inbound_id = i.id
            WHERE si.server_id = ?
            ORDER BY i.port ASC
            "#,
        )
        .bind(server_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch server inbounds")
    }
}
