use anyhow::Context;
use chrono::Utc;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::{Duration, Instant};
use tracing::{info, warn};
use xpanel_db::models::server::{NewServer, Server, ServerHealth, ServerStatus, ServerType};
use xpanel_db::repositories::client_repo::ClientRepository;
use xpanel_db::repositories::server_repo::ServerRepository;
use xpanel_shared::node::{ConfigSyncRequest, HealthReport};

use crate::error::{PanelError, Result};
use crate::xray::ConfigGenerator;

pub const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);
pub const SYNC_TIMEOUT: Duration = Duration::from_secs(10);
const API_KEY_HEADER: &str = "X-API-Key";
const DEFAULT_PORT: u16 = 443;
const DEFAULT_MAX_CLIENTS: i64 = 1000;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterServer {
    pub name: String,
    pub hostname: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub server_type: Option<ServerType>,
    #[serde(default)]
    pub max_clients: Option<i64>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

/// The plain secret is only ever handed out here.
#[derive(Debug, Clone, Serialize)]
pub struct RegisteredServer {
    pub server: Server,
    pub api_secret: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UpdateServer {
    pub name: Option<String>,
    pub hostname: Option<String>,
    pub port: Option<u16>,
    pub max_clients: Option<i64>,
    pub country: Option<String>,
    pub city: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "UPPERCASE")]
pub enum HealthOutcome {
    Online { response_time: i64 },
    Offline { error: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HealthSummary {
    pub total: usize,
    pub online: usize,
    pub offline: usize,
    pub error: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStats {
    pub server: Server,
    pub inbound_count: i64,
    pub client_count: i64,
    pub load_percentage: i64,
    pub available_slots: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Migration {
    pub from: i64,
    pub to: i64,
    pub count: usize,
}

pub fn hash_secret(secret: &str) -> String {
    hex::encode(Sha256::digest(secret.as_bytes()))
}

pub fn verify_secret(server: &Server, secret: &str) -> bool {
    hash_secret(secret) == server.api_secret_hash
}

fn random_hex(bytes: usize) -> String {
    let buf: Vec<u8> = (0..bytes).map(|_| rand::random::<u8>()).collect();
    hex::encode(buf)
}

/// Higher is better: 50% free capacity, 30% latency, 20% CPU/RAM headroom.
pub fn score(server: &Server) -> f64 {
    let capacity = server.max_clients.max(1) as f64;
    let load_score = 100.0 - (server.current_clients as f64 / capacity * 100.0).min(100.0);
    let latency_score = match server.response_time {
        Some(ms) if ms > 0 => 100.0 - (ms as f64 / 10.0).min(100.0),
        _ => 50.0,
    };
    let resource_score = 100.0 - ((server.cpu_usage + server.ram_usage) / 2.0).min(100.0);
    load_score * 0.5 + latency_score * 0.3 + resource_score * 0.2
}

pub fn pick_best(servers: &[Server]) -> Option<&Server> {
    servers
        .iter()
        .max_by(|a, b| score(a).total_cmp(&score(b)).then_with(|| b.id.cmp(&a.id)))
}

/// Moves clients from servers above 120% of the mean load to the first one
/// below 80%. Loads are updated as moves are planned.
pub fn plan_balance(loads: &[(i64, i64)]) -> Vec<Migration> {
    if loads.len() < 2 {
        return Vec::new();
    }
    let mut loads = loads.to_vec();
    let total: i64 = loads.iter().map(|(_, n)| *n).sum();
    let avg = total as f64 / loads.len() as f64;

    let mut plan = Vec::new();
    for i in 0..loads.len() {
        let (from, current) = loads[i];
        if (current as f64) <= avg * 1.2 {
            continue;
        }
        let excess = (current as f64 - avg).floor() as i64;
        let Some(j) = (0..loads.len()).find(|&j| j != i && (loads[j].1 as f64) < avg * 0.8) else {
            continue;
        };
        if excess <= 0 {
            continue;
        }
        loads[i].1 -= excess;
        loads[j].1 += excess;
        plan.push(Migration { from, to: loads[j].0, count: excess as usize });
    }
    plan
}

#[derive(Debug, Clone)]
pub struct ServerService {
    servers: ServerRepository,
    clients: ClientRepository,
    http: reqwest::Client,
}

impl ServerService {
    pub fn new(servers: ServerRepository, clients: ClientRepository) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent("xpanel")
            .build()
            .context("Failed to build node HTTP client")?;
        Ok(Self { servers, clients, http })
    }

    async fn server(&self, id: i64) -> Result<Server> {
        self.servers.get_by_id(id).await?.ok_or(PanelError::NotFound("Server"))
    }

    pub async fn register_server(&self, request: RegisterServer) -> Result<RegisteredServer> {
        if request.name.trim().is_empty() || request.hostname.trim().is_empty() {
            return Err(PanelError::Validation("Server name and hostname are required".into()));
        }
        let api_secret = random_hex(32);
        let server = self
            .servers
            .create(&NewServer {
                name: request.name,
                hostname: request.hostname,
                port: request.port.unwrap_or(DEFAULT_PORT),
                server_type: request.server_type.unwrap_or(ServerType::Slave),
                api_key: random_hex(32),
                api_secret_hash: hash_secret(&api_secret),
                max_clients: request.max_clients.unwrap_or(DEFAULT_MAX_CLIENTS),
                country: request.country,
                city: request.city,
                notes: request.notes,
            })
            .await?;

        info!("🖥️ Server registered: {} ({})", server.name, server.hostname);
        Ok(RegisteredServer { server, api_secret })
    }

    pub async fn list_servers(&self) -> Result<Vec<Server>> {
        Ok(self.servers.get_all().await?)
    }

    pub async fn health_check(&self, id: i64) -> Result<HealthOutcome> {
        let server = self.server(id).await?;
        let url = format!("https://{}:{}/api/health", server.hostname, server.port);
        let started = Instant::now();

        let response = self
            .http
            .get(&url)
            .header(API_KEY_HEADER, &server.api_key)
            .timeout(HEALTH_TIMEOUT)
            .send()
            .await
            .and_then(|r| r.error_for_status());

        match response {
            Ok(resp) => {
                let response_time = started.elapsed().as_millis() as i64;
                let report: HealthReport = resp.json().await.unwrap_or_default();
                self.servers
                    .record_health(
                        id,
                        &ServerHealth {
                            response_time,
                            version: report.version,
                            uptime: report.uptime,
                            cpu_usage: report.cpu,
                            ram_usage: report.ram,
                            disk_usage: report.disk,
                        },
                    )
                    .await?;
                Ok(HealthOutcome::Online { response_time })
            }
            Err(e) => {
                let status = if e.is_timeout() { ServerStatus::Offline } else { ServerStatus::Error };
                warn!("⚠️ Server {} failed health check: {}", server.name, e);
                self.servers.set_status(id, status).await?;
                Ok(HealthOutcome::Offline { error: e.to_string() })
            }
        }
    }

    pub async fn health_check_all(&self) -> Result<HealthSummary> {
        let servers = self.servers.get_all().await?;
        let results = join_all(servers.iter().map(|s| self.health_check(s.id))).await;

        let mut summary = HealthSummary { total: servers.len(), ..Default::default() };
        for result in results {
            match result {
                Ok(HealthOutcome::Online { .. }) => summary.online += 1,
                Ok(HealthOutcome::Offline { .. }) => summary.offline += 1,
                Err(_) => summary.error += 1,
            }
        }
        info!("🩺 Health check: {}/{} servers online", summary.online, summary.total);
        Ok(summary)
    }

    pub async fn get_server_stats(&self, id: i64) -> Result<ServerStats> {
        let server = self.server(id).await?;
        let inbound_count = self.servers.inbound_count(id).await?;
        let client_count = self.servers.client_count(id).await?;
        let load_percentage = if server.max_clients > 0 {
            (server.current_clients as f64 / server.max_clients as f64 * 100.0).round() as i64
        } else {
            0
        };
        let available_slots = server.max_clients - server.current_clients;
        Ok(ServerStats { server, inbound_count, client_count, load_percentage, available_slots })
    }

    pub async fn update_server(&self, id: i64, changes: UpdateServer) -> Result<Server> {
        let mut server = self.server(id).await?;
        if let Some(name) = changes.name {
            server.name = name;
        }
        if let Some(hostname) = changes.hostname {
            server.hostname = hostname;
        }
        if let Some(port) = changes.port {
            server.port = port;
        }
        if let Some(max_clients) = changes.max_clients {
            server.max_clients = max_clients;
        }
        if changes.country.is_some() {
            server.country = changes.country;
        }
        if changes.city.is_some() {
            server.city = changes.city;
        }
        if changes.notes.is_some() {
            server.notes = changes.notes;
        }
        let updated = self.servers.update(&server).await?;
        info!("Server updated: {}", updated.name);
        Ok(updated)
    }

    pub async fn delete_server(&self, id: i64) -> Result<()> {
        let server = self.server(id).await?;
        let assigned = self.servers.client_count(id).await?;
        if assigned > 0 {
            return Err(PanelError::Conflict(format!(
                "Server {} still has {} clients; migrate them first",
                server.name, assigned
            )));
        }
        self.servers.delete(id).await?;
        info!("🗑️ Server deleted: {}", server.name);
        Ok(())
    }

    pub async fn best_server(&self, country: Option<&str>) -> Result<Server> {
        let candidates = self.servers.get_online_slaves(country).await?;
        pick_best(&candidates)
            .cloned()
            .ok_or_else(|| PanelError::Conflict("No available servers".into()))
    }

    /// Returns the server the client ended up on and whether it was newly assigned.
    pub async fn assign_client(&self, client_id: i64, server_id: Option<i64>) -> Result<(i64, bool)> {
        self.clients.get_by_id(client_id).await?.ok_or(PanelError::NotFound("Client"))?;
        let server_id = match server_id {
            Some(id) => self.server(id).await?.id,
            None => self.best_server(None).await?.id,
        };
        let inserted = self.servers.assign_client(server_id, client_id).await?;
        if inserted {
            info!("Client {} assigned to server {}", client_id, server_id);
        }
        Ok((server_id, inserted))
    }

    pub async fn migrate_client(&self, client_id: i64, from: i64, to: i64) -> Result<()> {
        self.server(to).await?;
        if !self.servers.unassign_client(from, client_id).await? {
            return Err(PanelError::NotFound("Server assignment"));
        }
        self.servers.assign_client(to, client_id).await?;
        info!("🔀 Client {} migrated: {} -> {}", client_id, from, to);
        Ok(())
    }

    pub async fn auto_balance(&self) -> Result<usize> {
        let servers = self.servers.get_online_slaves(None).await?;
        let loads: Vec<(i64, i64)> = servers.iter().map(|s| (s.id, s.current_clients)).collect();
        let plan = plan_balance(&loads);

        let mut migrated = 0;
        for step in plan {
            let assignments = self.servers.get_assignments(step.from).await?;
            for assignment in assignments.into_iter().take(step.count) {
                self.migrate_client(assignment.client_id, step.from, step.to).await?;
                migrated += 1;
            }
        }
        info!("⚖️ Auto-balance completed: {} clients migrated", migrated);
        Ok(migrated)
    }

    /// Pushes the server's inbounds (with their clients) to the node and
    /// returns the new config version.
    pub async fn sync_config_to_server(&self, id: i64) -> Result<String> {
        let server = self.server(id).await?;
        let mut inbounds = Vec::new();
        for inbound in self.servers.get_inbounds(id).await? {
            let clients = self.clients.get_by_inbound(inbound.id).await?;
            inbounds.push(serde_json::to_value(ConfigGenerator::generate_inbound(&inbound, &clients))?);
        }
        let payload = ConfigSyncRequest { inbounds, timestamp: Utc::now().to_rfc3339() };

        let url = format!("https://{}:{}/api/config/sync", server.hostname, server.port);
        self.http
            .post(&url)
            .header(API_KEY_HEADER, &server.api_key)
            .timeout(SYNC_TIMEOUT)
            .json(&payload)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .with_context(|| format!("Failed to sync config to {}", server.name))?;

        let version = random_hex(8);
        self.servers.mark_synced(id, &version).await?;
        info!("📤 Config synced to server: {} ({})", server.name, version);
        Ok(version)
    }
}
