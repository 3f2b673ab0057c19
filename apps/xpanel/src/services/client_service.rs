use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use xpanel_db::counters;
use xpanel_db::models::client::{Client, ClientFilter, NewClient};
use xpanel_db::models::inbound::{Inbound, Network, Protocol, Security};
use xpanel_db::repositories::client_repo::ClientRepository;
use xpanel_db::repositories::inbound_repo::InboundRepository;

use super::config_sync::ConfigSync;
use super::inbound_service::rejected_before_activation;
use super::share_link;
use super::{Actor, Page};
use crate::error::{PanelError, Result};

pub const VISION_FLOW: &str = "xtls-rprx-vision";
const DEFAULT_PAGE_SIZE: u32 = 20;
const MAX_BULK: usize = 1000;
const SECONDS_PER_DAY: i64 = 86_400;
pub const DEFAULT_ADDRESS: &str = "127.0.0.1";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CreateClient {
    pub email: String,
    pub uuid: Option<String>,
    pub password: Option<String>,
    pub flow: Option<String>,
    /// Bytes, 0 = unlimited.
    pub traffic_limit: u64,
    pub expiry_time: Option<DateTime<Utc>>,
    pub enable: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BulkTemplate {
    pub email_prefix: Option<String>,
    pub traffic_limit: u64,
    pub expiry_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UpdateClient {
    pub email: Option<String>,
    pub uuid: Option<String>,
    pub password: Option<String>,
    pub flow: Option<String>,
    pub traffic_limit: Option<u64>,
    pub expiry_time: Option<DateTime<Utc>>,
    pub clear_expiry: bool,
    pub enable: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientStats {
    pub up: u64,
    pub down: u64,
    pub total: u64,
    pub traffic_limit: u64,
    /// `None` when the client is unlimited.
    pub remaining: Option<u64>,
    pub usage_percent: u64,
    pub expiry_time: Option<DateTime<Utc>>,
    pub days_until_expiry: Option<i64>,
    pub is_expired: bool,
    pub enable: bool,
}

/// Usage figures a subscription client shows next to the links.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionInfo {
    pub email: String,
    pub inbound: Option<String>,
    pub protocol: Protocol,
    pub upload: u64,
    pub download: u64,
    pub total: u64,
    pub traffic_limit: u64,
    /// `None` when the client is unlimited.
    pub remaining: Option<u64>,
    pub expiry_time: Option<DateTime<Utc>>,
    pub enable: bool,
}

impl SubscriptionInfo {
    /// `subscription-userinfo` header value; 0 stands for unlimited or no expiry.
    pub fn user_info_header(&self) -> String {
        format!(
            "upload={}; download={}; total={}; expire={}",
            self.upload,
            self.download,
            self.traffic_limit,
            self.expiry_time.map(|at| at.timestamp()).unwrap_or(0)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    pub links: Vec<String>,
    /// Base64 of the newline-joined links.
    pub body: String,
    pub info: SubscriptionInfo,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LimitReport {
    pub expired_count: usize,
    pub over_limit_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub uuid: Option<String>,
    pub password: Option<String>,
    pub flow: Option<String>,
}

fn random_secret() -> String {
    let bytes: [u8; 16] = rand::random();
    hex::encode(bytes)
}

/// Credentials for a new client of `inbound`, keeping whatever the caller supplied.
pub fn generate_credentials(inbound: &Inbound, uuid: Option<String>, password: Option<String>, flow: Option<String>) -> Credentials {
    match inbound.protocol {
        Protocol::Vmess | Protocol::Vless => {
            let uuid = uuid.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            let vision = inbound.protocol == Protocol::Vless
                && inbound.network == Network::Tcp
                && matches!(inbound.security, Security::Tls | Security::Reality);
            let flow = flow.or_else(|| vision.then(|| VISION_FLOW.to_string()));
            Credentials { uuid: Some(uuid), password: None, flow }
        }
        Protocol::Trojan | Protocol::Shadowsocks => Credentials {
            uuid: None,
            password: Some(password.unwrap_or_else(random_secret)),
            flow: None,
        },
    }
}

pub fn client_stats(client: &Client, now: DateTime<Utc>) -> ClientStats {
    let total = client.total_bytes();
    let limit = client.limit_bytes();
    let (remaining, usage_percent) = if limit > 0 {
        let percent = (u128::from(total) * 100 / u128::from(limit)) as u64;
        (Some(limit.saturating_sub(total)), percent)
    } else {
        (None, 0)
    };
    let days_until_expiry = client.expiry_time.map(|at| {
        let secs = (at - now).num_seconds();
        secs.div_euclid(SECONDS_PER_DAY) + i64::from(secs.rem_euclid(SECONDS_PER_DAY) != 0)
    });

    ClientStats {
        up: client.up_bytes(),
        down: client.down_bytes(),
        total,
        traffic_limit: limit,
        remaining,
        usage_percent,
        expiry_time: client.expiry_time,
        days_until_expiry,
        is_expired: client.is_expired(now),
        enable: client.enable,
    }
}

fn check_email(email: &str) -> Result<()> {
    let trimmed = email.trim();
    if trimmed.is_empty() || trimmed.len() > 255 || trimmed.chars().any(char::is_whitespace) {
        return Err(PanelError::Validation(format!("Invalid client email '{}'", email)));
    }
    Ok(())
}

#[derive(Clone)]
pub struct ClientService {
    clients: ClientRepository,
    inbounds: InboundRepository,
    sync: ConfigSync,
    /// Host clients connect to, written into share links.
    address: String,
}

impl ClientService {
    pub fn new(clients: ClientRepository, inbounds: InboundRepository, sync: ConfigSync) -> Self {
        Self { clients, inbounds, sync, address: DEFAULT_ADDRESS.to_string() }
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    async fn inbound_for(&self, actor: &Actor, inbound_id: i64) -> Result<Inbound> {
        let inbound = self
            .inbounds
            .get_by_id(inbound_id)
            .await?
            .ok_or(PanelError::NotFound("Inbound"))?;
        actor.authorize(inbound.user_id)?;
        Ok(inbound)
    }

    async fn client_for(&self, actor: &Actor, id: i64) -> Result<(Client, Inbound)> {
        let client = self.clients.get_by_id(id).await?.ok_or(PanelError::NotFound("Client"))?;
        let inbound = self.inbound_for(actor, client.inbound_id).await?;
        Ok((client, inbound))
    }

    async fn ensure_email_free(&self, inbound_id: i64, email: &str) -> Result<()> {
        if self.clients.find_by_email(inbound_id, email).await?.is_some() {
            return Err(PanelError::DuplicateEmail { inbound_id, email: email.to_string() });
        }
        Ok(())
    }

    pub async fn create_client(&self, actor: &Actor, inbound_id: i64, request: CreateClient) -> Result<Client> {
        let inbound = self.inbound_for(actor, inbound_id).await?;
        check_email(&request.email)?;
        self.ensure_email_free(inbound_id, &request.email).await?;

        let credentials = generate_credentials(&inbound, request.uuid, request.password, request.flow);
        let client = self
            .clients
            .create(&NewClient {
                inbound_id,
                email: request.email,
                uuid: credentials.uuid,
                password: credentials.password,
                flow: credentials.flow,
                traffic_limit: request.traffic_limit,
                expiry_time: request.expiry_time,
                enable: request.enable.unwrap_or(true),
            })
            .await?;

        if let Err(e) = self.sync.resync().await {
            if rejected_before_activation(&e) {
                warn!("⚠️ Xray rejected client {}, rolling back: {}", client.email, e);
                self.clients.delete(client.id).await?;
            }
            return Err(e);
        }

        info!("✅ Client created: {} in inbound {}", client.email, inbound.tag);
        Ok(client)
    }

    pub async fn bulk_create_clients(
        &self,
        actor: &Actor,
        inbound_id: i64,
        count: usize,
        template: BulkTemplate,
    ) -> Result<Vec<Client>> {
        if count == 0 || count > MAX_BULK {
            return Err(PanelError::Validation(format!("Bulk count must be between 1 and {}", MAX_BULK)));
        }
        let inbound = self.inbound_for(actor, inbound_id).await?;
        let stamp = Utc::now().timestamp_millis();

        let mut batch = Vec::with_capacity(count);
        for i in 0..count {
            let email = match &template.email_prefix {
                Some(prefix) => format!("{}_{}@bulk.local", prefix, i + 1),
                None => format!("client_{}_{}@bulk.local", stamp, i),
            };
            self.ensure_email_free(inbound_id, &email).await?;
            let credentials = generate_credentials(&inbound, None, None, None);
            batch.push(NewClient {
                inbound_id,
                email,
                uuid: credentials.uuid,
                password: credentials.password,
                flow: credentials.flow,
                traffic_limit: template.traffic_limit,
                expiry_time: template.expiry_time,
                enable: true,
            });
        }

        let created = self.clients.create_many(&batch).await?;
        if let Err(e) = self.sync.resync().await {
            if rejected_before_activation(&e) {
                warn!("⚠️ Xray rejected bulk clients, rolling back {} rows: {}", created.len(), e);
                for client in &created {
                    self.clients.delete(client.id).await?;
                }
            }
            return Err(e);
        }

        info!("📦 Bulk created {} clients in inbound {}", created.len(), inbound.tag);
        Ok(created)
    }

    pub async fn list_clients(&self, actor: &Actor, mut filter: ClientFilter) -> Result<Page<Client>> {
        match filter.inbound_id {
            Some(inbound_id) => {
                self.inbound_for(actor, inbound_id).await?;
            }
            None if !actor.is_admin() => filter.owner_id = Some(actor.user_id),
            None => {}
        }
        if filter.page == 0 {
            filter.page = 1;
        }
        if filter.limit == 0 {
            filter.limit = DEFAULT_PAGE_SIZE;
        }
        let (items, total) = self.clients.list(&filter, Utc::now()).await?;
        Ok(Page::new(items, total, filter.page, filter.limit))
    }

    pub async fn get_client(&self, actor: &Actor, id: i64) -> Result<Client> {
        Ok(self.client_for(actor, id).await?.0)
    }

    pub async fn update_client(&self, actor: &Actor, id: i64, changes: UpdateClient) -> Result<Client> {
        let (previous, _) = self.client_for(actor, id).await?;
        let mut next = previous.clone();

        if let Some(email) = changes.email.filter(|e| *e != previous.email) {
            check_email(&email)?;
            self.ensure_email_free(previous.inbound_id, &email).await?;
            next.email = email;
        }
        if let Some(uuid) = changes.uuid {
            next.uuid = Some(uuid);
        }
        if let Some(password) = changes.password {
            next.password = Some(password);
        }
        if let Some(flow) = changes.flow {
            next.flow = (!flow.is_empty()).then_some(flow);
        }
        if let Some(limit) = changes.traffic_limit {
            next.traffic_limit = counters::to_column(limit);
        }
        if changes.clear_expiry {
            next.expiry_time = None;
        } else if let Some(at) = changes.expiry_time {
            next.expiry_time = Some(at);
        }
        if let Some(enable) = changes.enable {
            next.enable = enable;
        }

        let updated = self.clients.update(&next).await?;
        if let Err(e) = self.sync.resync().await {
            if rejected_before_activation(&e) {
                warn!("⚠️ Xray rejected update of client {}, restoring: {}", previous.email, e);
                self.clients.update(&previous).await?;
            }
            return Err(e);
        }

        info!("✅ Client updated: {}", updated.email);
        Ok(updated)
    }

    pub async fn delete_client(&self, actor: &Actor, id: i64) -> Result<()> {
        let (client, _) = self.client_for(actor, id).await?;
        self.clients.delete(id).await?;
        self.sync.resync().await?;
        info!("🗑️ Client deleted: {}", client.email);
        Ok(())
    }

    /// Flips `enable` and returns the new value.
    pub async fn toggle_client(&self, actor: &Actor, id: i64) -> Result<bool> {
        let (client, _) = self.client_for(actor, id).await?;
        let enable = !client.enable;
        self.clients.set_enabled(id, enable).await?;

        if let Err(e) = self.sync.resync().await {
            if rejected_before_activation(&e) {
                self.clients.set_enabled(id, client.enable).await?;
            }
            return Err(e);
        }

        info!("🔄 Client {} is now {}", client.email, if enable { "enabled" } else { "disabled" });
        Ok(enable)
    }

    /// Zeroes up/down; the cap and expiry stay as they were.
    pub async fn reset_client_traffic(&self, actor: &Actor, id: i64) -> Result<Client> {
        let (client, _) = self.client_for(actor, id).await?;
        let reset = self.clients.reset_traffic(id).await?;
        self.sync.resync().await?;
        info!("♻️ Client traffic reset: {}", client.email);
        Ok(reset)
    }

    pub async fn get_client_stats(&self, actor: &Actor, id: i64) -> Result<ClientStats> {
        let (client, _) = self.client_for(actor, id).await?;
        Ok(client_stats(&client, Utc::now()))
    }

    pub async fn share_link(&self, actor: &Actor, id: i64) -> Result<String> {
        let (client, inbound) = self.client_for(actor, id).await?;
        share_link::share_link(&inbound, &client, &self.address)
    }

    /// Links for every enabled row sharing this client's email on an active
    /// inbound the caller may see, plus the client's own usage.
    pub async fn subscription(&self, actor: &Actor, id: i64) -> Result<Subscription> {
        let (client, inbound) = self.client_for(actor, id).await?;

        let mut links = Vec::new();
        for sibling in self.clients.get_by_email(&client.email).await? {
            if !sibling.enable {
                continue;
            }
            let owner = if sibling.inbound_id == inbound.id {
                inbound.clone()
            } else {
                match self.inbounds.get_by_id(sibling.inbound_id).await? {
                    Some(other) => other,
                    None => continue,
                }
            };
            if !owner.is_active || actor.authorize(owner.user_id).is_err() {
                continue;
            }
            match share_link::share_link(&owner, &sibling, &self.address) {
                Ok(link) => links.push(link),
                Err(e) => warn!("⚠️ No share link for {} on {}: {}", sibling.email, owner.tag, e),
            }
        }

        let stats = client_stats(&client, Utc::now());
        let info = SubscriptionInfo {
            email: client.email.clone(),
            inbound: inbound.remark.clone(),
            protocol: inbound.protocol,
            upload: stats.up,
            download: stats.down,
            total: stats.total,
            traffic_limit: stats.traffic_limit,
            remaining: stats.remaining,
            expiry_time: client.expiry_time,
            enable: client.enable,
        };

        Ok(Subscription { body: share_link::subscription_body(&links), links, info })
    }

    pub async fn enforce_limits(&self) -> Result<LimitReport> {
        self.enforce_limits_at(Utc::now()).await
    }

    /// Disables expired and over-cap clients, then resyncs once if anything changed.
    pub async fn enforce_limits_at(&self, now: DateTime<Utc>) -> Result<LimitReport> {
        let mut report = LimitReport::default();
        for client in self.clients.get_expired(now).await? {
            self.clients.set_enabled(client.id, false).await?;
            report.expired_count += 1;
            info!("⛔ Client {} disabled (expired)", client.email);
        }
        for client in self.clients.get_enabled().await? {
            if !client.is_over_limit() {
                continue;
            }
            self.clients.set_enabled(client.id, false).await?;
            report.over_limit_count += 1;
            info!("⛔ Client {} disabled (over its traffic cap)", client.email);
        }

        if report.expired_count + report.over_limit_count > 0 {
            self.sync.resync().await?;
        }
        info!(
            "Expired clients: {}, over-limit: {}",
            report.expired_count, report.over_limit_count
        );
        Ok(report)
    }
}
