use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sqlx::types::Json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{info, warn};
use xpanel_db::models::inbound::{
    Inbound, InboundClientTotals, InboundFilter, NewInbound, Network, Protocol, Security,
};
use xpanel_db::repositories::client_repo::ClientRepository;
use xpanel_db::repositories::inbound_repo::InboundRepository;
use xpanel_shared::status::ProcessStatus;

use super::config_sync::ConfigSync;
use super::{Actor, Page};
use crate::ai::traffic_collector::counter_delta;
use crate::error::{PanelError, Result};
use crate::xray::StatsSource;
use crate::xray::presets;

const DEFAULT_LISTEN: &str = "0.0.0.0";
const DEFAULT_PAGE_SIZE: u32 = 10;

fn default_settings() -> Value {
    json!({})
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateInbound {
    #[serde(default)]
    pub remark: Option<String>,
    pub protocol: Protocol,
    pub port: u16,
    #[serde(default)]
    pub listen: Option<String>,
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default = "default_settings")]
    pub settings: Value,
    #[serde(default)]
    pub network: Option<Network>,
    #[serde(default)]
    pub security: Option<Security>,
    #[serde(default)]
    pub stream_settings: Option<Value>,
    #[serde(default)]
    pub tls_settings: Option<Value>,
    #[serde(default)]
    pub reality_settings: Option<Value>,
    #[serde(default)]
    pub sniffing: Option<Value>,
    #[serde(default)]
    pub is_active: Option<bool>,
}

impl CreateInbound {
    pub fn new(protocol: Protocol, port: u16) -> Self {
        Self {
            remark: None,
            protocol,
            port,
            listen: None,
            tag: None,
            settings: default_settings(),
            network: None,
            security: None,
            stream_settings: None,
            tls_settings: None,
            reality_settings: None,
            sniffing: None,
            is_active: None,
        }
    }
}

/// Partial update; `None` leaves the stored value alone.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UpdateInbound {
    pub remark: Option<String>,
    pub protocol: Option<Protocol>,
    pub port: Option<u16>,
    pub listen: Option<String>,
    pub tag: Option<String>,
    pub settings: Option<Value>,
    pub network: Option<Network>,
    pub security: Option<Security>,
    pub stream_settings: Option<Value>,
    pub tls_settings: Option<Value>,
    pub reality_settings: Option<Value>,
    pub sniffing: Option<Value>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LiveCounters {
    pub up: u64,
    pub down: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundStats {
    pub inbound_id: i64,
    pub tag: String,
    pub up: u64,
    pub down: u64,
    /// `None` when the stats endpoint could not be reached.
    pub realtime: Option<LiveCounters>,
    pub clients: InboundClientTotals,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficSyncReport {
    pub polled: usize,
    pub updated: usize,
    pub failed: usize,
}

/// Merges caller settings over the protocol defaults and checks what the
/// protocol insists on.
pub fn prepare_settings(protocol: Protocol, settings: &Value) -> Result<Value> {
    if !settings.is_object() && !settings.is_null() {
        return Err(PanelError::Validation("Inbound settings must be an object".into()));
    }
    let merged = presets::merge_settings(presets::protocol_defaults(protocol), settings);
    if protocol == Protocol::Shadowsocks {
        let has_password = merged
            .get("password")
            .and_then(Value::as_str)
            .is_some_and(|p| !p.is_empty());
        if !has_password {
            return Err(PanelError::Validation("Shadowsocks password required".into()));
        }
    }
    Ok(merged)
}

/// tlsSettings exactly when security is TLS, realitySettings exactly when it is REALITY.
pub fn check_security(security: Security, tls: Option<&Value>, reality: Option<&Value>) -> Result<()> {
    let present = |block: Option<&Value>| block.is_some_and(|v| v.as_object().is_some_and(|m| !m.is_empty()));
    match (security, present(tls), present(reality)) {
        (Security::Tls, false, _) => Err(PanelError::Validation("tlsSettings required when security is TLS".into())),
        (Security::Reality, _, false) => Err(PanelError::Validation(
            "realitySettings required when security is REALITY".into(),
        )),
        (s, true, _) if s != Security::Tls => Err(PanelError::Validation(format!(
            "tlsSettings not allowed when security is {}",
            s
        ))),
        (s, _, true) if s != Security::Reality => Err(PanelError::Validation(format!(
            "realitySettings not allowed when security is {}",
            s
        ))),
        _ => Ok(()),
    }
}

fn check_port(port: u16) -> Result<()> {
    if port == 0 {
        return Err(PanelError::Validation("Port must be between 1 and 65535".into()));
    }
    Ok(())
}

/// The proxy never saw the change, so the row can be put back.
pub(crate) fn rejected_before_activation(err: &PanelError) -> bool {
    matches!(err, PanelError::InvalidConfig(_) | PanelError::ConfigTestFailed { .. })
}

#[derive(Clone)]
pub struct InboundService {
    inbounds: InboundRepository,
    clients: ClientRepository,
    sync: ConfigSync,
    stats: Arc<dyn StatsSource>,
    /// Last counters read from the proxy per inbound, for delta accounting.
    live: Arc<Mutex<HashMap<i64, (u64, u64)>>>,
}

impl InboundService {
    pub fn new(
        inbounds: InboundRepository,
        clients: ClientRepository,
        sync: ConfigSync,
        stats: Arc<dyn StatsSource>,
    ) -> Self {
        Self {
            inbounds,
            clients,
            sync,
            stats,
            live: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn live(&self) -> MutexGuard<'_, HashMap<i64, (u64, u64)>> {
        self.live.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub async fn create_inbound(&self, actor: &Actor, request: CreateInbound) -> Result<Inbound> {
        check_port(request.port)?;
        let tag = request
            .tag
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| format!("inbound-{}", request.port));

        if self.inbounds.port_taken(request.port, None).await? {
            return Err(PanelError::PortConflict(request.port));
        }
        if self.inbounds.tag_taken(&tag, None).await? {
            return Err(PanelError::TagConflict(tag));
        }

        let settings = prepare_settings(request.protocol, &request.settings)?;
        let security = request.security.unwrap_or(Security::None);
        check_security(security, request.tls_settings.as_ref(), request.reality_settings.as_ref())?;

        let inbound = self
            .inbounds
            .create(&NewInbound {
                user_id: actor.user_id,
                remark: request.remark,
                protocol: request.protocol,
                port: request.port,
                listen: request.listen.unwrap_or_else(|| DEFAULT_LISTEN.to_string()),
                tag,
                settings,
                network: request.network.unwrap_or(Network::Tcp),
                security,
                stream_settings: request.stream_settings,
                tls_settings: request.tls_settings,
                reality_settings: request.reality_settings,
                sniffing: request.sniffing,
                is_active: request.is_active.unwrap_or(true),
            })
            .await?;

        if let Err(e) = self.sync.resync().await {
            if rejected_before_activation(&e) {
                warn!("⚠️ Xray rejected inbound {}, rolling back: {}", inbound.tag, e);
                self.inbounds.delete(inbound.id).await?;
            }
            return Err(e);
        }

        info!("✅ Inbound created: {} ({} on port {})", inbound.tag, inbound.protocol, inbound.port);
        Ok(inbound)
    }

    pub async fn list_inbounds(&self, actor: &Actor, mut filter: InboundFilter) -> Result<Page<Inbound>> {
        if !actor.is_admin() {
            filter.user_id = Some(actor.user_id);
        }
        if filter.page == 0 {
            filter.page = 1;
        }
        if filter.limit == 0 {
            filter.limit = DEFAULT_PAGE_SIZE;
        }
        let (items, total) = self.inbounds.list(&filter).await?;
        Ok(Page::new(items, total, filter.page, filter.limit))
    }

    pub async fn get_inbound(&self, actor: &Actor, id: i64) -> Result<Inbound> {
        let inbound = self.inbounds.get_by_id(id).await?.ok_or(PanelError::NotFound("Inbound"))?;
        actor.authorize(inbound.user_id)?;
        Ok(inbound)
    }

    pub async fn update_inbound(&self, actor: &Actor, id: i64, changes: UpdateInbound) -> Result<Inbound> {
        let previous = self.get_inbound(actor, id).await?;
        let mut next = previous.clone();

        if let Some(port) = changes.port.filter(|p| *p != previous.port) {
            check_port(port)?;
            if self.inbounds.port_taken(port, Some(id)).await? {
                return Err(PanelError::PortConflict(port));
            }
            next.port = port;
        }
        if let Some(tag) = changes.tag.filter(|t| !t.trim().is_empty() && *t != previous.tag) {
            if self.inbounds.tag_taken(&tag, Some(id)).await? {
                return Err(PanelError::TagConflict(tag));
            }
            next.tag = tag;
        }

        if changes.protocol.is_some() || changes.settings.is_some() {
            let protocol = changes.protocol.unwrap_or(previous.protocol);
            let settings = changes.settings.unwrap_or_else(|| previous.settings.0.clone());
            next.protocol = protocol;
            next.settings.0 = prepare_settings(protocol, &settings)?;
        }

        if let Some(remark) = changes.remark {
            next.remark = Some(remark);
        }
        if let Some(listen) = changes.listen {
            next.listen = listen;
        }
        if let Some(network) = changes.network {
            next.network = network;
        }
        if let Some(security) = changes.security {
            next.security = security;
            // Blocks of the mode being left behind are dropped unless re-supplied.
            if security != Security::Tls {
                next.tls_settings = None;
            }
            if security != Security::Reality {
                next.reality_settings = None;
            }
        }
        if let Some(stream) = changes.stream_settings {
            next.stream_settings = Some(Json(stream));
        }
        if let Some(tls) = changes.tls_settings {
            next.tls_settings = Some(Json(tls));
        }
        if let Some(reality) = changes.reality_settings {
            next.reality_settings = Some(Json(reality));
        }
        if let Some(sniffing) = changes.sniffing {
            next.sniffing = Some(Json(sniffing));
        }
        if let Some(active) = changes.is_active {
            next.is_active = active;
        }
        check_security(
            next.security,
            next.tls_settings.as_ref().map(|j| &j.0),
            next.reality_settings.as_ref().map(|j| &j.0),
        )?;

        let updated = self.inbounds.update(&next).await?;
        if let Err(e) = self.sync.resync().await {
            if rejected_before_activation(&e) {
                warn!("⚠️ Xray rejected update of inbound {}, restoring: {}", previous.tag, e);
                self.inbounds.update(&previous).await?;
            }
            return Err(e);
        }

        info!("✅ Inbound updated: {}", updated.tag);
        Ok(updated)
    }

    /// Flips `is_active` and returns the new value.
    pub async fn toggle_inbound(&self, actor: &Actor, id: i64) -> Result<bool> {
        let inbound = self.get_inbound(actor, id).await?;
        let active = !inbound.is_active;
        self.inbounds.set_active(id, active).await?;

        if let Err(e) = self.sync.resync().await {
            if rejected_before_activation(&e) {
                self.inbounds.set_active(id, inbound.is_active).await?;
            }
            return Err(e);
        }

        info!("🔄 Inbound {} is now {}", inbound.tag, if active { "active" } else { "inactive" });
        Ok(active)
    }

    pub async fn delete_inbound(&self, actor: &Actor, id: i64) -> Result<()> {
        let inbound = self.get_inbound(actor, id).await?;
        let clients = self.clients.count_by_inbound(id).await?;
        if clients > 0 {
            return Err(PanelError::Conflict(format!(
                "Inbound {} still has {} clients; delete or migrate them first",
                inbound.tag, clients
            )));
        }

        self.inbounds.delete(id).await?;
        self.live().remove(&id);
        self.sync.resync().await?;
        info!("🗑️ Inbound deleted: {}", inbound.tag);
        Ok(())
    }

    pub async fn restart_inbound(&self, actor: &Actor, id: i64) -> Result<ProcessStatus> {
        let inbound = self.get_inbound(actor, id).await?;
        info!("♻️ Reloading Xray for inbound {}", inbound.tag);
        self.sync.proxy().reload_config().await
    }

    pub async fn get_inbound_stats(&self, actor: &Actor, id: i64) -> Result<InboundStats> {
        let inbound = self.get_inbound(actor, id).await?;
        let realtime = match self.stats.inbound_stats(&inbound.tag).await {
            Ok(resp) => Some(LiveCounters { up: resp.uplink(), down: resp.downlink() }),
            Err(e) => {
                warn!("⚠️ Live stats unavailable for {}: {}", inbound.tag, e);
                None
            }
        };
        let clients = self.clients.get_by_inbound(id).await?;

        Ok(InboundStats {
            inbound_id: inbound.id,
            tag: inbound.tag.clone(),
            up: inbound.up_bytes(),
            down: inbound.down_bytes(),
            realtime,
            clients: InboundClientTotals::tally(&clients),
        })
    }

    /// Folds the proxy's per-inbound counters into the stored totals.
    ///
    /// Counters read for the first time since startup are added whole, since
    /// the proxy was started by this process. A counter that went backwards
    /// means the proxy restarted and counts as a fresh delta.
    pub async fn sync_traffic(&self) -> Result<TrafficSyncReport> {
        let inbounds = self.inbounds.get_active().await?;
        let mut report = TrafficSyncReport { polled: inbounds.len(), ..Default::default() };

        for inbound in &inbounds {
            let current = match self.stats.inbound_stats(&inbound.tag).await {
                Ok(resp) => (resp.uplink(), resp.downlink()),
                Err(e) => {
                    warn!("⚠️ Traffic sync failed for {}: {}", inbound.tag, e);
                    report.failed += 1;
                    continue;
                }
            };

            let previous = self.live().insert(inbound.id, current).unwrap_or((0, 0));
            let up = counter_delta(previous.0, current.0);
            let down = counter_delta(previous.1, current.1);
            if up == 0 && down == 0 {
                continue;
            }

            self.inbounds
                .set_traffic(
                    inbound.id,
                    inbound.up_bytes().saturating_add(up),
                    inbound.down_bytes().saturating_add(down),
                )
                .await?;
            report.updated += 1;
        }

        info!(
            "📈 Inbound traffic synced: {} polled, {} updated, {} failed",
            report.polled, report.updated, report.failed
        );
        Ok(report)
    }
}
