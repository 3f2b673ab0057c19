use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};
use xpanel_db::models::xray_config::XrayConfigRecord;
use xpanel_db::repositories::client_repo::ClientRepository;
use xpanel_db::repositories::inbound_repo::InboundRepository;

use crate::error::Result;
use crate::xray::{ConfigGenerator, ConfigStore, GeneratorOptions, ProxyControl};

#[derive(Debug)]
pub enum SyncOutcome {
    Deployed(XrayConfigRecord),
    /// No active inbound left, the proxy was stopped.
    Stopped,
}

/// Rebuilds the proxy configuration from the database and rolls it out.
#[derive(Clone)]
pub struct ConfigSync {
    inbounds: InboundRepository,
    clients: ClientRepository,
    store: ConfigStore,
    proxy: Arc<dyn ProxyControl>,
    options: GeneratorOptions,
    lock: Arc<Mutex<()>>,
}

impl ConfigSync {
    pub fn new(
        inbounds: InboundRepository,
        clients: ClientRepository,
        store: ConfigStore,
        proxy: Arc<dyn ProxyControl>,
        options: GeneratorOptions,
    ) -> Self {
        Self {
            inbounds,
            clients,
            store,
            proxy,
            options,
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn proxy(&self) -> &Arc<dyn ProxyControl> {
        &self.proxy
    }

    pub fn store(&self) -> &ConfigStore {
        &self.store
    }

    /// Current database state as a proxy document, without deploying it.
    pub async fn render(&self) -> Result<Value> {
        let inbounds = self.inbounds.get_active().await?;
        let clients = self.clients.get_deployable().await?;
        let config = ConfigGenerator::generate_config(&self.options, &inbounds, &clients, Vec::new());
        Ok(serde_json::to_value(config)?)
    }

    /// Build, validate, test, activate and reload. Concurrent callers are
    /// serialized so the last mutation always wins on disk.
    pub async fn resync(&self) -> Result<SyncOutcome> {
        let _guard = self.lock.lock().await;

        let inbounds = self.inbounds.get_active().await?;
        if inbounds.is_empty() {
            warn!("⚠️ No active inbounds, stopping Xray");
            self.proxy.stop().await?;
            return Ok(SyncOutcome::Stopped);
        }

        let clients = self.clients.get_deployable().await?;
        let config = ConfigGenerator::generate_config(&self.options, &inbounds, &clients, Vec::new());
        let record = self.store.deploy(serde_json::to_value(config)?, self.proxy.as_ref()).await?;

        info!(
            "🔄 Xray config #{} deployed ({} inbounds, {} clients)",
            record.id,
            inbounds.len(),
            clients.len()
        );
        Ok(SyncOutcome::Deployed(record))
    }
}
