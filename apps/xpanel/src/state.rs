use sqlx::SqlitePool;
use std::sync::Arc;
use xpanel_db::repositories::anomaly_repo::AnomalyRepository;
use xpanel_db::repositories::client_repo::ClientRepository;
use xpanel_db::repositories::config_repo::ConfigRepository;
use xpanel_db::repositories::inbound_repo::InboundRepository;
use xpanel_db::repositories::model_repo::ModelRepository;
use xpanel_db::repositories::server_repo::ServerRepository;
use xpanel_db::repositories::traffic_repo::TrafficRepository;

use crate::ai::{AnomalyDetector, TrafficCollector};
use crate::error::Result;
use crate::services::{ClientService, ConfigSync, InboundService, ServerService};
use crate::settings::Settings;
use crate::xray::{ConfigStore, ProxyControl, StatsSource, XrayManager, XrayStatsClient};

/// Everything the panel runs on, built once at startup and shared by `Arc`.
#[derive(Clone)]
pub struct AppContext {
    pub pool: SqlitePool,
    pub settings: Arc<Settings>,
    pub xray: Arc<XrayManager>,
    pub stats: Arc<XrayStatsClient>,
    pub store: ConfigStore,
    pub sync: ConfigSync,
    pub inbounds: Arc<InboundService>,
    pub clients: Arc<ClientService>,
    pub servers: Arc<ServerService>,
    pub collector: Arc<TrafficCollector>,
    pub detector: Arc<AnomalyDetector>,
}

impl AppContext {
    pub fn new(pool: SqlitePool, settings: Settings) -> Result<Self> {
        let inbound_repo = InboundRepository::new(pool.clone());
        let client_repo = ClientRepository::new(pool.clone());
        let traffic_repo = TrafficRepository::new(pool.clone());

        let xray = Arc::new(XrayManager::new(settings.manager_settings()));
        let stats = Arc::new(XrayStatsClient::new(
            &settings.xray_api_host,
            settings.xray_api_port,
            settings.stats_timeout(),
        )?);
        let stats_source: Arc<dyn StatsSource> = stats.clone();
        let proxy: Arc<dyn ProxyControl> = xray.clone();

        let store = ConfigStore::new(
            ConfigRepository::new(pool.clone()),
            settings.xray_config_path.clone(),
            settings.backups_dir.clone(),
        );
        let sync = ConfigSync::new(
            inbound_repo.clone(),
            client_repo.clone(),
            store.clone(),
            proxy,
            settings.generator_options(),
        );

        let inbounds = Arc::new(InboundService::new(
            inbound_repo.clone(),
            client_repo.clone(),
            sync.clone(),
            stats_source.clone(),
        ));
        let clients = Arc::new(
            ClientService::new(client_repo.clone(), inbound_repo, sync.clone())
                .with_address(settings.server_address.clone()),
        );
        let servers = Arc::new(ServerService::new(ServerRepository::new(pool.clone()), client_repo.clone())?);
        let collector = Arc::new(TrafficCollector::new(client_repo, traffic_repo.clone(), stats_source));
        let detector = Arc::new(AnomalyDetector::new(
            settings.detector_settings()?,
            settings.models_dir.clone(),
            traffic_repo,
            AnomalyRepository::new(pool.clone()),
            ModelRepository::new(pool.clone()),
        ));

        Ok(Self {
            pool,
            settings: Arc::new(settings),
            xray,
            stats,
            store,
            sync,
            inbounds,
            clients,
            servers,
            collector,
            detector,
        })
    }
}
