use clap::Args;
use std::path::PathBuf;
use std::time::Duration;

use crate::ai::DetectorSettings;
use crate::error::Result;
use crate::xray::manager::{STABLE_AFTER, STOP_GRACE};
use crate::xray::{GeneratorOptions, ManagerSettings};

/// Process-wide settings, from flags or the environment (`.env` included).
#[derive(Args, Debug, Clone)]
pub struct Settings {
    /// SQLite database URL
    #[arg(long, env = "DATABASE_URL", default_value = "sqlite://xpanel.db", global = true)]
    pub database_url: String,

    /// Xray executable
    #[arg(long, env = "XRAY_BIN_PATH", default_value = "/usr/local/bin/xray", global = true)]
    pub xray_bin_path: PathBuf,

    /// Canonical Xray configuration file
    #[arg(long, env = "XRAY_CONFIG_PATH", default_value = "/etc/x-ui/config.json", global = true)]
    pub xray_config_path: PathBuf,

    #[arg(long, env = "XRAY_LOG_LEVEL", default_value = "warning", global = true)]
    pub xray_log_level: String,

    /// Restart Xray when it exits unexpectedly
    #[arg(
        long,
        env = "XRAY_AUTO_RESTART",
        default_value_t = true,
        action = clap::ArgAction::Set,
        global = true
    )]
    pub xray_auto_restart: bool,

    #[arg(long, env = "XRAY_RESTART_MAX_ATTEMPTS", default_value_t = 5, global = true)]
    pub xray_restart_max_attempts: u32,

    /// Stats API host
    #[arg(long, env = "XRAY_API_HOST", default_value = "127.0.0.1", global = true)]
    pub xray_api_host: String,

    /// Stats API port
    #[arg(long, env = "XRAY_API_PORT", default_value_t = 62789, global = true)]
    pub xray_api_port: u16,

    #[arg(long, env = "XRAY_API_TIMEOUT_SECS", default_value_t = 5, global = true)]
    pub xray_api_timeout_secs: u64,

    /// Public host written into client share links
    #[arg(long, env = "SERVER_ADDRESS", default_value = "127.0.0.1", global = true)]
    pub server_address: String,

    /// Where trained anomaly models are written
    #[arg(long, env = "MODELS_DIR", default_value = "./models", global = true)]
    pub models_dir: PathBuf,

    #[arg(long, env = "BACKUPS_DIR", default_value = "./backups", global = true)]
    pub backups_dir: PathBuf,

    #[arg(long, env = "LOG_DIR", default_value = ".", global = true)]
    pub log_dir: PathBuf,

    /// Optional JSON file with anomaly detector thresholds
    #[arg(long, env = "DETECTOR_CONFIG", global = true)]
    pub detector_config: Option<PathBuf>,
}

impl Settings {
    pub fn manager_settings(&self) -> ManagerSettings {
        ManagerSettings {
            bin_path: self.xray_bin_path.clone(),
            config_path: self.xray_config_path.clone(),
            auto_restart: self.xray_auto_restart,
            restart_max_attempts: self.xray_restart_max_attempts,
            stop_grace: STOP_GRACE,
            stable_after: STABLE_AFTER,
        }
    }

    pub fn generator_options(&self) -> GeneratorOptions {
        GeneratorOptions {
            log_level: self.xray_log_level.clone(),
            ..GeneratorOptions::default()
        }
    }

    pub fn stats_timeout(&self) -> Duration {
        Duration::from_secs(self.xray_api_timeout_secs.max(1))
    }

    pub fn detector_settings(&self) -> Result<DetectorSettings> {
        match &self.detector_config {
            Some(path) => DetectorSettings::load(path),
            None => Ok(DetectorSettings::default()),
        }
    }
}
