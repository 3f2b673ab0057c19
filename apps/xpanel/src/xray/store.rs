use chrono::Utc;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use xpanel_db::models::xray_config::XrayConfigRecord;
use xpanel_db::repositories::config_repo::ConfigRepository;

use super::manager::ProxyControl;
use super::validator::{self, STORAGE_ONLY_KEYS};
use crate::error::{PanelError, Result};

/// Owns the active configuration row and the file the proxy reads.
///
/// Nothing here touches the canonical file or the active flag until the
/// document has been validated; the file is replaced by rename inside the
/// transaction that flips the flag, so a failed commit never leaves a
/// half-written file behind.
#[derive(Clone)]
pub struct ConfigStore {
    repo: ConfigRepository,
    config_path: PathBuf,
    backups_dir: PathBuf,
}

impl ConfigStore {
    pub fn new(repo: ConfigRepository, config_path: impl Into<PathBuf>, backups_dir: impl Into<PathBuf>) -> Self {
        Self {
            repo,
            config_path: config_path.into(),
            backups_dir: backups_dir.into(),
        }
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub async fn get_active(&self) -> Result<Option<XrayConfigRecord>> {
        Ok(self.repo.get_active().await?)
    }

    /// Validate, normalize, supersede the active row and write the file.
    pub async fn save(&self, document: Value) -> Result<XrayConfigRecord> {
        let document = validator::validate_and_normalize(document)?;

        let mut tx = self.repo.begin().await?;
        ConfigRepository::deactivate_all(&mut tx).await?;
        let record = ConfigRepository::insert_active(&mut tx, &document).await?;
        self.write_config_file(&document).await?;
        tx.commit().await.map_err(anyhow::Error::from)?;

        info!("💾 Saved configuration #{} to {}", record.id, self.config_path.display());
        Ok(record)
    }

    /// Like `save`, but the proxy must accept the candidate file first and is
    /// reloaded once it is in place.
    pub async fn deploy(&self, document: Value, proxy: &dyn ProxyControl) -> Result<XrayConfigRecord> {
        let document = validator::validate_and_normalize(document)?;
        let candidate = self.stage_candidate(&document, proxy).await?;

        let mut tx = self.repo.begin().await?;
        ConfigRepository::deactivate_all(&mut tx).await?;
        let record = ConfigRepository::insert_active(&mut tx, &document).await?;
        self.promote(&candidate).await?;
        tx.commit().await.map_err(anyhow::Error::from)?;

        info!("🚀 Deployed configuration #{}", record.id);
        proxy.reload_config().await?;
        Ok(record)
    }

    /// Re-activates a stored configuration.
    pub async fn apply(&self, config_id: i64, proxy: &dyn ProxyControl) -> Result<XrayConfigRecord> {
        let stored = self
            .repo
            .get_by_id(config_id)
            .await?
            .ok_or(PanelError::NotFound("Configuration"))?;
        let document = validator::validate_and_normalize(stored.document.0)?;
        let candidate = self.stage_candidate(&document, proxy).await?;

        let mut tx = self.repo.begin().await?;
        ConfigRepository::deactivate_all(&mut tx).await?;
        let record = ConfigRepository::activate(&mut tx, config_id, &document).await?;
        self.promote(&candidate).await?;
        tx.commit().await.map_err(anyhow::Error::from)?;

        info!("🔄 Applied configuration #{}", record.id);
        proxy.reload_config().await?;
        Ok(record)
    }

    /// Rewrites the file from the active row. Returns `None` when nothing is active.
    pub async fn sync_from_db(&self) -> Result<Option<XrayConfigRecord>> {
        let Some(active) = self.repo.get_active().await? else {
            warn!("⚠️ No active configuration stored, leaving {} as is", self.config_path.display());
            return Ok(None);
        };
        let document = validator::normalize(active.document.0.clone());
        self.write_config_file(&document).await?;
        info!("♻️ Restored configuration #{} to {}", active.id, self.config_path.display());
        Ok(Some(active))
    }

    /// Copies the deployed file to `{backups_dir}/xray-config-{timestamp}.json`.
    pub async fn backup(&self) -> Result<PathBuf> {
        if !tokio::fs::try_exists(&self.config_path).await? {
            return Err(PanelError::NotFound("Deployed configuration file"));
        }
        tokio::fs::create_dir_all(&self.backups_dir).await?;

        let stamp = Utc::now().format("%Y-%m-%dT%H-%M-%S%.3fZ");
        let target = self.backups_dir.join(format!("xray-config-{}.json", stamp));
        tokio::fs::copy(&self.config_path, &target).await?;

        info!("📦 Backed up configuration to {}", target.display());
        Ok(target)
    }

    /// Pretty JSON without storage metadata, written atomically.
    pub async fn write_config_file(&self, document: &Value) -> Result<()> {
        write_atomic(&self.config_path, &render(document)?).await
    }

    /// Writes the document beside the canonical file and has the proxy dry-run it.
    async fn stage_candidate(&self, document: &Value, proxy: &dyn ProxyControl) -> Result<Candidate> {
        let path = sibling(&self.config_path, &format!("candidate.{}", uuid::Uuid::new_v4().simple()));
        write_atomic(&path, &render(document)?).await?;
        let candidate = Candidate { path };
        proxy.test_config(&candidate.path).await?;
        Ok(candidate)
    }

    async fn promote(&self, candidate: &Candidate) -> Result<()> {
        tokio::fs::rename(&candidate.path, &self.config_path).await?;
        Ok(())
    }
}

/// Candidate file beside the canonical path. Removed on drop unless renamed.
struct Candidate {
    path: PathBuf,
}

impl Drop for Candidate {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn render(document: &Value) -> Result<String> {
    let mut document = document.clone();
    if let Some(root) = document.as_object_mut() {
        for key in STORAGE_ONLY_KEYS {
            root.remove(*key);
        }
    }
    Ok(serde_json::to_string_pretty(&document)?)
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "config.json".to_string());
    path.with_file_name(format!(".{}.{}", name, suffix))
}

/// Writes through a hidden temporary file and renames it over `path`.
pub async fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = sibling(path, &format!("tmp.{}", uuid::Uuid::new_v4().simple()));
    tokio::fs::write(&tmp, contents).await?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use xpanel_shared::status::ProcessStatus;

    struct FakeProxy {
        accept: bool,
        tested: AtomicUsize,
        reloads: AtomicUsize,
    }

    impl FakeProxy {
        fn new(accept: bool) -> Self {
            Self { accept, tested: AtomicUsize::new(0), reloads: AtomicUsize::new(0) }
        }
    }

    #[async_trait]
    impl ProxyControl for FakeProxy {
        async fn test_config(&self, path: &Path) -> Result<String> {
            self.tested.fetch_add(1, Ordering::SeqCst);
            assert!(path.exists(), "candidate must exist while being tested");
            if self.accept {
                Ok("Configuration OK.".to_string())
            } else {
                Err(PanelError::ConfigTestFailed { output: "unknown field".to_string() })
            }
        }

        async fn reload_config(&self) -> Result<ProcessStatus> {
            self.reloads.fetch_add(1, Ordering::SeqCst);
            Ok(ProcessStatus::default())
        }

        async fn stop(&self) -> Result<ProcessStatus> {
            Ok(ProcessStatus::default())
        }
    }

    fn document(port: u16) -> Value {
        json!({
            "id": 99,
            "log": { "loglevel": "warning" },
            "api": { "tag": "api", "services": ["StatsService"] },
            "inbounds": [{
                "tag": format!("inbound-{}", port),
                "port": port,
                "protocol": "vless",
                "settings": { "clients": [], "decryption": "none" },
                "streamSettings": { "network": "tcp", "sockopt": { "tproxy": true } }
            }],
            "outbounds": [{ "protocol": "freedom", "tag": "direct" }],
            "routing": { "domainStrategy": "IPIfNonMatch", "rules": [] }
        })
    }

    async fn store(dir: &Path) -> (ConfigStore, ConfigRepository) {
        let pool = xpanel_db::connect_memory().await.unwrap();
        let repo = ConfigRepository::new(pool);
        let store = ConfigStore::new(repo.clone(), dir.join("xray/config.json"), dir.join("backups"));
        (store, repo)
    }

    fn read_file(path: &Path) -> Value {
        serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap()
    }

    fn leftovers(dir: &Path) -> Vec<String> {
        std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|name| name.starts_with('.'))
            .collect()
    }

    #[tokio::test]
    async fn save_keeps_exactly_one_active_row_and_writes_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let (store, repo) = store(dir.path()).await;

        let first = store.save(document(443)).await.unwrap();
        let second = store.save(document(8443)).await.unwrap();

        assert_eq!(repo.count_active().await.unwrap(), 1);
        assert_eq!(store.get_active().await.unwrap().unwrap().id, second.id);
        assert!(!repo.get_by_id(first.id).await.unwrap().unwrap().is_active);

        let on_disk = read_file(store.config_path());
        assert_eq!(on_disk["inbounds"][0]["port"], 8443);
        assert_eq!(on_disk["inbounds"][0]["streamSettings"]["sockopt"]["tproxy"], "redirect");
        assert!(on_disk.get("id").is_none());
    }

    #[tokio::test]
    async fn invalid_document_touches_neither_file_nor_flag() {
        let dir = tempfile::tempdir().unwrap();
        let (store, repo) = store(dir.path()).await;
        let good = store.save(document(443)).await.unwrap();
        let before = std::fs::read_to_string(store.config_path()).unwrap();

        let mut bad = document(8443);
        bad["inbounds"] = json!([]);
        let err = store.save(bad).await.unwrap_err();

        assert!(matches!(err, PanelError::InvalidConfig(_)));
        assert_eq!(std::fs::read_to_string(store.config_path()).unwrap(), before);
        assert_eq!(repo.get_active().await.unwrap().unwrap().id, good.id);
    }

    #[tokio::test]
    async fn rejected_candidate_is_not_activated() {
        let dir = tempfile::tempdir().unwrap();
        let (store, repo) = store(dir.path()).await;
        let good = store.save(document(443)).await.unwrap();
        let proxy = FakeProxy::new(false);

        let err = store.deploy(document(8443), &proxy).await.unwrap_err();

        assert!(matches!(err, PanelError::ConfigTestFailed { .. }));
        assert_eq!(proxy.tested.load(Ordering::SeqCst), 1);
        assert_eq!(proxy.reloads.load(Ordering::SeqCst), 0);
        assert_eq!(repo.get_active().await.unwrap().unwrap().id, good.id);
        assert_eq!(read_file(store.config_path())["inbounds"][0]["port"], 443);
        assert!(leftovers(&dir.path().join("xray")).is_empty());
    }

    #[tokio::test]
    async fn deploy_and_apply_reload_the_proxy() {
        let dir = tempfile::tempdir().unwrap();
        let (store, repo) = store(dir.path()).await;
        let proxy = FakeProxy::new(true);

        let first = store.deploy(document(443), &proxy).await.unwrap();
        store.deploy(document(8443), &proxy).await.unwrap();
        assert_eq!(read_file(store.config_path())["inbounds"][0]["port"], 8443);

        let applied = store.apply(first.id, &proxy).await.unwrap();
        assert_eq!(applied.id, first.id);
        assert!(applied.is_active);
        assert_eq!(repo.count_active().await.unwrap(), 1);
        assert_eq!(read_file(store.config_path())["inbounds"][0]["port"], 443);
        assert_eq!(proxy.reloads.load(Ordering::SeqCst), 3);

        let missing = store.apply(first.id + 100, &proxy).await.unwrap_err();
        assert!(matches!(missing, PanelError::NotFound(_)));
    }

    #[tokio::test]
    async fn backup_copies_the_deployed_file() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = store(dir.path()).await;

        assert!(matches!(store.backup().await, Err(PanelError::NotFound(_))));

        store.save(document(443)).await.unwrap();
        let target = store.backup().await.unwrap();

        let name = target.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("xray-config-") && name.ends_with(".json"));
        assert_eq!(
            std::fs::read_to_string(&target).unwrap(),
            std::fs::read_to_string(store.config_path()).unwrap()
        );
    }

    #[tokio::test]
    async fn sync_from_db_restores_a_deleted_file() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = store(dir.path()).await;

        assert!(store.sync_from_db().await.unwrap().is_none());

        store.save(document(443)).await.unwrap();
        std::fs::remove_file(store.config_path()).unwrap();

        let restored = store.sync_from_db().await.unwrap();
        assert!(restored.is_some());
        assert_eq!(read_file(store.config_path())["inbounds"][0]["port"], 443);
    }
}
