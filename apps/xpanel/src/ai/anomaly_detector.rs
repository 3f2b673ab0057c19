use chrono::{DateTime, Datelike, Duration, Local, Timelike, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info, warn};
use xpanel_db::models::ai_model::{AiModel, NewAiModel};
use xpanel_db::models::anomaly::{Anomaly, AnomalyCount, AnomalyType, AnomalyWithClient, NewAnomaly, Severity};
use xpanel_db::models::traffic::{TrafficSnapshot, WindowAverages};
use xpanel_db::repositories::anomaly_repo::AnomalyRepository;
use xpanel_db::repositories::model_repo::ModelRepository;
use xpanel_db::repositories::traffic_repo::TrafficRepository;

use super::autoencoder::{Autoencoder, LAYER_SIZES, MinMaxScaler, TrainOptions};
use crate::error::{PanelError, Result};

const LIST_LIMIT: i64 = 200;
const STATS_WINDOW_DAYS: i64 = 7;
const MODEL_NAME: &str = "traffic-autoencoder";

/// Detector thresholds and windows. Every field has a default, so a partial
/// JSON file is enough to override a few of them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorSettings {
    pub spike_multiplier: f64,
    pub ddos_connections: i64,
    pub sustained_multiplier: f64,
    pub sustained_min_samples: usize,
    /// Hours (local time, inclusive) in which heavy traffic is unusual.
    pub unusual_hours: (u32, u32),
    /// Bytes/s.
    pub unusual_rate: f64,
    pub recent_window_secs: i64,
    pub baseline_window_secs: i64,
    pub dedup_window_secs: i64,
    /// Collector period, used to turn a sample count into a duration.
    pub sample_interval_secs: i64,
    pub training_window_days: i64,
    pub min_training_samples: usize,
    pub epochs: usize,
    pub batch_size: usize,
    pub validation_split: f64,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            spike_multiplier: 5.0,
            ddos_connections: 100,
            sustained_multiplier: 3.0,
            sustained_min_samples: 10,
            unusual_hours: (2, 5),
            unusual_rate: 1_000_000.0,
            recent_window_secs: 600,
            baseline_window_secs: 3600,
            dedup_window_secs: 300,
            sample_interval_secs: 30,
            training_window_days: 30,
            min_training_samples: 200,
            epochs: 50,
            batch_size: 32,
            validation_split: 0.2,
        }
    }
}

impl DetectorSettings {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw)
            .map_err(|e| PanelError::Validation(format!("Invalid detector settings in {}: {}", path.display(), e)))
    }

    fn train_options(&self) -> TrainOptions {
        TrainOptions {
            epochs: self.epochs,
            batch_size: self.batch_size,
            validation_split: self.validation_split,
            ..TrainOptions::default()
        }
    }
}

/// One triggered rule, before deduplication.
#[derive(Debug, Clone, PartialEq)]
pub struct Finding {
    pub anomaly_type: AnomalyType,
    pub severity: Severity,
    pub score: f64,
    pub description: String,
}

/// Threshold rules over one client's latest sample. `hour` is the sample's
/// local hour; `recent` is the current window including `latest`.
pub fn evaluate(
    settings: &DetectorSettings,
    latest: &TrafficSnapshot,
    recent: &[TrafficSnapshot],
    baseline: &WindowAverages,
    hour: u32,
) -> Vec<Finding> {
    let avg_rate = baseline.avg_rate.unwrap_or(0.0);
    let mut findings = Vec::new();

    if avg_rate > 0.0 && latest.total_rate > avg_rate * settings.spike_multiplier {
        let ratio = latest.total_rate / avg_rate;
        findings.push(Finding {
            anomaly_type: AnomalyType::Spike,
            severity: Severity::High,
            score: (ratio * 10.0).min(100.0),
            description: format!(
                "Traffic spike: {:.2} MB/s ({:.1}x normal)",
                latest.total_rate / 1024.0 / 1024.0,
                ratio
            ),
        });
    }

    if latest.connection_count > settings.ddos_connections {
        findings.push(Finding {
            anomaly_type: AnomalyType::Ddos,
            severity: Severity::Critical,
            score: (latest.connection_count as f64 / 10.0).min(100.0),
            description: format!("Potential DDoS: {} concurrent connections", latest.connection_count),
        });
    }

    let (from, to) = settings.unusual_hours;
    if (from..=to).contains(&hour) && latest.total_rate > settings.unusual_rate {
        findings.push(Finding {
            anomaly_type: AnomalyType::UnusualTime,
            severity: Severity::Medium,
            score: 50.0,
            description: format!("High activity at unusual hour: {}:00", hour),
        });
    }

    let high = if avg_rate > 0.0 {
        recent
            .iter()
            .filter(|s| s.total_rate > avg_rate * settings.sustained_multiplier)
            .count()
    } else {
        0
    };
    if high >= settings.sustained_min_samples {
        findings.push(Finding {
            anomaly_type: AnomalyType::SustainedHigh,
            severity: Severity::Medium,
            score: 60.0,
            description: format!(
                "Sustained high traffic for {} seconds",
                high as i64 * settings.sample_interval_secs
            ),
        });
    }

    findings
}

/// `[up, down, total, connections, hour, weekday]`, weekday counted from Sunday.
pub fn features(snapshot: &TrafficSnapshot) -> Vec<f64> {
    let local = snapshot.timestamp.with_timezone(&Local);
    vec![
        snapshot.up_rate,
        snapshot.down_rate,
        snapshot.total_rate,
        snapshot.connection_count as f64,
        local.hour() as f64,
        local.weekday().num_days_from_sunday() as f64,
    ]
}

/// Artifact written next to each training run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub network: Autoencoder,
    pub scaler: MinMaxScaler,
    pub sample_count: usize,
    pub train_loss: f64,
    pub val_loss: Option<f64>,
}

impl ModelArtifact {
    pub fn score(&self, snapshot: &TrafficSnapshot) -> f64 {
        self.network.reconstruction_error(&self.scaler.transform(&features(snapshot)))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string(self)?;
        std::fs::write(path, json)
            .map_err(|e| anyhow::anyhow!("Failed to write model to {}: {}", path.display(), e))?;
        Ok(())
    }

    /// `1 - validation MSE`, clamped to `[0, 1]`.
    pub fn accuracy(&self) -> f64 {
        (1.0 - self.val_loss.unwrap_or(self.train_loss)).clamp(0.0, 1.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyStats {
    pub stats: Vec<AnomalyCount>,
    pub unresolved_count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub model: Option<AiModel>,
    pub ready: bool,
}

struct LoadedModel {
    record: AiModel,
    artifact: ModelArtifact,
}

pub struct AnomalyDetector {
    settings: DetectorSettings,
    models_dir: PathBuf,
    traffic: TrafficRepository,
    anomalies: AnomalyRepository,
    models: ModelRepository,
    model: RwLock<Option<Arc<LoadedModel>>>,
}

impl AnomalyDetector {
    pub fn new(
        settings: DetectorSettings,
        models_dir: impl Into<PathBuf>,
        traffic: TrafficRepository,
        anomalies: AnomalyRepository,
        models: ModelRepository,
    ) -> Self {
        Self {
            settings,
            models_dir: models_dir.into(),
            traffic,
            anomalies,
            models,
            model: RwLock::new(None),
        }
    }

    pub fn settings(&self) -> &DetectorSettings {
        &self.settings
    }

    pub async fn is_ready(&self) -> bool {
        self.model.read().await.is_some()
    }

    /// Loads the active model, or trains one when there is none or it cannot be read.
    pub async fn initialize(&self) -> Result<()> {
        if let Some(record) = self.models.get_active().await? {
            match load_artifact(Path::new(&record.model_path)) {
                Ok(artifact) => {
                    info!("🧠 Loaded anomaly model {} ({} samples)", record.version, record.sample_count);
                    *self.model.write().await = Some(Arc::new(LoadedModel { record, artifact }));
                    return Ok(());
                }
                Err(e) => warn!("⚠️ Active model at {} is unreadable ({}), retraining", record.model_path, e),
            }
        }
        self.train_model().await?;
        Ok(())
    }

    /// Trains on the last 30 days of snapshots. `Ok(None)` when there is not enough data.
    pub async fn train_model(&self) -> Result<Option<AiModel>> {
        let since = Utc::now() - Duration::days(self.settings.training_window_days);
        let snapshots = self.traffic.since(since).await?;
        if snapshots.len() < self.settings.min_training_samples {
            warn!(
                "⚠️ Not enough traffic data to train ({} < {} samples), skipping",
                snapshots.len(),
                self.settings.min_training_samples
            );
            return Ok(None);
        }

        let samples: Vec<Vec<f64>> = snapshots.iter().map(features).collect();
        let options = self.settings.train_options();
        info!("🧠 Training anomaly model on {} samples", samples.len());

        let artifact = tokio::task::spawn_blocking(move || fit(samples, options))
            .await
            .map_err(|e| anyhow::anyhow!("Training task panicked: {}", e))?;

        let trained_at = Utc::now();
        let dir = self.models_dir.join(format!("anomaly_{}", trained_at.timestamp_millis()));
        std::fs::create_dir_all(&dir)?;
        let path = dir.join("model.json");
        artifact.save(&path)?;

        let record = self
            .models
            .create_active(&NewAiModel {
                name: MODEL_NAME.to_string(),
                version: format!("v{}", trained_at.format("%Y%m%d%H%M%S")),
                model_path: path.to_string_lossy().into_owned(),
                accuracy: artifact.accuracy(),
                sample_count: artifact.sample_count as i64,
                config: json!({
                    "layers": LAYER_SIZES,
                    "epochs": options.epochs,
                    "batchSize": options.batch_size,
                    "validationSplit": options.validation_split,
                    "trainLoss": artifact.train_loss,
                    "valLoss": artifact.val_loss,
                }),
                trained_at,
            })
            .await?;

        info!(
            "✅ Anomaly model {} trained: accuracy {:.4}, stored at {}",
            record.version,
            record.accuracy,
            path.display()
        );
        *self.model.write().await = Some(Arc::new(LoadedModel {
            record: record.clone(),
            artifact,
        }));
        Ok(Some(record))
    }

    /// Periodic entry point: never fails, logs and returns nothing instead.
    pub async fn detect_anomalies(&self) -> Vec<Anomaly> {
        match self.detect_at(Utc::now()).await {
            Ok(found) => found,
            Err(e) => {
                error!("❌ Anomaly detection error: {}", e);
                Vec::new()
            }
        }
    }

    pub async fn detect_at(&self, now: DateTime<Utc>) -> Result<Vec<Anomaly>> {
        let recent_start = now - Duration::seconds(self.settings.recent_window_secs);
        let baseline_start = now - Duration::seconds(self.settings.baseline_window_secs);
        let dedup_start = now - Duration::seconds(self.settings.dedup_window_secs);

        let mut by_client: BTreeMap<i64, Vec<TrafficSnapshot>> = BTreeMap::new();
        for snapshot in self.traffic.since(recent_start).await? {
            by_client.entry(snapshot.client_id).or_default().push(snapshot);
        }
        if by_client.is_empty() {
            return Ok(Vec::new());
        }

        let model = self.model.read().await.clone();
        let mut created = Vec::new();

        for (client_id, recent) in by_client {
            let Some(latest) = recent.last() else { continue };
            let baseline = self.traffic.averages(client_id, baseline_start, recent_start).await?;
            let hour = latest.timestamp.with_timezone(&Local).hour();

            let findings = evaluate(&self.settings, latest, &recent, &baseline, hour);
            if findings.is_empty() {
                continue;
            }

            let metrics = metrics(latest, &baseline, model.as_deref());
            for finding in findings {
                if self
                    .anomalies
                    .find_recent_unresolved(client_id, finding.anomaly_type, dedup_start)
                    .await?
                    .is_some()
                {
                    continue;
                }
                let anomaly = self
                    .anomalies
                    .create(&NewAnomaly {
                        client_id,
                        anomaly_type: finding.anomaly_type,
                        severity: finding.severity,
                        score: finding.score,
                        description: finding.description,
                        metrics: metrics.clone(),
                        detected_at: now,
                    })
                    .await?;
                warn!(
                    "🚨 Anomaly detected: {} for client {} ({})",
                    anomaly.anomaly_type, client_id, anomaly.description
                );
                created.push(anomaly);
            }
        }

        Ok(created)
    }

    /// Newest first.
    pub async fn list_anomalies(&self) -> Result<Vec<AnomalyWithClient>> {
        Ok(self.anomalies.list_recent(LIST_LIMIT).await?)
    }

    pub async fn resolve_anomaly(&self, id: i64, resolved_by: &str, notes: Option<&str>) -> Result<Anomaly> {
        self.anomalies
            .resolve(id, resolved_by, notes, Utc::now())
            .await?
            .ok_or(PanelError::NotFound("Anomaly"))
    }

    pub async fn get_anomaly_stats(&self) -> Result<AnomalyStats> {
        let since = Utc::now() - Duration::days(STATS_WINDOW_DAYS);
        Ok(AnomalyStats {
            stats: self.anomalies.counts_since(since).await?,
            unresolved_count: self.anomalies.unresolved_count().await?,
        })
    }

    pub async fn model_info(&self) -> Result<ModelInfo> {
        let loaded = self.model.read().await.clone();
        let model = match loaded {
            Some(loaded) => Some(loaded.record.clone()),
            None => self.models.get_active().await?,
        };
        Ok(ModelInfo {
            model,
            ready: self.is_ready().await,
        })
    }
}

fn metrics(latest: &TrafficSnapshot, baseline: &WindowAverages, model: Option<&LoadedModel>) -> Value {
    let mut metrics = json!({
        "upRate": latest.up_rate,
        "downRate": latest.down_rate,
        "totalRate": latest.total_rate,
        "connectionCount": latest.connection_count,
        "connectionCountEstimated": true,
        "baseline": {
            "avgRate": baseline.avg_rate.unwrap_or(0.0),
            "avgConnections": baseline.avg_connections.unwrap_or(0.0),
            "samples": baseline.samples,
        },
    });
    if let Some(model) = model {
        metrics["reconstructionError"] = json!(model.artifact.score(latest));
        metrics["modelVersion"] = json!(model.record.version);
    }
    metrics
}

fn fit(samples: Vec<Vec<f64>>, options: TrainOptions) -> ModelArtifact {
    let scaler = MinMaxScaler::fit(&samples);
    let normalized: Vec<Vec<f64>> = samples.iter().map(|s| scaler.transform(s)).collect();

    let mut rng = rand::rng();
    let mut network = Autoencoder::new(&LAYER_SIZES, &mut rng);
    let report = network.train(&normalized, &options, &mut rng, |epoch| {
        if epoch.epoch % 10 == 0 {
            info!(
                "Epoch {}: loss = {:.6}, val_loss = {:.6}",
                epoch.epoch,
                epoch.loss,
                epoch.val_loss.unwrap_or(f64::NAN)
            );
        }
    });

    ModelArtifact {
        network,
        scaler,
        sample_count: samples.len(),
        train_loss: report.final_loss(),
        val_loss: report.final_val_loss(),
    }
}

fn load_artifact(path: &Path) -> Result<ModelArtifact> {
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}
