pub mod anomaly_detector;
pub mod autoencoder;
pub mod traffic_collector;

pub use anomaly_detector::{AnomalyDetector, DetectorSettings};
pub use traffic_collector::TrafficCollector;
