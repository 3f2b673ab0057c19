pub mod anomaly_repo;
pub mod client_repo;
pub mod config_repo;
pub mod inbound_repo;
pub mod model_repo;
pub mod server_repo;
pub mod traffic_repo;
