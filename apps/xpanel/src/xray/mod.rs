pub mod config;
pub mod generator;
pub mod manager;
pub mod presets;
pub mod provision;
pub mod stats;
pub mod store;
pub mod validator;

#[cfg(test)]
mod tests;

pub use generator::{ConfigGenerator, GeneratorOptions};
pub use manager::{ManagerSettings, ProxyControl, XrayManager};
pub use stats::{StatsSource, XrayStatsClient};
pub use store::ConfigStore;
