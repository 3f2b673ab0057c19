pub mod ai;
pub mod error;
pub mod jobs;
pub mod services;
pub mod settings;
pub mod state;
pub mod xray;

pub use error::{PanelError, Result};
pub use state::AppContext;
