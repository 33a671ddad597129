pub mod config;
pub mod error;
pub mod model;
pub mod types;

pub use config::AppConfig;
pub use error::{AttributionError, AttributionResult};
pub use model::ClickModel;
