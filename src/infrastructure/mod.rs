//! Infrastructure: configuration, logging, and metrics adapters.

pub mod config;
pub mod logging;
pub mod metrics;

pub use config::{Config, ConfigError, ConfigLoader};
pub use logging::{init_logging, LoggerGuard};
pub use metrics::{FacadeMetrics, RecordingMetrics};
