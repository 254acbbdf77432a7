//! Core utilities, configuration, and common functionality

pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod plans;
pub mod rate_limiter;
pub mod utils;

// Re-exports for convenience
pub use config::Settings;
pub use error::{AppError, AppResult, ExtractionError, LedgerError, QueueError, TransportError};
pub use logging::{init_logger, log_startup_configuration};
pub use plans::{Feature, Plan, PlanId, PlanRegistry};
