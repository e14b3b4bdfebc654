pub mod config;
pub mod error;
pub mod http;
pub mod metrics;
pub mod services;

pub use config::Config;
pub use error::{CdcError, Result};
pub use metrics::CdcMetrics;
pub use services::cdc::{CdcConsumer, ChangeHandler, DispatchRegistry, HandlerScope, Lifecycle};
