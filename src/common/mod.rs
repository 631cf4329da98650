//! Common utilities and types shared across shard-registrar

pub mod config;
pub mod error;
pub mod metrics;
pub mod utils;

pub use config::{Config, RegistrarConfig};
pub use error::{Error, Result};
pub use metrics::RegistrarMetrics;
pub use utils::{format_duration, holder_prefix, parse_duration};
