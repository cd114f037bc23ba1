/// Error types for collectors, receivers and configuration
pub mod error;

/// Metric records and the output channel contract
pub mod metric;

/// Name sets excluded from emission
pub mod exclusion;

/// Query identifier to host name mapping
pub mod hostmap;

/// External command execution with secret redaction
pub mod process;

/// Aggregate-row parsing into match tables
pub mod parser;

/// Pull-model collectors
pub mod collectors;

/// Push-model receivers
pub mod receivers;

/// Configuration management
pub mod config;

// Re-export commonly used types
pub use collectors::{new_collector, CollectorState, MetricCollector};
pub use error::{CollectorError, ConfigError, ProcessError, ReceiverError};
pub use metric::{FieldValue, MetricRecord, Timestamp};
pub use receivers::{new_receiver, MetricReceiver, ReceiverState};
