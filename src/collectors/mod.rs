/// BeeGFS client statistics collectors (storage and metadata)
pub mod beegfs;

/// Mounted filesystem discovery
pub mod mounts;

/// Top CPU consuming processes collector
pub mod topprocs;

pub use beegfs::{BeegfsCollector, BeegfsNodeType};
pub use topprocs::TopProcsCollector;

use crate::error::CollectorError;
use crate::metric::MetricRecord;
use serde_json::Value;
use std::fmt;
use std::sync::mpsc::SyncSender;
use std::time::Duration;

/// Lifecycle of a pull-model collector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectorState {
    /// Constructed, `init` not yet successful
    Uninitialized,
    /// Initialized and accepting `read` calls
    Ready,
    /// Closed; `init` may bring it back to `Ready`
    Closed,
}

impl fmt::Display for CollectorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CollectorState::Uninitialized => "uninitialized",
            CollectorState::Ready => "ready",
            CollectorState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Pull-model acquisition unit driven by an external scheduler
///
/// The scheduler calls [`read`](MetricCollector::read) once per tick. Calls
/// take `&mut self`, so a single collector never reads concurrently with
/// itself, while distinct collectors may be read from different threads.
pub trait MetricCollector: Send {
    /// Instance name used in logs and as the `source` meta entry
    fn name(&self) -> &str;

    /// Parse configuration and run pre-flight checks
    ///
    /// Calling `init` on a ready collector is a successful no-op.
    fn init(&mut self, config: &Value) -> Result<(), CollectorError>;

    /// Acquire one sample set and push it into `output`
    ///
    /// Transient failures (failed command, malformed output) are logged and
    /// skipped. Errors are returned only when the collector is not ready or
    /// the output channel is gone.
    fn read(
        &mut self,
        interval: Duration,
        output: &SyncSender<MetricRecord>,
    ) -> Result<(), CollectorError>;

    /// Return to a non-ready state
    fn close(&mut self);

    fn state(&self) -> CollectorState;

    /// Whether the scheduler may run this collector alongside others
    fn parallel(&self) -> bool {
        true
    }
}

/// Reject `read` unless the collector is ready
pub(crate) fn ensure_ready(name: &str, state: CollectorState) -> Result<(), CollectorError> {
    if state == CollectorState::Ready {
        Ok(())
    } else {
        Err(CollectorError::NotReady {
            collector: name.to_string(),
            state: state.to_string(),
        })
    }
}

/// Decode a JSON instance configuration, `null` meaning "all defaults"
pub(crate) fn decode_config<T>(collector: &str, config: &Value) -> Result<T, CollectorError>
where
    T: serde::de::DeserializeOwned + Default,
{
    if config.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(config.clone()).map_err(|e| CollectorError::InvalidConfig {
        collector: collector.to_string(),
        reason: e.to_string(),
    })
}

/// Collector kinds known to [`new_collector`]
pub const COLLECTOR_KINDS: &[&str] = &["beegfs_storage", "beegfs_meta", "topprocs"];

/// Create an uninitialized collector by kind
pub fn new_collector(kind: &str) -> Result<Box<dyn MetricCollector>, CollectorError> {
    match kind {
        "beegfs_storage" => Ok(Box::new(BeegfsCollector::new(BeegfsNodeType::Storage))),
        "beegfs_meta" => Ok(Box::new(BeegfsCollector::new(BeegfsNodeType::Meta))),
        "topprocs" => Ok(Box::new(TopProcsCollector::new())),
        other => Err(CollectorError::UnknownCollector(other.to_string())),
    }
}
