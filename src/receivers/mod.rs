/// Out-of-band BMC sensor receiver
pub mod ipmi;

/// Fixed-rate scheduling and drift detection for receiver workers
pub mod ticker;

pub use ipmi::IpmiReceiver;
pub use ticker::{MissedTickPolicy, Ticker};

use crate::error::ReceiverError;
use crate::metric::MetricRecord;
use serde_json::Value;
use std::fmt;
use std::sync::mpsc::SyncSender;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverState {
    /// Configuration validated, no worker yet
    Constructed,
    /// Worker thread is ticking
    Running,
    /// Worker has exited; terminal
    Stopped,
}

impl fmt::Display for ReceiverState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReceiverState::Constructed => "constructed",
            ReceiverState::Running => "running",
            ReceiverState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Push-model acquisition unit owning its own periodic worker
///
/// All validation happens when the receiver is constructed. `start` spawns
/// exactly one worker that emits into the attached sink until `close`, which
/// blocks until the worker has exited.
pub trait MetricReceiver: Send {
    fn name(&self) -> &str;

    /// Attach the output channel; must happen before `start`
    fn set_sink(&mut self, sink: SyncSender<MetricRecord>);

    fn start(&mut self) -> Result<(), ReceiverError>;

    /// Signal stop and wait for the worker to finish its current pass
    fn close(&mut self) -> Result<(), ReceiverError>;

    fn state(&self) -> ReceiverState;
}

/// Receiver kinds known to [`new_receiver`]
pub const RECEIVER_KINDS: &[&str] = &["ipmi"];

/// Construct a receiver by kind, validating its configuration
pub fn new_receiver(
    kind: &str,
    name: &str,
    config: &Value,
) -> Result<Box<dyn MetricReceiver>, ReceiverError> {
    match kind {
        "ipmi" => Ok(Box::new(IpmiReceiver::new(name, config)?)),
        other => Err(ReceiverError::UnknownReceiver(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_receiver_ipmi() {
        let config = json!({
            "endpoint": "ipmi-sensors://%h-bmc",
            "username": "admin",
            "password": "secret",
            "client_config": [{"host_list": ["n1"]}]
        });
        let receiver = new_receiver("ipmi", "bmc", &config).unwrap();
        assert_eq!(receiver.name(), "IPMIReceiver(bmc)");
        assert_eq!(receiver.state(), ReceiverState::Constructed);
    }

    #[test]
    fn test_new_receiver_unknown_kind() {
        assert!(matches!(
            new_receiver("redfish", "r", &Value::Null),
            Err(ReceiverError::UnknownReceiver(kind)) if kind == "redfish"
        ));
    }

    #[test]
    fn test_new_receiver_propagates_validation_errors() {
        assert!(matches!(
            new_receiver("ipmi", "bmc", &Value::Null),
            Err(ReceiverError::NoHosts { .. })
        ));
    }
}
