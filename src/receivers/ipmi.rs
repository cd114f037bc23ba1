//! IPMI sensor receiver
//!
//! Queries baseboard management controllers out of band with `ipmi-sensors`
//! on a fixed interval. Each client config groups hosts that share a
//! protocol, driver and credentials; hosts are addressed through a pattern
//! such as `ipmi-sensors://%h-bmc`, and sensor output is translated back to
//! the canonical host name before it is emitted.

use crate::config::parse_duration;
use crate::error::{ProcessError, ReceiverError};
use crate::exclusion::ExclusionSet;
use crate::hostmap::HostMapping;
use crate::metric::{emit, string_map, MetricRecord};
use crate::process::{CommandSpec, ProcessRunner, StreamingProcess, SystemRunner, REDACTED};
use crate::receivers::ticker::{run_periodic, LoopStats, MissedTickPolicy, Ticker};
use crate::receivers::{MetricReceiver, ReceiverState};
use log::{debug, error, info, warn};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::mem;
use std::sync::mpsc::{self, SendError, Sender, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

pub const DEFAULT_FANOUT: u32 = 64;
pub const DEFAULT_DRIVER_TYPE: &str = "LAN_2_0";
pub const DEFAULT_INTERVAL: &str = "30s";

/// The only supported endpoint protocol, also the command run
pub const IPMI_SENSORS: &str = "ipmi-sensors";

/// Sensor names accepted for the `utilization` metric
const UTILIZATION_SENSORS: &[&str] = &[
    "cpu_utilization",
    "io_utilization",
    "mem_utilization",
    "sys_utilization",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverType {
    Lan,
    Lan20,
}

impl DriverType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "LAN" => Some(DriverType::Lan),
            "LAN_2_0" => Some(DriverType::Lan20),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DriverType::Lan => "LAN",
            DriverType::Lan20 => "LAN_2_0",
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct IpmiReceiverJson {
    fanout: u32,
    driver_type: String,
    interval: String,
    missed_ticks: MissedTickPolicy,
    username: Option<String>,
    password: Option<String>,
    endpoint: Option<String>,
    exclude_metrics: Vec<String>,
    client_config: Vec<ClientConfigJson>,
}

impl Default for IpmiReceiverJson {
    fn default() -> Self {
        Self {
            fanout: DEFAULT_FANOUT,
            driver_type: DEFAULT_DRIVER_TYPE.to_string(),
            interval: DEFAULT_INTERVAL.to_string(),
            missed_ticks: MissedTickPolicy::default(),
            username: None,
            password: None,
            endpoint: None,
            exclude_metrics: Vec::new(),
            client_config: Vec::new(),
        }
    }
}

/// Per-client overrides; zero fanout and empty driver type inherit
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ClientConfigJson {
    endpoint: Option<String>,
    fanout: u32,
    driver_type: String,
    host_list: Vec<String>,
    username: Option<String>,
    password: Option<String>,
    exclude_metrics: Vec<String>,
}

/// Split `<protocol>://<host-pattern>`
fn split_endpoint(endpoint: &str) -> Option<(&str, &str)> {
    let parts: Vec<&str> = endpoint.split("://").collect();
    match parts.as_slice() {
        &[protocol, pattern] => Some((protocol, pattern)),
        _ => None,
    }
}

/// Fully resolved settings for one group of hosts
#[derive(Clone)]
pub struct IpmiClientConfig {
    protocol: String,
    driver_type: DriverType,
    fanout: u32,
    hosts: HostMapping,
    username: String,
    password: String,
    excluded: ExclusionSet,
}

impl IpmiClientConfig {
    fn from_json(
        receiver: &str,
        index: usize,
        client: &ClientConfigJson,
        defaults: &IpmiReceiverJson,
    ) -> Result<Self, ReceiverError> {
        let missing = |field: &'static str| ReceiverError::MissingField {
            receiver: receiver.to_string(),
            index,
            field,
        };

        let endpoint = client
            .endpoint
            .as_ref()
            .or(defaults.endpoint.as_ref())
            .ok_or_else(|| missing("endpoint"))?;

        let fanout = if client.fanout != 0 {
            client.fanout
        } else {
            defaults.fanout
        };

        let driver_type = if client.driver_type.is_empty() {
            &defaults.driver_type
        } else {
            &client.driver_type
        };
        let driver_type =
            DriverType::parse(driver_type).ok_or_else(|| ReceiverError::InvalidDriverType {
                receiver: receiver.to_string(),
                index,
                driver_type: driver_type.clone(),
            })?;

        let (protocol, pattern) =
            split_endpoint(endpoint).ok_or_else(|| ReceiverError::InvalidEndpoint {
                receiver: receiver.to_string(),
                index,
                endpoint: endpoint.clone(),
            })?;
        if protocol != IPMI_SENSORS {
            return Err(ReceiverError::UnsupportedProtocol {
                receiver: receiver.to_string(),
                index,
                protocol: protocol.to_string(),
            });
        }

        let username = client
            .username
            .as_ref()
            .or(defaults.username.as_ref())
            .ok_or_else(|| missing("username"))?;
        let password = client
            .password
            .as_ref()
            .or(defaults.password.as_ref())
            .ok_or_else(|| missing("password"))?;

        Ok(Self {
            protocol: protocol.to_string(),
            driver_type,
            fanout,
            hosts: HostMapping::from_template(pattern, &client.host_list),
            username: username.clone(),
            password: password.clone(),
            excluded: ExclusionSet::union(&defaults.exclude_metrics, &client.exclude_metrics),
        })
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn driver_type(&self) -> DriverType {
        self.driver_type
    }

    pub fn fanout(&self) -> u32 {
        self.fanout
    }

    pub fn hosts(&self) -> &HostMapping {
        &self.hosts
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn excluded(&self) -> &ExclusionSet {
        &self.excluded
    }

    /// Full `ipmi-sensors` invocation; the password is a secret argument
    pub fn command(&self) -> CommandSpec {
        CommandSpec::new(IPMI_SENSORS)
            .args([
                "--always-prefix",
                "--sdr-cache-recreate",
                "--interpret-oem-data",
                "--ignore-not-available-sensors",
                "--ignore-unrecognized-events",
                "--comma-separated-output",
                "--no-header-output",
                "--non-abbreviated-units",
            ])
            .arg("--fanout")
            .arg(self.fanout.to_string())
            .arg("--driver-type")
            .arg(self.driver_type.as_str())
            .arg("--host")
            .arg(self.hosts.host_argument())
            .arg("--user")
            .arg(self.username.as_str())
            .arg("--password")
            .secret_arg(self.password.as_str())
    }
}

impl fmt::Debug for IpmiClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IpmiClientConfig")
            .field("protocol", &self.protocol)
            .field("driver_type", &self.driver_type)
            .field("fanout", &self.fanout)
            .field("hosts", &self.hosts)
            .field("username", &self.username)
            .field("password", &REDACTED)
            .field("excluded", &self.excluded)
            .finish()
    }
}

/// Metric name and output unit for a sensor
///
/// `sensor_type` is expected lowercased. Combinations outside the rule table
/// yield `None` and the reading is dropped.
pub fn classify_sensor(
    sensor: &str,
    sensor_type: &str,
    unit: &str,
) -> Option<(&'static str, &'static str)> {
    match (sensor_type, unit) {
        (_, "Watts") => Some(("power", "Watts")),
        ("voltage", "Volts") => Some(("voltage", "Volts")),
        ("temperature", "degrees C") => Some(("temperature", "degC")),
        ("temperature", "degrees F") => Some(("temperature", "degF")),
        ("fan", "RPM") => Some(("fan_speed", "RPM")),
        ("other units based sensor", "unspecified" | "%")
            if UTILIZATION_SENSORS.contains(&sensor) =>
        {
            Some(("utilization", "percent"))
        }
        _ => None,
    }
}

/// One sensor reading translated into metric terms
#[derive(Debug, Clone, PartialEq)]
pub struct SensorReading {
    pub host: String,
    pub sensor: String,
    pub metric: &'static str,
    pub unit: &'static str,
    pub value: f64,
}

impl SensorReading {
    fn into_record(self, meta: &BTreeMap<String, String>) -> MetricRecord {
        let tags = string_map([
            ("hostname", self.host.as_str()),
            ("type", "node"),
            ("name", self.sensor.as_str()),
        ]);
        let mut meta = meta.clone();
        meta.insert("unit".to_string(), self.unit.to_string());
        MetricRecord::new(self.metric, &tags, &meta, self.value)
    }
}

/// Parse `<identifier>: id,name,type,reading,units,event`
///
/// Lines for unknown identifiers, malformed lines, `N/A` readings, unmapped
/// sensors and excluded metrics all yield `None`.
pub fn parse_sensor_line(
    line: &str,
    hosts: &HostMapping,
    excluded: &ExclusionSet,
) -> Option<SensorReading> {
    let parts: Vec<&str> = line.split(": ").collect();
    let &[identifier, payload] = parts.as_slice() else {
        return None;
    };
    let host = hosts.resolve(identifier)?;

    let fields: Vec<&str> = payload.split(',').collect();
    let &[_id, name, sensor_type, reading, unit, _event] = fields.as_slice() else {
        return None;
    };
    if reading == "N/A" {
        return None;
    }

    let sensor = name.replace(' ', "_").to_lowercase();
    let (metric, unit) = classify_sensor(&sensor, &sensor_type.to_lowercase(), unit)?;
    if excluded.contains(metric) {
        return None;
    }

    let value = match reading.parse::<f64>() {
        Ok(value) => value,
        Err(e) => {
            debug!("Unparsable reading '{}' for sensor {}: {}", reading, sensor, e);
            return None;
        }
    };

    Some(SensorReading {
        host: host.to_string(),
        sensor,
        metric,
        unit,
        value,
    })
}

/// State moved into the worker thread at start
struct Worker {
    name: String,
    clients: Vec<IpmiClientConfig>,
    runner: Arc<dyn ProcessRunner>,
    sink: SyncSender<MetricRecord>,
    meta: BTreeMap<String, String>,
}

impl Worker {
    /// One acquisition pass over every client config
    fn pass(&self) {
        for client in &self.clients {
            if self.read_client(client).is_err() {
                warn!("{}: output channel closed, abandoning pass", self.name);
                return;
            }
        }
    }

    fn read_client(&self, client: &IpmiClientConfig) -> Result<(), SendError<MetricRecord>> {
        let spec = client.command();
        let mut process = match self.runner.spawn(&spec) {
            Ok(process) => process,
            Err(e) => {
                error!("{}.read(): failed to start command \"{}\": {}", self.name, spec, e);
                return Ok(());
            }
        };

        let streamed = self.stream(client, process.as_mut());

        // The child is always reaped, even when the sink went away mid-stream
        match process.wait() {
            Ok(()) => {}
            Err(ProcessError::NonZeroExit { status, stderr, .. }) => {
                error!(
                    "{}.read(): failed to wait for the end of command \"{}\": {}",
                    self.name, spec, status
                );
                error!("{}.read(): command stderr: \"{}\"", self.name, stderr.trim_end());
            }
            Err(e) => {
                error!(
                    "{}.read(): failed to wait for the end of command \"{}\": {}",
                    self.name, spec, e
                );
            }
        }

        streamed
    }

    fn stream(
        &self,
        client: &IpmiClientConfig,
        process: &mut dyn StreamingProcess,
    ) -> Result<(), SendError<MetricRecord>> {
        let mut line = String::new();
        let mut emitted = 0usize;

        loop {
            line.clear();
            match process.read_line(&mut line) {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) => {
                    error!("{}.read(): failed to read command output: {}", self.name, e);
                    break;
                }
            }

            let line = line.trim_end_matches(['\r', '\n']);
            if let Some(reading) = parse_sensor_line(line, &client.hosts, &client.excluded) {
                emit(&self.sink, reading.into_record(&self.meta))?;
                emitted += 1;
            }
        }

        debug!(
            "{}: {} readings from {} hosts",
            self.name,
            emitted,
            client.hosts.len()
        );
        Ok(())
    }
}

/// Push-model receiver polling BMC sensors through `ipmi-sensors`
pub struct IpmiReceiver {
    name: String,
    interval: Duration,
    missed_ticks: MissedTickPolicy,
    clients: Vec<IpmiClientConfig>,
    total_hosts: usize,
    runner: Arc<dyn ProcessRunner>,
    sink: Option<SyncSender<MetricRecord>>,
    state: ReceiverState,
    stop: Option<Sender<()>>,
    worker: Option<JoinHandle<LoopStats>>,
}

impl IpmiReceiver {
    /// Validate `config` and build the per-client settings
    pub fn new(name: &str, config: &Value) -> Result<Self, ReceiverError> {
        let name = format!("IPMIReceiver({})", name);

        let json: IpmiReceiverJson = if config.is_null() {
            IpmiReceiverJson::default()
        } else {
            serde_json::from_value(config.clone()).map_err(|e| ReceiverError::InvalidConfig {
                receiver: name.clone(),
                reason: e.to_string(),
            })?
        };

        let interval = parse_duration(&json.interval).map_err(|e| ReceiverError::InvalidConfig {
            receiver: name.clone(),
            reason: e.to_string(),
        })?;
        if interval.is_zero() {
            return Err(ReceiverError::InvalidConfig {
                receiver: name,
                reason: "interval must be positive".to_string(),
            });
        }

        let clients = json
            .client_config
            .iter()
            .enumerate()
            .map(|(index, client)| IpmiClientConfig::from_json(&name, index, client, &json))
            .collect::<Result<Vec<_>, _>>()?;

        let total_hosts: usize = clients.iter().map(|c| c.hosts.len()).sum();
        if total_hosts == 0 {
            return Err(ReceiverError::NoHosts { receiver: name });
        }

        info!("{}: monitoring {} IPMI hosts", name, total_hosts);

        Ok(Self {
            name,
            interval,
            missed_ticks: json.missed_ticks,
            clients,
            total_hosts,
            runner: Arc::new(SystemRunner),
            sink: None,
            state: ReceiverState::Constructed,
            stop: None,
            worker: None,
        })
    }

    pub fn with_runner(mut self, runner: Arc<dyn ProcessRunner>) -> Self {
        self.runner = runner;
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn missed_ticks(&self) -> MissedTickPolicy {
        self.missed_ticks
    }

    /// Client settings; empty once the worker has taken ownership
    pub fn clients(&self) -> &[IpmiClientConfig] {
        &self.clients
    }

    pub fn total_hosts(&self) -> usize {
        self.total_hosts
    }

    fn invalid_state(&self) -> ReceiverError {
        ReceiverError::InvalidState {
            receiver: self.name.clone(),
            state: self.state.to_string(),
        }
    }
}

impl MetricReceiver for IpmiReceiver {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_sink(&mut self, sink: SyncSender<MetricRecord>) {
        self.sink = Some(sink);
    }

    fn start(&mut self) -> Result<(), ReceiverError> {
        if self.state != ReceiverState::Constructed {
            return Err(self.invalid_state());
        }
        let sink = self.sink.clone().ok_or_else(|| ReceiverError::NoSink {
            receiver: self.name.clone(),
        })?;

        debug!("{}: START", self.name);

        let (stop_tx, stop_rx) = mpsc::channel();
        let worker = Worker {
            name: self.name.clone(),
            clients: mem::take(&mut self.clients),
            runner: Arc::clone(&self.runner),
            sink,
            meta: string_map([("source", self.name.as_str()), ("group", "IPMI")]),
        };
        let ticker = Ticker::new(self.interval, Instant::now(), self.missed_ticks);

        let handle = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || {
                let name = worker.name.clone();
                run_periodic(&name, ticker, &stop_rx, || worker.pass())
            })?;

        self.stop = Some(stop_tx);
        self.worker = Some(handle);
        self.state = ReceiverState::Running;
        debug!("{}: STARTED", self.name);
        Ok(())
    }

    fn close(&mut self) -> Result<(), ReceiverError> {
        if self.state != ReceiverState::Running {
            return Err(self.invalid_state());
        }

        debug!("{}: CLOSE", self.name);

        // Dropping the sender disconnects the stop channel
        drop(self.stop.take());
        self.sink = None;
        self.state = ReceiverState::Stopped;

        match self.worker.take().map(JoinHandle::join) {
            Some(Ok(stats)) => {
                debug!(
                    "{}: DONE after {} passes ({} drifted ticks, {} coalesced)",
                    self.name, stats.passes, stats.drifted_ticks, stats.skipped_ticks
                );
                Ok(())
            }
            Some(Err(_)) => Err(ReceiverError::WorkerPanicked {
                receiver: self.name.clone(),
            }),
            None => Ok(()),
        }
    }

    fn state(&self) -> ReceiverState {
        self.state
    }
}

impl Drop for IpmiReceiver {
    fn drop(&mut self) {
        if self.state == ReceiverState::Running {
            if let Err(e) = self.close() {
                error!("{}: failed to stop worker: {}", self.name, e);
            }
        }
    }
}
