use anyhow::{Context, Result};
use ccmetric::collectors::{new_collector, MetricCollector};
use ccmetric::config::Config;
use ccmetric::error::ConfigError;
use ccmetric::metric::MetricRecord;
use ccmetric::receivers::ticker::{run_periodic, MissedTickPolicy, Ticker};
use ccmetric::receivers::{new_receiver, MetricReceiver, ReceiverState};
use clap::Parser;
use log::{debug, error, info, warn};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender, SyncSender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Command-line arguments for the metric agent
#[derive(Parser)]
#[command(
    name = "ccmetric",
    about = "Cluster node metric acquisition agent",
    long_about = "Periodically reads node metrics from external tools (beegfs-ctl, ps) and \
                  out-of-band BMC sensors (ipmi-sensors), printing one JSON record per line."
)]
struct Cli {
    /// Path to configuration file
    #[arg(
        short,
        long,
        value_name = "FILE",
        help = "Configuration file path (TOML or JSON)"
    )]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(
        short,
        long,
        help = "Enable verbose logging output (sets RUST_LOG=debug)"
    )]
    verbose: bool,

    /// Single collection round
    #[arg(long, help = "Read every collector once and exit; receivers are not started")]
    once: bool,
}

impl Cli {
    /// Validate the CLI arguments
    fn validate(&self) -> Result<(), String> {
        if let Some(ref config_path) = self.config {
            // Missing files fall back to defaults in MetricAgent::load_config
            if config_path.exists() {
                if !config_path.is_file() {
                    return Err(format!(
                        "Configuration path is not a file: {}",
                        config_path.display()
                    ));
                }

                let known = config_path
                    .extension()
                    .and_then(|ext| ext.to_str())
                    .map(|ext| matches!(ext, "toml" | "json"))
                    .unwrap_or(false);
                if !known {
                    warn!(
                        "Configuration file {} has neither .toml nor .json extension, \
                         parsing as TOML",
                        config_path.display()
                    );
                }
            }
        }

        Ok(())
    }
}

/// Orchestrates collectors, receivers and the record sink
///
/// Collectors are read on every tick of the configured interval; collectors
/// that allow it are read concurrently on scoped threads. Receivers tick on
/// their own. All records flow through one bounded channel into a sink
/// thread that prints them as JSON lines.
pub struct MetricAgent {
    interval: Duration,
    collectors: Vec<Box<dyn MetricCollector>>,
    receivers: Vec<Box<dyn MetricReceiver>>,
    output: Option<SyncSender<MetricRecord>>,
    sink_thread: Option<JoinHandle<u64>>,
    /// Sender for shutdown signal
    pub shutdown_sender: Sender<()>,
    shutdown_receiver: Receiver<()>,
}

impl MetricAgent {
    /// Build every configured unit and start the sink thread
    ///
    /// Units that fail to initialize are logged and left out; the agent runs
    /// with whatever remains.
    pub fn new(config: &Config) -> Result<Self> {
        let interval = config.tick_interval()?;
        let (output, records) = mpsc::sync_channel(config.channel_capacity);

        let mut collectors = Vec::new();
        for (kind, instance) in &config.collectors {
            let mut collector = match new_collector(kind) {
                Ok(collector) => collector,
                Err(e) => {
                    error!("Skipping collector: {}", e);
                    continue;
                }
            };
            match collector.init(instance) {
                Ok(()) => {
                    info!("Collector {} initialized", collector.name());
                    collectors.push(collector);
                }
                Err(e) => error!("Failed to initialize collector {}: {}", kind, e),
            }
        }

        let mut receivers = Vec::new();
        for entry in &config.receivers {
            match new_receiver(&entry.kind, &entry.name, &entry.options_value()) {
                Ok(mut receiver) => {
                    receiver.set_sink(output.clone());
                    receivers.push(receiver);
                }
                Err(e) => error!("Failed to create receiver {}: {}", entry.name, e),
            }
        }

        let sink_thread = spawn_sink(records, io::stdout()).context("Failed to spawn sink thread")?;
        let (shutdown_sender, shutdown_receiver) = mpsc::channel();

        Ok(Self {
            interval,
            collectors,
            receivers,
            output: Some(output),
            sink_thread: Some(sink_thread),
            shutdown_sender,
            shutdown_receiver,
        })
    }

    /// Load configuration from file or use defaults
    ///
    /// A missing or unreadable file falls back to defaults; a file that
    /// exists but does not parse is an error.
    pub fn load_config(config_path: Option<&Path>) -> Result<Config, ConfigError> {
        match config_path {
            Some(path) => {
                info!("Loading configuration from: {}", path.display());
                match Config::from_file(path) {
                    Ok(config) => Ok(config),
                    Err(ConfigError::ReadError(reason)) => {
                        warn!("Configuration file unreadable ({}), using defaults", reason);
                        Ok(Config::default())
                    }
                    Err(e) => Err(e),
                }
            }
            None => {
                info!("Using default configuration");
                Ok(Config::default())
            }
        }
    }

    pub fn start_receivers(&mut self) {
        for receiver in &mut self.receivers {
            match receiver.start() {
                Ok(()) => info!("Receiver {} started", receiver.name()),
                Err(e) => error!("Failed to start receiver {}: {}", receiver.name(), e),
            }
        }
    }

    /// Read every collector once
    pub fn tick(&mut self) -> Result<()> {
        let output = self.output.as_ref().context("Agent already stopped")?;
        read_collectors(&mut self.collectors, self.interval, output);
        Ok(())
    }

    /// Tick collectors until a shutdown signal arrives
    pub fn run(&mut self) -> Result<()> {
        let output = self.output.as_ref().context("Agent already stopped")?;
        let collectors = &mut self.collectors;
        let interval = self.interval;

        let ticker = Ticker::new(interval, Instant::now(), MissedTickPolicy::Coalesce);
        let stats = run_periodic("MetricAgent", ticker, &self.shutdown_receiver, || {
            read_collectors(collectors, interval, output)
        });

        info!(
            "Shutdown signal received after {} collection rounds",
            stats.passes
        );
        Ok(())
    }

    /// Close every unit and wait for the sink to drain
    pub fn stop(&mut self) -> Result<()> {
        info!("Stopping MetricAgent");

        for mut receiver in self.receivers.drain(..) {
            if receiver.state() != ReceiverState::Running {
                continue;
            }
            if let Err(e) = receiver.close() {
                error!("Failed to close receiver {}: {}", receiver.name(), e);
            }
        }

        for collector in &mut self.collectors {
            collector.close();
        }

        // The sink exits once the last sender is gone
        self.output = None;
        if let Some(handle) = self.sink_thread.take() {
            match handle.join() {
                Ok(count) => info!("Sink wrote {} records", count),
                Err(_) => anyhow::bail!("Sink thread panicked"),
            }
        }

        Ok(())
    }
}

/// Read all collectors, the parallel ones concurrently
fn read_collectors(
    collectors: &mut [Box<dyn MetricCollector>],
    interval: Duration,
    output: &SyncSender<MetricRecord>,
) {
    let (parallel, serial): (Vec<_>, Vec<_>) =
        collectors.iter_mut().partition(|collector| collector.parallel());

    thread::scope(|scope| {
        for collector in parallel {
            scope.spawn(move || read_one(&mut **collector, interval, output));
        }
        for collector in serial {
            read_one(&mut **collector, interval, output);
        }
    });
}

fn read_one(
    collector: &mut dyn MetricCollector,
    interval: Duration,
    output: &SyncSender<MetricRecord>,
) {
    let started = Instant::now();
    match collector.read(interval, output) {
        Ok(()) => debug!("{} read in {:?}", collector.name(), started.elapsed()),
        Err(e) => error!("{}: {}", collector.name(), e),
    }
}

/// Print records as JSON lines until every sender is dropped
fn spawn_sink<W>(records: Receiver<MetricRecord>, mut out: W) -> io::Result<JoinHandle<u64>>
where
    W: Write + Send + 'static,
{
    thread::Builder::new().name("sink".to_string()).spawn(move || {
        let mut written = 0;
        for record in records {
            let line = match serde_json::to_string(&record) {
                Ok(line) => line,
                Err(e) => {
                    error!("Failed to encode record {}: {}", record.name(), e);
                    continue;
                }
            };
            if let Err(e) = writeln!(out, "{}", line) {
                error!("Failed to write record: {}", e);
                break;
            }
            written += 1;
        }
        let _ = out.flush();
        written
    })
}

fn main() {
    let cli = Cli::parse();

    if cli.verbose {
        std::env::set_var("RUST_LOG", "debug");
    }
    env_logger::init();

    info!("Starting ccmetric");

    if let Err(e) = cli.validate() {
        error!("Invalid arguments: {}", e);
        std::process::exit(1);
    }

    let config = match MetricAgent::load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    let mut agent = match MetricAgent::new(&config) {
        Ok(agent) => agent,
        Err(e) => {
            error!("Failed to initialize MetricAgent: {:#}", e);
            std::process::exit(1);
        }
    };

    if cli.once {
        if let Err(e) = agent.tick() {
            error!("Collection failed: {:#}", e);
        }
    } else {
        let shutdown_sender = agent.shutdown_sender.clone();
        if let Err(e) = ctrlc::set_handler(move || {
            info!("Received interrupt signal (SIGINT), shutting down gracefully...");
            if let Err(e) = shutdown_sender.send(()) {
                error!("Failed to send shutdown signal: {}", e);
            }
        }) {
            error!("Error setting SIGINT handler: {}", e);
            std::process::exit(1);
        }

        agent.start_receivers();
        info!("ccmetric is running. Press Ctrl+C to stop.");

        if let Err(e) = agent.run() {
            error!("Error while running: {:#}", e);
        }
    }

    if let Err(e) = agent.stop() {
        error!("Error during shutdown: {:#}", e);
        std::process::exit(1);
    }

    info!("ccmetric shutdown complete");
}
