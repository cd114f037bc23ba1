use crate::collectors::{decode_config, ensure_ready, CollectorState, MetricCollector};
use crate::error::CollectorError;
use crate::metric::{emit, string_map, MetricRecord};
use crate::process::{CommandSpec, ProcessRunner, SystemRunner};
use log::{debug, error, info};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::mpsc::SyncSender;
use std::sync::Arc;
use std::time::Duration;

pub const MAX_NUM_PROCS: i64 = 10;
pub const DEFAULT_NUM_PROCS: i64 = 2;

const NAME: &str = "TopProcsCollector";

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct TopProcsConfig {
    #[serde(alias = "num_items")]
    pub num_procs: i64,
}

impl Default for TopProcsConfig {
    fn default() -> Self {
        Self {
            num_procs: DEFAULT_NUM_PROCS,
        }
    }
}

/// Reports the names of the processes using the most CPU
///
/// Emits `topproc1` .. `topprocN` with the command name as a string value.
pub struct TopProcsCollector {
    state: CollectorState,
    num_procs: usize,
    tags: BTreeMap<String, String>,
    meta: BTreeMap<String, String>,
    runner: Arc<dyn ProcessRunner>,
}

impl Default for TopProcsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl TopProcsCollector {
    pub fn new() -> Self {
        Self::with_runner(Arc::new(SystemRunner))
    }

    pub fn with_runner(runner: Arc<dyn ProcessRunner>) -> Self {
        Self {
            state: CollectorState::Uninitialized,
            num_procs: DEFAULT_NUM_PROCS as usize,
            tags: string_map([("type", "node")]),
            meta: string_map([("source", NAME), ("group", "TopProcs")]),
            runner,
        }
    }

    fn command() -> CommandSpec {
        CommandSpec::new("ps").args(["-Ao", "comm", "--sort=-pcpu"])
    }
}

impl MetricCollector for TopProcsCollector {
    fn name(&self) -> &str {
        NAME
    }

    fn init(&mut self, config: &Value) -> Result<(), CollectorError> {
        if self.state == CollectorState::Ready {
            return Ok(());
        }

        let config: TopProcsConfig = decode_config(NAME, config)?;
        if config.num_procs <= 0 || config.num_procs > MAX_NUM_PROCS {
            return Err(CollectorError::InvalidConfig {
                collector: NAME.to_string(),
                reason: format!(
                    "num_procs option must be in range 1-{}, got {}",
                    MAX_NUM_PROCS, config.num_procs
                ),
            });
        }

        // Pre-flight: the process lister must run
        self.runner.run(&Self::command())?;

        self.num_procs = config.num_procs as usize;
        self.state = CollectorState::Ready;
        info!("{} initialized, reporting {} processes", NAME, self.num_procs);
        Ok(())
    }

    fn read(
        &mut self,
        _interval: Duration,
        output: &SyncSender<MetricRecord>,
    ) -> Result<(), CollectorError> {
        ensure_ready(NAME, self.state)?;

        let captured = match self.runner.run(&Self::command()) {
            Ok(captured) => captured,
            Err(e) => {
                error!("{}.read(): {}", NAME, e);
                return Ok(());
            }
        };

        // First line is the COMMAND header
        let names: Vec<&str> = captured
            .stdout
            .lines()
            .skip(1)
            .map(str::trim_end)
            .filter(|line| !line.is_empty())
            .take(self.num_procs)
            .collect();

        if names.len() < self.num_procs {
            debug!(
                "{}: only {} of {} processes available",
                NAME,
                names.len(),
                self.num_procs
            );
        }

        for (i, name) in names.iter().enumerate() {
            let record =
                MetricRecord::new(format!("topproc{}", i + 1), &self.tags, &self.meta, *name);
            emit(output, record).map_err(|_| CollectorError::OutputClosed)?;
        }

        Ok(())
    }

    fn close(&mut self) {
        self.state = CollectorState::Closed;
    }

    fn state(&self) -> CollectorState {
        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProcessError;
    use crate::process::{CapturedOutput, MockProcessRunner};
    use serde_json::json;
    use std::sync::mpsc;

    const PS_OUTPUT: &str = "COMMAND\nstress\npython3\nsshd\nbash\n";

    fn runner_with(stdout: &'static str) -> Arc<MockProcessRunner> {
        let mut runner = MockProcessRunner::new();
        runner
            .expect_run()
            .withf(|spec| {
                spec.program() == "ps" && spec.get_args() == ["-Ao", "comm", "--sort=-pcpu"]
            })
            .returning(move |_| {
                Ok(CapturedOutput {
                    stdout: stdout.to_string(),
                    stderr: String::new(),
                })
            });
        Arc::new(runner)
    }

    #[test]
    fn test_default_reports_two_processes() {
        let mut c = TopProcsCollector::with_runner(runner_with(PS_OUTPUT));
        c.init(&Value::Null).unwrap();

        let (tx, rx) = mpsc::sync_channel(16);
        c.read(Duration::from_secs(10), &tx).unwrap();
        let records: Vec<MetricRecord> = rx.try_iter().collect();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].name(), "topproc1");
        assert_eq!(records[0].value().as_str(), Some("stress"));
        assert_eq!(records[1].name(), "topproc2");
        assert_eq!(records[1].value().as_str(), Some("python3"));
        assert_eq!(records[0].tag("type"), Some("node"));
    }

    #[test]
    fn test_num_items_alias() {
        let mut c = TopProcsCollector::with_runner(runner_with(PS_OUTPUT));
        c.init(&json!({"num_items": 3})).unwrap();

        let (tx, rx) = mpsc::sync_channel(16);
        c.read(Duration::from_secs(10), &tx).unwrap();
        assert_eq!(rx.try_iter().count(), 3);
    }

    #[test]
    fn test_fewer_lines_than_requested() {
        let mut c = TopProcsCollector::with_runner(runner_with("COMMAND\ninit\n"));
        c.init(&json!({"num_procs": 5})).unwrap();

        let (tx, rx) = mpsc::sync_channel(16);
        c.read(Duration::from_secs(10), &tx).unwrap();
        let records: Vec<MetricRecord> = rx.try_iter().collect();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].value().as_str(), Some("init"));
    }

    #[test]
    fn test_out_of_range_num_procs_is_fatal() {
        for n in [0, -1, 11] {
            let mut c = TopProcsCollector::with_runner(Arc::new(MockProcessRunner::new()));
            let err = c.init(&json!({ "num_procs": n })).unwrap_err();
            assert!(err.to_string().contains("range 1-10"), "{}", err);
            assert_eq!(c.state(), CollectorState::Uninitialized);
        }
    }

    #[test]
    fn test_failing_ps_is_fatal_at_init() {
        let mut runner = MockProcessRunner::new();
        runner.expect_run().returning(|spec| {
            Err(ProcessError::NonZeroExit {
                command: spec.to_string(),
                status: "exit status: 1".to_string(),
                stdout: String::new(),
                stderr: "ps: unknown option".to_string(),
            })
        });
        let mut c = TopProcsCollector::with_runner(Arc::new(runner));

        assert!(matches!(
            c.init(&Value::Null),
            Err(CollectorError::Process(_))
        ));
        assert_eq!(c.state(), CollectorState::Uninitialized);
    }

    #[test]
    fn test_read_requires_ready_state() {
        let mut c = TopProcsCollector::with_runner(runner_with(PS_OUTPUT));
        let (tx, _rx) = mpsc::sync_channel(16);
        assert!(matches!(
            c.read(Duration::from_secs(1), &tx),
            Err(CollectorError::NotReady { .. })
        ));
    }
}
