use crate::collectors::mounts::{self, BEEGFS_ONDEMAND_MARKER, MOUNTS_PATH};
use crate::collectors::{decode_config, ensure_ready, CollectorState, MetricCollector};
use crate::error::{CollectorError, ProcessError};
use crate::exclusion::ExclusionSet;
use crate::metric::{emit, string_map, MetricRecord};
use crate::parser::{is_totals_line, payload_pairs, MatchTable};
use crate::process::{self, CommandSpec, ProcessRunner, SystemRunner};
use log::{debug, error, info, warn};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::mpsc::SyncSender;
use std::sync::Arc;
use std::time::Duration;

/// Default location of the BeeGFS control tool
pub const DEFAULT_BEEGFS_CMD: &str = "/usr/bin/beegfs-ctl";

const STORAGE_OPERATIONS: &[&str] = &[
    "sum", "ack", "sChDrct", "getFSize", "sAttr", "statfs", "trunc", "close", "fsync", "ops-rd",
    "MiB-rd/s", "ops-wr", "MiB-wr/s", "gendbg", "hrtbeat", "remNode", "storInf", "unlnk",
];

const META_OPERATIONS: &[&str] = &[
    "sum", "ack", "close", "entInf", "fndOwn", "mkdir", "create", "rddir", "refrEn", "mdsInf",
    "rmdir", "rmLnk", "mvDirIns", "mvFiles", "open", "ren", "sChDrct", "sAttr", "sDirPat", "stat",
    "statfs", "trunc", "symlnk", "unlnk", "lookLI", "statLI", "revalLI", "openLI", "createLI",
    "hardlnk", "flckAp", "flckEn", "flckRg", "dirparent", "listXA", "getXA", "rmXA", "setXA",
    "mirror",
];

/// BeeGFS server role whose client statistics are queried
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeegfsNodeType {
    Storage,
    Meta,
}

impl BeegfsNodeType {
    /// Value of `--nodetype`
    pub fn as_str(self) -> &'static str {
        match self {
            BeegfsNodeType::Storage => "storage",
            BeegfsNodeType::Meta => "meta",
        }
    }

    /// Operation labels printed by `beegfs-ctl --clientstats`
    pub fn operations(self) -> &'static [&'static str] {
        match self {
            BeegfsNodeType::Storage => STORAGE_OPERATIONS,
            BeegfsNodeType::Meta => META_OPERATIONS,
        }
    }

    pub fn metric_prefix(self) -> &'static str {
        match self {
            BeegfsNodeType::Storage => "beegfs_cstorage_",
            BeegfsNodeType::Meta => "beegfs_cmeta_",
        }
    }

    pub fn collector_name(self) -> &'static str {
        match self {
            BeegfsNodeType::Storage => "BeegfsStorageCollector",
            BeegfsNodeType::Meta => "BeegfsMetaCollector",
        }
    }

    fn group(self) -> &'static str {
        match self {
            BeegfsNodeType::Storage => "BeegfsStorage",
            BeegfsNodeType::Meta => "BeegfsMeta",
        }
    }
}

/// JSON options of a BeeGFS collector
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct BeegfsCollectorConfig {
    /// Path or name of `beegfs-ctl`
    #[serde(alias = "binary_path")]
    pub beegfs_path: String,
    /// Operation labels or canonical metric names never to emit
    pub exclude_metrics: Vec<String>,
    /// Mount points never to query
    pub exclude_filesystem: Vec<String>,
}

impl Default for BeegfsCollectorConfig {
    fn default() -> Self {
        Self {
            beegfs_path: DEFAULT_BEEGFS_CMD.to_string(),
            exclude_metrics: Vec::new(),
            exclude_filesystem: Vec::new(),
        }
    }
}

/// Collector for BeeGFS on-demand client statistics
///
/// Every tick it discovers the mounted BeeGFS on-demand filesystems, runs
/// `beegfs-ctl --clientstats` for each of them and emits the full match table
/// for every aggregate row found, tagged with the mount point.
pub struct BeegfsCollector {
    node_type: BeegfsNodeType,
    state: CollectorState,
    config: BeegfsCollectorConfig,
    matches: MatchTable,
    skip_filesystems: ExclusionSet,
    meta: BTreeMap<String, String>,
    runner: Arc<dyn ProcessRunner>,
    mounts_path: PathBuf,
    privilege_check: fn() -> bool,
}

impl BeegfsCollector {
    pub fn new(node_type: BeegfsNodeType) -> Self {
        Self::with_runner(node_type, Arc::new(SystemRunner))
    }

    pub fn with_runner(node_type: BeegfsNodeType, runner: Arc<dyn ProcessRunner>) -> Self {
        let name = node_type.collector_name();
        Self {
            node_type,
            state: CollectorState::Uninitialized,
            config: BeegfsCollectorConfig::default(),
            matches: MatchTable::new(node_type.metric_prefix(), &[], &ExclusionSet::default()),
            skip_filesystems: ExclusionSet::default(),
            meta: string_map([("source", name), ("group", node_type.group())]),
            runner,
            mounts_path: PathBuf::from(MOUNTS_PATH),
            privilege_check: process::is_privileged,
        }
    }

    /// Read mounts from another table than `/proc/mounts`
    pub fn with_mounts_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.mounts_path = path.into();
        self
    }

    /// Replace the effective-uid check
    pub fn with_privilege_check(mut self, check: fn() -> bool) -> Self {
        self.privilege_check = check;
        self
    }

    pub fn match_table(&self) -> &MatchTable {
        &self.matches
    }

    fn command_for(&self, mount_point: &str) -> CommandSpec {
        CommandSpec::new(&self.config.beegfs_path).args([
            "--clientstats".to_string(),
            format!("--nodetype={}", self.node_type.as_str()),
            format!("--mount={}", mount_point),
            "--allstats".to_string(),
        ])
    }

    fn log_failure(&self, err: &ProcessError) {
        let name = self.name();
        error!("{}.read(): {}", name, err);
        if let ProcessError::NonZeroExit { stdout, stderr, .. } = err {
            error!("{}.read(): command stderr: \"{}\"", name, stderr.trim_end());
            debug!("{}.read(): command stdout: \"{}\"", name, stdout.trim_end());
        }
    }

    /// Run `beegfs-ctl` for one mount point and emit its aggregate rows
    fn read_mount(
        &mut self,
        mount_point: &str,
        output: &SyncSender<MetricRecord>,
    ) -> Result<(), CollectorError> {
        let spec = self.command_for(mount_point);
        let captured = match self.runner.run(&spec) {
            Ok(captured) => captured,
            Err(e) => {
                self.log_failure(&e);
                return Ok(());
            }
        };

        let name = self.node_type.collector_name();
        let tags = string_map([("type", "node"), ("filesystem", mount_point)]);

        for line in captured.stdout.lines() {
            if !is_totals_line(line) {
                continue;
            }

            let pairs = match payload_pairs(line) {
                Some(pairs) => pairs,
                None => {
                    warn!("{}: aggregate row without payload: '{}'", name, line);
                    continue;
                }
            };

            let outcome = self.matches.apply_pairs(&pairs, |value, label| {
                error!(
                    "{}: failed to convert value '{}' of '{}' to float",
                    name, value, label
                );
            });
            debug!(
                "{}: {} matched, {} accumulated into other, {} invalid on {}",
                name, outcome.matched, outcome.accumulated, outcome.invalid, mount_point
            );

            for (key, value) in self.matches.snapshot() {
                emit(output, MetricRecord::new(key, &tags, &self.meta, value))
                    .map_err(|_| CollectorError::OutputClosed)?;
            }
        }

        Ok(())
    }
}

impl MetricCollector for BeegfsCollector {
    fn name(&self) -> &str {
        self.node_type.collector_name()
    }

    fn init(&mut self, config: &Value) -> Result<(), CollectorError> {
        if self.state == CollectorState::Ready {
            return Ok(());
        }

        let name = self.name().to_string();
        let config: BeegfsCollectorConfig = decode_config(&name, config)?;

        let excluded = ExclusionSet::new(config.exclude_metrics.iter().cloned());
        let matches = MatchTable::new(
            self.node_type.metric_prefix(),
            self.node_type.operations(),
            &excluded,
        );

        // Client statistics can only be queried by root
        if !(self.privilege_check)() {
            return Err(CollectorError::InsufficientPrivilege {
                collector: name,
                reason: "BeeGFS file system statistics can only be queried by user root"
                    .to_string(),
            });
        }

        if process::resolve_binary(&config.beegfs_path).is_none() {
            return Err(CollectorError::BinaryNotFound {
                collector: name,
                binary: config.beegfs_path,
            });
        }

        self.skip_filesystems = ExclusionSet::new(config.exclude_filesystem.iter().cloned());
        self.matches = matches;
        self.config = config;
        self.state = CollectorState::Ready;

        info!(
            "{} initialized with {} metrics using {}",
            name,
            self.matches.len(),
            self.config.beegfs_path
        );
        Ok(())
    }

    fn read(
        &mut self,
        _interval: Duration,
        output: &SyncSender<MetricRecord>,
    ) -> Result<(), CollectorError> {
        ensure_ready(self.name(), self.state)?;

        let mount_points = match mounts::discover_mounts(
            &self.mounts_path,
            BEEGFS_ONDEMAND_MARKER,
            &self.skip_filesystems,
        ) {
            Ok(mount_points) => mount_points,
            Err(e) => {
                error!(
                    "{}: failed to read mount table {}: {}",
                    self.name(),
                    self.mounts_path.display(),
                    e
                );
                return Ok(());
            }
        };

        if mount_points.is_empty() {
            debug!("{}: no BeeGFS on-demand mounts found", self.name());
            return Ok(());
        }

        for mount_point in &mount_points {
            self.read_mount(mount_point, output)?;
        }

        Ok(())
    }

    fn close(&mut self) {
        self.state = CollectorState::Closed;
        debug!("{} closed", self.name());
    }

    fn state(&self) -> CollectorState {
        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::FieldValue;
    use crate::process::{CapturedOutput, MockProcessRunner};
    use serde_json::json;
    use std::io::Write;
    use std::sync::mpsc;
    use tempfile::NamedTempFile;

    const CLIENTSTATS: &str = "\
====== 10 s ======
Sum:          17 [sum]          10 [ack]           5 [close]           2 [foo]
10.0.0.1      17 [sum]          10 [ack]           5 [close]           2 [foo]
";

    fn mount_table(mounts: &[&str]) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        for mount in mounts {
            writeln!(file, "beegfs_ondemand {} beegfs rw,relatime 0 0", mount).unwrap();
        }
        writeln!(file, "/dev/sda1 / ext4 rw 0 0").unwrap();
        file.flush().unwrap();
        file
    }

    fn runner_returning(stdout: &'static str) -> MockProcessRunner {
        let mut runner = MockProcessRunner::new();
        runner.expect_run().returning(move |_| {
            Ok(CapturedOutput {
                stdout: stdout.to_string(),
                stderr: String::new(),
            })
        });
        runner
    }

    fn collector(runner: MockProcessRunner, mounts: &NamedTempFile) -> BeegfsCollector {
        BeegfsCollector::with_runner(BeegfsNodeType::Storage, Arc::new(runner))
            .with_mounts_path(mounts.path())
            .with_privilege_check(|| true)
    }

    fn config() -> Value {
        json!({"beegfs_path": "sh"})
    }

    fn drain(rx: &mpsc::Receiver<MetricRecord>) -> Vec<MetricRecord> {
        rx.try_iter().collect()
    }

    #[test]
    fn test_init_succeeds_with_resolvable_binary() {
        let mounts = mount_table(&[]);
        let mut c = collector(MockProcessRunner::new(), &mounts);

        c.init(&config()).unwrap();
        assert_eq!(c.state(), CollectorState::Ready);
        // 18 storage operations plus the accumulator
        assert_eq!(c.match_table().len(), 19);
    }

    #[test]
    fn test_init_fails_without_privilege() {
        let mounts = mount_table(&[]);
        let mut c = collector(MockProcessRunner::new(), &mounts).with_privilege_check(|| false);

        let err = c.init(&config()).unwrap_err();
        assert!(matches!(err, CollectorError::InsufficientPrivilege { .. }));
        assert!(err.to_string().contains("root"));
        assert_eq!(c.state(), CollectorState::Uninitialized);
    }

    #[test]
    fn test_init_fails_with_unresolvable_binary() {
        let mounts = mount_table(&[]);
        let mut c = collector(MockProcessRunner::new(), &mounts);

        let err = c
            .init(&json!({"beegfs_path": "/nonexistent/beegfs-ctl"}))
            .unwrap_err();
        match err {
            CollectorError::BinaryNotFound { binary, .. } => {
                assert_eq!(binary, "/nonexistent/beegfs-ctl")
            }
            other => panic!("Expected BinaryNotFound, got {:?}", other),
        }
        assert_eq!(c.state(), CollectorState::Uninitialized);
    }

    #[test]
    fn test_init_rejects_malformed_config() {
        let mounts = mount_table(&[]);
        let mut c = collector(MockProcessRunner::new(), &mounts);

        let err = c.init(&json!({"exclude_metrics": "ack"})).unwrap_err();
        assert!(matches!(err, CollectorError::InvalidConfig { .. }));
    }

    #[test]
    fn test_init_is_idempotent() {
        let mounts = mount_table(&[]);
        let mut c = collector(MockProcessRunner::new(), &mounts);

        c.init(&json!({"beegfs_path": "sh", "exclude_metrics": ["ack"]}))
            .unwrap();
        let table_before = c.match_table().clone();

        // A second init with different options must not touch the table
        c.init(&json!({"beegfs_path": "sh"})).unwrap();
        assert_eq!(c.state(), CollectorState::Ready);
        assert_eq!(c.match_table(), &table_before);
    }

    #[test]
    fn test_read_before_init_is_rejected() {
        let mounts = mount_table(&["/mnt/beeond"]);
        let mut c = collector(MockProcessRunner::new(), &mounts);
        let (tx, rx) = mpsc::sync_channel(64);

        let err = c.read(Duration::from_secs(10), &tx).unwrap_err();
        assert!(matches!(err, CollectorError::NotReady { .. }));
        assert!(drain(&rx).is_empty());
    }

    #[test]
    fn test_read_after_close_is_rejected_until_reinit() {
        let mounts = mount_table(&[]);
        let mut c = collector(MockProcessRunner::new(), &mounts);
        let (tx, _rx) = mpsc::sync_channel(64);

        c.init(&config()).unwrap();
        c.close();
        assert_eq!(c.state(), CollectorState::Closed);
        assert!(c.read(Duration::from_secs(10), &tx).is_err());

        c.init(&config()).unwrap();
        assert!(c.read(Duration::from_secs(10), &tx).is_ok());
    }

    #[test]
    fn test_read_emits_full_table_per_mount() {
        let mounts = mount_table(&["/mnt/beeond"]);
        let mut runner = MockProcessRunner::new();
        runner
            .expect_run()
            .withf(|spec| {
                spec.program() == "sh"
                    && spec.get_args()
                        == [
                            "--clientstats",
                            "--nodetype=storage",
                            "--mount=/mnt/beeond",
                            "--allstats",
                        ]
            })
            .times(1)
            .returning(|_| {
                Ok(CapturedOutput {
                    stdout: CLIENTSTATS.to_string(),
                    stderr: String::new(),
                })
            });
        let mut c = collector(runner, &mounts);
        c.init(&config()).unwrap();

        let (tx, rx) = mpsc::sync_channel(64);
        c.read(Duration::from_secs(10), &tx).unwrap();
        let records = drain(&rx);

        assert_eq!(records.len(), 19);
        let value_of = |name: &str| {
            records
                .iter()
                .find(|r| r.name() == name)
                .map(|r| r.value().clone())
        };
        assert_eq!(value_of("beegfs_cstorage_sum"), Some(FieldValue::Float(17.0)));
        assert_eq!(value_of("beegfs_cstorage_ack"), Some(FieldValue::Float(10.0)));
        assert_eq!(value_of("beegfs_cstorage_close"), Some(FieldValue::Float(5.0)));
        assert_eq!(value_of("beegfs_cstorage_other"), Some(FieldValue::Float(2.0)));
        // Never observed, still emitted at zero
        assert_eq!(value_of("beegfs_cstorage_fsync"), Some(FieldValue::Float(0.0)));

        for record in &records {
            assert_eq!(record.tag("filesystem"), Some("/mnt/beeond"));
            assert_eq!(record.tag("type"), Some("node"));
            assert_eq!(
                record.meta().get("source").map(String::as_str),
                Some("BeegfsStorageCollector")
            );
        }
    }

    #[test]
    fn test_read_known_keys_scenario() {
        let mounts = mount_table(&["/mnt/beeond"]);
        let mut c = collector(runner_returning("Sum: 42 [x] 10 ack 5 sum\n"), &mounts);
        c.init(&config()).unwrap();

        let (tx, rx) = mpsc::sync_channel(64);
        c.read(Duration::from_secs(10), &tx).unwrap();
        let records = drain(&rx);

        let ack = records.iter().find(|r| r.name() == "beegfs_cstorage_ack").unwrap();
        let sum = records.iter().find(|r| r.name() == "beegfs_cstorage_sum").unwrap();
        assert_eq!(ack.value().as_f64(), Some(10.0));
        assert_eq!(sum.value().as_f64(), Some(5.0));
        assert_eq!(ack.tag("filesystem"), Some("/mnt/beeond"));
        assert_eq!(sum.tag("filesystem"), Some("/mnt/beeond"));
    }

    #[test]
    fn test_excluded_metrics_are_never_emitted() {
        let mounts = mount_table(&["/mnt/beeond"]);
        let mut c = collector(runner_returning(CLIENTSTATS), &mounts);
        c.init(&json!({
            "beegfs_path": "sh",
            "exclude_metrics": ["ack", "beegfs_cstorage_close"]
        }))
        .unwrap();

        let (tx, rx) = mpsc::sync_channel(64);
        c.read(Duration::from_secs(10), &tx).unwrap();
        let records = drain(&rx);

        assert_eq!(records.len(), 17);
        assert!(records.iter().all(|r| r.name() != "beegfs_cstorage_ack"));
        assert!(records.iter().all(|r| r.name() != "beegfs_cstorage_close"));
        // Excluded labels seen in output fall into the accumulator
        let other = records
            .iter()
            .find(|r| r.name() == "beegfs_cstorage_other")
            .unwrap();
        assert_eq!(other.value().as_f64(), Some(17.0));
    }

    #[test]
    fn test_excluded_filesystem_is_not_queried() {
        let mounts = mount_table(&["/mnt/beeond", "/mnt/skip"]);
        let mut runner = MockProcessRunner::new();
        runner
            .expect_run()
            .withf(|spec| spec.get_args().iter().any(|a| a == "--mount=/mnt/beeond"))
            .times(1)
            .returning(|_| Ok(CapturedOutput::default()));
        let mut c = collector(runner, &mounts);
        c.init(&json!({"beegfs_path": "sh", "exclude_filesystem": ["/mnt/skip"]}))
            .unwrap();

        let (tx, _rx) = mpsc::sync_channel(64);
        c.read(Duration::from_secs(10), &tx).unwrap();
    }

    #[test]
    fn test_no_mounts_is_an_empty_tick() {
        let mounts = mount_table(&[]);
        let mut runner = MockProcessRunner::new();
        runner.expect_run().never();
        let mut c = collector(runner, &mounts);
        c.init(&config()).unwrap();

        let (tx, rx) = mpsc::sync_channel(64);
        assert!(c.read(Duration::from_secs(10), &tx).is_ok());
        assert!(drain(&rx).is_empty());
    }

    #[test]
    fn test_failed_command_skips_only_that_mount() {
        let mounts = mount_table(&["/mnt/broken", "/mnt/beeond"]);
        let mut runner = MockProcessRunner::new();
        runner
            .expect_run()
            .withf(|spec| spec.get_args().iter().any(|a| a == "--mount=/mnt/broken"))
            .returning(|spec| {
                Err(ProcessError::NonZeroExit {
                    command: spec.to_string(),
                    status: "exit status: 1".to_string(),
                    stdout: String::new(),
                    stderr: "Unable to connect".to_string(),
                })
            });
        runner
            .expect_run()
            .withf(|spec| spec.get_args().iter().any(|a| a == "--mount=/mnt/beeond"))
            .returning(|_| {
                Ok(CapturedOutput {
                    stdout: CLIENTSTATS.to_string(),
                    stderr: String::new(),
                })
            });
        let mut c = collector(runner, &mounts);
        c.init(&config()).unwrap();

        let (tx, rx) = mpsc::sync_channel(64);
        c.read(Duration::from_secs(10), &tx).unwrap();
        let records = drain(&rx);

        assert_eq!(records.len(), 19);
        assert!(records
            .iter()
            .all(|r| r.tag("filesystem") == Some("/mnt/beeond")));
        assert_eq!(c.state(), CollectorState::Ready);
    }

    #[test]
    fn test_output_without_totals_emits_nothing() {
        let mounts = mount_table(&["/mnt/beeond"]);
        let mut c = collector(
            runner_returning("10.0.0.1  3 [sum]  3 [ack]\nno statistics\n"),
            &mounts,
        );
        c.init(&config()).unwrap();

        let (tx, rx) = mpsc::sync_channel(64);
        c.read(Duration::from_secs(10), &tx).unwrap();
        assert!(drain(&rx).is_empty());
    }

    #[test]
    fn test_closed_output_channel_is_reported() {
        let mounts = mount_table(&["/mnt/beeond"]);
        let mut c = collector(runner_returning(CLIENTSTATS), &mounts);
        c.init(&config()).unwrap();

        let (tx, rx) = mpsc::sync_channel(64);
        drop(rx);
        assert!(matches!(
            c.read(Duration::from_secs(10), &tx),
            Err(CollectorError::OutputClosed)
        ));
    }

    #[test]
    fn test_meta_collector_vocabulary() {
        let mounts = mount_table(&["/mnt/beeond"]);
        let mut runner = MockProcessRunner::new();
        runner
            .expect_run()
            .withf(|spec| spec.get_args().iter().any(|a| a == "--nodetype=meta"))
            .returning(|_| {
                Ok(CapturedOutput {
                    stdout: "Sum: 9 [sum] 4 [mkdir] 5 [open]\n".to_string(),
                    stderr: String::new(),
                })
            });
        let mut c = BeegfsCollector::with_runner(BeegfsNodeType::Meta, Arc::new(runner))
            .with_mounts_path(mounts.path())
            .with_privilege_check(|| true);
        c.init(&config()).unwrap();
        assert_eq!(c.name(), "BeegfsMetaCollector");

        let (tx, rx) = mpsc::sync_channel(64);
        c.read(Duration::from_secs(10), &tx).unwrap();
        let records = drain(&rx);

        assert_eq!(records.len(), META_OPERATIONS.len() + 1);
        let mkdir = records.iter().find(|r| r.name() == "beegfs_cmeta_mkdir").unwrap();
        assert_eq!(mkdir.value().as_f64(), Some(4.0));
    }
}
