//! Process-wide configuration
//!
//! The document is TOML or JSON, picked by file extension:
//!
//! ```toml
//! interval = "10s"
//! channel_capacity = 1024
//!
//! [collectors.beegfs_storage]
//! exclude_metrics = ["gendbg"]
//!
//! [collectors.topprocs]
//! num_procs = 5
//!
//! [[receivers]]
//! name = "bmc"
//! type = "ipmi"
//! endpoint = "ipmi-sensors://%h-bmc"
//! username = "monitor"
//! password = "secret"
//! client_config = [{ host_list = ["n1", "n2"] }]
//! ```
//!
//! Each collector section and each receiver entry is handed to its unit as a
//! JSON value, so both formats reach the units in the same shape.

use crate::error::ConfigError;
use log::debug;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_INTERVAL: &str = "10s";
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Toml,
    Json,
}

impl ConfigFormat {
    /// `.json` files are JSON, everything else is TOML
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => ConfigFormat::Json,
            _ => ConfigFormat::Toml,
        }
    }
}

/// One `[[receivers]]` entry
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ReceiverEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    /// Remaining keys, passed to the receiver unchanged
    #[serde(flatten)]
    pub options: Map<String, Value>,
}

impl ReceiverEntry {
    pub fn options_value(&self) -> Value {
        Value::Object(self.options.clone())
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Collector tick as a duration string
    pub interval: String,
    /// Capacity of the bounded output channel
    pub channel_capacity: usize,
    /// Collector kind → instance configuration
    pub collectors: BTreeMap<String, Value>,
    pub receivers: Vec<ReceiverEntry>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL.to_string(),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            collectors: BTreeMap::new(),
            receivers: Vec::new(),
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load and validate a configuration file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadError(format!("{}: {}", path.display(), e)))?;
        let format = ConfigFormat::from_path(path);
        debug!("Parsing {} as {:?}", path.display(), format);
        Self::parse(&content, format)
    }

    pub fn parse(content: &str, format: ConfigFormat) -> Result<Self, ConfigError> {
        let config: Config = match format {
            ConfigFormat::Toml => toml::from_str(content)?,
            ConfigFormat::Json => serde_json::from_str(content)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_interval()?.is_zero() {
            return Err(ConfigError::ValidationError(
                "interval must be positive".to_string(),
            ));
        }

        if self.channel_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "channel_capacity must be at least 1".to_string(),
            ));
        }

        let mut names = HashSet::new();
        for entry in &self.receivers {
            if entry.name.is_empty() {
                return Err(ConfigError::ValidationError(
                    "receiver entries need a non-empty name".to_string(),
                ));
            }
            if !names.insert(entry.name.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "duplicate receiver name '{}'",
                    entry.name
                )));
            }
        }

        Ok(())
    }

    /// Collector tick as a [`Duration`]
    pub fn tick_interval(&self) -> Result<Duration, ConfigError> {
        parse_duration(&self.interval)
    }
}

/// Parse a duration such as `"30s"`, `"1m30s"`, `"250ms"` or `"1.5h"`
///
/// Accepts a sequence of decimal numbers, each followed by one of the units
/// `ns`, `us` (or `µs`), `ms`, `s`, `m`, `h`. A bare `"0"` is zero. Negative
/// durations are rejected.
pub fn parse_duration(input: &str) -> Result<Duration, ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidDuration {
        input: input.to_string(),
        reason: reason.to_string(),
    };

    let s = input.trim();
    if s.is_empty() {
        return Err(invalid("empty duration"));
    }
    if s.starts_with('-') {
        return Err(invalid("negative durations are not supported"));
    }
    let s = s.strip_prefix('+').unwrap_or(s);
    if s == "0" {
        return Ok(Duration::ZERO);
    }

    let is_number = |c: char| c.is_ascii_digit() || c == '.';
    let mut rest = s;
    let mut total_nanos = 0f64;

    while !rest.is_empty() {
        let number_len = rest.find(|c: char| !is_number(c)).unwrap_or(rest.len());
        if number_len == 0 {
            return Err(invalid("expected a number"));
        }
        let number: f64 = rest[..number_len]
            .parse()
            .map_err(|_| invalid("malformed number"))?;
        rest = &rest[number_len..];

        let unit_len = rest.find(is_number).unwrap_or(rest.len());
        let nanos_per_unit = match &rest[..unit_len] {
            "ns" => 1.0,
            "us" | "µs" | "μs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3600e9,
            "" => return Err(invalid("missing unit")),
            unit => return Err(invalid(&format!("unknown unit '{}'", unit))),
        };
        rest = &rest[unit_len..];

        total_nanos += number * nanos_per_unit;
    }

    if !total_nanos.is_finite() || total_nanos > u64::MAX as f64 {
        return Err(invalid("duration out of range"));
    }

    Ok(Duration::from_nanos(total_nanos.round() as u64))
}


#[cfg(test)]
mod property_tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    #[quickcheck]
    fn prop_whole_seconds_roundtrip(secs: u16) -> bool {
        parse_duration(&format!("{}s", secs)).ok() == Some(Duration::from_secs(u64::from(secs)))
    }

    #[quickcheck]
    fn prop_components_add_up(h: u8, m: u8, s: u8) -> bool {
        let expected = Duration::from_secs(u64::from(h) * 3600 + u64::from(m) * 60 + u64::from(s));
        parse_duration(&format!("{}h{}m{}s", h, m, s)).ok() == Some(expected)
    }
}
