use thiserror::Error;

/// Errors raised while launching or waiting for an external command
#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("Failed to spawn subprocess `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Command `{command}` exited with {status}")]
    NonZeroExit {
        command: String,
        status: String,
        stdout: String,
        stderr: String,
    },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Errors that can occur in pull-model collectors
#[derive(Error, Debug)]
pub enum CollectorError {
    #[error("{collector}: invalid configuration: {reason}")]
    InvalidConfig { collector: String, reason: String },

    #[error("{collector}: {reason}")]
    InsufficientPrivilege { collector: String, reason: String },

    #[error("{collector}: failed to find binary '{binary}' in search path")]
    BinaryNotFound { collector: String, binary: String },

    #[error("{collector}: collector is not ready (state: {state})")]
    NotReady { collector: String, state: String },

    #[error("Unknown collector type: {0}")]
    UnknownCollector(String),

    #[error("Output channel closed")]
    OutputClosed,

    #[error("Subprocess failed: {0}")]
    Process(#[from] ProcessError),
}

/// Errors that can occur in push-model receivers
#[derive(Error, Debug)]
pub enum ReceiverError {
    #[error("{receiver}: client config number {index} requires {field}")]
    MissingField {
        receiver: String,
        index: usize,
        field: &'static str,
    },

    #[error("{receiver}: client config number {index} has invalid driver type {driver_type}")]
    InvalidDriverType {
        receiver: String,
        index: usize,
        driver_type: String,
    },

    #[error("{receiver}: client config number {index} has invalid endpoint {endpoint}")]
    InvalidEndpoint {
        receiver: String,
        index: usize,
        endpoint: String,
    },

    #[error("{receiver}: client config number {index} uses unsupported protocol {protocol}")]
    UnsupportedProtocol {
        receiver: String,
        index: usize,
        protocol: String,
    },

    #[error("{receiver}: at least one IPMI host config is required")]
    NoHosts { receiver: String },

    #[error("{receiver}: invalid configuration: {reason}")]
    InvalidConfig { receiver: String, reason: String },

    #[error("{receiver}: no output channel attached")]
    NoSink { receiver: String },

    #[error("{receiver}: operation not allowed in state {state}")]
    InvalidState { receiver: String, state: String },

    #[error("{receiver}: worker thread panicked")]
    WorkerPanicked { receiver: String },

    #[error("Unknown receiver type: {0}")]
    UnknownReceiver(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Errors that can occur during configuration loading
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(String),

    #[error("Invalid configuration value: {0}")]
    ValidationError(String),

    #[error("Invalid duration '{input}': {reason}")]
    InvalidDuration { input: String, reason: String },

    #[error("TOML parse error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("JSON parse error: {0}")]
    JsonError(#[from] serde_json::Error),
}
