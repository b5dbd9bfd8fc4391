//! Error types for serial command interface operations

use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RobotError>;

#[derive(Error, Debug)]
pub enum RobotError {
    #[error("No response within {timeout:?} (expected {expected} bytes)")]
    TransportTimeout { expected: usize, timeout: Duration },

    #[error("Incomplete frame: expected {expected} bytes, received {received}")]
    IncompleteFrame { expected: usize, received: usize },

    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    #[error("Sensor read failed: {0}")]
    SensorReadFailure(#[source] Box<RobotError>),

    #[error("{command} takes at most {max} items, got {len}")]
    PayloadTooLong { command: &'static str, len: usize, max: usize },

    #[error("Invalid value {value} for enum field '{field}'")]
    InvalidEnumValue { field: &'static str, value: i32 },

    #[error("Docking timed out after {0:?}")]
    DockingTimedOut(Duration),

    /// A bounded operation ran out of time mid-sequence
    #[error("Deadline exceeded")]
    DeadlineExceeded,

    #[error("Serial link closed")]
    LinkClosed,

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Service error: {0}")]
    Service(String),

    #[error("Tokio task error: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl RobotError {
    /// Whether the caller may retry or carry on with stale telemetry.
    ///
    /// Anything else means the link (or the task driving it) is gone and
    /// the owning service should stop.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            RobotError::TransportTimeout { .. }
                | RobotError::IncompleteFrame { .. }
                | RobotError::SensorReadFailure(_)
                | RobotError::InvalidEnumValue { .. }
        )
    }
}
