//! Telemetry abstraction for the robot daemon
//!
//! Services hand their observations to a [`TelemetryPublisher`] without
//! knowing where they end up (stdout, a log, a message bus).

use crate::auxiliary::BatteryLevel;
use crate::power::PowerDecision;
use crate::sensors::SensorFrame;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// One power-management cycle
#[derive(Debug, Clone, Serialize)]
pub struct PowerReport {
    pub decision: PowerDecision,
    /// Relay state after the cycle, when known
    pub auxiliary_power: Option<bool>,
    pub auxiliary_battery: BatteryLevel,
    /// Sequence of the sensor frame the decision was made on
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
}

/// Trait for publishing robot telemetry
#[async_trait]
pub trait TelemetryPublisher: Send + Sync {
    /// Publish a sensor frame whose readings changed
    async fn publish_sensors(&self, frame: &SensorFrame) -> anyhow::Result<()>;

    /// Publish the outcome of a power-management cycle
    async fn publish_power(&self, report: &PowerReport) -> anyhow::Result<()>;
}

/// Discards everything
#[derive(Debug, Clone)]
pub struct NoOpTelemetry;

#[async_trait]
impl TelemetryPublisher for NoOpTelemetry {
    async fn publish_sensors(&self, _frame: &SensorFrame) -> anyhow::Result<()> {
        Ok(())
    }

    async fn publish_power(&self, _report: &PowerReport) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Prints telemetry to stdout as one tagged JSON document per line
#[derive(Debug, Clone)]
pub struct ConsoleTelemetry {
    pub pretty_print: bool,
}

impl ConsoleTelemetry {
    pub fn new() -> Self {
        Self { pretty_print: false }
    }

    pub fn pretty() -> Self {
        Self { pretty_print: true }
    }

    fn print<T: Serialize + ?Sized>(&self, tag: &str, data: &T) -> anyhow::Result<()> {
        let json = if self.pretty_print {
            serde_json::to_string_pretty(data)?
        } else {
            serde_json::to_string(data)?
        };
        println!("[{}] {}", tag, json);
        Ok(())
    }
}

impl Default for ConsoleTelemetry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TelemetryPublisher for ConsoleTelemetry {
    async fn publish_sensors(&self, frame: &SensorFrame) -> anyhow::Result<()> {
        self.print("SENSORS", frame)
    }

    async fn publish_power(&self, report: &PowerReport) -> anyhow::Result<()> {
        self.print("POWER", report)
    }
}
