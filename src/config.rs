//! Configuration loading for the robot daemon
//!
//! Every field is optional; accessors fall back to the defaults the robot
//! has been tuned with.

use crate::{Result, RobotError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub serial: SerialConfig,
    #[serde(default)]
    pub motion: MotionConfig,
    #[serde(default)]
    pub obstacle: ObstacleConfig,
    #[serde(default)]
    pub docking: DockingConfig,
    #[serde(default)]
    pub services: ServicesConfig,
    #[serde(default)]
    pub auxiliary: AuxiliaryConfig,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SerialConfig {
    pub port: Option<String>,
    pub baud: Option<u32>,
    pub read_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct MotionConfig {
    pub move_duration_ms: Option<u64>,
    pub turn_duration_ms: Option<u64>,
    /// Safe mode lets the firmware veto motion near cliffs; full mode does not
    pub safe_mode: Option<bool>,
    pub start_delay_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ObstacleConfig {
    pub poll_interval_ms: Option<u64>,
    pub reverse_duration_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DockingConfig {
    pub timeout_s: Option<f64>,
    pub poll_interval_ms: Option<u64>,
    pub fast_dock_limit_s: Option<f64>,
    pub settle_ms: Option<u64>,
    pub retry_reverses: Option<u32>,
    /// Cliff signal below this means the front wheels are on the dock ramp.
    /// `None` in the file keeps the default; ramp detection can be turned off
    /// with `ramp_detection: false`.
    pub ramp_cliff_threshold: Option<i32>,
    pub ramp_detection: Option<bool>,
    pub turn_min_ms: Option<u64>,
    pub turn_max_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ServicesConfig {
    pub sensor_interval_ms: Option<u64>,
    pub power_interval_s: Option<u64>,
    pub startup_settle_s: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AuxiliaryConfig {
    /// Relay board serial port; no relay board when absent
    pub port: Option<String>,
    pub baud: Option<u32>,
    pub battery_path: Option<String>,
}

impl Config {
    pub fn load_from_path(config_path: &str) -> Result<Self> {
        let contents = fs::read_to_string(config_path)
            .map_err(|e| RobotError::Config(format!("Failed to read {}: {}", config_path, e)))?;
        Self::load_from_str(&contents)
    }

    pub fn load_from_str(contents: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would stall a loop or invert a range
    pub fn validate(&self) -> Result<()> {
        let non_zero = [
            ("serial.read_timeout_ms", self.serial.read_timeout().as_millis()),
            ("obstacle.poll_interval_ms", self.obstacle.poll_interval().as_millis()),
            ("docking.poll_interval_ms", self.docking.poll_interval().as_millis()),
            ("docking.timeout_s", self.docking.timeout().as_millis()),
            ("services.sensor_interval_ms", self.services.sensor_interval().as_millis()),
            ("services.power_interval_s", self.services.power_interval().as_millis()),
        ];
        for (name, value) in non_zero {
            if value == 0 {
                return Err(RobotError::Config(format!("{} must be greater than zero", name)));
            }
        }
        if self.docking.turn_min() > self.docking.turn_max() {
            return Err(RobotError::Config(format!(
                "docking.turn_min_ms ({:?}) exceeds docking.turn_max_ms ({:?})",
                self.docking.turn_min(),
                self.docking.turn_max()
            )));
        }
        if self.serial.baud() == 0 {
            return Err(RobotError::Config("serial.baud must be greater than zero".to_string()));
        }
        Ok(())
    }
}

fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}

impl SerialConfig {
    pub fn port(&self) -> &str {
        self.port.as_deref().unwrap_or("/dev/ttyUSB1")
    }

    pub fn baud(&self) -> u32 {
        self.baud.unwrap_or(57600)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms.unwrap_or(500))
    }
}

impl MotionConfig {
    pub fn move_duration(&self) -> Duration {
        Duration::from_millis(self.move_duration_ms.unwrap_or(1000))
    }

    pub fn turn_duration(&self) -> Duration {
        Duration::from_millis(self.turn_duration_ms.unwrap_or(250))
    }

    pub fn safe_mode(&self) -> bool {
        self.safe_mode.unwrap_or(false)
    }

    /// Wait after `start` before the robot accepts mode commands
    pub fn start_delay(&self) -> Duration {
        Duration::from_millis(self.start_delay_ms.unwrap_or(500))
    }
}

impl ObstacleConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.unwrap_or(50))
    }

    pub fn reverse_duration(&self) -> Duration {
        Duration::from_millis(self.reverse_duration_ms.unwrap_or(500))
    }
}

impl DockingConfig {
    pub fn timeout(&self) -> Duration {
        secs(self.timeout_s.unwrap_or(60.0))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.unwrap_or(50))
    }

    pub fn fast_dock_limit(&self) -> Duration {
        secs(self.fast_dock_limit_s.unwrap_or(10.0))
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms.unwrap_or(1000))
    }

    pub fn retry_reverses(&self) -> u32 {
        self.retry_reverses.unwrap_or(3)
    }

    pub fn ramp_cliff_threshold(&self) -> Option<i32> {
        if self.ramp_detection.unwrap_or(true) {
            Some(self.ramp_cliff_threshold.unwrap_or(1200))
        } else {
            None
        }
    }

    pub fn turn_min(&self) -> Duration {
        Duration::from_millis(self.turn_min_ms.unwrap_or(500))
    }

    pub fn turn_max(&self) -> Duration {
        Duration::from_millis(self.turn_max_ms.unwrap_or(2000))
    }
}

impl ServicesConfig {
    pub fn sensor_interval(&self) -> Duration {
        Duration::from_millis(self.sensor_interval_ms.unwrap_or(50))
    }

    pub fn power_interval(&self) -> Duration {
        Duration::from_secs(self.power_interval_s.unwrap_or(10))
    }

    /// Time given to the sensor service before power management starts
    pub fn startup_settle(&self) -> Duration {
        Duration::from_secs(self.startup_settle_s.unwrap_or(5))
    }
}

impl AuxiliaryConfig {
    pub fn baud(&self) -> u32 {
        self.baud.unwrap_or(9600)
    }

    pub fn battery_path(&self) -> &str {
        self.battery_path
            .as_deref()
            .unwrap_or("/sys/class/power_supply/olpc-battery/capacity_level")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::load_from_str("{}").unwrap();
        assert_eq!(config.serial.port(), "/dev/ttyUSB1");
        assert_eq!(config.serial.baud(), 57600);
        assert_eq!(config.docking.timeout(), Duration::from_secs(60));
        assert_eq!(config.docking.retry_reverses(), 3);
        assert_eq!(config.docking.ramp_cliff_threshold(), Some(1200));
        assert_eq!(config.obstacle.poll_interval(), Duration::from_millis(50));
        assert_eq!(config.services.power_interval(), Duration::from_secs(10));
        assert!(!config.motion.safe_mode());
        assert!(config.auxiliary.port.is_none());
    }

    #[test]
    fn test_partial_sections() {
        let yaml = r#"
serial:
  port: /dev/ttyS0
docking:
  timeout_s: 30.5
  ramp_detection: false
services:
  power_interval_s: 5
"#;
        let config = Config::load_from_str(yaml).unwrap();
        assert_eq!(config.serial.port(), "/dev/ttyS0");
        assert_eq!(config.serial.read_timeout(), Duration::from_millis(500));
        assert_eq!(config.docking.timeout(), Duration::from_millis(30500));
        assert_eq!(config.docking.ramp_cliff_threshold(), None);
        assert_eq!(config.services.power_interval(), Duration::from_secs(5));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let zero_poll = "obstacle:\n  poll_interval_ms: 0\n";
        assert!(matches!(Config::load_from_str(zero_poll), Err(RobotError::Config(_))));

        let inverted = "docking:\n  turn_min_ms: 3000\n  turn_max_ms: 1000\n";
        assert!(matches!(Config::load_from_str(inverted), Err(RobotError::Config(_))));

        assert!(matches!(Config::load_from_str("serial: [1, 2]"), Err(RobotError::Yaml(_))));
    }

    #[test]
    fn test_shipped_config_loads() {
        let path = concat!(env!("CARGO_MANIFEST_DIR"), "/config/default_config.yaml");
        let config = Config::load_from_path(path).unwrap();
        assert_eq!(config.serial.baud(), 57600);
        assert_eq!(config.docking.turn_max(), Duration::from_secs(2));
        assert!(config.auxiliary.port.is_none());
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(Config::load_from_path("/nonexistent/robot.yaml"), Err(RobotError::Config(_))));
    }
}
