//! Auxiliary device collaborators
//!
//! The robot carries a second computer fed from the robot's battery through
//! a relay. Power management needs to switch that relay and to know how
//! charged the computer's own battery is.

use crate::transport::{Link, SerialLink};
use crate::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::{Mutex as StdMutex, PoisonError};
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Relay that feeds the auxiliary device from the robot
#[async_trait]
pub trait AuxiliaryPower: Send + Sync {
    async fn set_auxiliary_power(&self, on: bool) -> Result<()>;

    async fn query_auxiliary_power(&self) -> Result<bool>;
}

/// Battery of the auxiliary device
#[async_trait]
pub trait AuxiliaryBattery: Send + Sync {
    async fn capacity_level(&self) -> Result<BatteryLevel>;
}

/// Coarse charge level as reported by the kernel's power-supply class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BatteryLevel {
    Critical,
    Low,
    Normal,
    High,
    Full,
    Unknown,
}

impl BatteryLevel {
    pub fn parse(text: &str) -> Self {
        match text.trim().to_ascii_lowercase().as_str() {
            "critical" => BatteryLevel::Critical,
            "low" => BatteryLevel::Low,
            "normal" => BatteryLevel::Normal,
            "high" => BatteryLevel::High,
            "full" => BatteryLevel::Full,
            _ => BatteryLevel::Unknown,
        }
    }

    /// Charged enough that the device can run off its own battery.
    /// An unreadable level does not force the relay on.
    pub fn is_sufficient(self) -> bool {
        !matches!(self, BatteryLevel::Critical | BatteryLevel::Low)
    }
}

/// Relay on a microcontroller behind a serial line.
///
/// The board only accepts commands, so the relay state is whatever was last
/// set through this handle.
pub struct RelayBoard {
    link: Mutex<Box<dyn Link>>,
    state: StdMutex<Option<bool>>,
}

impl RelayBoard {
    const ON: u8 = b'V';
    const OFF: u8 = b'R';

    pub fn new(link: Box<dyn Link>) -> Self {
        Self { link: Mutex::new(link), state: StdMutex::new(None) }
    }

    pub fn open(path: &str, baud: u32) -> Result<Self> {
        info!("Opening relay board on {}", path);
        Ok(Self::new(Box::new(SerialLink::open(path, baud)?)))
    }

    fn cached(&self) -> Option<bool> {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl AuxiliaryPower for RelayBoard {
    async fn set_auxiliary_power(&self, on: bool) -> Result<()> {
        let byte = if on { Self::ON } else { Self::OFF };
        self.link.lock().await.write(&[byte]).await?;
        debug!("Auxiliary power {}", if on { "on" } else { "off" });
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = Some(on);
        Ok(())
    }

    /// Last state set; off until the first switch
    async fn query_auxiliary_power(&self) -> Result<bool> {
        Ok(self.cached().unwrap_or(false))
    }
}

/// Reads a sysfs `capacity_level` file
pub struct SysfsBattery {
    path: PathBuf,
}

impl SysfsBattery {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl AuxiliaryBattery for SysfsBattery {
    async fn capacity_level(&self) -> Result<BatteryLevel> {
        let text = tokio::fs::read_to_string(&self.path).await?;
        Ok(BatteryLevel::parse(&text))
    }
}
