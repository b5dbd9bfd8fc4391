//! createbot - serial command interface and autonomy loops for a Create-class robot
//!
//! This library drives the robot over its serial command interface and runs
//! the behaviours built on top of it: obstacle-aware motion, docking, and
//! power management for an auxiliary computer riding on the robot.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use createbot::{Config, ObstacleMonitor, Motion, Robot, Transport};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::load_from_path("config/default_config.yaml")?;
//!     let transport = Arc::new(Transport::open(
//!         config.serial.port(),
//!         config.serial.baud(),
//!         config.serial.read_timeout(),
//!     )?);
//!
//!     let robot = Robot::new(transport, config.motion.clone());
//!     robot.wake().await?;
//!     robot.control().await?;
//!
//!     let monitor = ObstacleMonitor::new(robot.clone(), &config.obstacle);
//!     let outcome = Motion::new(robot, monitor).forward(true).await?;
//!     println!("Forward: {:?}", outcome);
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! - **Command / Opcode**: statically checked wire command table and codec
//! - **Transport**: the one shared serial link, one exchange at a time
//! - **SensorFrame**: decoded sensor snapshot with staleness tracking
//! - **Robot / Motion**: command sequences and timed moves
//! - **ObstacleMonitor**: bump and virtual-wall watch during motion
//! - **DockingController**: bounded docking state machine
//! - **ServiceScheduler**: periodic sensor and power services
//! - **TelemetryPublisher**: transport-agnostic telemetry interface

pub mod auxiliary;
pub mod codec;
pub mod config;
pub mod docking;
pub mod error;
pub mod motion;
pub mod obstacle;
pub mod opcodes;
pub mod power;
pub mod robot;
pub mod sensors;
pub mod service;
pub mod sim;
pub mod telemetry;
pub mod transport;

// High-level exports for easy usage
pub use config::Config;
pub use docking::{DockingController, DockingPhase, DockingReport};
pub use error::{Result, RobotError};
pub use motion::Motion;
pub use obstacle::{ObstacleMonitor, ObstacleOutcome};
pub use robot::Robot;
pub use sensors::{ChargingState, SensorFrame, SensorValue};
pub use service::{Service, ServiceScheduler, ServiceState, SensorService};
pub use telemetry::{ConsoleTelemetry, NoOpTelemetry, PowerReport, TelemetryPublisher};
pub use transport::{Link, SerialLink, Transport};

// Protocol exports for advanced usage
pub use codec::{Command, TurnDirection};
pub use opcodes::{Opcode, OpcodeFamily, PayloadShape, RemoteOpcode};

// Power management exports
pub use auxiliary::{AuxiliaryBattery, AuxiliaryPower, BatteryLevel, RelayBoard, SysfsBattery};
pub use power::{PowerDecision, PowerManager, PowerService};
