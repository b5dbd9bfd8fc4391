//! Docking state machine
//!
//! The firmware's own dock-seeking behaviour finds the dock but is too gentle
//! to push a loaded robot onto the charging contacts. This controller lets it
//! line up, then takes over once the robot sees the dock's combined buoy and
//! force-field signal and rams the last stretch at full speed, retrying from
//! a random heading when the charging contacts are missed.
//!
//! ```text
//! Approaching -> Seeking -> FastDocking -> Success
//!      ^                        |
//!      +------- Retrying <------+
//! ```
//!
//! The whole sequence is bounded by the configured timeout. Every wait is cut
//! short at the deadline, after which the robot is stopped and
//! [`RobotError::DockingTimedOut`] is returned.

use crate::codec::{Command, TurnDirection, VELOCITY_MAX, VELOCITY_SLOW};
use crate::config::DockingConfig;
use crate::motion::Motion;
use crate::sensors::{SensorFrame, CHARGING_SOURCES_AVAILABLE, CLIFF_LEFT_SIGNAL, CLIFF_RIGHT_SIGNAL};
use crate::{Result, RobotError};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DockingPhase {
    /// Dock-seek issued to the firmware
    Approaching,
    /// Waiting for alignment with the dock, then for the ramp
    Seeking,
    /// Driving onto the contacts at full speed
    FastDocking,
    /// Contacts missed; backing off and turning
    Retrying,
    Success,
}

impl fmt::Display for DockingPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DockingPhase::Approaching => "approaching",
            DockingPhase::Seeking => "seeking",
            DockingPhase::FastDocking => "fast-docking",
            DockingPhase::Retrying => "retrying",
            DockingPhase::Success => "success",
        };
        f.write_str(name)
    }
}

/// Summary of a successful docking run
#[derive(Debug, Clone, Serialize)]
pub struct DockingReport {
    /// Dock-seek commands issued, including the first
    pub attempts: u32,
    pub elapsed: Duration,
}

pub struct DockingController<R = StdRng> {
    motion: Motion,
    config: DockingConfig,
    rng: R,
}

impl DockingController<StdRng> {
    pub fn new(motion: Motion, config: DockingConfig) -> Self {
        Self::with_rng(motion, config, StdRng::from_entropy())
    }
}

impl<R: Rng + Send> DockingController<R> {
    pub fn with_rng(motion: Motion, config: DockingConfig, rng: R) -> Self {
        Self { motion, config, rng }
    }

    /// Drive into the dock.
    ///
    /// Returns once the charging contacts report a source, or fails with
    /// [`RobotError::DockingTimedOut`] with the robot stopped. Link failures
    /// are passed through as-is.
    pub async fn dock(&mut self) -> Result<DockingReport> {
        let timeout = self.config.timeout();
        let start = Instant::now();
        info!("Docking (timeout {:?})", timeout);

        let bounded = self.motion.with_deadline(start + timeout);
        match self.run(&bounded).await {
            Ok(attempts) => {
                let elapsed = start.elapsed();
                info!("Docking succeeded after {} attempt(s) in {:?}", attempts, elapsed);
                Ok(DockingReport { attempts, elapsed })
            }
            Err(RobotError::DeadlineExceeded) => {
                warn!("Docking timed out after {:?}", timeout);
                let robot = self.motion.robot();
                robot.control().await?;
                robot.stop().await?;
                Err(RobotError::DockingTimedOut(timeout))
            }
            Err(e) => Err(e),
        }
    }

    async fn run(&mut self, motion: &Motion) -> Result<u32> {
        let mut attempts = 0;
        let mut phase = DockingPhase::Approaching;
        loop {
            debug!(%phase, attempts, "Docking phase");
            phase = match phase {
                DockingPhase::Approaching => {
                    attempts += 1;
                    motion.robot().seek_dock().await?;
                    DockingPhase::Seeking
                }
                DockingPhase::Seeking => {
                    self.await_alignment(motion).await?;
                    DockingPhase::FastDocking
                }
                DockingPhase::FastDocking => {
                    if self.fast_dock(motion).await? {
                        DockingPhase::Success
                    } else {
                        DockingPhase::Retrying
                    }
                }
                DockingPhase::Retrying => {
                    self.retry(motion).await?;
                    DockingPhase::Approaching
                }
                DockingPhase::Success => return Ok(attempts),
            };
        }
    }

    async fn await_alignment(&self, motion: &Motion) -> Result<()> {
        let robot = motion.robot();
        let poll = self.config.poll_interval();

        loop {
            let frame = robot.poll_sensors().await?;
            if frame.remote_opcode().is_some_and(|opcode| opcode.is_dock_aligned()) {
                info!("Aligned with dock");
                break;
            }
            robot.pause(poll).await?;
        }

        let Some(threshold) = self.config.ramp_cliff_threshold() else {
            return Ok(());
        };
        loop {
            let frame = robot.poll_sensors().await?;
            if on_ramp(&frame, threshold) {
                debug!("Front wheels on the dock ramp");
                return Ok(());
            }
            robot.pause(poll).await?;
        }
    }

    /// Back off, then charge the dock until a bumper trips or the stopwatch
    /// runs out. True when a charging source shows up afterwards.
    async fn fast_dock(&self, motion: &Motion) -> Result<bool> {
        let robot = motion.robot();
        robot.control().await?;
        motion.reverse().await?;

        info!("Fast docking");
        robot.drive_straight(VELOCITY_MAX).await?;
        let limit = Instant::now() + self.config.fast_dock_limit();
        loop {
            let frame = robot.poll_sensors().await?;
            let now = Instant::now();
            if frame.bumped() || now >= limit {
                break;
            }
            robot.pause(self.config.poll_interval().min(limit - now)).await?;
        }
        robot.stop().await?;

        robot.pause(self.config.settle()).await?;
        let frame = robot.poll_sensors().await?;
        Ok(frame.flag(CHARGING_SOURCES_AVAILABLE))
    }

    async fn retry(&mut self, motion: &Motion) -> Result<()> {
        info!("Docking failed, retrying");
        let robot = motion.robot();
        robot.control().await?;
        for _ in 0..self.config.retry_reverses() {
            motion.reverse().await?;
        }

        let direction = TurnDirection::random(&mut self.rng);
        let turn = self.rng.gen_range(self.config.turn_min()..=self.config.turn_max());
        debug!("Turning {:?} for {:?}", direction, turn);
        robot.send(Command::turn_in_place(VELOCITY_SLOW, direction)).await?;
        robot.pause(turn).await
    }
}

fn on_ramp(frame: &SensorFrame, threshold: i32) -> bool {
    [CLIFF_LEFT_SIGNAL, CLIFF_RIGHT_SIGNAL]
        .iter()
        .any(|key| frame.int(key).is_some_and(|signal| signal < threshold))
}
