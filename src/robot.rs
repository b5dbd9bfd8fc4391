//! Robot command layer
//!
//! Thin, cloneable handle over the shared [`Transport`] that knows the
//! command sequences the firmware expects: waking, taking control, resets,
//! the drive variants and sensor polling.

use crate::codec::{Command, TurnDirection, VELOCITY_SLOW};
use crate::config::MotionConfig;
use crate::sensors::SensorFrame;
use crate::transport::{SensorReading, Transport};
use crate::{Result, RobotError};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

/// Velocity change per step while slowing down, in mm/s
pub const DECELERATION_STEP: i32 = 25;
/// Time between deceleration steps
pub const DECELERATION_INTERVAL: Duration = Duration::from_millis(50);

/// Velocities to pass through when bringing `velocity` down to a crawl.
///
/// Empty when already at or below the slow speed.
pub fn deceleration_steps(velocity: i32) -> Vec<i32> {
    let mut steps = Vec::new();
    let mut v = velocity;
    while v.abs() > VELOCITY_SLOW {
        steps.push(v);
        v -= DECELERATION_STEP * v.signum();
    }
    steps
}

#[derive(Clone)]
pub struct Robot {
    transport: Arc<Transport>,
    motion: MotionConfig,
    deadline: Option<Instant>,
}

impl Robot {
    pub fn new(transport: Arc<Transport>, motion: MotionConfig) -> Self {
        Self { transport, motion, deadline: None }
    }

    /// A handle whose pauses give up at `deadline`.
    ///
    /// Any operation on the returned handle that would have to wait past the
    /// deadline sleeps until it and then fails with
    /// [`RobotError::DeadlineExceeded`], before sending anything further.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        Self { deadline: Some(deadline), ..self.clone() }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Sleep for `duration`, bounded by the handle's deadline
    pub async fn pause(&self, duration: Duration) -> Result<()> {
        let until = Instant::now() + duration;
        match self.deadline {
            Some(deadline) if until > deadline => {
                sleep_until(deadline).await;
                Err(RobotError::DeadlineExceeded)
            }
            _ => {
                sleep_until(until).await;
                Ok(())
            }
        }
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    pub fn motion_config(&self) -> &MotionConfig {
        &self.motion
    }

    pub async fn send(&self, command: Command) -> Result<()> {
        self.transport.send(&command).await
    }

    /// Pulse RTS low then high to wake a sleeping robot
    pub async fn wake(&self) -> Result<()> {
        info!("Waking robot");
        self.transport.set_rts(false).await?;
        self.pause(Duration::from_millis(100)).await?;
        self.transport.set_rts(true).await?;
        // Nominally awake after 500ms
        self.pause(Duration::from_secs(1)).await
    }

    /// Start the interface and enter safe or full mode
    pub async fn control(&self) -> Result<()> {
        let mode = if self.motion.safe_mode() { Command::Safe } else { Command::Full };
        debug!("Taking control ({})", mode);
        self.send(Command::Start).await?;
        self.pause(self.motion.start_delay()).await?;
        self.send(mode).await
    }

    /// Reboot the firmware. The robot will not start charging from the
    /// not-charging state without one.
    pub async fn soft_reset(&self) -> Result<()> {
        info!("Sending soft reset");
        self.send(Command::SoftReset).await?;
        self.pause(self.motion.start_delay()).await?;
        // The boot banner is not a response to anything
        self.transport.clear_input().await
    }

    /// Hand the robot to its own dock-seeking behaviour
    pub async fn seek_dock(&self) -> Result<()> {
        self.send(Command::Start).await?;
        self.pause(self.motion.start_delay()).await?;
        self.send(Command::CoverAndSeekDock).await
    }

    pub async fn drive(&self, velocity: i32, radius: i32) -> Result<()> {
        self.send(Command::drive(velocity, radius)).await
    }

    pub async fn drive_straight(&self, velocity: i32) -> Result<()> {
        self.send(Command::drive_straight(velocity)).await
    }

    pub async fn turn_in_place(&self, velocity: i32, direction: TurnDirection) -> Result<()> {
        self.send(Command::turn_in_place(velocity, direction)).await
    }

    pub async fn stop(&self) -> Result<()> {
        self.send(Command::stop()).await
    }

    /// Bleed off speed before stopping so the robot does not tip
    pub async fn slow_stop(&self, velocity: i32) -> Result<()> {
        for v in deceleration_steps(velocity) {
            self.drive_straight(v).await?;
            self.pause(DECELERATION_INTERVAL).await?;
        }
        self.stop().await
    }

    /// Query sensors, surfacing every failure
    pub async fn query_sensors(&self) -> Result<SensorReading> {
        self.transport.query_sensors().await
    }

    /// Query sensors, falling back to the last good frame on a failed read.
    ///
    /// The fallback frame keeps its old sequence number, so callers can tell.
    pub async fn poll_sensors(&self) -> Result<SensorFrame> {
        match self.transport.query_sensors().await {
            Ok(reading) => Ok(reading.frame),
            Err(e @ RobotError::SensorReadFailure(_)) => {
                warn!("Using last sensor frame: {}", e);
                Ok(self.transport.snapshot())
            }
            Err(e) => Err(e),
        }
    }

    /// Latest frame without a query
    pub fn sensors(&self) -> SensorFrame {
        self.transport.snapshot()
    }
}
