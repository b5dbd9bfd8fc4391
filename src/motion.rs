//! Timed moves built from the drive primitives

use crate::codec::{TurnDirection, VELOCITY_FAST, VELOCITY_SLOW};
use crate::obstacle::{ObstacleMonitor, ObstacleOutcome};
use crate::robot::Robot;
use crate::Result;
use tokio::time::Instant;
use tracing::info;

#[derive(Clone)]
pub struct Motion {
    robot: Robot,
    monitor: ObstacleMonitor,
}

impl Motion {
    pub fn new(robot: Robot, monitor: ObstacleMonitor) -> Self {
        Self { robot, monitor }
    }

    /// Same moves, abandoned with [`crate::RobotError::DeadlineExceeded`] at `deadline`
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let robot = self.robot.with_deadline(deadline);
        let monitor = self.monitor.with_robot(robot.clone());
        Self { robot, monitor }
    }

    pub fn robot(&self) -> &Robot {
        &self.robot
    }

    /// Drive forward for the configured move duration.
    ///
    /// With `safe` set the bumpers and virtual wall are watched and the move
    /// ends early on contact. Without it the robot drives blind and stops
    /// dead at the end of the window.
    pub async fn forward(&self, safe: bool) -> Result<ObstacleOutcome> {
        info!("Forward (safe: {})", safe);
        self.robot.drive_straight(VELOCITY_FAST).await?;
        let window = self.robot.motion_config().move_duration();
        if !safe {
            self.robot.pause(window).await?;
            self.robot.stop().await?;
            return Ok(ObstacleOutcome::NoObstacle);
        }
        let outcome = self.monitor.watch(window).await?;
        if outcome == ObstacleOutcome::NoObstacle {
            self.robot.slow_stop(VELOCITY_FAST).await?;
        }
        Ok(outcome)
    }

    pub async fn reverse(&self) -> Result<()> {
        info!("Reverse");
        self.robot.drive_straight(-VELOCITY_FAST).await?;
        self.robot.pause(self.robot.motion_config().move_duration()).await?;
        self.robot.slow_stop(-VELOCITY_FAST).await
    }

    pub async fn left(&self) -> Result<()> {
        self.turn(TurnDirection::CounterClockwise).await
    }

    pub async fn right(&self) -> Result<()> {
        self.turn(TurnDirection::Clockwise).await
    }

    async fn turn(&self, direction: TurnDirection) -> Result<()> {
        info!("Turn {:?}", direction);
        self.robot.turn_in_place(VELOCITY_SLOW, direction).await?;
        self.robot.pause(self.robot.motion_config().turn_duration()).await?;
        self.robot.stop().await
    }

    /// Back out of the dock: take control, swing left, then reverse away
    pub async fn undock(&self) -> Result<()> {
        info!("Undocking");
        self.robot.control().await?;
        self.left().await?;
        self.reverse().await
    }
}
