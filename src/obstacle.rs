//! Bump and virtual-wall watch during timed motion

use crate::codec::VELOCITY_SLOW;
use crate::config::ObstacleConfig;
use crate::robot::Robot;
use crate::Result;
use std::time::Duration;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObstacleOutcome {
    /// Something was hit; the robot backed off and is stopped
    Handled,
    /// The window elapsed without contact; the robot is still moving
    NoObstacle,
}

/// Polls the sensors while the robot is driving and backs away on contact
#[derive(Clone)]
pub struct ObstacleMonitor {
    robot: Robot,
    poll_interval: Duration,
    reverse_duration: Duration,
}

impl ObstacleMonitor {
    pub fn new(robot: Robot, config: &ObstacleConfig) -> Self {
        Self {
            robot,
            poll_interval: config.poll_interval(),
            reverse_duration: config.reverse_duration(),
        }
    }

    /// Same monitor driving a different robot handle
    pub fn with_robot(&self, robot: Robot) -> Self {
        Self { robot, ..self.clone() }
    }

    /// Watch for obstacles for `window`.
    ///
    /// Returns [`ObstacleOutcome::Handled`] as soon as a bumper or the virtual
    /// wall trips, after reversing and stopping. Otherwise returns
    /// [`ObstacleOutcome::NoObstacle`] once the window has fully elapsed.
    pub async fn watch(&self, window: Duration) -> Result<ObstacleOutcome> {
        let deadline = Instant::now() + window;
        loop {
            let frame = self.robot.poll_sensors().await?;
            if frame.obstacle_detected() {
                info!("Obstacle detected (seq {}), backing off", frame.sequence());
                self.back_off().await?;
                return Ok(ObstacleOutcome::Handled);
            }

            let now = Instant::now();
            if now >= deadline {
                debug!("No obstacle within {:?}", window);
                return Ok(ObstacleOutcome::NoObstacle);
            }
            sleep_until((now + self.poll_interval).min(deadline)).await;
        }
    }

    async fn back_off(&self) -> Result<()> {
        self.robot.drive_straight(-VELOCITY_SLOW).await?;
        self.robot.pause(self.reverse_duration).await?;
        self.robot.stop().await
    }
}
