//! Auxiliary power management
//!
//! Decides, from the latest sensor frame, whether the auxiliary device should
//! be fed from the robot's battery. The decision depends on the combination
//! of charging source, the robot's charging state and the device's own
//! battery, never on a single threshold.

use crate::auxiliary::{AuxiliaryBattery, AuxiliaryPower, BatteryLevel};
use crate::robot::Robot;
use crate::sensors::{ChargingState, SensorFrame, CHARGING_SOURCES_AVAILABLE, CHARGING_STATE};
use crate::service::Service;
use crate::telemetry::{PowerReport, TelemetryPublisher};
use crate::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PowerDecision {
    /// The frame does not carry the charging fields yet; leave the relay
    NoTelemetry,
    /// Nothing to charge from; relay off
    NoChargingSource,
    /// Docked but the robot is not charging; reset it and look again later
    SoftReset,
    /// A reset was issued and no frame newer than it has arrived
    AwaitingFreshTelemetry,
    /// Robot still bulk charging, or the device battery is low; relay on
    AuxiliaryOverride,
    /// Robot is topping off and the device is fine; relay off
    RobotCharging,
}

impl PowerDecision {
    /// Relay state this decision asks for, if any
    pub fn auxiliary_power(self) -> Option<bool> {
        match self {
            PowerDecision::AuxiliaryOverride => Some(true),
            PowerDecision::NoChargingSource | PowerDecision::RobotCharging => Some(false),
            PowerDecision::NoTelemetry
            | PowerDecision::SoftReset
            | PowerDecision::AwaitingFreshTelemetry => None,
        }
    }
}

/// The power policy. Remembers the frame a soft reset was decided on so
/// that it never acts twice on the same state.
#[derive(Debug, Default)]
pub struct PowerManager {
    reset_at: Option<u64>,
}

impl PowerManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn evaluate(&mut self, frame: &SensorFrame, battery: BatteryLevel) -> PowerDecision {
        if let Some(sequence) = self.reset_at {
            if frame.sequence() <= sequence {
                return PowerDecision::AwaitingFreshTelemetry;
            }
            self.reset_at = None;
        }

        if !frame.contains(CHARGING_SOURCES_AVAILABLE) {
            return PowerDecision::NoTelemetry;
        }
        if !frame.flag(CHARGING_SOURCES_AVAILABLE) {
            return PowerDecision::NoChargingSource;
        }

        let state = match frame.charging_state() {
            Some(state) if !frame.is_stale(CHARGING_STATE) => state,
            _ => return PowerDecision::NoTelemetry,
        };
        if state == ChargingState::NotCharging {
            self.reset_at = Some(frame.sequence());
            return PowerDecision::SoftReset;
        }
        if !state.is_settled() || !battery.is_sufficient() {
            PowerDecision::AuxiliaryOverride
        } else {
            PowerDecision::RobotCharging
        }
    }
}

/// Runs the power policy on a fresh sensor frame every cycle
pub struct PowerService {
    robot: Robot,
    manager: PowerManager,
    relay: Arc<dyn AuxiliaryPower>,
    battery: Option<Arc<dyn AuxiliaryBattery>>,
    telemetry: Arc<dyn TelemetryPublisher>,
    interval: Duration,
    /// Relay state last written by this service
    applied: Option<bool>,
}

impl PowerService {
    pub const NAME: &'static str = "power";

    pub fn new(
        robot: Robot,
        relay: Arc<dyn AuxiliaryPower>,
        battery: Option<Arc<dyn AuxiliaryBattery>>,
        telemetry: Arc<dyn TelemetryPublisher>,
        interval: Duration,
    ) -> Self {
        Self {
            robot,
            manager: PowerManager::new(),
            relay,
            battery,
            telemetry,
            interval,
            applied: None,
        }
    }

    async fn battery_level(&self) -> BatteryLevel {
        let Some(battery) = &self.battery else {
            return BatteryLevel::Unknown;
        };
        match battery.capacity_level().await {
            Ok(level) => level,
            Err(e) => {
                warn!("Failed to read auxiliary battery: {}", e);
                BatteryLevel::Unknown
            }
        }
    }

    /// Switch the relay only when it is not already where it should be
    async fn ensure_relay(&mut self, on: bool) -> Result<()> {
        if self.applied.is_some() && self.relay.query_auxiliary_power().await? == on {
            return Ok(());
        }
        info!("Auxiliary power {}", if on { "on" } else { "off" });
        self.relay.set_auxiliary_power(on).await?;
        self.applied = Some(on);
        Ok(())
    }
}

#[async_trait]
impl Service for PowerService {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn iterate(&mut self) -> Result<()> {
        let frame = self.robot.poll_sensors().await?;
        let battery = self.battery_level().await;
        let decision = self.manager.evaluate(&frame, battery);
        debug!(?decision, sequence = frame.sequence(), ?battery, "Power decision");

        match decision {
            PowerDecision::SoftReset => {
                info!("Docked but not charging, resetting robot");
                self.robot.soft_reset().await?;
            }
            PowerDecision::NoTelemetry => info!("No charging telemetry yet"),
            _ => {}
        }
        if let Some(on) = decision.auxiliary_power() {
            self.ensure_relay(on).await?;
        }

        let report = PowerReport {
            decision,
            auxiliary_power: self.applied,
            auxiliary_battery: battery,
            sequence: frame.sequence(),
            timestamp: Utc::now(),
        };
        if let Err(e) = self.telemetry.publish_power(&report).await {
            warn!("Failed to publish power report: {}", e);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Command;
    use crate::config::MotionConfig;
    use crate::sensors::{decode_packet, SensorPacket};
    use crate::sim::SimulatedRobot;
    use crate::telemetry::NoOpTelemetry;
    use crate::transport::Transport;
    use crate::RobotError;
    use std::sync::Mutex as StdMutex;

    fn frame(charging: bool, state: ChargingState) -> SensorFrame {
        let mut packet = SensorPacket::default();
        packet.set(CHARGING_SOURCES_AVAILABLE, charging as i32).unwrap();
        packet.set(CHARGING_STATE, state.index() as i32).unwrap();
        let mut frame = SensorFrame::default();
        assert!(frame.merge(decode_packet(packet.as_bytes()).unwrap()).is_empty());
        frame
    }

    #[test]
    fn test_policy_table() {
        let mut manager = PowerManager::new();
        let cases = [
            (false, ChargingState::NotCharging, BatteryLevel::Full, PowerDecision::NoChargingSource),
            (true, ChargingState::ReconditioningCharging, BatteryLevel::Full, PowerDecision::AuxiliaryOverride),
            (true, ChargingState::TrickleCharging, BatteryLevel::Full, PowerDecision::RobotCharging),
            (true, ChargingState::FullCharging, BatteryLevel::Normal, PowerDecision::RobotCharging),
            (true, ChargingState::TrickleCharging, BatteryLevel::Low, PowerDecision::AuxiliaryOverride),
            (true, ChargingState::Waiting, BatteryLevel::Unknown, PowerDecision::AuxiliaryOverride),
        ];
        for (charging, state, battery, expected) in cases {
            assert_eq!(manager.evaluate(&frame(charging, state), battery), expected, "{:?}", state);
        }
    }

    #[test]
    fn test_missing_telemetry() {
        let mut manager = PowerManager::new();
        let decision = manager.evaluate(&SensorFrame::default(), BatteryLevel::Full);
        assert_eq!(decision, PowerDecision::NoTelemetry);
        assert_eq!(decision.auxiliary_power(), None);
    }

    #[test]
    fn test_reset_waits_for_newer_frame() {
        let mut manager = PowerManager::new();
        let stuck = frame(true, ChargingState::NotCharging);
        assert_eq!(manager.evaluate(&stuck, BatteryLevel::Full), PowerDecision::SoftReset);
        // Same frame again must not trigger a second reset
        assert_eq!(manager.evaluate(&stuck, BatteryLevel::Full), PowerDecision::AwaitingFreshTelemetry);
    }

    #[derive(Default)]
    struct FakeRelay {
        writes: StdMutex<Vec<bool>>,
    }

    #[async_trait]
    impl AuxiliaryPower for FakeRelay {
        async fn set_auxiliary_power(&self, on: bool) -> Result<()> {
            self.writes.lock().unwrap().push(on);
            Ok(())
        }

        async fn query_auxiliary_power(&self) -> Result<bool> {
            Ok(self.writes.lock().unwrap().last().copied().unwrap_or(false))
        }
    }

    struct FixedBattery(BatteryLevel);

    #[async_trait]
    impl AuxiliaryBattery for FixedBattery {
        async fn capacity_level(&self) -> Result<BatteryLevel> {
            Ok(self.0)
        }
    }

    fn service(sim: &SimulatedRobot, relay: Arc<FakeRelay>, battery: BatteryLevel) -> PowerService {
        let transport = Arc::new(Transport::new(Box::new(sim.link()), Duration::from_millis(100)));
        let robot = Robot::new(transport, MotionConfig::default());
        PowerService::new(
            robot,
            relay,
            Some(Arc::new(FixedBattery(battery))),
            Arc::new(NoOpTelemetry),
            Duration::from_secs(10),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_soft_reset_before_relay_toggle() {
        let sim = SimulatedRobot::new();
        sim.set_sensor(CHARGING_SOURCES_AVAILABLE, 1).unwrap();
        sim.set_sensor(CHARGING_STATE, ChargingState::NotCharging.index() as i32).unwrap();
        let relay = Arc::new(FakeRelay::default());
        let mut power = service(&sim, Arc::clone(&relay), BatteryLevel::Full);

        power.iterate().await.unwrap();
        assert_eq!(sim.count(&Command::SoftReset), 1);
        assert!(relay.writes.lock().unwrap().is_empty());

        // The reset took; the robot is bulk charging now
        sim.set_sensor(CHARGING_STATE, ChargingState::ReconditioningCharging.index() as i32).unwrap();
        power.iterate().await.unwrap();
        assert_eq!(sim.count(&Command::SoftReset), 1);
        assert_eq!(*relay.writes.lock().unwrap(), vec![true]);

        sim.set_sensor(CHARGING_STATE, ChargingState::TrickleCharging.index() as i32).unwrap();
        power.iterate().await.unwrap();
        assert_eq!(*relay.writes.lock().unwrap(), vec![true, false]);

        // Steady state does not rewrite the relay
        power.iterate().await.unwrap();
        assert_eq!(*relay.writes.lock().unwrap(), vec![true, false]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_read_does_not_repeat_reset() {
        let sim = SimulatedRobot::new();
        sim.set_sensor(CHARGING_SOURCES_AVAILABLE, 1).unwrap();
        let relay = Arc::new(FakeRelay::default());
        let mut power = service(&sim, Arc::clone(&relay), BatteryLevel::Full);

        power.iterate().await.unwrap();
        assert_eq!(sim.count(&Command::SoftReset), 1);

        // The next read is lost, so only the old frame is available
        sim.drop_next_responses(1);
        power.iterate().await.unwrap();
        assert_eq!(sim.count(&Command::SoftReset), 1);
        assert!(relay.writes.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_undocked_turns_relay_off() {
        let sim = SimulatedRobot::new();
        let relay = Arc::new(FakeRelay::default());
        let mut power = service(&sim, Arc::clone(&relay), BatteryLevel::Low);

        power.iterate().await.unwrap();
        assert_eq!(*relay.writes.lock().unwrap(), vec![false]);
        assert_eq!(sim.count(&Command::SoftReset), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_link_is_fatal() {
        let sim = SimulatedRobot::new();
        let relay = Arc::new(FakeRelay::default());
        let mut power = service(&sim, relay, BatteryLevel::Full);
        sim.disconnect();
        assert!(matches!(power.iterate().await, Err(RobotError::LinkClosed)));
    }
}
