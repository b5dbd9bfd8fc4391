//! Byte-level transport over the robot's serial link
//!
//! There is exactly one physical link and several tasks that want to talk
//! over it. [`Transport`] owns the link behind a single async mutex, so every
//! write-then-read exchange runs as one critical section and command bytes
//! from different tasks never interleave. The decoded [`SensorFrame`] lives
//! inside the same lock and is published to readers as immutable snapshots
//! through a watch channel.

use crate::codec::{Command, SENSOR_GROUP_ALL};
use crate::sensors::{decode_packet, SensorFrame, SENSOR_PACKET_LEN};
use crate::{Result, RobotError};
use async_trait::async_trait;
use serialport::{ClearBuffer, SerialPort};
use std::io::{ErrorKind, Read, Write};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};
use tracing::{debug, warn};

/// A point-to-point byte link
#[async_trait]
pub trait Link: Send {
    async fn write(&mut self, bytes: &[u8]) -> Result<()>;

    /// Read exactly `n` bytes or fail once `timeout` has passed.
    ///
    /// Nothing at all is [`RobotError::TransportTimeout`]; a partial read is
    /// [`RobotError::IncompleteFrame`].
    async fn read(&mut self, n: usize, timeout: Duration) -> Result<Vec<u8>>;

    /// Drop any unread input left over from an earlier exchange
    async fn clear_input(&mut self) -> Result<()> {
        Ok(())
    }

    /// Drive the RTS line; the robot wakes on a low-high pulse
    async fn set_rts(&mut self, _level: bool) -> Result<()> {
        Ok(())
    }
}

/// Error for a read that stopped short of `expected` bytes
pub fn short_read(expected: usize, received: usize, timeout: Duration) -> RobotError {
    if received == 0 {
        RobotError::TransportTimeout { expected, timeout }
    } else {
        RobotError::IncompleteFrame { expected, received }
    }
}

/// Serial port link. Blocking port calls run on the blocking thread pool.
pub struct SerialLink {
    path: String,
    port: Arc<StdMutex<Box<dyn SerialPort>>>,
}

impl SerialLink {
    pub fn open(path: &str, baud: u32) -> Result<Self> {
        let port = serialport::new(path, baud)
            .timeout(Duration::from_millis(100))
            .open()
            .map_err(|e| RobotError::Connection(format!("Failed to open {}: {}", path, e)))?;
        debug!("Opened serial link {} at {} baud", path, baud);
        Ok(Self {
            path: path.to_string(),
            port: Arc::new(StdMutex::new(port)),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    async fn with_port<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut dyn SerialPort) -> Result<T> + Send + 'static,
    {
        let port = Arc::clone(&self.port);
        tokio::task::spawn_blocking(move || {
            let mut port = port.lock().map_err(|_| RobotError::LinkClosed)?;
            f(port.as_mut())
        })
        .await?
    }
}

fn read_until_deadline(port: &mut dyn SerialPort, n: usize, timeout: Duration) -> Result<Vec<u8>> {
    let deadline = Instant::now() + timeout;
    let mut buf = vec![0u8; n];
    let mut filled = 0;

    while filled < n {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        port.set_timeout(remaining)?;
        match port.read(&mut buf[filled..]) {
            Ok(0) => return Err(RobotError::LinkClosed),
            Ok(count) => filled += count,
            Err(e) if e.kind() == ErrorKind::TimedOut => break,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }

    if filled < n {
        return Err(short_read(n, filled, timeout));
    }
    Ok(buf)
}

#[async_trait]
impl Link for SerialLink {
    async fn write(&mut self, bytes: &[u8]) -> Result<()> {
        let bytes = bytes.to_vec();
        self.with_port(move |port| {
            port.write_all(&bytes)?;
            port.flush()?;
            Ok(())
        })
        .await
    }

    async fn read(&mut self, n: usize, timeout: Duration) -> Result<Vec<u8>> {
        self.with_port(move |port| read_until_deadline(port, n, timeout)).await
    }

    async fn clear_input(&mut self) -> Result<()> {
        self.with_port(|port| Ok(port.clear(ClearBuffer::Input)?)).await
    }

    async fn set_rts(&mut self, level: bool) -> Result<()> {
        self.with_port(move |port| Ok(port.write_request_to_send(level)?)).await
    }
}

/// Result of one sensor query
#[derive(Debug)]
pub struct SensorReading {
    pub frame: SensorFrame,
    /// Enum fields that held values outside their domain. Their previous
    /// values were kept and they are marked stale in `frame`.
    pub invalid: Vec<RobotError>,
}

struct Exchange {
    link: Box<dyn Link>,
    frame: SensorFrame,
}

/// Shared owner of the robot link
pub struct Transport {
    exchange: Mutex<Exchange>,
    frames: watch::Sender<SensorFrame>,
    read_timeout: Duration,
}

impl Transport {
    pub fn new(link: Box<dyn Link>, read_timeout: Duration) -> Self {
        let (frames, _) = watch::channel(SensorFrame::default());
        Self {
            exchange: Mutex::new(Exchange { link, frame: SensorFrame::default() }),
            frames,
            read_timeout,
        }
    }

    /// Open the serial port at `path`
    pub fn open(path: &str, baud: u32, read_timeout: Duration) -> Result<Self> {
        Ok(Self::new(Box::new(SerialLink::open(path, baud)?), read_timeout))
    }

    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    pub async fn send(&self, command: &Command) -> Result<()> {
        let mut exchange = self.exchange.lock().await;
        debug!("-> {}", command);
        exchange.link.write(&command.encode()).await
    }

    /// Send several commands back to back without letting another task in
    pub async fn send_all(&self, commands: &[Command]) -> Result<()> {
        let mut exchange = self.exchange.lock().await;
        for command in commands {
            debug!("-> {}", command);
            exchange.link.write(&command.encode()).await?;
        }
        Ok(())
    }

    /// Send a command and read its fixed-length response
    pub async fn request(&self, command: &Command, response_len: usize) -> Result<Vec<u8>> {
        let mut exchange = self.exchange.lock().await;
        exchange.link.clear_input().await?;
        exchange.link.write(&command.encode()).await?;
        exchange.link.read(response_len, self.read_timeout).await
    }

    /// Query every sensor and fold the result into the shared frame.
    ///
    /// A timeout or short response leaves the frame untouched and fails with
    /// [`RobotError::SensorReadFailure`].
    pub async fn query_sensors(&self) -> Result<SensorReading> {
        let mut exchange = self.exchange.lock().await;
        let query = Command::Sensors(SENSOR_GROUP_ALL);

        exchange.link.clear_input().await?;
        exchange.link.write(&query.encode()).await?;
        let raw = match exchange.link.read(SENSOR_PACKET_LEN, self.read_timeout).await {
            Ok(raw) => raw,
            Err(e @ (RobotError::TransportTimeout { .. } | RobotError::IncompleteFrame { .. })) => {
                debug!("Sensor query failed: {}", e);
                return Err(RobotError::SensorReadFailure(Box::new(e)));
            }
            Err(e) => return Err(e),
        };

        let packet = decode_packet(&raw).map_err(|e| RobotError::SensorReadFailure(Box::new(e)))?;
        let invalid = exchange.frame.merge(packet);
        for error in &invalid {
            warn!("Keeping previous sensor value: {}", error);
        }

        let frame = exchange.frame.clone();
        self.frames.send_replace(frame.clone());
        Ok(SensorReading { frame, invalid })
    }

    pub async fn set_rts(&self, level: bool) -> Result<()> {
        self.exchange.lock().await.link.set_rts(level).await
    }

    pub async fn clear_input(&self) -> Result<()> {
        self.exchange.lock().await.link.clear_input().await
    }

    /// Latest decoded frame without touching the link
    pub fn snapshot(&self) -> SensorFrame {
        self.frames.borrow().clone()
    }

    /// Receiver notified on every successful sensor decode
    pub fn subscribe(&self) -> watch::Receiver<SensorFrame> {
        self.frames.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensors::{BUMP_LEFT, CHARGING_STATE, VOLTAGE};
    use crate::sim::SimulatedRobot;
    use std::time::Duration;

    fn transport(sim: &SimulatedRobot) -> Arc<Transport> {
        Arc::new(Transport::new(Box::new(sim.link()), Duration::from_millis(100)))
    }

    #[tokio::test(start_paused = true)]
    async fn test_query_updates_frame_and_snapshot() {
        let sim = SimulatedRobot::new();
        sim.set_sensor(VOLTAGE, 15500).unwrap();
        let transport = transport(&sim);
        let mut updates = transport.subscribe();

        let reading = transport.query_sensors().await.unwrap();
        assert!(reading.invalid.is_empty());
        assert_eq!(reading.frame.int(VOLTAGE), Some(15500));
        assert_eq!(transport.snapshot(), reading.frame);
        assert!(updates.has_changed().unwrap());
        assert_eq!(sim.commands(), vec![Command::Sensors(6)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_leaves_frame_untouched() {
        let sim = SimulatedRobot::new();
        sim.set_sensor(BUMP_LEFT, 1).unwrap();
        let transport = transport(&sim);
        let before = transport.query_sensors().await.unwrap().frame;

        sim.set_sensor(BUMP_LEFT, 0).unwrap();
        sim.drop_next_responses(1);
        match transport.query_sensors().await {
            Err(RobotError::SensorReadFailure(inner)) => {
                assert!(matches!(*inner, RobotError::TransportTimeout { expected: 52, .. }));
            }
            other => panic!("expected SensorReadFailure, got {:?}", other),
        }
        assert_eq!(transport.snapshot(), before);
        assert_eq!(transport.snapshot().bool(BUMP_LEFT), Some(true));

        let after = transport.query_sensors().await.unwrap().frame;
        assert_eq!(after.bool(BUMP_LEFT), Some(false));
        assert_eq!(after.sequence(), before.sequence() + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_truncated_response_is_read_failure() {
        let sim = SimulatedRobot::new();
        let transport = transport(&sim);
        sim.truncate_next_response(20);
        match transport.query_sensors().await {
            Err(RobotError::SensorReadFailure(inner)) => {
                assert!(matches!(*inner, RobotError::IncompleteFrame { expected: 52, received: 20 }));
            }
            other => panic!("expected SensorReadFailure, got {:?}", other),
        }
        assert_eq!(transport.snapshot().sequence(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_enum_is_reported_not_fatal() {
        let sim = SimulatedRobot::new();
        sim.set_sensor(CHARGING_STATE, 2).unwrap();
        let transport = transport(&sim);
        transport.query_sensors().await.unwrap();

        sim.set_sensor(CHARGING_STATE, 42).unwrap();
        sim.set_sensor(VOLTAGE, 12000).unwrap();
        let reading = transport.query_sensors().await.unwrap();
        assert_eq!(reading.invalid.len(), 1);
        assert!(matches!(reading.invalid[0], RobotError::InvalidEnumValue { value: 42, .. }));
        assert!(reading.frame.is_stale(CHARGING_STATE));
        assert_eq!(reading.frame.int(VOLTAGE), Some(12000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_exchanges_do_not_interleave() {
        let sim = SimulatedRobot::new();
        let transport = transport(&sim);

        let mut tasks = Vec::new();
        for i in 0..8 {
            let transport = Arc::clone(&transport);
            tasks.push(tokio::spawn(async move {
                if i % 2 == 0 {
                    transport.query_sensors().await.map(|_| ())
                } else {
                    transport.send_all(&[Command::drive(100 + i, 200), Command::stop()]).await
                }
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        // Every byte written must still frame cleanly into whole commands
        let commands = sim.commands();
        assert_eq!(commands.len(), 4 + 4 * 2);
        for pair in commands.windows(2) {
            if let Command::Drive { velocity, .. } = pair[0] {
                if velocity != 0 {
                    assert!(pair[1].is_stop());
                }
            }
        }
    }

    #[test]
    fn test_short_read_classification() {
        let t = Duration::from_millis(10);
        assert!(matches!(short_read(52, 0, t), RobotError::TransportTimeout { .. }));
        assert!(matches!(short_read(52, 51, t), RobotError::IncompleteFrame { received: 51, .. }));
    }
}
