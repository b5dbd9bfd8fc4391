//! Simulated robot on the far end of a [`Link`]
//!
//! Records every command written to it (re-framed with the codec, so a
//! malformed byte stream fails the write just as it would confuse the real
//! firmware) and answers sensor queries from a raw sensor packet that tests
//! can change at any time. Faults such as missing or truncated responses
//! and a vanished link can be injected.

use crate::codec::Command;
use crate::sensors::SensorPacket;
use crate::transport::{short_read, Link};
use crate::{Result, RobotError};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

#[derive(Default)]
struct SimState {
    commands: Vec<Command>,
    packet: SensorPacket,
    pending: VecDeque<u8>,
    drop_responses: usize,
    truncate_next: Option<usize>,
    rts: Vec<bool>,
    closed: bool,
}

/// Handle for inspecting and steering the simulated robot
#[derive(Clone, Default)]
pub struct SimulatedRobot {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedRobot {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A link to hand to [`crate::transport::Transport`]
    pub fn link(&self) -> SimLink {
        SimLink { state: Arc::clone(&self.state) }
    }

    /// Set a raw sensor value reported from the next query on
    pub fn set_sensor(&self, key: &str, raw: i32) -> Result<()> {
        self.state().packet.set(key, raw)?;
        Ok(())
    }

    /// Swallow the responses to the next `count` sensor queries
    pub fn drop_next_responses(&self, count: usize) {
        self.state().drop_responses += count;
    }

    /// Answer the next sensor query with only `len` bytes
    pub fn truncate_next_response(&self, len: usize) {
        self.state().truncate_next = Some(len);
    }

    /// Make every further link operation fail as if the cable was pulled
    pub fn disconnect(&self) {
        self.state().closed = true;
    }

    /// Every command received so far, in order
    pub fn commands(&self) -> Vec<Command> {
        self.state().commands.clone()
    }

    pub fn clear_commands(&self) {
        self.state().commands.clear();
    }

    /// `(velocity, radius)` of every drive command received
    pub fn drives(&self) -> Vec<(i32, i32)> {
        self.state()
            .commands
            .iter()
            .filter_map(|c| match c {
                Command::Drive { velocity, radius } => Some((*velocity, *radius)),
                _ => None,
            })
            .collect()
    }

    pub fn last_command(&self) -> Option<Command> {
        self.state().commands.last().cloned()
    }

    pub fn count(&self, command: &Command) -> usize {
        self.state().commands.iter().filter(|c| *c == command).count()
    }

    pub fn rts_history(&self) -> Vec<bool> {
        self.state().rts.clone()
    }
}

/// The link half of [`SimulatedRobot`]
pub struct SimLink {
    state: Arc<Mutex<SimState>>,
}

impl SimLink {
    fn state(&self) -> Result<MutexGuard<'_, SimState>> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.closed {
            return Err(RobotError::LinkClosed);
        }
        Ok(state)
    }
}

#[async_trait]
impl Link for SimLink {
    async fn write(&mut self, bytes: &[u8]) -> Result<()> {
        let mut state = self.state()?;
        for command in Command::decode_stream(bytes)? {
            if let Command::Sensors(_) = command {
                if state.drop_responses > 0 {
                    state.drop_responses -= 1;
                } else {
                    let mut response = state.packet.as_bytes().to_vec();
                    if let Some(len) = state.truncate_next.take() {
                        response.truncate(len);
                    }
                    state.pending.extend(response);
                }
            }
            state.commands.push(command);
        }
        Ok(())
    }

    async fn read(&mut self, n: usize, timeout: Duration) -> Result<Vec<u8>> {
        let partial = {
            let mut state = self.state()?;
            if state.pending.len() >= n {
                return Ok(state.pending.drain(..n).collect());
            }
            state.pending.drain(..).count()
        };
        // A real port would sit out the whole timeout waiting for the rest
        tokio::time::sleep(timeout).await;
        Err(short_read(n, partial, timeout))
    }

    async fn clear_input(&mut self) -> Result<()> {
        self.state()?.pending.clear();
        Ok(())
    }

    async fn set_rts(&mut self, level: bool) -> Result<()> {
        self.state()?.rts.push(level);
        Ok(())
    }
}
