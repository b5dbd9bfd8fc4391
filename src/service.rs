//! Periodic background services
//!
//! A [`Service`] is one unit of work repeated at its own cadence. The
//! [`ServiceScheduler`] runs each registered service on its own tokio task
//! with a cancellation signal. An iteration is never interrupted: stopping a
//! service waits for the iteration in flight and for the task to exit. An
//! iteration that fails takes its service down, and it stays down until
//! started again.

use crate::robot::Robot;
use crate::sensors::SensorFrame;
use crate::telemetry::TelemetryPublisher;
use crate::{Result, RobotError};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[async_trait]
pub trait Service: Send + 'static {
    fn name(&self) -> &str;

    /// Pause between the end of one iteration and the start of the next
    fn interval(&self) -> Duration;

    async fn iterate(&mut self) -> Result<()>;
}

/// Lifecycle of a registered service.
///
/// There is no stopping state to observe: [`ServiceScheduler::stop`] holds
/// the scheduler mutably until the task has exited, so callers only ever
/// see the service before or after it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    Stopped,
    Running,
    /// Torn down by a failed or panicked iteration
    Failed,
}

/// Receiving half of a service's stop signal
#[derive(Clone)]
pub struct Cancellation {
    rx: watch::Receiver<bool>,
}

impl Cancellation {
    /// A stop signal sender and its receiving token
    pub fn pair() -> (watch::Sender<bool>, Self) {
        let (tx, rx) = watch::channel(false);
        (tx, Self { rx })
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Sleep for `duration` unless cancelled first. True when cancelled.
    pub async fn delay(&mut self, duration: Duration) -> bool {
        if self.is_cancelled() {
            return true;
        }
        let signalled = tokio::select! {
            _ = tokio::time::sleep(duration) => false,
            // A dropped sender counts as a stop request
            _ = self.rx.changed() => true,
        };
        signalled || self.is_cancelled()
    }
}

struct Exit {
    service: Box<dyn Service>,
    outcome: Result<()>,
}

struct Running {
    cancel: watch::Sender<bool>,
    task: JoinHandle<Exit>,
}

enum Slot {
    Idle { service: Box<dyn Service>, last_error: Option<String> },
    Running(Running),
    /// The task panicked and took the service with it
    Lost { error: String },
}

async fn run_service(mut service: Box<dyn Service>, mut cancel: Cancellation) -> Exit {
    let name = service.name().to_string();
    info!(service = %name, "Service started");
    let outcome = loop {
        if cancel.is_cancelled() {
            break Ok(());
        }
        if let Err(e) = service.iterate().await {
            error!(service = %name, "Service iteration failed, stopping: {}", e);
            break Err(e);
        }
        if cancel.delay(service.interval()).await {
            break Ok(());
        }
    };
    info!(service = %name, "Service exited");
    Exit { service, outcome }
}

/// Owns the registered services and their tasks
#[derive(Default)]
pub struct ServiceScheduler {
    slots: BTreeMap<String, Slot>,
}

impl ServiceScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a service in the stopped state, replacing a stopped one of the
    /// same name
    pub fn register(&mut self, service: Box<dyn Service>) -> Result<()> {
        let name = service.name().to_string();
        if matches!(self.slots.get(&name), Some(Slot::Running(_))) {
            return Err(RobotError::Service(format!("{} is running", name)));
        }
        self.slots.insert(name, Slot::Idle { service, last_error: None });
        Ok(())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.slots.keys().map(String::as_str)
    }

    pub fn state(&self, name: &str) -> Option<ServiceState> {
        self.slots.get(name).map(|slot| match slot {
            Slot::Idle { last_error: Some(_), .. } | Slot::Lost { .. } => ServiceState::Failed,
            Slot::Idle { .. } => ServiceState::Stopped,
            // Only a failed iteration ends the task without a stop request
            Slot::Running(running) if running.task.is_finished() => ServiceState::Failed,
            Slot::Running(_) => ServiceState::Running,
        })
    }

    /// Message of the error that last took the service down
    pub fn last_error(&self, name: &str) -> Option<&str> {
        match self.slots.get(name) {
            Some(Slot::Idle { last_error, .. }) => last_error.as_deref(),
            Some(Slot::Lost { error }) => Some(error.as_str()),
            _ => None,
        }
    }

    /// Start a service. A running service is stopped first, so at most one
    /// task ever runs it.
    pub async fn start(&mut self, name: &str) -> Result<()> {
        if matches!(self.slots.get(name), Some(Slot::Running(_))) {
            info!(service = %name, "Restarting service");
            self.stop(name).await?;
        }
        let service = match self.slots.remove(name) {
            Some(Slot::Idle { service, .. }) => service,
            Some(running @ Slot::Running(_)) => {
                self.slots.insert(name.to_string(), running);
                return Err(RobotError::Service(format!("{} did not stop", name)));
            }
            Some(Slot::Lost { error }) => {
                let message = format!("{} was lost and must be registered again: {}", name, error);
                self.slots.insert(name.to_string(), Slot::Lost { error });
                return Err(RobotError::Service(message));
            }
            None => return Err(RobotError::Service(format!("Unknown service: {}", name))),
        };
        let (cancel, token) = Cancellation::pair();
        let task = tokio::spawn(run_service(service, token));
        self.slots.insert(name.to_string(), Slot::Running(Running { cancel, task }));
        Ok(())
    }

    /// Signal a service to stop and wait until its task has exited.
    ///
    /// Stopping a stopped service is a no-op. A task that panicked leaves the
    /// name registered as failed and the panic is returned.
    pub async fn stop(&mut self, name: &str) -> Result<()> {
        let running = match self.slots.remove(name) {
            Some(Slot::Running(running)) => running,
            Some(idle) => {
                self.slots.insert(name.to_string(), idle);
                return Ok(());
            }
            None => return Err(RobotError::Service(format!("Unknown service: {}", name))),
        };

        debug!(service = %name, "Stopping service");
        // The task may already have exited on its own
        let _ = running.cancel.send(true);
        let exit = match running.task.await {
            Ok(exit) => exit,
            Err(e) => {
                error!(service = %name, "Service task died, tearing it down: {}", e);
                self.slots.insert(name.to_string(), Slot::Lost { error: e.to_string() });
                return Err(e.into());
            }
        };
        let last_error = exit.outcome.err().map(|e| e.to_string());
        if let Some(e) = &last_error {
            warn!(service = %name, "Service had failed: {}", e);
        }
        self.slots.insert(name.to_string(), Slot::Idle { service: exit.service, last_error });
        info!(service = %name, "Service stopped");
        Ok(())
    }

    /// Start every service, returning the first failure once all were tried
    pub async fn start_all(&mut self) -> Result<()> {
        let names: Vec<String> = self.slots.keys().cloned().collect();
        let mut first = None;
        for name in names {
            if let Err(e) = self.start(&name).await {
                first.get_or_insert(e);
            }
        }
        first.map_or(Ok(()), Err)
    }

    /// Stop every service, returning the first failure once all have exited
    pub async fn stop_all(&mut self) -> Result<()> {
        let names: Vec<String> = self.slots.keys().cloned().collect();
        let mut first = None;
        for name in names {
            if let Err(e) = self.stop(&name).await {
                first.get_or_insert(e);
            }
        }
        first.map_or(Ok(()), Err)
    }
}

/// Keeps the shared sensor frame fresh and publishes changed readings
pub struct SensorService {
    robot: Robot,
    telemetry: Arc<dyn TelemetryPublisher>,
    interval: Duration,
    published: Option<SensorFrame>,
}

impl SensorService {
    pub const NAME: &'static str = "sensors";

    pub fn new(robot: Robot, telemetry: Arc<dyn TelemetryPublisher>, interval: Duration) -> Self {
        Self { robot, telemetry, interval, published: None }
    }
}

#[async_trait]
impl Service for SensorService {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn iterate(&mut self) -> Result<()> {
        let frame = match self.robot.query_sensors().await {
            Ok(reading) => reading.frame,
            Err(e) if e.is_recoverable() => {
                warn!("Sensor refresh failed: {}", e);
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let changed = self.published.as_ref().map_or(true, |last| !last.same_readings(&frame));
        if changed {
            if let Err(e) = self.telemetry.publish_sensors(&frame).await {
                warn!("Failed to publish sensors: {}", e);
            }
            self.published = Some(frame);
        }
        Ok(())
    }
}
