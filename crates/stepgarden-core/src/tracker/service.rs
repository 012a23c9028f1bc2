//! Runs a [`StepReconciler`] on its own task.
//!
//! Every mutation (sensor signals, user commands, lifecycle hooks, the
//! housekeeping tick) is serialized through one `select!` loop, so the
//! reconciler itself needs no locking. Snapshots are published on a
//! `watch` channel and events on a `broadcast` channel.

use std::path::Path;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::backend::{SensorEvent, StepBackend};
use super::reconciler::StepReconciler;
use super::state::StepSnapshot;
use crate::clock::{Clock, SystemClock};
use crate::error::{CoreError, Result};
use crate::events::Event;
use crate::storage::{data_dir, Config, Database, KeyValueStore};

const EVENT_CAPACITY: usize = 64;

enum Command {
    AddManualSteps(u64),
    RetryConnection,
    SetManualMode(bool),
    Foreground,
    Background,
    Stop,
    Shutdown,
}

struct Request {
    command: Command,
    reply: oneshot::Sender<StepSnapshot>,
}

pub struct ReconcilerService {
    reconciler: StepReconciler,
    signals: mpsc::UnboundedReceiver<SensorEvent>,
    requests: mpsc::UnboundedReceiver<Request>,
    snapshot_tx: watch::Sender<StepSnapshot>,
    events_tx: broadcast::Sender<Event>,
}

impl ReconcilerService {
    /// Open config and database in the data directory and run a reconciler
    /// over them on the system clock.
    ///
    /// # Errors
    ///
    /// Returns an error if the data directory cannot be created, the config
    /// file is malformed, or the database cannot be opened.
    pub fn open(backends: Vec<Arc<dyn StepBackend>>) -> Result<ReconcilerHandle> {
        Self::open_in(&data_dir()?, backends)
    }

    /// Like [`open`](Self::open), with `config.toml` and `stepgarden.db`
    /// under `dir`.
    pub fn open_in(dir: &Path, backends: Vec<Arc<dyn StepBackend>>) -> Result<ReconcilerHandle> {
        let config = Config::load_from(&dir.join("config.toml"))?;
        let db = Database::open_at(&dir.join("stepgarden.db"))?;
        info!(dir = %dir.display(), "opened step storage");
        Ok(Self::start(
            Arc::new(db),
            backends,
            Arc::new(SystemClock),
            config,
        ))
    }

    /// Build a reconciler over `store` and `backends` and run it.
    pub fn start(
        store: Arc<dyn KeyValueStore>,
        backends: Vec<Arc<dyn StepBackend>>,
        clock: Arc<dyn Clock>,
        config: Config,
    ) -> ReconcilerHandle {
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        let reconciler = StepReconciler::new(store, backends, clock, config, signals_tx);
        Self::spawn(reconciler, signals_rx)
    }

    /// Run an existing reconciler. `signals` must be the receiving end of
    /// the channel the reconciler was created with.
    pub fn spawn(
        reconciler: StepReconciler,
        signals: mpsc::UnboundedReceiver<SensorEvent>,
    ) -> ReconcilerHandle {
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(reconciler.snapshot());
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);

        let service = Self {
            reconciler,
            signals,
            requests: requests_rx,
            snapshot_tx,
            events_tx: events_tx.clone(),
        };
        tokio::spawn(service.run());

        ReconcilerHandle {
            requests: requests_tx,
            snapshot: snapshot_rx,
            events: events_tx,
        }
    }

    async fn run(mut self) {
        self.reconciler.start().await;
        self.publish();

        let period = self.reconciler.config().tracking.tick_period();
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                request = self.requests.recv() => {
                    let Some(Request { command, reply }) = request else {
                        debug!("all reconciler handles dropped; stopping");
                        self.shutdown().await;
                        return;
                    };
                    if matches!(command, Command::Shutdown) {
                        self.shutdown().await;
                        let _ = reply.send(self.reconciler.snapshot());
                        return;
                    }
                    self.apply(command).await;
                    self.publish();
                    let _ = reply.send(self.reconciler.snapshot());
                }
                Some(event) = self.signals.recv() => {
                    self.reconciler.handle_sensor_event(event);
                    self.publish();
                }
                _ = ticker.tick() => {
                    self.reconciler.tick().await;
                    self.publish();
                }
            }
        }
    }

    async fn apply(&mut self, command: Command) {
        match command {
            Command::AddManualSteps(amount) => {
                self.reconciler.add_manual_steps(amount);
            }
            Command::RetryConnection => {
                self.reconciler.retry_permission().await;
            }
            Command::SetManualMode(enabled) => {
                self.reconciler.set_manual_mode(enabled).await;
            }
            Command::Foreground => self.reconciler.on_app_foreground().await,
            Command::Background => self.reconciler.on_app_background().await,
            Command::Stop => self.stop().await,
            Command::Shutdown => {}
        }
    }

    async fn stop(&mut self) {
        self.reconciler.stop();
        if let Err(err) = self.reconciler.flush().await {
            warn!(error = %err, "step total not persisted on stop");
        }
    }

    async fn shutdown(&mut self) {
        self.stop().await;
        self.publish();
        info!(steps = self.reconciler.steps(), "step tracking service stopped");
    }

    fn publish(&mut self) {
        let snapshot = self.reconciler.snapshot();
        self.snapshot_tx.send_if_modified(|current| {
            if *current == snapshot {
                return false;
            }
            *current = snapshot;
            true
        });
        for event in self.reconciler.take_events() {
            // No subscribers is fine.
            let _ = self.events_tx.send(event);
        }
    }
}

/// Cloneable front end to a running [`ReconcilerService`].
#[derive(Clone)]
pub struct ReconcilerHandle {
    requests: mpsc::UnboundedSender<Request>,
    snapshot: watch::Receiver<StepSnapshot>,
    events: broadcast::Sender<Event>,
}

impl ReconcilerHandle {
    /// Latest published snapshot.
    pub fn snapshot(&self) -> StepSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Watch snapshots as they change.
    pub fn subscribe(&self) -> watch::Receiver<StepSnapshot> {
        self.snapshot.clone()
    }

    /// Events published from now on.
    pub fn events(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    pub async fn add_manual_steps(&self, amount: u64) -> Result<StepSnapshot> {
        self.request(Command::AddManualSteps(amount)).await
    }

    /// Re-run the permission request and restart tracking.
    pub async fn retry_connection(&self) -> Result<StepSnapshot> {
        self.request(Command::RetryConnection).await
    }

    pub async fn set_manual_mode(&self, enabled: bool) -> Result<StepSnapshot> {
        self.request(Command::SetManualMode(enabled)).await
    }

    pub async fn app_foreground(&self) -> Result<StepSnapshot> {
        self.request(Command::Foreground).await
    }

    pub async fn app_background(&self) -> Result<StepSnapshot> {
        self.request(Command::Background).await
    }

    /// Detach from the sensor and persist. The service keeps running, so
    /// manual entries and [`retry_connection`](Self::retry_connection) still
    /// work afterwards.
    pub async fn stop(&self) -> Result<StepSnapshot> {
        self.request(Command::Stop).await
    }

    /// Stop tracking and end the service task. Later requests fail with
    /// [`CoreError::ServiceStopped`].
    pub async fn shutdown(&self) -> Result<StepSnapshot> {
        self.request(Command::Shutdown).await
    }

    async fn request(&self, command: Command) -> Result<StepSnapshot> {
        let (reply, response) = oneshot::channel();
        self.requests
            .send(Request { command, reply })
            .map_err(|_| CoreError::ServiceStopped)?;
        response.await.map_err(|_| CoreError::ServiceStopped)
    }
}
