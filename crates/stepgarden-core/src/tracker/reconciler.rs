//! Step reconciler.
//!
//! Owns today's [`DailyStepRecord`] and the [`SensorSession`], and turns
//! sensor readings, absolute platform counts, lifecycle transitions and
//! manual entries into one non-decreasing step count for the local day.
//!
//! ## State Transitions
//!
//! ```text
//! permission:  Undetermined -> (Granted | Denied)     retry re-evaluates
//! mode:        Unavailable -> start() -> (Sensor | Manual)
//!              Sensor -> subscription failure -> Manual
//!              Sensor <-> Manual                       user toggle
//!              any -> stop() -> Unavailable
//! ```
//!
//! No operation returns an error: backend and persistence failures become
//! mode/permission changes or log lines.
//!
//! ## Usage
//!
//! ```ignore
//! let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
//! let mut reconciler = StepReconciler::new(store, backends, clock, config, tx);
//! reconciler.start().await;
//! while let Some(event) = rx.recv().await {
//!     reconciler.handle_sensor_event(event);
//! }
//! ```

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::backend::{
    BackendKind, BackendTable, DayRange, ReadingSink, SensorEvent, SensorSignal, StepBackend,
    SubscriptionHandle,
};
use super::policy::CheckpointPolicy;
use super::record::DailyStepRecord;
use super::session::{ReadingOutcome, SensorSession};
use super::state::{PermissionState, StepSnapshot, TrackingMode};
use crate::clock::{start_of_day, Clock};
use crate::error::{ReadingError, SensorError, StorageError};
use crate::events::Event;
use crate::storage::{CheckpointWriter, Config, KeyValueStore};

struct ActiveSubscription {
    backend: Arc<dyn StepBackend>,
    handle: SubscriptionHandle,
    generation: u64,
}

pub struct StepReconciler {
    store: Arc<dyn KeyValueStore>,
    writer: CheckpointWriter,
    backends: BackendTable,
    clock: Arc<dyn Clock>,
    config: Config,
    policy: CheckpointPolicy,
    signals: mpsc::UnboundedSender<SensorEvent>,

    record: DailyStepRecord,
    session: SensorSession,
    mode: TrackingMode,
    permission: PermissionState,
    active: Option<ActiveSubscription>,
    generation: u64,
    /// The user switched to manual entry on purpose.
    manual_requested: bool,
    /// Today's stored total could not be read yet; holds the in-memory total
    /// at the time of the failed read.
    unloaded_base: Option<u64>,
    events: Vec<Event>,
}

impl StepReconciler {
    /// Create an idle reconciler. Readings from subscribed backends are
    /// queued on `signals`; feed them back through
    /// [`handle_sensor_event`](Self::handle_sensor_event).
    ///
    /// Must be called inside a tokio runtime (spawns the checkpoint writer).
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        backends: Vec<Arc<dyn StepBackend>>,
        clock: Arc<dyn Clock>,
        config: Config,
        signals: mpsc::UnboundedSender<SensorEvent>,
    ) -> Self {
        let writer = CheckpointWriter::spawn(store.clone());
        let record = DailyStepRecord::empty(clock.today());
        Self {
            store,
            writer,
            backends: BackendTable::new(backends),
            clock,
            policy: CheckpointPolicy::new(config.checkpoint.clone()),
            config,
            signals,
            record,
            session: SensorSession::default(),
            mode: TrackingMode::Unavailable,
            permission: PermissionState::Undetermined,
            active: None,
            generation: 0,
            manual_requested: false,
            unloaded_base: None,
            events: Vec::new(),
        }
    }

    // ── Queries ──────────────────────────────────────────────────────

    pub fn steps(&self) -> u64 {
        self.record.total_steps
    }

    pub fn record(&self) -> DailyStepRecord {
        self.record
    }

    pub fn mode(&self) -> TrackingMode {
        self.mode
    }

    pub fn permission(&self) -> PermissionState {
        self.permission
    }

    pub fn session(&self) -> &SensorSession {
        &self.session
    }

    pub fn active_backend(&self) -> Option<BackendKind> {
        self.active.as_ref().map(|a| a.backend.kind())
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn snapshot(&self) -> StepSnapshot {
        StepSnapshot::new(
            self.record.date,
            self.record.total_steps,
            self.mode,
            self.permission,
            self.active_backend(),
        )
    }

    /// Events produced since the last call.
    pub fn take_events(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.events)
    }

    /// Wait for submitted checkpoints to be attempted.
    pub async fn flush(&self) -> Result<(), StorageError> {
        self.writer.flush().await
    }

    // ── Commands ─────────────────────────────────────────────────────

    /// Load today's total and pick a step source.
    pub async fn start(&mut self) -> StepSnapshot {
        self.detach();
        self.roll_over_if_needed();
        self.load_today().await;
        self.session = SensorSession::new(self.record.total_steps);

        if self.manual_requested {
            self.set_mode(TrackingMode::Manual);
        } else {
            match self.select_backend().await {
                Some(active) => {
                    info!(backend = active.backend.kind().name(), "step tracking attached");
                    self.active = Some(active);
                    self.set_mode(TrackingMode::Sensor);
                    self.refresh_absolute().await;
                }
                None => self.set_mode(TrackingMode::Manual),
            }
        }

        self.emit(|at, r| Event::TrackingStarted {
            mode: r.mode,
            permission: r.permission,
            backend: r.active_backend(),
            baseline_steps: r.session.baseline_steps(),
            at,
        });
        self.snapshot()
    }

    /// Detach from the sensor and checkpoint. Safe to call repeatedly.
    pub fn stop(&mut self) {
        let was_attached = self.detach();
        if self.mode == TrackingMode::Unavailable && !was_attached {
            return;
        }
        self.checkpoint_now();
        self.set_mode(TrackingMode::Unavailable);
        self.emit(|at, r| Event::TrackingStopped {
            steps: r.record.total_steps,
            at,
        });
    }

    /// Route a queued sensor signal. Signals from a subscription that has
    /// since been replaced or stopped are dropped.
    pub fn handle_sensor_event(&mut self, event: SensorEvent) {
        let current = self.active.as_ref().map(|a| a.generation);
        if current != Some(event.generation) {
            debug!(generation = event.generation, "ignoring signal from detached subscription");
            return;
        }
        match event.signal {
            SensorSignal::Reading(raw) => self.on_raw_reading(raw),
            SensorSignal::Failed(reason) => self.demote_to_manual(reason),
        }
    }

    /// Apply a cumulative raw reading from the active backend.
    pub fn on_raw_reading(&mut self, raw: i64) {
        let raw = match validate_reading(raw) {
            Ok(raw) => raw,
            Err(err) => {
                debug!(error = %err, "discarding raw reading");
                return;
            }
        };
        if self.active.is_none() {
            debug!(raw, "no sensor attached; ignoring reading");
            return;
        }
        self.roll_over_if_needed();

        match self.session.observe(raw, self.record.total_steps) {
            ReadingOutcome::Anchored => debug!(raw, "sensor session anchored"),
            ReadingOutcome::Rebooted { previous_reference } => {
                info!(previous_reference, raw, "sensor counter reset; re-anchoring");
                self.emit(|at, r| Event::RebootDetected {
                    previous_reference,
                    raw,
                    steps: r.record.total_steps,
                    at,
                });
                self.checkpoint_now();
            }
            ReadingOutcome::Advanced { total } => {
                self.record.raise_to(total);
                self.emit(|at, _| Event::StepsUpdated { steps: total, at });
                self.maybe_checkpoint();
            }
            ReadingOutcome::Unchanged => {}
            ReadingOutcome::Suppressed { candidate } => debug!(
                candidate,
                displayed = self.record.total_steps,
                "reading would lower today's total; ignored"
            ),
        }
    }

    /// Add steps entered by the user.
    ///
    /// Allowed in every mode unless `tracking.manual_override` is off, in
    /// which case additions during sensor tracking are rejected.
    pub fn add_manual_steps(&mut self, amount: u64) -> StepSnapshot {
        if amount == 0 {
            debug!("ignoring empty manual entry");
            return self.snapshot();
        }
        self.roll_over_if_needed();

        if self.mode == TrackingMode::Sensor && !self.config.tracking.manual_override {
            info!(amount, "manual entry rejected while the sensor is tracking");
            self.emit(|at, _| Event::ManualStepsRejected { amount, at });
            return self.snapshot();
        }

        let total = self.record.total_steps.saturating_add(amount);
        self.record.raise_to(total);
        if self.active.is_some() {
            self.session.rebaseline(total);
        }
        self.emit(|at, _| Event::ManualStepsAdded {
            amount,
            steps: total,
            at,
        });
        self.checkpoint_now();
        self.snapshot()
    }

    /// Freeze yesterday and start a fresh day if the date has changed.
    /// Returns whether a rollover happened.
    pub async fn on_day_rollover(&mut self) -> bool {
        let rolled = self.roll_over_if_needed();
        if rolled {
            self.refresh_absolute().await;
        }
        rolled
    }

    pub async fn on_app_background(&mut self) {
        self.retry_load().await;
        self.checkpoint_now();
    }

    pub async fn on_app_foreground(&mut self) {
        if !self.on_day_rollover().await {
            self.retry_load().await;
            self.refresh_absolute().await;
        }
    }

    /// Ask for permission again and restart tracking.
    pub async fn retry_permission(&mut self) -> StepSnapshot {
        self.manual_requested = false;
        self.detach();
        self.set_permission(PermissionState::Undetermined);
        self.start().await
    }

    /// Switch between manual entry and sensor tracking.
    pub async fn set_manual_mode(&mut self, enabled: bool) -> StepSnapshot {
        if enabled {
            self.manual_requested = true;
            if self.detach() {
                self.checkpoint_now();
            }
            self.set_mode(TrackingMode::Manual);
            self.snapshot()
        } else {
            self.manual_requested = false;
            self.start().await
        }
    }

    /// Periodic housekeeping: rollover and time-based checkpoints.
    pub async fn tick(&mut self) {
        if self.on_day_rollover().await {
            return;
        }
        self.retry_load().await;
        let now = self.clock.now();
        if self
            .policy
            .stale_total(self.record.total_steps, now)
            .is_some()
        {
            self.checkpoint_now();
        }
    }

    // ── Internal ─────────────────────────────────────────────────────

    fn today_key(&self) -> String {
        self.record.key(&self.config.tracking.key_prefix)
    }

    async fn load_today(&mut self) {
        let key = self.today_key();
        let base = self.unloaded_base.take().unwrap_or(self.record.total_steps);
        match self.store.get(&key).await {
            Ok(Some(value)) => match DailyStepRecord::from_stored(self.record.date, &value) {
                Some(stored) => self.merge_stored(stored.total_steps, base),
                None => warn!(key = %key, value = %value, "ignoring malformed stored step total"),
            },
            Ok(None) => {
                debug!(key = %key, "no record for today yet; creating one");
                self.checkpoint_now();
            }
            Err(err) => {
                warn!(key = %key, error = %err, "could not load today's steps; will retry");
                self.unloaded_base = Some(base);
            }
        }
    }

    async fn retry_load(&mut self) {
        if self.unloaded_base.is_none() {
            return;
        }
        self.load_today().await;
        if self.unloaded_base.is_none() {
            self.checkpoint_now();
        }
    }

    /// Fold a stored total into today's record. Steps counted in memory
    /// since `base` was read are added on top of the stored total.
    fn merge_stored(&mut self, stored: u64, base: u64) {
        let counted_since = self.record.total_steps.saturating_sub(base);
        let total = stored.saturating_add(counted_since);
        if !self.record.raise_to(total) {
            return;
        }
        if self.active.is_some() {
            self.session.rebaseline(total);
        }
        if counted_since > 0 {
            info!(stored, counted_since, total, "merged late-loaded step total");
            self.emit(|at, _| Event::StepsUpdated { steps: total, at });
            self.checkpoint_now();
        }
    }

    /// Probe backends in priority order and attach to the first usable one.
    async fn select_backend(&mut self) -> Option<ActiveSubscription> {
        if self.backends.is_empty() {
            debug!("no step backends registered");
            return None;
        }
        let backends: Vec<Arc<dyn StepBackend>> = self.backends.iter().cloned().collect();
        for backend in backends {
            let kind = backend.kind();
            match backend.is_available().await {
                Ok(true) => {}
                Ok(false) => {
                    debug!(backend = kind.name(), "step backend unavailable");
                    continue;
                }
                Err(err) => {
                    self.demoted(kind, &err);
                    continue;
                }
            }

            if self.resolve_permission(backend.as_ref()).await != PermissionState::Granted {
                return None;
            }

            match self.attach(backend).await {
                Ok(active) => return Some(active),
                Err(err) => self.demoted(kind, &err),
            }
        }
        None
    }

    async fn resolve_permission(&mut self, backend: &dyn StepBackend) -> PermissionState {
        let kind = backend.kind();
        let state = match backend.permission().await {
            Ok(grant) if grant.granted => PermissionState::Granted,
            Ok(grant) if !grant.can_ask_again => PermissionState::Denied,
            current => {
                if let Err(err) = current {
                    warn!(backend = kind.name(), error = %err, "permission check failed; asking");
                }
                match backend.request_permission().await {
                    Ok(true) => PermissionState::Granted,
                    Ok(false) => PermissionState::Denied,
                    Err(err) => {
                        warn!(backend = kind.name(), error = %err, "permission request failed");
                        PermissionState::Denied
                    }
                }
            }
        };
        if state == PermissionState::Denied {
            let err = SensorError::PermissionDenied {
                backend: kind.name().into(),
            };
            info!(error = %err, "falling back to manual entry");
        }
        self.set_permission(state);
        state
    }

    async fn attach(&mut self, backend: Arc<dyn StepBackend>) -> Result<ActiveSubscription, SensorError> {
        backend.start().await?;
        self.generation += 1;
        let sink = ReadingSink::new(self.generation, self.signals.clone());
        let handle = backend.subscribe(sink)?;
        Ok(ActiveSubscription {
            backend,
            handle,
            generation: self.generation,
        })
    }

    /// Unsubscribe if attached. Returns whether there was a subscription.
    fn detach(&mut self) -> bool {
        match self.active.take() {
            Some(active) => {
                active.backend.unsubscribe(active.handle);
                debug!(backend = active.backend.kind().name(), "step tracking detached");
                true
            }
            None => false,
        }
    }

    fn demote_to_manual(&mut self, reason: String) {
        let Some(kind) = self.active_backend() else {
            return;
        };
        self.detach();
        let err = SensorError::Subscription(reason);
        self.demoted(kind, &err);
        self.checkpoint_now();
        self.set_mode(TrackingMode::Manual);
    }

    fn demoted(&mut self, backend: BackendKind, err: &SensorError) {
        warn!(backend = backend.name(), error = %err, "step backend demoted");
        let reason = err.to_string();
        self.emit(|at, _| Event::BackendDemoted {
            backend,
            reason,
            at,
        });
    }

    async fn refresh_absolute(&mut self) {
        let Some(active) = &self.active else {
            return;
        };
        if !active.backend.capabilities().absolute_query {
            return;
        }
        let backend = active.backend.clone();
        let now = self.clock.now();
        let range = DayRange {
            start: start_of_day(now),
            end: now,
        };
        match backend.query_total(range).await {
            Ok(Some(total)) => self.apply_absolute(backend.kind(), total),
            Ok(None) => {}
            Err(err) => warn!(backend = backend.kind().name(), error = %err, "absolute step query failed"),
        }
    }

    fn apply_absolute(&mut self, backend: BackendKind, total: u64) {
        if !self.record.raise_to(total) {
            debug!(total, steps = self.record.total_steps, "absolute count not above reconciled total");
            return;
        }
        self.session.rebaseline(total);
        self.emit(|at, _| Event::AbsoluteRefresh {
            backend,
            steps: total,
            at,
        });
        self.checkpoint_now();
    }

    fn roll_over_if_needed(&mut self) -> bool {
        let today = self.clock.today();
        if today <= self.record.date {
            return false;
        }

        let finished = self.record;
        let finished_key = self.today_key();
        self.writer.submit(&finished_key, finished.total_steps);
        self.writer.seal(&finished_key);

        self.record = DailyStepRecord::empty(today);
        self.unloaded_base = None;
        self.session.reset();
        self.policy.reset();
        info!(
            finalized = %finished.date,
            final_steps = finished.total_steps,
            today = %today,
            "day rolled over"
        );
        self.emit(|at, _| Event::DayRolledOver {
            finalized: finished.date,
            final_steps: finished.total_steps,
            today,
            at,
        });
        self.checkpoint_now();
        true
    }

    fn maybe_checkpoint(&mut self) {
        if self.policy.due(self.record.total_steps, self.clock.now()) {
            self.checkpoint_now();
        }
    }

    fn checkpoint_now(&mut self) {
        if self.unloaded_base.is_some() {
            debug!(
                steps = self.record.total_steps,
                "today's stored total not loaded yet; deferring checkpoint"
            );
            return;
        }
        let now = self.clock.now();
        let total = self.record.total_steps;
        self.writer.submit(&self.today_key(), total);
        self.policy.record(total, now);
        let date = self.record.date;
        self.emit(|at, _| Event::CheckpointSubmitted {
            date,
            steps: total,
            at,
        });
    }

    fn set_mode(&mut self, to: TrackingMode) {
        let from = self.mode;
        if from == to {
            return;
        }
        self.mode = to;
        info!(from = ?from, to = ?to, "tracking mode changed");
        self.emit(|at, _| Event::ModeChanged { from, to, at });
    }

    fn set_permission(&mut self, permission: PermissionState) {
        if self.permission == permission {
            return;
        }
        self.permission = permission;
        self.emit(|at, _| Event::PermissionChanged { permission, at });
    }

    fn emit(&mut self, build: impl FnOnce(chrono::NaiveDateTime, &Self) -> Event) {
        let event = build(self.clock.now(), self);
        self.events.push(event);
    }
}

fn validate_reading(raw: i64) -> Result<u64, ReadingError> {
    u64::try_from(raw).map_err(|_| ReadingError::Negative(raw))
}
