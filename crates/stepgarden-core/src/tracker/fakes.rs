//! Scriptable backends and stores for reconciler tests.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::NaiveDate;
use tokio::sync::mpsc;

use super::backend::{
    BackendCapabilities, BackendKind, DayRange, PermissionGrant, ReadingSink, SensorEvent,
    StepBackend, SubscriptionHandle,
};
use super::reconciler::StepReconciler;
use crate::clock::{Clock, ManualClock};
use crate::error::{SensorError, StorageError};
use crate::storage::{day_key, Config, KeyValueStore, MemoryStore};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub(crate) struct FakeBackend {
    kind: BackendKind,
    capabilities: BackendCapabilities,
    available: bool,
    grant: Mutex<PermissionGrant>,
    request_grants: AtomicBool,
    start_fails: bool,
    subscribe_fails: bool,
    absolute: Mutex<Option<u64>>,
    last_range: Mutex<Option<DayRange>>,
    sink: Mutex<Option<ReadingSink>>,
    next_handle: AtomicU64,
    starts: AtomicUsize,
    requests: AtomicUsize,
    subscribes: AtomicUsize,
    unsubscribes: AtomicUsize,
}

impl FakeBackend {
    fn new(kind: BackendKind, capabilities: BackendCapabilities) -> Self {
        Self {
            kind,
            capabilities,
            available: true,
            grant: Mutex::new(PermissionGrant::GRANTED),
            request_grants: AtomicBool::new(true),
            start_fails: false,
            subscribe_fails: false,
            absolute: Mutex::new(None),
            last_range: Mutex::new(None),
            sink: Mutex::new(None),
            next_handle: AtomicU64::new(1),
            starts: AtomicUsize::new(0),
            requests: AtomicUsize::new(0),
            subscribes: AtomicUsize::new(0),
            unsubscribes: AtomicUsize::new(0),
        }
    }

    pub(crate) fn native() -> Self {
        Self::new(
            BackendKind::Native,
            BackendCapabilities {
                absolute_query: true,
            },
        )
    }

    pub(crate) fn generic() -> Self {
        Self::new(BackendKind::Generic, BackendCapabilities::default())
    }

    pub(crate) fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }

    /// Permission not granted yet.
    pub(crate) fn denied(self, can_ask_again: bool) -> Self {
        *lock(&self.grant) = PermissionGrant {
            granted: false,
            can_ask_again,
        };
        self
    }

    pub(crate) fn declines_request(self) -> Self {
        self.request_grants.store(false, Ordering::SeqCst);
        self
    }

    pub(crate) fn failing_start(mut self) -> Self {
        self.start_fails = true;
        self
    }

    pub(crate) fn failing_subscribe(mut self) -> Self {
        self.subscribe_fails = true;
        self
    }

    pub(crate) fn with_absolute(self, total: u64) -> Self {
        self.set_absolute(Some(total));
        self
    }

    /// The user flipped the permission in system settings.
    pub(crate) fn grant(&self) {
        *lock(&self.grant) = PermissionGrant::GRANTED;
        self.request_grants.store(true, Ordering::SeqCst);
    }

    pub(crate) fn set_absolute(&self, total: Option<u64>) {
        *lock(&self.absolute) = total;
    }

    /// Deliver a raw reading through the current subscription, if any.
    pub(crate) fn emit(&self, raw: i64) {
        if let Some(sink) = lock(&self.sink).as_ref() {
            sink.push(raw);
        }
    }

    pub(crate) fn fail(&self, reason: &str) {
        if let Some(sink) = lock(&self.sink).as_ref() {
            sink.fail(reason);
        }
    }

    pub(crate) fn last_range(&self) -> Option<DayRange> {
        *lock(&self.last_range)
    }

    pub(crate) fn start_count(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub(crate) fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    pub(crate) fn subscribe_count(&self) -> usize {
        self.subscribes.load(Ordering::SeqCst)
    }

    pub(crate) fn unsubscribe_count(&self) -> usize {
        self.unsubscribes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StepBackend for FakeBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn capabilities(&self) -> BackendCapabilities {
        self.capabilities
    }

    async fn is_available(&self) -> Result<bool, SensorError> {
        Ok(self.available)
    }

    async fn permission(&self) -> Result<PermissionGrant, SensorError> {
        Ok(*lock(&self.grant))
    }

    async fn request_permission(&self) -> Result<bool, SensorError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        Ok(self.request_grants.load(Ordering::SeqCst))
    }

    async fn start(&self) -> Result<(), SensorError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        if self.start_fails {
            return Err(SensorError::Unavailable {
                backend: self.kind.name().into(),
            });
        }
        Ok(())
    }

    async fn query_total(&self, range: DayRange) -> Result<Option<u64>, SensorError> {
        *lock(&self.last_range) = Some(range);
        Ok(*lock(&self.absolute))
    }

    fn subscribe(&self, sink: ReadingSink) -> Result<SubscriptionHandle, SensorError> {
        if self.subscribe_fails {
            return Err(SensorError::Subscription("listener rejected".into()));
        }
        self.subscribes.fetch_add(1, Ordering::SeqCst);
        *lock(&self.sink) = Some(sink);
        Ok(SubscriptionHandle(
            self.next_handle.fetch_add(1, Ordering::SeqCst),
        ))
    }

    fn unsubscribe(&self, _handle: SubscriptionHandle) {
        self.unsubscribes.fetch_add(1, Ordering::SeqCst);
        *lock(&self.sink) = None;
    }
}

/// Memory store that fails every call while `failing` is set.
#[derive(Default)]
pub(crate) struct FailingStore {
    inner: Arc<MemoryStore>,
    failing: AtomicBool,
}

impl FailingStore {
    pub(crate) fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl KeyValueStore for FailingStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StorageError::Read {
                key: key.to_string(),
                message: "database is locked".into(),
            });
        }
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StorageError::Write {
                key: key.to_string(),
                message: "database is locked".into(),
            });
        }
        self.inner.set(key, value).await
    }
}

/// A reconciler wired to fakes, a manual clock at 2024-03-09 09:00 and a
/// memory store.
pub(crate) struct Harness {
    pub(crate) reconciler: StepReconciler,
    pub(crate) store: Arc<MemoryStore>,
    pub(crate) clock: Arc<ManualClock>,
    backends: Vec<Arc<FakeBackend>>,
    signals: mpsc::UnboundedReceiver<SensorEvent>,
}

impl Harness {
    pub(crate) fn new(backends: Vec<FakeBackend>) -> Self {
        Self::with_config(backends, Config::default())
    }

    pub(crate) fn with_config(backends: Vec<FakeBackend>, config: Config) -> Self {
        let store = Arc::new(MemoryStore::new());
        Self::build(backends, store.clone(), store, config)
    }

    pub(crate) fn with_failing_store(backends: Vec<FakeBackend>) -> (Self, Arc<FailingStore>) {
        let failing = Arc::new(FailingStore::default());
        let memory = failing.inner.clone();
        let harness = Self::build(backends, failing.clone(), memory, Config::default());
        (harness, failing)
    }

    fn build(
        backends: Vec<FakeBackend>,
        store: Arc<dyn KeyValueStore>,
        memory: Arc<MemoryStore>,
        config: Config,
    ) -> Self {
        let day = NaiveDate::from_ymd_opt(2024, 3, 9).unwrap();
        let clock = Arc::new(ManualClock::at(day, 9, 0));
        let backends: Vec<Arc<FakeBackend>> = backends.into_iter().map(Arc::new).collect();
        let dyn_backends: Vec<Arc<dyn StepBackend>> = backends
            .iter()
            .map(|b| b.clone() as Arc<dyn StepBackend>)
            .collect();
        let (tx, rx) = mpsc::unbounded_channel();
        let reconciler = StepReconciler::new(store, dyn_backends, clock.clone(), config, tx);
        Self {
            reconciler,
            store: memory,
            clock,
            backends,
            signals: rx,
        }
    }

    pub(crate) fn native(&self) -> &FakeBackend {
        self.backend(BackendKind::Native)
    }

    pub(crate) fn generic(&self) -> &FakeBackend {
        self.backend(BackendKind::Generic)
    }

    fn backend(&self, kind: BackendKind) -> &FakeBackend {
        self.backends
            .iter()
            .find(|b| b.kind == kind)
            .expect("no fake backend of that kind")
    }

    /// Deliver every queued sensor signal to the reconciler.
    pub(crate) fn pump(&mut self) {
        while let Ok(event) = self.signals.try_recv() {
            self.reconciler.handle_sensor_event(event);
        }
    }

    /// Storage key for the clock's current day.
    pub(crate) fn key(&self) -> String {
        day_key(&self.reconciler.config().tracking.key_prefix, self.clock.today())
    }

    pub(crate) fn stored(&self) -> Option<u64> {
        self.store.value(&self.key()).and_then(|v| v.parse().ok())
    }
}
