//! Step sensor backends and the order they are probed in.
//!
//! A device exposes zero, one or two step sources:
//!
//! ```text
//! priority 1  Native   dedicated step-counter service, absolute "steps today"
//! priority 2  Generic  cross-platform pedometer, cumulative readings
//! fallback    manual entry
//! ```
//!
//! Platform glue implements [`StepBackend`] and forwards every sensor callback
//! into the [`ReadingSink`] it was handed on `subscribe`.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::SensorError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Native,
    Generic,
}

impl BackendKind {
    /// Probe order, highest priority first.
    pub const PROBE_ORDER: [BackendKind; 2] = [BackendKind::Native, BackendKind::Generic];

    pub fn priority(&self) -> usize {
        Self::PROBE_ORDER
            .iter()
            .position(|k| k == self)
            .unwrap_or(usize::MAX)
    }

    pub fn name(&self) -> &'static str {
        match self {
            BackendKind::Native => "native",
            BackendKind::Generic => "generic",
        }
    }
}

/// What a backend can do beyond streaming readings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackendCapabilities {
    /// Answers "how many steps since local midnight" directly.
    pub absolute_query: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PermissionGrant {
    pub granted: bool,
    pub can_ask_again: bool,
}

impl PermissionGrant {
    pub const GRANTED: PermissionGrant = PermissionGrant {
        granted: true,
        can_ask_again: true,
    };
}

/// Local time span for absolute step queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DayRange {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

/// Backend-issued token for an active subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(pub u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SensorSignal {
    /// Cumulative steps since the sensor's epoch, as reported.
    Reading(i64),
    /// The subscription broke.
    Failed(String),
}

/// A signal tagged with the subscription generation it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensorEvent {
    pub generation: u64,
    pub signal: SensorSignal,
}

/// Delivery end handed to a backend on subscribe.
///
/// Signals are queued for the reconciler; once the subscription is replaced
/// or stopped, anything still pushed through an old sink is ignored.
#[derive(Debug, Clone)]
pub struct ReadingSink {
    generation: u64,
    tx: mpsc::UnboundedSender<SensorEvent>,
}

impl ReadingSink {
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<SensorEvent>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Queue a raw reading. Returns `false` once the reconciler is gone.
    pub fn push(&self, raw: i64) -> bool {
        self.send(SensorSignal::Reading(raw))
    }

    /// Report that the subscription failed.
    pub fn fail(&self, reason: impl Into<String>) -> bool {
        self.send(SensorSignal::Failed(reason.into()))
    }

    fn send(&self, signal: SensorSignal) -> bool {
        self.tx
            .send(SensorEvent {
                generation: self.generation,
                signal,
            })
            .is_ok()
    }
}

#[async_trait]
pub trait StepBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities::default()
    }

    async fn is_available(&self) -> Result<bool, SensorError>;

    async fn permission(&self) -> Result<PermissionGrant, SensorError> {
        Ok(PermissionGrant::GRANTED)
    }

    /// Ask the user. `Ok(true)` when granted.
    async fn request_permission(&self) -> Result<bool, SensorError> {
        Ok(true)
    }

    /// Bring up whatever the platform needs before subscribing
    /// (e.g. a foreground service).
    async fn start(&self) -> Result<(), SensorError> {
        Ok(())
    }

    /// Steps taken within `range`; `Ok(None)` when unsupported.
    async fn query_total(&self, _range: DayRange) -> Result<Option<u64>, SensorError> {
        Ok(None)
    }

    fn subscribe(&self, sink: ReadingSink) -> Result<SubscriptionHandle, SensorError>;

    fn unsubscribe(&self, handle: SubscriptionHandle);
}

/// Backends in probe order.
#[derive(Clone, Default)]
pub(crate) struct BackendTable {
    entries: Vec<Arc<dyn StepBackend>>,
}

impl BackendTable {
    pub(crate) fn new(mut entries: Vec<Arc<dyn StepBackend>>) -> Self {
        entries.sort_by_key(|b| b.kind().priority());
        Self { entries }
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Arc<dyn StepBackend>> {
        self.entries.iter()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::fakes::FakeBackend;

    #[test]
    fn table_sorts_by_priority() {
        let generic: Arc<dyn StepBackend> = Arc::new(FakeBackend::generic());
        let native: Arc<dyn StepBackend> = Arc::new(FakeBackend::native());
        let table = BackendTable::new(vec![generic, native]);
        let kinds: Vec<BackendKind> = table.iter().map(|b| b.kind()).collect();
        assert_eq!(kinds, vec![BackendKind::Native, BackendKind::Generic]);
    }

    #[test]
    fn sink_tags_signals_with_generation() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = ReadingSink::new(7, tx);
        assert!(sink.push(5000));
        assert!(sink.fail("sensor lost"));

        assert_eq!(
            rx.try_recv().unwrap(),
            SensorEvent { generation: 7, signal: SensorSignal::Reading(5000) }
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            SensorEvent { generation: 7, signal: SensorSignal::Failed("sensor lost".into()) }
        );

        drop(rx);
        assert!(!sink.push(1));
    }
}
