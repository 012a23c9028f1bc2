//! Single-writer checkpoint queue for daily step totals.
//!
//! The reconciler submits totals without waiting; one background task applies
//! them to the [`KeyValueStore`] in submission order.
//!
//! Invariants:
//! - A value lower than the highest value seen for a key (submitted, written,
//!   or found in storage) is dropped, so stored totals never decrease.
//! - A failed write is kept as pending and retried on the next command.
//! - Nothing is written for a key until its stored value has been read; while
//!   reads fail the write is held as pending.
//! - Once a key is sealed, new submissions for it are dropped; a pending
//!   write that was submitted before the seal is still retried.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use super::{parse_total, KeyValueStore};
use crate::error::StorageError;

enum WriteCommand {
    Write { key: String, total: u64 },
    Seal { key: String },
    Flush(oneshot::Sender<Result<(), StorageError>>),
}

/// Handle to the checkpoint writer task.
///
/// Must be created inside a tokio runtime.
#[derive(Clone)]
pub struct CheckpointWriter {
    tx: mpsc::UnboundedSender<WriteCommand>,
}

impl CheckpointWriter {
    pub fn spawn(store: Arc<dyn KeyValueStore>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(WriterTask::new(store).run(rx));
        Self { tx }
    }

    /// Queue `total` for `key`. Never blocks.
    pub fn submit(&self, key: &str, total: u64) {
        let command = WriteCommand::Write {
            key: key.to_string(),
            total,
        };
        if self.tx.send(command).is_err() {
            warn!(key = %key, total, "checkpoint writer is gone; dropping write");
        }
    }

    /// Freeze `key`: later submissions for it are ignored.
    pub fn seal(&self, key: &str) {
        if self.tx.send(WriteCommand::Seal { key: key.to_string() }).is_err() {
            warn!(key = %key, "checkpoint writer is gone; cannot seal");
        }
    }

    /// Wait until everything submitted so far has been attempted.
    ///
    /// Returns the last failure if a write is still pending afterwards.
    pub async fn flush(&self) -> Result<(), StorageError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(WriteCommand::Flush(reply_tx))
            .map_err(|_| StorageError::WriterClosed)?;
        reply_rx.await.map_err(|_| StorageError::WriterClosed)?
    }
}

struct WriterTask {
    store: Arc<dyn KeyValueStore>,
    /// Highest value known per key: written, found in storage, or pending.
    high_water: HashMap<String, u64>,
    /// Keys whose stored value has been read and merged into `high_water`.
    verified: HashSet<String>,
    /// Writes that still need to land, including writes held back because
    /// the stored value could not be read yet.
    pending: HashMap<String, u64>,
    sealed: HashSet<String>,
    last_error: Option<StorageError>,
}

impl WriterTask {
    fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            high_water: HashMap::new(),
            verified: HashSet::new(),
            pending: HashMap::new(),
            sealed: HashSet::new(),
            last_error: None,
        }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<WriteCommand>) {
        while let Some(command) = rx.recv().await {
            self.retry_pending().await;
            match command {
                WriteCommand::Write { key, total } => self.write(key, total).await,
                WriteCommand::Seal { key } => {
                    self.sealed.insert(key);
                }
                WriteCommand::Flush(reply) => {
                    let result = match (&self.last_error, self.pending.is_empty()) {
                        (Some(err), false) => Err(err.clone()),
                        _ => Ok(()),
                    };
                    let _ = reply.send(result);
                }
            }
        }
        if !self.pending.is_empty() {
            warn!(pending = self.pending.len(), "checkpoint writer stopped with unwritten totals");
        }
    }

    async fn write(&mut self, key: String, total: u64) {
        if self.sealed.contains(&key) {
            debug!(key = %key, total, "dropping write for finalized day");
            return;
        }
        self.merge_and_write(key, total).await;
    }

    async fn merge_and_write(&mut self, key: String, total: u64) {
        if !self.verified.contains(&key) {
            if let Err(err) = self.learn_stored_value(&key).await {
                warn!(key = %key, total, error = %err, "could not read stored total; holding write");
                self.hold(key, total, err);
                return;
            }
        }
        if let Some(&known) = self.high_water.get(&key) {
            if total < known {
                debug!(key = %key, total, known, "dropping stale checkpoint");
                return;
            }
            if total == known && !self.pending.contains_key(&key) {
                return;
            }
        }

        self.high_water.insert(key.clone(), total);
        self.attempt(key, total).await;
    }

    async fn learn_stored_value(&mut self, key: &str) -> Result<(), StorageError> {
        if let Some(value) = self.store.get(key).await? {
            match parse_total(&value) {
                Some(stored) => {
                    let known = self.high_water.entry(key.to_string()).or_insert(stored);
                    *known = (*known).max(stored);
                }
                None => warn!(key = %key, value = %value, "stored total is not a number; replacing it"),
            }
        }
        self.verified.insert(key.to_string());
        Ok(())
    }

    /// Keep `total` pending without writing it.
    fn hold(&mut self, key: String, total: u64, err: StorageError) {
        let held = self.pending.entry(key).or_insert(total);
        *held = (*held).max(total);
        self.last_error = Some(err);
    }

    async fn attempt(&mut self, key: String, total: u64) {
        match self.store.set(&key, &total.to_string()).await {
            Ok(()) => {
                debug!(key = %key, total, "checkpoint written");
                self.pending.remove(&key);
                if self.pending.is_empty() {
                    self.last_error = None;
                }
            }
            Err(err) => {
                warn!(key = %key, total, error = %err, "checkpoint write failed; will retry");
                self.pending.insert(key, total);
                self.last_error = Some(err);
            }
        }
    }

    async fn retry_pending(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let retries: Vec<(String, u64)> = self.pending.drain().collect();
        for (key, total) in retries {
            if self.verified.contains(&key) {
                self.attempt(key, total).await;
            } else {
                self.merge_and_write(key, total).await;
            }
        }
        if self.pending.is_empty() {
            self.last_error = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Store whose writes fail while `failing` is set and whose reads fail
    /// while `reads_failing` is set.
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryStore,
        failing: AtomicBool,
        reads_failing: AtomicBool,
        writes: AtomicUsize,
    }

    #[async_trait]
    impl KeyValueStore for FlakyStore {
        async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
            if self.reads_failing.load(Ordering::SeqCst) {
                return Err(StorageError::Read {
                    key: key.to_string(),
                    message: "database is locked".into(),
                });
            }
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                return Err(StorageError::Write {
                    key: key.to_string(),
                    message: "disk full".into(),
                });
            }
            self.inner.set(key, value).await
        }
    }

    #[tokio::test]
    async fn lower_values_are_dropped() {
        let store = Arc::new(MemoryStore::new());
        let writer = CheckpointWriter::spawn(store.clone());

        writer.submit("daily_steps_2024-03-09", 150);
        writer.submit("daily_steps_2024-03-09", 120);
        writer.flush().await.unwrap();

        assert_eq!(store.value("daily_steps_2024-03-09").as_deref(), Some("150"));
    }

    #[tokio::test]
    async fn never_overwrites_higher_stored_value() {
        let store = Arc::new(MemoryStore::new());
        store.insert("daily_steps_2024-03-09", "900");
        let writer = CheckpointWriter::spawn(store.clone());

        writer.submit("daily_steps_2024-03-09", 40);
        writer.flush().await.unwrap();
        assert_eq!(store.value("daily_steps_2024-03-09").as_deref(), Some("900"));

        writer.submit("daily_steps_2024-03-09", 901);
        writer.flush().await.unwrap();
        assert_eq!(store.value("daily_steps_2024-03-09").as_deref(), Some("901"));
    }

    #[tokio::test]
    async fn failed_write_is_retried_on_next_command() {
        let store = Arc::new(FlakyStore::default());
        store.failing.store(true, Ordering::SeqCst);
        let writer = CheckpointWriter::spawn(store.clone());

        writer.submit("daily_steps_2024-03-09", 75);
        assert!(matches!(
            writer.flush().await,
            Err(StorageError::Write { .. })
        ));
        assert!(store.inner.value("daily_steps_2024-03-09").is_none());

        store.failing.store(false, Ordering::SeqCst);
        writer.flush().await.unwrap();
        assert_eq!(store.inner.value("daily_steps_2024-03-09").as_deref(), Some("75"));
    }

    #[tokio::test]
    async fn sealed_key_ignores_later_writes() {
        let store = Arc::new(MemoryStore::new());
        let writer = CheckpointWriter::spawn(store.clone());

        writer.submit("daily_steps_2024-03-09", 4_000);
        writer.seal("daily_steps_2024-03-09");
        writer.submit("daily_steps_2024-03-09", 4_500);
        writer.submit("daily_steps_2024-03-10", 12);
        writer.flush().await.unwrap();

        assert_eq!(store.value("daily_steps_2024-03-09").as_deref(), Some("4000"));
        assert_eq!(store.value("daily_steps_2024-03-10").as_deref(), Some("12"));
    }

    #[tokio::test]
    async fn unchanged_total_is_not_rewritten() {
        let store = Arc::new(FlakyStore::default());
        let writer = CheckpointWriter::spawn(store.clone());

        writer.submit("daily_steps_2024-03-09", 10);
        writer.submit("daily_steps_2024-03-09", 10);
        writer.flush().await.unwrap();

        assert_eq!(store.writes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unreadable_key_holds_write_until_stored_value_is_known() {
        let store = Arc::new(FlakyStore::default());
        store.inner.insert("daily_steps_2024-03-09", "5000");
        store.reads_failing.store(true, Ordering::SeqCst);
        let writer = CheckpointWriter::spawn(store.clone());

        writer.submit("daily_steps_2024-03-09", 250);
        assert!(matches!(writer.flush().await, Err(StorageError::Read { .. })));
        assert_eq!(store.writes.load(Ordering::SeqCst), 0);
        assert_eq!(store.inner.value("daily_steps_2024-03-09").as_deref(), Some("5000"));

        store.reads_failing.store(false, Ordering::SeqCst);
        writer.flush().await.unwrap();
        assert_eq!(store.writes.load(Ordering::SeqCst), 0);
        assert_eq!(store.inner.value("daily_steps_2024-03-09").as_deref(), Some("5000"));

        writer.submit("daily_steps_2024-03-09", 5_100);
        writer.flush().await.unwrap();
        assert_eq!(store.inner.value("daily_steps_2024-03-09").as_deref(), Some("5100"));
    }

    #[tokio::test]
    async fn held_write_lands_once_reads_recover_on_empty_key() {
        let store = Arc::new(FlakyStore::default());
        store.reads_failing.store(true, Ordering::SeqCst);
        let writer = CheckpointWriter::spawn(store.clone());

        writer.submit("daily_steps_2024-03-09", 40);
        writer.submit("daily_steps_2024-03-09", 30);
        assert!(writer.flush().await.is_err());

        store.reads_failing.store(false, Ordering::SeqCst);
        writer.flush().await.unwrap();
        assert_eq!(store.inner.value("daily_steps_2024-03-09").as_deref(), Some("40"));
    }
}
