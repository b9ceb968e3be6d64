#![forbid(unsafe_code)]

//! Transaction lifecycle.
//!
//! The [`TransactionManager`] bounds how many transactions are open at once
//! (a slot pool with a timed wait) and serializes writers through a single
//! writer lock. A [`Transaction`] owns its store transaction, resolves the
//! read view its isolation level calls for and enforces its timeout at every
//! call and before commit.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::storage::{CommitId, ReadView, RecordStore};
use crate::types::TxnId;

/// Visibility of other transactions' writes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum IsolationLevel {
    /// Sees pending writes of every open transaction.
    ReadUncommitted,
    /// Each statement sees the newest committed state.
    #[default]
    ReadCommitted,
    /// Every statement sees the snapshot taken at begin.
    RepeatableRead,
    /// Begin snapshot plus the writer lock for the whole transaction.
    Serializable,
}

/// Per-transaction overrides of the engine defaults.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TransactionOptions {
    /// Isolation level.
    pub isolation: Option<IsolationLevel>,
    /// Bound on waiting for a transaction slot, in milliseconds.
    pub max_wait_ms: Option<u64>,
    /// Bound on the transaction's open duration, in milliseconds.
    pub timeout_ms: Option<u64>,
}

impl TransactionOptions {
    /// Engine defaults for everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the isolation level.
    pub fn isolation(mut self, level: IsolationLevel) -> Self {
        self.isolation = Some(level);
        self
    }

    /// Sets the slot wait bound.
    pub fn max_wait(mut self, wait: Duration) -> Self {
        self.max_wait_ms = Some(wait.as_millis() as u64);
        self
    }

    /// Sets the open-duration bound.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }
}

/// The state of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    /// Accepting statements.
    Active,
    /// Committed.
    Committed,
    /// Rolled back, explicitly, on error, on timeout or on drop.
    RolledBack,
}

#[derive(Debug)]
struct SlotPool {
    open: Mutex<usize>,
    freed: Condvar,
    capacity: usize,
}

impl SlotPool {
    fn acquire(&self, max_wait: Duration) -> Result<SlotGuard<'_>> {
        let started = Instant::now();
        let deadline = started + max_wait;
        let mut open = self.open.lock();
        while *open >= self.capacity {
            if self.freed.wait_until(&mut open, deadline).timed_out() && *open >= self.capacity {
                let waited_ms = started.elapsed().as_millis() as u64;
                warn!(waited_ms, capacity = self.capacity, "txn.acquire_timeout");
                return Err(EngineError::TransactionAcquireTimeout { waited_ms });
            }
        }
        *open += 1;
        Ok(SlotGuard { pool: self })
    }
}

#[derive(Debug)]
struct SlotGuard<'m> {
    pool: &'m SlotPool,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        let mut open = self.pool.open.lock();
        *open = open.saturating_sub(1);
        self.pool.freed.notify_one();
    }
}

#[derive(Debug, Default)]
struct WriterLock {
    held: Mutex<bool>,
    freed: Condvar,
}

impl WriterLock {
    fn acquire(&self, deadline: Instant) -> Option<WriterGuard<'_>> {
        let mut held = self.held.lock();
        while *held {
            if self.freed.wait_until(&mut held, deadline).timed_out() && *held {
                return None;
            }
        }
        *held = true;
        Some(WriterGuard { lock: self })
    }
}

#[derive(Debug)]
struct WriterGuard<'m> {
    lock: &'m WriterLock,
}

impl Drop for WriterGuard<'_> {
    fn drop(&mut self) {
        *self.lock.held.lock() = false;
        self.lock.freed.notify_one();
    }
}

/// Hands out transactions against one store.
#[derive(Debug)]
pub struct TransactionManager {
    store: Arc<dyn RecordStore>,
    slots: SlotPool,
    writer: WriterLock,
    default_isolation: IsolationLevel,
    default_max_wait: Duration,
    default_timeout: Duration,
}

impl TransactionManager {
    /// Creates a manager with the limits and defaults of `config`.
    pub fn new(store: Arc<dyn RecordStore>, config: &EngineConfig) -> Self {
        Self {
            store,
            slots: SlotPool {
                open: Mutex::new(0),
                freed: Condvar::new(),
                capacity: config.max_open_transactions.max(1),
            },
            writer: WriterLock::default(),
            default_isolation: config.default_isolation,
            default_max_wait: Duration::from_millis(config.default_max_wait_ms),
            default_timeout: Duration::from_millis(config.default_timeout_ms),
        }
    }

    /// Transactions currently holding a slot.
    pub fn open_transactions(&self) -> usize {
        *self.slots.open.lock()
    }

    /// Opens a transaction, waiting at most the effective `max_wait` for a
    /// slot (and, for serializable transactions, for the writer lock).
    pub fn begin(&self, options: &TransactionOptions) -> Result<Transaction<'_>> {
        let isolation = options.isolation.unwrap_or(self.default_isolation);
        let max_wait = options
            .max_wait_ms
            .map(Duration::from_millis)
            .unwrap_or(self.default_max_wait);
        let timeout = options
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.default_timeout);

        let started = Instant::now();
        let slot = self.slots.acquire(max_wait)?;
        let writer = if isolation == IsolationLevel::Serializable {
            let guard = self.writer.acquire(started + max_wait).ok_or_else(|| {
                let waited_ms = started.elapsed().as_millis() as u64;
                warn!(waited_ms, "txn.writer_acquire_timeout");
                EngineError::TransactionAcquireTimeout { waited_ms }
            })?;
            Some(guard)
        } else {
            None
        };
        let start = self.store.begin()?;
        debug!(txn = start.id.0, ?isolation, snapshot = start.snapshot, "txn.begin");
        Ok(Transaction {
            manager: self,
            id: start.id,
            isolation,
            snapshot: start.snapshot,
            started,
            timeout,
            state: TxState::Active,
            writer,
            _slot: slot,
        })
    }
}

/// One open transaction.
///
/// Must end with [`Transaction::commit`] or [`Transaction::rollback`]; a
/// transaction dropped while active is rolled back with a warning.
#[derive(Debug)]
pub struct Transaction<'m> {
    manager: &'m TransactionManager,
    id: TxnId,
    isolation: IsolationLevel,
    snapshot: CommitId,
    started: Instant,
    timeout: Duration,
    state: TxState,
    writer: Option<WriterGuard<'m>>,
    _slot: SlotGuard<'m>,
}

impl<'m> Transaction<'m> {
    /// Store transaction identifier.
    pub fn id(&self) -> TxnId {
        self.id
    }

    /// Isolation level in effect.
    pub fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    /// Current state.
    pub fn state(&self) -> TxState {
        self.state
    }

    /// Time since begin.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Whether this transaction holds the writer lock.
    pub fn holds_writer(&self) -> bool {
        self.writer.is_some()
    }

    /// Fails with `TransactionClosed` once the transaction has ended and with
    /// `TransactionTimeout` (rolling back first) once it has outlived its
    /// timeout.
    pub fn check(&mut self) -> Result<()> {
        if self.state != TxState::Active {
            return Err(EngineError::TransactionClosed { txn: self.id.0 });
        }
        let elapsed = self.started.elapsed();
        if elapsed > self.timeout {
            let timeout_ms = self.timeout.as_millis() as u64;
            let elapsed_ms = elapsed.as_millis() as u64;
            warn!(txn = self.id.0, timeout_ms, elapsed_ms, "txn.timeout");
            self.abort();
            return Err(EngineError::TransactionTimeout { timeout_ms, elapsed_ms });
        }
        Ok(())
    }

    /// View a statement reads through. Read-committed statements see the
    /// newest commit; repeatable-read and serializable keep the begin
    /// snapshot. Own pending writes are always visible.
    pub fn read_view(&self) -> ReadView {
        match self.isolation {
            IsolationLevel::ReadUncommitted => ReadView::within(self.manager.store.snapshot(), self.id).dirty(),
            IsolationLevel::ReadCommitted => ReadView::within(self.manager.store.snapshot(), self.id),
            IsolationLevel::RepeatableRead | IsolationLevel::Serializable => ReadView::within(self.snapshot, self.id),
        }
    }

    /// View constraint checks run against: the newest commit plus own writes.
    pub fn write_view(&self) -> ReadView {
        ReadView::within(self.manager.store.snapshot(), self.id)
    }

    /// Takes the writer lock if not already held, waiting at most the
    /// remaining timeout.
    pub fn acquire_writer(&mut self) -> Result<()> {
        if self.writer.is_some() {
            return Ok(());
        }
        let deadline = self.started + self.timeout;
        match self.manager.writer.acquire(deadline) {
            Some(guard) => {
                self.writer = Some(guard);
                Ok(())
            }
            None => {
                let timeout_ms = self.timeout.as_millis() as u64;
                let elapsed_ms = self.started.elapsed().as_millis() as u64;
                warn!(txn = self.id.0, timeout_ms, elapsed_ms, "txn.writer_timeout");
                self.abort();
                Err(EngineError::TransactionTimeout { timeout_ms, elapsed_ms })
            }
        }
    }

    /// Publishes every write. A transaction past its timeout is rolled back
    /// instead.
    pub fn commit(mut self) -> Result<CommitId> {
        self.check()?;
        match self.manager.store.commit(self.id) {
            Ok(commit) => {
                self.state = TxState::Committed;
                self.writer = None;
                info!(
                    txn = self.id.0,
                    commit,
                    isolation = ?self.isolation,
                    elapsed_ms = self.started.elapsed().as_millis() as u64,
                    "txn.commit"
                );
                Ok(commit)
            }
            Err(err) => {
                self.abort();
                Err(err.into())
            }
        }
    }

    /// Discards every write.
    pub fn rollback(mut self) -> Result<()> {
        if self.state != TxState::Active {
            return Err(EngineError::TransactionClosed { txn: self.id.0 });
        }
        let result = self.manager.store.rollback(self.id);
        self.state = TxState::RolledBack;
        self.writer = None;
        info!(txn = self.id.0, "txn.rollback");
        result.map_err(Into::into)
    }

    fn abort(&mut self) {
        if self.state != TxState::Active {
            return;
        }
        if let Err(err) = self.manager.store.rollback(self.id) {
            warn!(txn = self.id.0, error = %err, "txn.rollback_failed");
        }
        self.state = TxState::RolledBack;
        self.writer = None;
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if self.state == TxState::Active {
            warn!(txn = self.id.0, "txn.dropped");
            self.abort();
        }
    }
}
