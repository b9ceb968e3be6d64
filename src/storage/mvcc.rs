use std::collections::BTreeMap;

use crate::types::TxnId;

/// Identifier assigned to every committed write transaction. Snapshots are
/// expressed as the newest commit they include.
pub type CommitId = u64;

/// Sentinel commit ID meaning "visible forever".
pub const COMMIT_MAX: CommitId = 0;

/// MVCC version flags.
pub mod flags {
    /// Version was written by a transaction that has not committed yet.
    pub const PENDING: u16 = 0x0001;
    /// A pending transaction has deleted or superseded this version.
    pub const PENDING_END: u16 = 0x0002;
}

/// Visibility bounds of one record version.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct VersionHeader {
    /// First commit ID where this version becomes visible.
    pub begin: CommitId,
    /// Exclusive commit ID where the version stops being visible. `COMMIT_MAX`
    /// (zero) means unbounded.
    pub end: CommitId,
    /// Bitflags captured in [`flags`].
    pub flags: u16,
}

impl VersionHeader {
    /// Header for a version written by a transaction that has not committed.
    pub const fn pending() -> Self {
        Self {
            begin: COMMIT_MAX,
            end: COMMIT_MAX,
            flags: flags::PENDING,
        }
    }

    /// Returns `true` if this version is visible for the provided snapshot.
    /// Pending versions are never visible through this check.
    pub fn visible_at(&self, snapshot: CommitId) -> bool {
        if self.is_pending() || snapshot < self.begin {
            return false;
        }
        if self.end == COMMIT_MAX {
            return true;
        }
        snapshot < self.end
    }

    /// Whether the version awaits its writer's commit.
    pub fn is_pending(&self) -> bool {
        (self.flags & flags::PENDING) != 0
    }

    /// Whether a pending transaction has ended this version.
    pub fn has_pending_end(&self) -> bool {
        (self.flags & flags::PENDING_END) != 0
    }

    /// Stamps the begin commit and clears the pending flag.
    pub fn publish(&mut self, commit: CommitId) {
        self.begin = commit;
        self.flags &= !flags::PENDING;
    }

    /// Stamps the end commit and clears the pending-end flag.
    pub fn retire(&mut self, commit: CommitId) {
        self.end = commit;
        self.flags &= !flags::PENDING_END;
    }

    /// Whether no snapshot at or after `horizon` can observe this version.
    pub fn reclaimable(&self, horizon: CommitId) -> bool {
        !self.is_pending() && self.end != COMMIT_MAX && self.end <= horizon
    }
}

/// Tracks the snapshot pinned by each open transaction so dead versions can
/// be reclaimed once no reader can observe them.
#[derive(Clone, Debug, Default)]
pub struct CommitTable {
    latest: CommitId,
    readers: BTreeMap<TxnId, CommitId>,
}

impl CommitTable {
    /// Creates a table whose newest commit is `start`.
    pub fn new(start: CommitId) -> Self {
        Self {
            latest: start,
            readers: BTreeMap::new(),
        }
    }

    /// Newest committed ID.
    pub fn latest(&self) -> CommitId {
        self.latest
    }

    /// Reserves and publishes the next commit ID.
    pub fn advance(&mut self) -> CommitId {
        self.latest += 1;
        self.latest
    }

    /// Pins the current snapshot for `txn` and returns it.
    pub fn register_reader(&mut self, txn: TxnId) -> CommitId {
        let snapshot = self.latest;
        self.readers.insert(txn, snapshot);
        snapshot
    }

    /// Releases the snapshot pinned by `txn`.
    pub fn release_reader(&mut self, txn: TxnId) -> bool {
        self.readers.remove(&txn).is_some()
    }

    /// Whether `txn` is registered.
    pub fn is_active(&self, txn: TxnId) -> bool {
        self.readers.contains_key(&txn)
    }

    /// Number of registered transactions.
    pub fn active(&self) -> usize {
        self.readers.len()
    }

    /// Returns the smallest commit ID that must remain visible to readers.
    pub fn oldest_visible(&self) -> CommitId {
        self.readers
            .values()
            .copied()
            .min()
            .map_or(self.latest, |oldest| oldest.min(self.latest))
    }
}
