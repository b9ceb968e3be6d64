use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tracing::{debug, trace};

use crate::types::{RecordId, TxnId};

use super::mvcc::{flags, CommitId, CommitTable, VersionHeader};
use super::{Fields, ReadView, Record, RecordStore, StoreError, StoreResult, TxnStart};

#[derive(Clone, Debug)]
struct Version {
    header: VersionHeader,
    /// Writer of a pending version.
    created_by: Option<TxnId>,
    /// Transaction that has a pending delete or supersede on this version.
    ended_by: Option<TxnId>,
    fields: Fields,
}

impl Version {
    fn visible_to(&self, view: &ReadView) -> bool {
        let sees = |owner: Option<TxnId>| match owner {
            Some(txn) => view.dirty || view.txn == Some(txn),
            None => false,
        };
        let born = if self.header.is_pending() {
            sees(self.created_by)
        } else {
            self.header.visible_at(view.snapshot)
        };
        born && !(self.header.has_pending_end() && sees(self.ended_by))
    }
}

#[derive(Debug, Default)]
struct Table {
    rows: BTreeMap<RecordId, Vec<Version>>,
    next_id: u64,
}

#[derive(Debug, Default)]
struct Tables {
    tables: HashMap<String, Table>,
    writes: HashMap<TxnId, Vec<(String, RecordId)>>,
    commits: CommitTable,
}

impl Tables {
    fn ensure_active(&self, txn: TxnId) -> StoreResult<()> {
        if self.commits.is_active(txn) {
            Ok(())
        } else {
            Err(StoreError::TxnNotActive { txn })
        }
    }

    fn record_write(&mut self, txn: TxnId, record_type: &str, id: RecordId) {
        self.writes
            .entry(txn)
            .or_default()
            .push((record_type.to_owned(), id));
    }

    /// Version chain of a record that `txn` may write, as its current head.
    fn writable_chain(
        &mut self,
        txn: TxnId,
        record_type: &str,
        id: RecordId,
    ) -> StoreResult<&mut Vec<Version>> {
        let latest = self.commits.latest();
        let view = ReadView::within(latest, txn);
        let chain = self
            .tables
            .get_mut(record_type)
            .and_then(|table| table.rows.get_mut(&id))
            .filter(|chain| chain.iter().any(|v| v.visible_to(&view)))
            .ok_or_else(|| StoreError::RecordMissing {
                record_type: record_type.to_owned(),
                id,
            })?;
        let foreign = chain.iter().find_map(|v| match (v.created_by, v.ended_by) {
            (Some(holder), _) if holder != txn => Some(holder),
            (_, Some(holder)) if holder != txn => Some(holder),
            _ => None,
        });
        if let Some(holder) = foreign {
            return Err(StoreError::WriteConflict {
                record_type: record_type.to_owned(),
                id,
                holder,
            });
        }
        Ok(chain)
    }

    fn reclaim(&mut self) {
        let horizon = self.commits.oldest_visible();
        let mut reclaimed = 0usize;
        for table in self.tables.values_mut() {
            table.rows.retain(|_, chain| {
                let before = chain.len();
                chain.retain(|v| !v.header.reclaimable(horizon));
                reclaimed += before - chain.len();
                !chain.is_empty()
            });
        }
        if reclaimed > 0 {
            trace!(horizon, reclaimed, "store.reclaim");
        }
    }
}

/// Multi-version in-memory [`RecordStore`].
///
/// Every record keeps a short chain of versions bounded by commit IDs.
/// Readers resolve the version visible to their [`ReadView`]; writers append
/// pending versions that become visible at commit. Versions no open
/// transaction can observe are reclaimed after each commit or rollback.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<Tables>,
    next_txn: AtomicU64,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of transactions currently open in the store.
    pub fn open_transactions(&self) -> usize {
        self.inner.read().commits.active()
    }

    /// Total number of stored versions, including superseded ones still
    /// pinned by open transactions.
    pub fn version_count(&self) -> usize {
        self.inner
            .read()
            .tables
            .values()
            .flat_map(|table| table.rows.values())
            .map(Vec::len)
            .sum()
    }
}

impl RecordStore for MemoryStore {
    fn begin(&self) -> StoreResult<TxnStart> {
        let id = TxnId(self.next_txn.fetch_add(1, Ordering::Relaxed) + 1);
        let snapshot = self.inner.write().commits.register_reader(id);
        trace!(txn = id.0, snapshot, "store.begin");
        Ok(TxnStart { id, snapshot })
    }

    fn snapshot(&self) -> CommitId {
        self.inner.read().commits.latest()
    }

    fn scan(&self, record_type: &str, view: &ReadView) -> StoreResult<Vec<Record>> {
        let guard = self.inner.read();
        let Some(table) = guard.tables.get(record_type) else {
            return Ok(Vec::new());
        };
        Ok(table
            .rows
            .iter()
            .filter_map(|(id, chain)| {
                chain.iter().rev().find(|v| v.visible_to(view)).map(|v| Record {
                    id: *id,
                    fields: v.fields.clone(),
                })
            })
            .collect())
    }

    fn get(&self, record_type: &str, id: RecordId, view: &ReadView) -> StoreResult<Option<Record>> {
        let guard = self.inner.read();
        Ok(guard
            .tables
            .get(record_type)
            .and_then(|table| table.rows.get(&id))
            .and_then(|chain| chain.iter().rev().find(|v| v.visible_to(view)))
            .map(|v| Record {
                id,
                fields: v.fields.clone(),
            }))
    }

    fn insert(&self, txn: TxnId, record_type: &str, fields: Fields) -> StoreResult<RecordId> {
        let mut guard = self.inner.write();
        guard.ensure_active(txn)?;
        let table = guard.tables.entry(record_type.to_owned()).or_default();
        table.next_id += 1;
        let id = RecordId(table.next_id);
        table.rows.insert(
            id,
            vec![Version {
                header: VersionHeader::pending(),
                created_by: Some(txn),
                ended_by: None,
                fields,
            }],
        );
        guard.record_write(txn, record_type, id);
        Ok(id)
    }

    fn update(&self, txn: TxnId, record_type: &str, id: RecordId, fields: Fields) -> StoreResult<()> {
        let mut guard = self.inner.write();
        guard.ensure_active(txn)?;
        let chain = guard.writable_chain(txn, record_type, id)?;
        match chain.last_mut() {
            Some(head) if head.created_by == Some(txn) => head.fields = fields,
            Some(head) => {
                head.header.flags |= flags::PENDING_END;
                head.ended_by = Some(txn);
                chain.push(Version {
                    header: VersionHeader::pending(),
                    created_by: Some(txn),
                    ended_by: None,
                    fields,
                });
            }
            None => {
                return Err(StoreError::RecordMissing {
                    record_type: record_type.to_owned(),
                    id,
                })
            }
        }
        guard.record_write(txn, record_type, id);
        Ok(())
    }

    fn delete(&self, txn: TxnId, record_type: &str, id: RecordId) -> StoreResult<()> {
        let mut guard = self.inner.write();
        guard.ensure_active(txn)?;
        let chain = guard.writable_chain(txn, record_type, id)?;
        if chain.last().is_some_and(|head| head.created_by == Some(txn)) {
            chain.pop();
        }
        if let Some(head) = chain.last_mut() {
            if head.created_by.is_none() {
                head.header.flags |= flags::PENDING_END;
                head.ended_by = Some(txn);
            }
        }
        if chain.is_empty() {
            if let Some(table) = guard.tables.get_mut(record_type) {
                table.rows.remove(&id);
            }
        }
        guard.record_write(txn, record_type, id);
        Ok(())
    }

    fn commit(&self, txn: TxnId) -> StoreResult<CommitId> {
        let mut guard = self.inner.write();
        guard.ensure_active(txn)?;
        let writes = guard.writes.remove(&txn).unwrap_or_default();
        let commit = if writes.is_empty() {
            guard.commits.latest()
        } else {
            guard.commits.advance()
        };
        for (record_type, id) in &writes {
            let Some(chain) = guard
                .tables
                .get_mut(record_type)
                .and_then(|table| table.rows.get_mut(id))
            else {
                continue;
            };
            for version in chain.iter_mut() {
                if version.created_by == Some(txn) {
                    version.header.publish(commit);
                    version.created_by = None;
                }
                if version.ended_by == Some(txn) {
                    version.header.retire(commit);
                    version.ended_by = None;
                }
            }
        }
        guard.commits.release_reader(txn);
        guard.reclaim();
        debug!(txn = txn.0, commit, writes = writes.len(), "store.commit");
        Ok(commit)
    }

    fn rollback(&self, txn: TxnId) -> StoreResult<()> {
        let mut guard = self.inner.write();
        guard.ensure_active(txn)?;
        let writes = guard.writes.remove(&txn).unwrap_or_default();
        for (record_type, id) in &writes {
            let Some(table) = guard.tables.get_mut(record_type) else {
                continue;
            };
            let Some(chain) = table.rows.get_mut(id) else {
                continue;
            };
            chain.retain(|v| v.created_by != Some(txn));
            for version in chain.iter_mut() {
                if version.ended_by == Some(txn) {
                    version.ended_by = None;
                    version.header.flags &= !flags::PENDING_END;
                }
            }
            if chain.is_empty() {
                table.rows.remove(id);
            }
        }
        guard.commits.release_reader(txn);
        guard.reclaim();
        debug!(txn = txn.0, writes = writes.len(), "store.rollback");
        Ok(())
    }
}
