//! The sorted in-memory MVCC store.
//!
//! Rows live in an ordered map keyed by row key. Each row carries one lock
//! slot per schema lock group; transactional writes stage values under a
//! lock and only the two-phase commit turns them into committed, timestamped
//! versions. Committed versions reference a store-wide revision vector that
//! maps revisions back to commit timestamps.

use crate::{Error, InvalidStateSnafu, Result, RowLockConflictSnafu};
use data_types::{
    ColumnFilter, LockMask, RowKey, StoreId, StoreState, TableSchema, Timestamp, TransactionId,
    UnversionedRow, Value, VersionedRow, VersionedValue,
};
use observability_deps::tracing::trace;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;
use tokio::sync::Notify;

/// What a read found; blocked rows are data, not exceptions, so they never
/// cross an invoker boundary as panics.
#[derive(Debug, Clone, PartialEq)]
pub enum LookupOutcome {
    /// The row (or its absence) at the requested timestamp.
    Ok(Option<VersionedRow>),
    /// A lock with a prepare timestamp below the read timestamp is pending;
    /// wait for the transaction to finish and retry.
    Blocked {
        /// The blocked key.
        key: RowKey,
        /// Which lock blocks the read.
        lock_index: u8,
        /// The blocking prepare timestamp.
        prepared_timestamp: Timestamp,
    },
}

#[derive(Debug, Default, Clone)]
struct LockState {
    writer: Option<TransactionId>,
    prepared_timestamp: Option<Timestamp>,
    last_commit_timestamp: Timestamp,
    staged_values: Vec<(usize, Value)>,
    staged_delete: bool,
}

#[derive(Debug)]
struct DynamicRow {
    locks: Vec<LockState>,
    /// Committed versions per value column, newest last, as (revision, value).
    columns: Vec<Vec<(u32, Value)>>,
    /// Committed deletions, newest last.
    delete_revisions: Vec<u32>,
    /// Commit revisions of whole-row writes, newest last.
    write_revisions: Vec<u32>,
}

impl DynamicRow {
    fn new(lock_count: u8, value_column_count: usize) -> Self {
        Self {
            locks: vec![LockState::default(); lock_count as usize],
            columns: vec![Vec::new(); value_column_count],
            delete_revisions: Vec::new(),
            write_revisions: Vec::new(),
        }
    }

    fn has_committed_data(&self) -> bool {
        !self.write_revisions.is_empty() || !self.delete_revisions.is_empty()
    }
}

#[derive(Debug)]
struct StoreInner {
    rows: BTreeMap<RowKey, DynamicRow>,
    /// Revision -> commit timestamp; revision 0 is reserved for "null".
    revisions: Vec<Timestamp>,
    min_timestamp: Timestamp,
    max_timestamp: Timestamp,
    data_size: i64,
}

impl StoreInner {
    fn register_revision(&mut self, timestamp: Timestamp) -> u32 {
        self.revisions.push(timestamp);
        self.min_timestamp = self.min_timestamp.min(timestamp);
        self.max_timestamp = self.max_timestamp.max(timestamp);
        (self.revisions.len() - 1) as u32
    }

    fn timestamp_from_revision(&self, revision: u32) -> Timestamp {
        self.revisions[revision as usize]
    }
}

/// The sorted dynamic store.
#[derive(Debug)]
pub struct SortedDynamicStore {
    id: StoreId,
    schema: Arc<TableSchema>,
    state: Mutex<StoreState>,
    inner: Mutex<StoreInner>,
    row_unblocked: Notify,
}

impl SortedDynamicStore {
    /// Create an active store.
    pub fn new(id: StoreId, schema: Arc<TableSchema>) -> Arc<Self> {
        Arc::new(Self {
            id,
            schema,
            state: Mutex::new(StoreState::ActiveDynamic),
            inner: Mutex::new(StoreInner {
                rows: BTreeMap::new(),
                revisions: vec![Timestamp::NULL],
                min_timestamp: Timestamp::MAX,
                max_timestamp: Timestamp::NULL,
                data_size: 0,
            }),
            row_unblocked: Notify::new(),
        })
    }

    /// The store id.
    pub fn id(&self) -> StoreId {
        self.id
    }

    /// The table schema.
    pub fn schema(&self) -> &Arc<TableSchema> {
        &self.schema
    }

    /// The lifecycle state.
    pub fn state(&self) -> StoreState {
        *self.state.lock()
    }

    /// Move the store along its lifecycle. Only the documented transitions
    /// are legal.
    pub fn set_state(&self, next: StoreState) -> Result<()> {
        let mut state = self.state.lock();
        let legal = matches!(
            (*state, next),
            (StoreState::ActiveDynamic, StoreState::PassiveDynamic)
                | (StoreState::PassiveDynamic, StoreState::Flushing)
                | (StoreState::Flushing, StoreState::FlushFailed)
                | (StoreState::Flushing, StoreState::Removed)
                | (StoreState::FlushFailed, StoreState::PassiveDynamic)
        );
        if !legal {
            return InvalidStateSnafu {
                entity: format!("store {}", self.id),
                state: format!("{:?}", *state),
                operation: format!("transition to {next:?}"),
            }
            .fail();
        }
        trace!(store_id = %self.id, from = ?*state, to = ?next, "store state changed");
        *state = next;
        Ok(())
    }

    /// Committed row count.
    pub fn row_count(&self) -> usize {
        let inner = self.inner.lock();
        inner.rows.values().filter(|r| r.has_committed_data()).count()
    }

    /// Rough committed payload size in bytes.
    pub fn data_size(&self) -> i64 {
        self.inner.lock().data_size
    }

    /// Smallest committed key, if any.
    pub fn min_key(&self) -> Option<RowKey> {
        self.inner.lock().rows.keys().next().cloned()
    }

    /// Largest committed key, if any.
    pub fn max_key(&self) -> Option<RowKey> {
        self.inner.lock().rows.keys().next_back().cloned()
    }

    /// Commit timestamp range of the store's data.
    pub fn timestamp_range(&self) -> (Timestamp, Timestamp) {
        let inner = self.inner.lock();
        (inner.min_timestamp, inner.max_timestamp)
    }

    fn value_size(value: &Value) -> i64 {
        match value {
            Value::Bytes(b) => 16 + b.len() as i64,
            Value::String(s) => 16 + s.len() as i64,
            _ => 16,
        }
    }

    // -----------------------------------------------------------------------
    // Write path
    // -----------------------------------------------------------------------

    /// Write a row.
    ///
    /// With `commit_timestamp` given (non-transactional writes and replay)
    /// no locks are checked or taken and the row commits immediately.
    /// Otherwise locks are checked and taken for `transaction`, and the
    /// staged values commit later through [`SortedDynamicStore::commit_row`].
    pub fn write_row(
        &self,
        transaction: Option<(TransactionId, Timestamp)>,
        row: &UnversionedRow,
        commit_timestamp: Option<Timestamp>,
        lock_mask: LockMask,
    ) -> Result<RowKey> {
        self.schema
            .validate_row(row)
            .map_err(|source| Error::Schema { source })?;
        let key = row.key(&self.schema);
        let key_column_count = self.schema.key_column_count;
        let staged: Vec<(usize, Value)> = row.values[key_column_count..]
            .iter()
            .enumerate()
            .filter(|(_, value)| !matches!(value, Value::Null))
            .map(|(offset, value)| (key_column_count + offset, value.clone()))
            .collect();

        let lock_count = self.schema.lock_count();
        let value_column_count = self.schema.columns.len() - key_column_count;
        let mut inner = self.inner.lock();
        let row_entry = inner
            .rows
            .entry(key.clone())
            .or_insert_with(|| DynamicRow::new(lock_count, value_column_count));

        match commit_timestamp {
            Some(timestamp) => {
                // Immediate commit path; bypasses locking entirely.
                let row_entry_size: i64 = staged.iter().map(|(_, v)| Self::value_size(v)).sum();
                // Reborrow through the inner lock to register the revision.
                drop(row_entry);
                let revision = inner.register_revision(timestamp);
                let row_entry = inner.rows.get_mut(&key).expect("just inserted");
                for (column_index, value) in staged {
                    row_entry.columns[column_index - key_column_count].push((revision, value));
                }
                row_entry.write_revisions.push(revision);
                for lock in &mut row_entry.locks {
                    lock.last_commit_timestamp = lock.last_commit_timestamp.max(timestamp);
                }
                inner.data_size += row_entry_size + 16;
            }
            None => {
                let (transaction_id, start_timestamp) =
                    transaction.expect("transactional write without transaction");
                Self::check_row_locks(row_entry, transaction_id, start_timestamp, lock_mask, &key)?;
                for lock_index in lock_mask.iter() {
                    let lock = &mut row_entry.locks[lock_index as usize];
                    lock.writer = Some(transaction_id);
                }
                // Stage values under their column's lock.
                for (column_index, value) in staged {
                    let lock_index = self.schema.columns[column_index].lock_index;
                    row_entry.locks[lock_index as usize]
                        .staged_values
                        .push((column_index, value));
                }
            }
        }
        Ok(key)
    }

    /// Delete a row: takes the primary lock (or commits the tombstone
    /// immediately when `commit_timestamp` is given).
    pub fn delete_row(
        &self,
        transaction: Option<(TransactionId, Timestamp)>,
        key: &RowKey,
        commit_timestamp: Option<Timestamp>,
    ) -> Result<()> {
        let lock_count = self.schema.lock_count();
        let value_column_count = self.schema.columns.len() - self.schema.key_column_count;
        let mut inner = self.inner.lock();
        let row_entry = inner
            .rows
            .entry(key.clone())
            .or_insert_with(|| DynamicRow::new(lock_count, value_column_count));

        match commit_timestamp {
            Some(timestamp) => {
                drop(row_entry);
                let revision = inner.register_revision(timestamp);
                let row_entry = inner.rows.get_mut(key).expect("just inserted");
                row_entry.delete_revisions.push(revision);
                for lock in &mut row_entry.locks {
                    lock.last_commit_timestamp = lock.last_commit_timestamp.max(timestamp);
                }
                inner.data_size += 16;
            }
            None => {
                let (transaction_id, start_timestamp) =
                    transaction.expect("transactional delete without transaction");
                Self::check_row_locks(
                    row_entry,
                    transaction_id,
                    start_timestamp,
                    LockMask::PRIMARY,
                    key,
                )?;
                let lock = &mut row_entry.locks[0];
                lock.writer = Some(transaction_id);
                lock.staged_delete = true;
            }
        }
        Ok(())
    }

    fn check_row_locks(
        row: &DynamicRow,
        transaction_id: TransactionId,
        start_timestamp: Timestamp,
        lock_mask: LockMask,
        key: &RowKey,
    ) -> Result<()> {
        for lock_index in lock_mask.iter() {
            let lock = &row.locks[lock_index as usize];
            if let Some(holder) = lock.writer {
                if holder != transaction_id {
                    return RowLockConflictSnafu {
                        key: key.clone(),
                        lock_index,
                        holder,
                    }
                    .fail();
                }
            }
            // A commit later than our snapshot invalidates the write.
            if lock.last_commit_timestamp > start_timestamp {
                return RowLockConflictSnafu {
                    key: key.clone(),
                    lock_index,
                    holder: transaction_id,
                }
                .fail();
            }
        }
        Ok(())
    }

    /// Mark every lock held by `transaction_id` on `key` as prepared.
    pub fn prepare_row(
        &self,
        transaction_id: TransactionId,
        key: &RowKey,
        prepare_timestamp: Timestamp,
    ) {
        let mut inner = self.inner.lock();
        if let Some(row) = inner.rows.get_mut(key) {
            for lock in &mut row.locks {
                if lock.writer == Some(transaction_id) {
                    lock.prepared_timestamp = Some(prepare_timestamp);
                }
            }
        }
    }

    /// Commit the staged writes of `transaction_id` on `key`.
    pub fn commit_row(
        &self,
        transaction_id: TransactionId,
        key: &RowKey,
        commit_timestamp: Timestamp,
    ) {
        let key_column_count = self.schema.key_column_count;
        let mut inner = self.inner.lock();
        let revision = inner.register_revision(commit_timestamp);
        let mut size_delta = 0i64;
        if let Some(row) = inner.rows.get_mut(key) {
            let mut wrote = false;
            for lock in &mut row.locks {
                if lock.writer != Some(transaction_id) {
                    continue;
                }
                for (column_index, value) in std::mem::take(&mut lock.staged_values) {
                    size_delta += Self::value_size(&value);
                    row.columns[column_index - key_column_count].push((revision, value));
                    wrote = true;
                }
                if std::mem::take(&mut lock.staged_delete) {
                    row.delete_revisions.push(revision);
                    size_delta += 16;
                }
                lock.writer = None;
                lock.prepared_timestamp = None;
                lock.last_commit_timestamp = lock.last_commit_timestamp.max(commit_timestamp);
            }
            if wrote {
                row.write_revisions.push(revision);
                size_delta += 16;
            }
        }
        inner.data_size += size_delta;
        drop(inner);
        self.row_unblocked.notify_waiters();
    }

    /// Discard the staged writes of `transaction_id` on `key`.
    pub fn abort_row(&self, transaction_id: TransactionId, key: &RowKey) {
        let mut inner = self.inner.lock();
        if let Some(row) = inner.rows.get_mut(key) {
            for lock in &mut row.locks {
                if lock.writer == Some(transaction_id) {
                    lock.writer = None;
                    lock.prepared_timestamp = None;
                    lock.staged_values.clear();
                    lock.staged_delete = false;
                }
            }
        }
        drop(inner);
        self.row_unblocked.notify_waiters();
    }

    /// The last commit timestamp recorded on one lock of `key`.
    pub fn last_commit_timestamp(&self, key: &RowKey, lock_index: u8) -> Timestamp {
        let inner = self.inner.lock();
        inner
            .rows
            .get(key)
            .map(|row| row.locks[lock_index as usize].last_commit_timestamp)
            .unwrap_or(Timestamp::NULL)
    }

    // -----------------------------------------------------------------------
    // Read path
    // -----------------------------------------------------------------------

    /// Look up `key` at `timestamp`.
    pub fn lookup(
        &self,
        key: &RowKey,
        timestamp: Timestamp,
        column_filter: &ColumnFilter,
    ) -> LookupOutcome {
        let inner = self.inner.lock();
        let Some(row) = inner.rows.get(key) else {
            return LookupOutcome::Ok(None);
        };

        // A prepared-but-uncommitted lock below the read timestamp may still
        // commit below it; the read must wait.
        for (lock_index, lock) in row.locks.iter().enumerate() {
            if let Some(prepared) = lock.prepared_timestamp {
                if prepared < timestamp {
                    return LookupOutcome::Blocked {
                        key: key.clone(),
                        lock_index: lock_index as u8,
                        prepared_timestamp: prepared,
                    };
                }
            }
        }

        LookupOutcome::Ok(self.build_versioned_row(&inner, key, row, timestamp, column_filter))
    }

    fn build_versioned_row(
        &self,
        inner: &StoreInner,
        key: &RowKey,
        row: &DynamicRow,
        timestamp: Timestamp,
        column_filter: &ColumnFilter,
    ) -> Option<VersionedRow> {
        let key_column_count = self.schema.key_column_count;
        let mut result = VersionedRow {
            key: key.clone(),
            ..Default::default()
        };
        for (offset, versions) in row.columns.iter().enumerate() {
            let column_index = key_column_count + offset;
            if !column_filter.contains(column_index) {
                continue;
            }
            for (revision, value) in versions.iter().rev() {
                let version_timestamp = inner.timestamp_from_revision(*revision);
                if version_timestamp <= timestamp {
                    result.values.push(VersionedValue {
                        column_index,
                        value: value.clone(),
                        timestamp: version_timestamp,
                    });
                }
            }
        }
        for revision in row.write_revisions.iter().rev() {
            let version_timestamp = inner.timestamp_from_revision(*revision);
            if version_timestamp <= timestamp {
                result.write_timestamps.push(version_timestamp);
            }
        }
        for revision in row.delete_revisions.iter().rev() {
            let version_timestamp = inner.timestamp_from_revision(*revision);
            if version_timestamp <= timestamp {
                result.delete_timestamps.push(version_timestamp);
            }
        }
        (!result.is_empty()).then_some(result)
    }

    /// Wait until some blocked row may have become unblocked.
    ///
    /// The wait is capped: a commit landing between the caller's lookup and
    /// this call would otherwise be missed, so the caller re-checks
    /// periodically.
    pub async fn wait_row_unblocked(&self) {
        let _ = tokio::time::timeout(
            std::time::Duration::from_millis(10),
            self.row_unblocked.notified(),
        )
        .await;
    }

    /// All committed rows as versioned rows, in key order; the flush and
    /// snapshot reader.
    pub fn read_all(&self) -> Vec<VersionedRow> {
        self.read_range(None, None, Timestamp::MAX)
    }

    /// Committed rows within `[lower, upper)` visible at `timestamp`.
    pub fn read_range(
        &self,
        lower: Option<&RowKey>,
        upper: Option<&RowKey>,
        timestamp: Timestamp,
    ) -> Vec<VersionedRow> {
        let inner = self.inner.lock();
        let lower_bound = lower.map_or(Bound::Unbounded, |k| Bound::Included(k.clone()));
        let upper_bound = upper.map_or(Bound::Unbounded, |k| Bound::Excluded(k.clone()));
        inner
            .rows
            .range((lower_bound, upper_bound))
            .filter_map(|(key, row)| {
                self.build_versioned_row(&inner, key, row, timestamp, &ColumnFilter::All)
            })
            .collect()
    }
}
