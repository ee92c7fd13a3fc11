//! The ordered (append-only) in-memory store.
//!
//! Rows are appended into segments of doubling capacity under an assigned
//! commit timestamp; readers see a contiguous range addressed by absolute
//! row index, and snapshot rows carry a synthesized
//! `(tablet_index, row_index)` prefix.

use crate::{InvalidStateSnafu, Result};
use data_types::{StoreId, StoreState, Timestamp, UnversionedRow, Value};
use parking_lot::Mutex;
use std::sync::Arc;

const FIRST_SEGMENT_CAPACITY: usize = 16;

/// A row read back from an ordered store, with its synthesized prefix.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderedRow {
    /// Which tablet the row belongs to.
    pub tablet_index: u16,
    /// Absolute row index within the tablet.
    pub row_index: i64,
    /// The commit timestamp the row was appended under.
    pub commit_timestamp: Timestamp,
    /// The row payload.
    pub row: UnversionedRow,
}

#[derive(Debug)]
struct OrderedInner {
    /// Segments of doubling capacity; only the last one grows.
    segments: Vec<Vec<(Timestamp, UnversionedRow)>>,
    row_count: usize,
    data_size: i64,
}

impl OrderedInner {
    fn push(&mut self, timestamp: Timestamp, row: UnversionedRow) {
        let need_new_segment = match self.segments.last() {
            Some(segment) => segment.len() == segment.capacity(),
            None => true,
        };
        if need_new_segment {
            let capacity = self
                .segments
                .last()
                .map(|s| s.capacity() * 2)
                .unwrap_or(FIRST_SEGMENT_CAPACITY);
            self.segments.push(Vec::with_capacity(capacity));
        }
        self.segments.last_mut().expect("segment exists").push((timestamp, row));
        self.row_count += 1;
    }

    fn get(&self, index: usize) -> Option<&(Timestamp, UnversionedRow)> {
        let mut remaining = index;
        for segment in &self.segments {
            if remaining < segment.len() {
                return segment.get(remaining);
            }
            remaining -= segment.len();
        }
        None
    }
}

/// The ordered dynamic store.
#[derive(Debug)]
pub struct OrderedDynamicStore {
    id: StoreId,
    tablet_index: u16,
    /// Absolute index of this store's first row within the tablet.
    starting_row_index: i64,
    state: Mutex<StoreState>,
    inner: Mutex<OrderedInner>,
}

impl OrderedDynamicStore {
    /// Create an active store whose first row has the given absolute index.
    pub fn new(id: StoreId, tablet_index: u16, starting_row_index: i64) -> Arc<Self> {
        Arc::new(Self {
            id,
            tablet_index,
            starting_row_index,
            state: Mutex::new(StoreState::ActiveDynamic),
            inner: Mutex::new(OrderedInner {
                segments: Vec::new(),
                row_count: 0,
                data_size: 0,
            }),
        })
    }

    /// The store id.
    pub fn id(&self) -> StoreId {
        self.id
    }

    /// The lifecycle state.
    pub fn state(&self) -> StoreState {
        *self.state.lock()
    }

    /// Move the store along its lifecycle; same walk as the sorted store.
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
        *state = next;
        Ok(())
    }

    /// Absolute index of the first row.
    pub fn starting_row_index(&self) -> i64 {
        self.starting_row_index
    }

    /// Rows appended so far.
    pub fn row_count(&self) -> usize {
        self.inner.lock().row_count
    }

    /// Rough payload size in bytes.
    pub fn data_size(&self) -> i64 {
        self.inner.lock().data_size
    }

    /// Append a row under its commit timestamp; returns the absolute row
    /// index.
    pub fn append_row(&self, row: UnversionedRow, commit_timestamp: Timestamp) -> i64 {
        let mut inner = self.inner.lock();
        let index = self.starting_row_index + inner.row_count as i64;
        inner.data_size += 16
            + row
                .values
                .iter()
                .map(|v| match v {
                    Value::Bytes(b) => 16 + b.len() as i64,
                    Value::String(s) => 16 + s.len() as i64,
                    _ => 16,
                })
                .sum::<i64>();
        inner.push(commit_timestamp, row);
        index
    }

    /// Read rows in `[lower_row_index, upper_row_index)`, absolute indexes,
    /// clipped to what this store holds.
    pub fn read_rows(&self, lower_row_index: i64, upper_row_index: i64) -> Vec<OrderedRow> {
        let inner = self.inner.lock();
        let first = lower_row_index.max(self.starting_row_index);
        let end = upper_row_index.min(self.starting_row_index + inner.row_count as i64);
        let mut rows = Vec::new();
        let mut index = first;
        while index < end {
            let offset = (index - self.starting_row_index) as usize;
            let (timestamp, row) = inner.get(offset).expect("index within bounds");
            rows.push(OrderedRow {
                tablet_index: self.tablet_index,
                row_index: index,
                commit_timestamp: *timestamp,
                row: row.clone(),
            });
            index += 1;
        }
        rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(v: i64) -> UnversionedRow {
        UnversionedRow {
            values: vec![Value::Int64(v)],
        }
    }

    #[test]
    fn append_assigns_consecutive_absolute_indexes() {
        let store = OrderedDynamicStore::new(data_types::new_dynamic_store_id(1), 3, 100);
        for i in 0..50 {
            assert_eq!(store.append_row(row(i), Timestamp(10 + i as u64)), 100 + i);
        }
        assert_eq!(store.row_count(), 50);

        let rows = store.read_rows(110, 113);
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].row_index, 110);
        assert_eq!(rows[0].tablet_index, 3);
        assert_eq!(rows[0].commit_timestamp, Timestamp(20));
        assert_eq!(rows[2].row.values, vec![Value::Int64(12)]);
    }

    #[test]
    fn segments_double_in_capacity() {
        let store = OrderedDynamicStore::new(data_types::new_dynamic_store_id(1), 0, 0);
        for i in 0..100 {
            store.append_row(row(i), Timestamp(1));
        }
        let inner = store.inner.lock();
        // 16 + 32 + 64 covers 100 rows in three segments.
        assert_eq!(inner.segments.len(), 3);
        assert_eq!(inner.segments[0].capacity(), 16);
        assert_eq!(inner.segments[1].capacity(), 32);
        assert_eq!(inner.segments[2].capacity(), 64);
    }

    #[test]
    fn reads_clip_to_store_bounds() {
        let store = OrderedDynamicStore::new(data_types::new_dynamic_store_id(1), 0, 10);
        for i in 0..5 {
            store.append_row(row(i), Timestamp(1));
        }
        assert!(store.read_rows(0, 10).is_empty());
        assert_eq!(store.read_rows(0, 100).len(), 5);
        assert_eq!(store.read_rows(13, 100).len(), 2);
    }
}
