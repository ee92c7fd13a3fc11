//! The immutable chunk store of a tablet.
//!
//! Holds a reference to a chunk plus cached meta. Reads are served, in
//! order of preference, from the backing dynamic store (until the flush is
//! acknowledged), from preloaded in-memory chunk data, or from the chunk
//! itself via block reads.

use crate::{
    decode_row_block, InMemoryChunkData, InvalidStateSnafu, Result, SortedDynamicStore,
};
use chunk_client::{ChunkReader, MemoryChunkStore};
use data_types::{
    ChunkId, ChunkMeta, ColumnFilter, InMemoryMode, RowKey, StoreId, StoreState, Timestamp,
    VersionedRow,
};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Instant;

/// Where a chunk store stands with respect to preloading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreloadState {
    /// Not preloaded and not queued.
    None,
    /// Queued for the preloader.
    Scheduled,
    /// A preload task is running.
    Running,
    /// In-memory data is installed.
    Complete,
    /// The last attempt failed; retry after the deadline.
    Failed,
}

/// An immutable store backed by a chunk.
#[derive(Debug)]
pub struct ChunkStore {
    chunk_id: ChunkId,
    meta: ChunkMeta,
    state: Mutex<StoreState>,
    chunk_backend: Arc<MemoryChunkStore>,
    in_memory: RwLock<Option<Arc<InMemoryChunkData>>>,
    backing_store: Mutex<Option<Arc<SortedDynamicStore>>>,
    preload_state: Mutex<PreloadState>,
    preload_backoff_until: Mutex<Option<Instant>>,
}

impl ChunkStore {
    /// Create a chunk store over a confirmed chunk.
    pub fn new(chunk_id: ChunkId, meta: ChunkMeta, chunk_backend: Arc<MemoryChunkStore>) -> Arc<Self> {
        Arc::new(Self {
            chunk_id,
            meta,
            state: Mutex::new(StoreState::Persistent),
            chunk_backend,
            in_memory: RwLock::new(None),
            backing_store: Mutex::new(None),
            preload_state: Mutex::new(PreloadState::None),
            preload_backoff_until: Mutex::new(None),
        })
    }

    /// The chunk (and store) id.
    pub fn id(&self) -> StoreId {
        self.chunk_id.get()
    }

    /// The underlying chunk id.
    pub fn chunk_id(&self) -> ChunkId {
        self.chunk_id
    }

    /// Cached chunk meta.
    pub fn meta(&self) -> &ChunkMeta {
        &self.meta
    }

    /// The lifecycle state.
    pub fn state(&self) -> StoreState {
        *self.state.lock()
    }

    /// Move the store along its lifecycle.
    pub fn set_state(&self, next: StoreState) -> Result<()> {
        let mut state = self.state.lock();
        let legal = matches!(
            (*state, next),
            (StoreState::Persistent, StoreState::Compacting)
                | (StoreState::Compacting, StoreState::Persistent)
                | (StoreState::Compacting, StoreState::RemoveCommitting)
                | (StoreState::RemoveCommitting, StoreState::Removed)
        );
        if !legal {
            return InvalidStateSnafu {
                entity: format!("chunk store {}", self.chunk_id),
                state: format!("{:?}", *state),
                operation: format!("transition to {next:?}"),
            }
            .fail();
        }
        *state = next;
        Ok(())
    }

    /// Uncompressed size from the meta.
    pub fn data_size(&self) -> i64 {
        self.meta
            .misc
            .as_ref()
            .map(|m| m.uncompressed_data_size)
            .unwrap_or(0)
    }

    /// Row count from the meta.
    pub fn row_count(&self) -> i64 {
        self.meta.misc.as_ref().map(|m| m.row_count).unwrap_or(0)
    }

    /// Smallest key from the meta.
    pub fn min_key(&self) -> Option<&RowKey> {
        self.meta.misc.as_ref().and_then(|m| m.min_key.as_ref())
    }

    /// Largest key from the meta.
    pub fn max_key(&self) -> Option<&RowKey> {
        self.meta.misc.as_ref().and_then(|m| m.max_key.as_ref())
    }

    /// Commit timestamp range from the meta.
    pub fn timestamp_range(&self) -> (Timestamp, Timestamp) {
        self.meta
            .misc
            .as_ref()
            .map(|m| (m.min_timestamp, m.max_timestamp))
            .unwrap_or((Timestamp::NULL, Timestamp::NULL))
    }

    // -----------------------------------------------------------------------
    // Backing store
    // -----------------------------------------------------------------------

    /// Keep serving reads from the flushed dynamic store until the master
    /// acknowledges the stores update.
    pub fn set_backing_store(&self, store: Arc<SortedDynamicStore>) {
        *self.backing_store.lock() = Some(store);
    }

    /// The backing store, if still held.
    pub fn backing_store(&self) -> Option<Arc<SortedDynamicStore>> {
        self.backing_store.lock().clone()
    }

    /// Release the backing store once the flush is fully acknowledged.
    pub fn release_backing_store(&self) {
        *self.backing_store.lock() = None;
    }

    // -----------------------------------------------------------------------
    // Preload bookkeeping
    // -----------------------------------------------------------------------

    /// The preload state.
    pub fn preload_state(&self) -> PreloadState {
        *self.preload_state.lock()
    }

    pub(crate) fn set_preload_state(&self, state: PreloadState) {
        *self.preload_state.lock() = state;
    }

    /// Whether the preloader should pick this store up for `mode`.
    pub fn needs_preload(&self, mode: InMemoryMode) -> bool {
        if mode == InMemoryMode::None {
            return false;
        }
        if let Some(until) = *self.preload_backoff_until.lock() {
            if Instant::now() < until {
                return false;
            }
        }
        match self.preload_state() {
            PreloadState::None | PreloadState::Failed => true,
            PreloadState::Scheduled | PreloadState::Running => false,
            PreloadState::Complete => self
                .in_memory
                .read()
                .as_ref()
                .map(|data| data.mode() != mode)
                .unwrap_or(true),
        }
    }

    pub(crate) fn backoff_preload(&self, backoff: std::time::Duration) {
        *self.preload_backoff_until.lock() = Some(Instant::now() + backoff);
        self.set_preload_state(PreloadState::Failed);
    }

    /// Install preloaded in-memory chunk data.
    pub fn install_in_memory(&self, data: Arc<InMemoryChunkData>) {
        *self.in_memory.write() = Some(data);
        self.set_preload_state(PreloadState::Complete);
        *self.preload_backoff_until.lock() = None;
    }

    /// The installed in-memory data, if any.
    pub fn in_memory(&self) -> Option<Arc<InMemoryChunkData>> {
        self.in_memory.read().clone()
    }

    /// Drop the in-memory data (e.g. on a mode change to `None`).
    pub fn evict_in_memory(&self) {
        *self.in_memory.write() = None;
        self.set_preload_state(PreloadState::None);
    }

    // -----------------------------------------------------------------------
    // Read path
    // -----------------------------------------------------------------------

    fn clip_row(
        row: &VersionedRow,
        timestamp: Timestamp,
        column_filter: &ColumnFilter,
    ) -> Option<VersionedRow> {
        let clipped = VersionedRow {
            key: row.key.clone(),
            values: row
                .values
                .iter()
                .filter(|value| {
                    value.timestamp <= timestamp && column_filter.contains(value.column_index)
                })
                .cloned()
                .collect(),
            write_timestamps: row
                .write_timestamps
                .iter()
                .copied()
                .filter(|ts| *ts <= timestamp)
                .collect(),
            delete_timestamps: row
                .delete_timestamps
                .iter()
                .copied()
                .filter(|ts| *ts <= timestamp)
                .collect(),
        };
        (!clipped.is_empty()).then_some(clipped)
    }

    /// Serve the lookup without suspending, if a synchronous source exists:
    /// the backing dynamic store or installed in-memory data.
    pub fn try_lookup_sync(
        &self,
        key: &RowKey,
        timestamp: Timestamp,
        column_filter: &ColumnFilter,
    ) -> Option<Result<Option<VersionedRow>>> {
        if let Some(backing) = self.backing_store() {
            return match backing.lookup(key, timestamp, column_filter) {
                crate::LookupOutcome::Ok(row) => Some(Ok(row)),
                // A backing store cannot hold prepared locks (it was frozen
                // before the flush), but tolerate the case by falling through
                // to the chunk.
                crate::LookupOutcome::Blocked { .. } => None,
            };
        }
        if let Some(data) = self.in_memory() {
            return Some(Ok(data
                .lookup_row(key)
                .and_then(|row| Self::clip_row(row.as_ref(), timestamp, column_filter))));
        }
        None
    }

    /// Serve the lookup from chunk blocks.
    pub async fn lookup_from_chunk(
        &self,
        key: &RowKey,
        timestamp: Timestamp,
        column_filter: &ColumnFilter,
    ) -> Result<Option<VersionedRow>> {
        let rows = self.read_all_rows().await?;
        Ok(rows
            .iter()
            .find(|row| &row.key == key)
            .and_then(|row| Self::clip_row(row, timestamp, column_filter)))
    }

    /// All versioned rows of the chunk, from memory or blocks.
    pub async fn read_all_rows(&self) -> Result<Vec<VersionedRow>> {
        if let Some(backing) = self.backing_store() {
            return Ok(backing.read_all());
        }
        if let Some(data) = self.in_memory() {
            return Ok(data.rows());
        }
        let reader = self.chunk_backend.reader(self.chunk_id);
        let block_count = self
            .meta
            .blocks
            .as_ref()
            .map(|b| b.block_sizes.len())
            .unwrap_or(usize::MAX);
        let blocks = reader.read_blocks(0, block_count).await?;
        let mut rows = Vec::new();
        for block in &blocks {
            rows.extend(decode_row_block(block)?);
        }
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode_row_block;
    use chunk_client::ChunkWriter;
    use data_types::{EntityKind, MiscExt, Value, VersionedValue};

    fn key(k: i64) -> RowKey {
        RowKey(vec![Value::Int64(k)])
    }

    fn versioned_row(k: i64, ts: u64) -> VersionedRow {
        VersionedRow {
            key: key(k),
            values: vec![VersionedValue {
                column_index: 1,
                value: Value::Int64(k * 10),
                timestamp: Timestamp(ts),
            }],
            write_timestamps: vec![Timestamp(ts)],
            delete_timestamps: vec![],
        }
    }

    async fn store_with_rows(rows: Vec<VersionedRow>) -> Arc<ChunkStore> {
        let backend = MemoryChunkStore::new();
        let chunk_id = ChunkId::new(EntityKind::Chunk, 1);
        let writer = backend.writer(chunk_id);
        writer.write_block(encode_row_block(&rows)).await.unwrap();
        let meta = ChunkMeta {
            misc: Some(MiscExt {
                row_count: rows.len() as i64,
                sealed: true,
                ..Default::default()
            }),
            blocks: None,
        };
        writer.close(meta.clone()).await.unwrap();
        ChunkStore::new(chunk_id, meta, backend)
    }

    #[tokio::test]
    async fn lookup_from_chunk_blocks() {
        let store = store_with_rows(vec![versioned_row(1, 100), versioned_row(2, 200)]).await;

        // No sync source yet.
        assert!(store
            .try_lookup_sync(&key(1), Timestamp::MAX, &ColumnFilter::All)
            .is_none());

        let row = store
            .lookup_from_chunk(&key(1), Timestamp::MAX, &ColumnFilter::All)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.write_timestamps, vec![Timestamp(100)]);

        // Timestamp clipping hides the later row.
        assert!(store
            .lookup_from_chunk(&key(2), Timestamp(150), &ColumnFilter::All)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn backing_store_serves_reads_until_released() {
        let store = store_with_rows(vec![]).await;
        let backing = SortedDynamicStore::new(
            data_types::new_dynamic_store_id(5),
            crate::test_support::simple_schema(),
        );
        backing
            .write_row(
                None,
                &data_types::UnversionedRow {
                    values: vec![Value::Int64(7), Value::String("x".to_owned())],
                },
                Some(Timestamp(50)),
                data_types::LockMask::EMPTY,
            )
            .unwrap();
        store.set_backing_store(backing);

        let found = store
            .try_lookup_sync(&key(7), Timestamp::MAX, &ColumnFilter::All)
            .unwrap()
            .unwrap();
        assert!(found.is_some());

        store.release_backing_store();
        assert!(store
            .try_lookup_sync(&key(7), Timestamp::MAX, &ColumnFilter::All)
            .is_none());
    }

    #[test]
    fn chunk_store_lifecycle() {
        let backend = MemoryChunkStore::new();
        let store = ChunkStore::new(
            ChunkId::new(EntityKind::Chunk, 1),
            ChunkMeta::default(),
            backend,
        );
        assert_eq!(store.state(), StoreState::Persistent);
        store.set_state(StoreState::Compacting).unwrap();
        store.set_state(StoreState::RemoveCommitting).unwrap();
        store.set_state(StoreState::Removed).unwrap();
        assert!(store.set_state(StoreState::Persistent).is_err());
    }
}
