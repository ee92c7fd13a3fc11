//! In-memory chunk data: write-time block interception and preloading.
//!
//! Tablets mounted with an in-memory mode keep their chunk data resident.
//! Freshly flushed chunks are captured at write time by an intercepting
//! block cache; pre-existing chunks are preloaded by a scanner that reads
//! their blocks (decompressing on the compression pool when the mode asks
//! for it) and installs the result into the chunk store.

use crate::{
    decode_row_block, ChunkStore, ConfigRevisionMismatchSnafu, Error, InMemoryManagerConfig,
    MemoryCategory, MemoryGuard, MemoryTracker, PreloadState, ResourceOverdraftSnafu, Result,
};
use async_core::{invoke_on, AsyncSemaphore, PoolInvoker};
use chunk_client::{Block, BlockCache, BlockId, BlockType, ChunkReader, MemoryChunkStore};
use data_types::{ChunkId, ChunkMeta, CompressionCodec, InMemoryMode, RowKey, VersionedRow};
use observability_deps::tracing::{info, warn};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Map an in-memory mode to the block representation it stores.
pub fn block_type_for_mode(mode: InMemoryMode) -> BlockType {
    match mode {
        InMemoryMode::Compressed => BlockType::CompressedData,
        InMemoryMode::Uncompressed => BlockType::UncompressedData,
        InMemoryMode::None => BlockType::None,
    }
}

/// Resident data of one chunk.
#[derive(Debug)]
pub struct InMemoryChunkData {
    mode: InMemoryMode,
    config_revision: u64,
    blocks: RwLock<Vec<Option<Block>>>,
    finalized: RwLock<Option<FinalizedChunkData>>,
    memory_guard: Mutex<Option<MemoryGuard>>,
}

#[derive(Debug)]
struct FinalizedChunkData {
    meta: ChunkMeta,
    rows: Vec<Arc<VersionedRow>>,
    lookup_table: HashMap<RowKey, usize>,
}

impl InMemoryChunkData {
    fn new(mode: InMemoryMode, config_revision: u64, memory_guard: Option<MemoryGuard>) -> Self {
        Self {
            mode,
            config_revision,
            blocks: RwLock::new(Vec::new()),
            finalized: RwLock::new(None),
            memory_guard: Mutex::new(memory_guard),
        }
    }

    /// The mode the data was captured under.
    pub fn mode(&self) -> InMemoryMode {
        self.mode
    }

    /// The in-memory config revision the data was captured under.
    pub fn config_revision(&self) -> u64 {
        self.config_revision
    }

    /// Number of captured blocks.
    pub fn block_count(&self) -> usize {
        self.blocks.read().iter().filter(|b| b.is_some()).count()
    }

    fn put_block(&self, block_index: usize, block: Block) {
        let mut blocks = self.blocks.write();
        if blocks.len() <= block_index {
            // Capacity-doubling growth, mirroring the writer's block order.
            let mut capacity = blocks.capacity().max(1);
            while capacity <= block_index {
                capacity *= 2;
            }
            let len = blocks.len();
            blocks.reserve(capacity - len);
            blocks.resize(block_index + 1, None);
        }
        debug_assert!(blocks[block_index].is_none());
        let size = block.size() as i64;
        blocks[block_index] = Some(block);
        if let Some(guard) = self.memory_guard.lock().as_mut() {
            guard.update_size(guard.size() + size);
        }
    }

    /// Decode the captured blocks and build the lookup hash table.
    pub fn finalize(&self, meta: ChunkMeta) -> Result<()> {
        let blocks = self.blocks.read();
        let mut rows = Vec::new();
        for block in blocks.iter().flatten() {
            for row in decode_row_block(block)? {
                rows.push(Arc::new(row));
            }
        }
        let lookup_table: HashMap<RowKey, usize> = rows
            .iter()
            .enumerate()
            .map(|(index, row)| (row.key.clone(), index))
            .collect();
        *self.finalized.write() = Some(FinalizedChunkData {
            meta,
            rows,
            lookup_table,
        });
        Ok(())
    }

    /// Whether [`InMemoryChunkData::finalize`] has run.
    pub fn is_finalized(&self) -> bool {
        self.finalized.read().is_some()
    }

    /// The finalized chunk meta.
    pub fn meta(&self) -> Option<ChunkMeta> {
        self.finalized.read().as_ref().map(|f| f.meta.clone())
    }

    /// Hash table lookup of one row.
    pub fn lookup_row(&self, key: &RowKey) -> Option<Arc<VersionedRow>> {
        let finalized = self.finalized.read();
        let finalized = finalized.as_ref()?;
        finalized
            .lookup_table
            .get(key)
            .map(|index| Arc::clone(&finalized.rows[*index]))
    }

    /// All resident rows.
    pub fn rows(&self) -> Vec<VersionedRow> {
        self.finalized
            .read()
            .as_ref()
            .map(|f| f.rows.iter().map(|r| (**r).clone()).collect())
            .unwrap_or_default()
    }
}

/// Owns all intercepted and preloaded chunk data on one node.
#[derive(Debug)]
pub struct InMemoryManager {
    config: InMemoryManagerConfig,
    memory_tracker: Arc<MemoryTracker>,
    compression_invoker: Arc<PoolInvoker>,
    preload_semaphore: Arc<AsyncSemaphore>,
    intercepted: RwLock<HashMap<ChunkId, Arc<InMemoryChunkData>>>,
}

impl InMemoryManager {
    /// Create a manager with its preload semaphore.
    pub fn new(config: InMemoryManagerConfig, memory_tracker: Arc<MemoryTracker>) -> Arc<Self> {
        let max_concurrent_preloads = config.max_concurrent_preloads;
        Arc::new(Self {
            config,
            memory_tracker,
            compression_invoker: PoolInvoker::new(),
            preload_semaphore: AsyncSemaphore::new(max_concurrent_preloads),
            intercepted: RwLock::new(HashMap::new()),
        })
    }

    /// The preload semaphore, shared with the preloader scan.
    pub fn preload_semaphore(&self) -> &Arc<AsyncSemaphore> {
        &self.preload_semaphore
    }

    /// A block cache capturing writes for `mode` at `config_revision`.
    pub fn create_intercepting_block_cache(
        self: &Arc<Self>,
        mode: InMemoryMode,
        config_revision: u64,
    ) -> Arc<InterceptingBlockCache> {
        Arc::new(InterceptingBlockCache {
            manager: Arc::clone(self),
            mode,
            config_revision,
            block_type: block_type_for_mode(mode),
            chunk_ids: Mutex::new(HashSet::new()),
            dropped: Mutex::new(false),
        })
    }

    fn get_or_create_chunk_data(
        &self,
        chunk_id: ChunkId,
        mode: InMemoryMode,
        config_revision: u64,
    ) -> Arc<InMemoryChunkData> {
        if let Some(data) = self.intercepted.read().get(&chunk_id) {
            return Arc::clone(data);
        }
        let mut intercepted = self.intercepted.write();
        let data = intercepted.entry(chunk_id).or_insert_with(|| {
            let guard = self
                .memory_tracker
                .acquire(MemoryCategory::TabletStatic, 0)
                .ok();
            info!(%chunk_id, ?mode, config_revision, "intercepted chunk data created");
            Arc::new(InMemoryChunkData::new(mode, config_revision, guard))
        });
        Arc::clone(data)
    }

    /// Drop an intercepted record, e.g. under memory pressure.
    pub fn drop_chunk_data(&self, chunk_id: ChunkId) {
        if self.intercepted.write().remove(&chunk_id).is_some() {
            warn!(%chunk_id, "intercepted chunk data dropped due to memory pressure");
        }
    }

    /// Remove and return intercepted data for installation into a store.
    pub fn evict_intercepted_chunk_data(&self, chunk_id: ChunkId) -> Option<Arc<InMemoryChunkData>> {
        let data = self.intercepted.write().remove(&chunk_id);
        if let Some(data) = &data {
            info!(%chunk_id, mode = ?data.mode(), "intercepted chunk data evicted");
        }
        data
    }

    /// Install the final chunk meta into an intercepted record and build its
    /// lookup hash table.
    pub fn finalize_chunk(&self, chunk_id: ChunkId, meta: ChunkMeta) -> Result<()> {
        let data = {
            let intercepted = self.intercepted.read();
            intercepted.get(&chunk_id).cloned()
        };
        let Some(data) = data else {
            info!(%chunk_id, "cannot find intercepted chunk data for finalization");
            return Ok(());
        };
        data.finalize(meta)
    }

    /// Preload one chunk store's blocks into memory.
    ///
    /// `current_revision` is re-sampled around the blocking work so that a
    /// config change in flight aborts the preload instead of installing
    /// stale data.
    pub async fn preload_store(
        self: &Arc<Self>,
        store: Arc<ChunkStore>,
        chunk_backend: Arc<MemoryChunkStore>,
        mode: InMemoryMode,
        config_revision: u64,
        current_revision: impl Fn() -> u64 + Send,
    ) -> Result<()> {
        // Fail quickly before any I/O.
        let actual = current_revision();
        if actual != config_revision {
            return ConfigRevisionMismatchSnafu {
                expected: config_revision,
                actual,
            }
            .fail();
        }

        info!(chunk_id = %store.chunk_id(), ?mode, config_revision, "store preload started");
        let reader = chunk_backend.reader(store.chunk_id());
        let meta = reader.meta().await?;

        let total_size: i64 = meta
            .blocks
            .as_ref()
            .map(|b| b.block_sizes.iter().map(|s| *s as i64).sum())
            .unwrap_or(0);
        if self.memory_tracker.free(MemoryCategory::TabletStatic) < total_size {
            return ResourceOverdraftSnafu {
                message: "preload cancelled due to memory pressure".to_owned(),
            }
            .fail();
        }

        let block_count = meta
            .blocks
            .as_ref()
            .map(|b| b.block_sizes.len())
            .unwrap_or(usize::MAX);
        let compressed_blocks = reader.read_blocks(0, block_count).await?;

        let codec = meta
            .misc
            .as_ref()
            .map(|m| m.compression_codec)
            .unwrap_or(CompressionCodec::None);
        let blocks = match mode {
            InMemoryMode::Uncompressed => {
                // Decompression runs on the compression pool even for the
                // identity codec, keeping the thread discipline uniform.
                let mut decompressed = Vec::with_capacity(compressed_blocks.len());
                for block in compressed_blocks {
                    let future = invoke_on(&*self.compression_invoker, move || {
                        decompress_block(codec, block)
                    });
                    decompressed.push(future.await.map_err(|e| Error::ChunkIo {
                        message: e.to_string(),
                    })?);
                }
                decompressed
            }
            _ => compressed_blocks,
        };

        // Re-check after the suspension points.
        let actual = current_revision();
        if actual != config_revision {
            return ConfigRevisionMismatchSnafu {
                expected: config_revision,
                actual,
            }
            .fail();
        }

        let guard = self
            .memory_tracker
            .acquire(MemoryCategory::TabletStatic, total_size)?;
        let data = Arc::new(InMemoryChunkData::new(mode, config_revision, Some(guard)));
        for (index, block) in blocks.into_iter().enumerate() {
            data.put_block(index, block);
        }
        data.finalize(meta)?;

        info!(
            chunk_id = %store.chunk_id(),
            block_count = data.block_count(),
            "store preload completed"
        );
        store.install_in_memory(data);
        Ok(())
    }

    /// The retention applied to intercepted data after its writer is gone.
    pub fn retention_time(&self) -> std::time::Duration {
        self.config.intercepted_data_retention_time
    }

    fn is_memory_limit_exceeded(&self) -> bool {
        self.memory_tracker.is_exceeded(MemoryCategory::TabletStatic)
    }
}

/// The store preloader: walks every slot and tablet and brings chunk stores
/// of in-memory tablets into RAM.
#[derive(Debug)]
pub struct StorePreloader {
    slot_manager: Arc<crate::SlotManager>,
    manager: Arc<InMemoryManager>,
    error_backoff: std::time::Duration,
}

impl StorePreloader {
    /// Create a preloader over the node's slots.
    pub fn new(
        config: &crate::TabletNodeConfig,
        slot_manager: Arc<crate::SlotManager>,
        manager: Arc<InMemoryManager>,
    ) -> Arc<Self> {
        Arc::new(Self {
            slot_manager,
            manager,
            error_backoff: config.error_backoff_time,
        })
    }

    /// One scan: launch semaphore-bounded preload tasks for every store
    /// that needs one.
    pub async fn scan_once(self: &Arc<Self>) {
        for slot in self.slot_manager.slots() {
            let mut pending = Vec::new();
            {
                let mut state = slot.state().lock();
                for tablet_id in state.tablet_ids() {
                    let Ok(store_manager) = state.store_manager(tablet_id) else {
                        continue;
                    };
                    let tablet_state = store_manager.tablet().state;
                    if tablet_state.is_in_unmount_workflow() {
                        continue;
                    }
                    let mode = store_manager.in_memory_mode();
                    let config_revision = store_manager.in_memory_config_revision();
                    while let Some(store) = store_manager.peek_store_for_preload() {
                        let Some(guard) = self.manager.preload_semaphore().try_acquire() else {
                            break;
                        };
                        store.set_preload_state(PreloadState::Scheduled);
                        pending.push((tablet_id, mode, config_revision, store, guard));
                    }
                }
            }

            for (tablet_id, mode, config_revision, store, guard) in pending {
                let preloader = Arc::clone(self);
                let slot = Arc::clone(&slot);
                tokio::spawn(async move {
                    let _guard = guard;
                    store.set_preload_state(PreloadState::Running);
                    let revision_slot = Arc::clone(&slot);
                    let result = preloader
                        .manager
                        .preload_store(
                            Arc::clone(&store),
                            Arc::clone(slot.chunk_backend()),
                            mode,
                            config_revision,
                            move || {
                                let mut state = revision_slot.state().lock();
                                state
                                    .store_manager(tablet_id)
                                    .map(|m| m.in_memory_config_revision())
                                    .unwrap_or(u64::MAX)
                            },
                        )
                        .await;
                    if let Err(e) = result {
                        warn!(%tablet_id, chunk_id = %store.chunk_id(), %e,
                            "error preloading tablet store, backing off");
                        store.backoff_preload(preloader.error_backoff);
                    }
                });
            }
        }
    }
}

/// Drive the preloader until shutdown.
pub async fn run_store_preloader(
    preloader: Arc<StorePreloader>,
    period: std::time::Duration,
    shutdown: tokio_util::sync::CancellationToken,
) {
    loop {
        if shutdown.is_cancelled() {
            info!("store preloader shutdown");
            return;
        }
        preloader.scan_once().await;
        tokio::select!(
            _ = tokio::time::sleep(period) => {},
            _ = shutdown.cancelled() => {},
        );
    }
}

fn decompress_block(codec: CompressionCodec, block: Block) -> Block {
    match codec {
        // The block format carries no real compression; the identity codec
        // keeps the pipeline shape.
        CompressionCodec::None => block,
    }
}

/// A [`BlockCache`] that captures a chunk's blocks as they are written.
pub struct InterceptingBlockCache {
    manager: Arc<InMemoryManager>,
    mode: InMemoryMode,
    config_revision: u64,
    block_type: BlockType,
    chunk_ids: Mutex<HashSet<ChunkId>>,
    dropped: Mutex<bool>,
}

impl std::fmt::Debug for InterceptingBlockCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterceptingBlockCache")
            .field("mode", &self.mode)
            .field("config_revision", &self.config_revision)
            .finish()
    }
}

impl BlockCache for InterceptingBlockCache {
    fn put(&self, id: BlockId, block_type: BlockType, block: Block) {
        if block_type != self.block_type {
            return;
        }
        let mut dropped = self.dropped.lock();
        if self.manager.is_memory_limit_exceeded() {
            *dropped = true;
        }
        if *dropped {
            // The chunk is marked for a fresh preload later.
            self.manager.drop_chunk_data(id.chunk_id);
            return;
        }
        drop(dropped);

        self.chunk_ids.lock().insert(id.chunk_id);
        let data =
            self.manager
                .get_or_create_chunk_data(id.chunk_id, self.mode, self.config_revision);
        data.put_block(id.block_index, block);
    }

    fn find(&self, _id: BlockId, _block_type: BlockType) -> Option<Block> {
        None
    }

    fn supported_block_type(&self) -> BlockType {
        self.block_type
    }
}

impl Drop for InterceptingBlockCache {
    fn drop(&mut self) {
        // Intercepted records outlive the writer by the retention time, long
        // enough for the stores-update to install them.
        let retention = self.manager.retention_time();
        let manager = Arc::clone(&self.manager);
        let chunk_ids: Vec<ChunkId> = self.chunk_ids.lock().iter().copied().collect();
        if chunk_ids.is_empty() {
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                tokio::time::sleep(retention).await;
                for chunk_id in chunk_ids {
                    manager.evict_intercepted_chunk_data(chunk_id);
                }
            });
        } else {
            for chunk_id in chunk_ids {
                manager.evict_intercepted_chunk_data(chunk_id);
            }
        }
    }
}
