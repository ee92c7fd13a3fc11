//! The store flusher: turns passive dynamic stores into chunk stores.
//!
//! A periodic scan walks every slot and tablet, scheduling overflow and
//! periodic rotations, launching semaphore-bounded flush tasks for passive
//! stores, and, at end of scan, forcing rotations of the heaviest active
//! stores while dynamic memory pressure persists.

use crate::{
    encode_row_block, CommitStoresUpdateRequest, InMemoryManager, Result, SlotManager, Store,
    StoreAddDescriptor, TabletNodeConfig, TabletSlot,
};
use async_core::{AsyncSemaphore, SemaphoreGuard};
use chunk_client::{ChunkWriter, InterceptingChunkWriter};
use data_types::{
    BlocksExt, ChunkId, ChunkMeta, EntityKind, InMemoryMode, MiscExt, MountRevision, StoreId,
    TabletId, Timestamp, VersionedRow,
};
use observability_deps::tracing::{debug, error, info};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

// Flushed chunk ids are allocated node-locally; the high bit namespaces them
// away from master-allocated ids.
static NEXT_FLUSH_CHUNK_UNIQUE: AtomicU64 = AtomicU64::new(1);

fn allocate_chunk_id() -> ChunkId {
    let unique = NEXT_FLUSH_CHUNK_UNIQUE.fetch_add(1, Ordering::Relaxed);
    ChunkId::new(EntityKind::Chunk, (1 << 63) | unique)
}

/// Compute the meta of a chunk holding `rows`.
pub fn chunk_meta_for_rows(rows: &[VersionedRow], block_sizes: Vec<u64>) -> ChunkMeta {
    let mut min_timestamp = Timestamp::MAX;
    let mut max_timestamp = Timestamp::NULL;
    let mut data_weight = 0i64;
    for row in rows {
        for timestamp in row.write_timestamps.iter().chain(&row.delete_timestamps) {
            min_timestamp = min_timestamp.min(*timestamp);
            max_timestamp = max_timestamp.max(*timestamp);
        }
        data_weight += row.values.len() as i64 * 16 + 16;
    }
    let uncompressed: i64 = block_sizes.iter().map(|s| *s as i64).sum();
    ChunkMeta {
        misc: Some(MiscExt {
            row_count: rows.len() as i64,
            uncompressed_data_size: uncompressed,
            compressed_data_size: uncompressed,
            data_weight,
            sealed: true,
            min_key: rows.first().map(|r| r.key.clone()),
            max_key: rows.last().map(|r| r.key.clone()),
            min_timestamp: if rows.is_empty() {
                Timestamp::NULL
            } else {
                min_timestamp
            },
            max_timestamp,
            ..Default::default()
        }),
        blocks: Some(BlocksExt { block_sizes }),
    }
}

#[derive(Debug)]
struct ForcedRotationCandidate {
    memory_usage: i64,
    tablet_id: TabletId,
    slot: Arc<TabletSlot>,
}

/// The store flusher of one node.
#[derive(Debug)]
pub struct StoreFlusher {
    config: TabletNodeConfig,
    slot_manager: Arc<SlotManager>,
    in_memory_manager: Option<Arc<InMemoryManager>>,
    semaphore: Arc<AsyncSemaphore>,
    flush_counter: metric::Metric<metric::U64Counter>,
}

impl StoreFlusher {
    /// Create a flusher over the node's slots.
    pub fn new(
        config: TabletNodeConfig,
        slot_manager: Arc<SlotManager>,
        in_memory_manager: Option<Arc<InMemoryManager>>,
        metric_registry: &metric::Registry,
    ) -> Arc<Self> {
        let semaphore = AsyncSemaphore::new(config.store_flusher.max_concurrent_flushes);
        let flush_counter = metric_registry
            .register_metric("tablet_store_flush_count", "store flushes by outcome");
        Arc::new(Self {
            config,
            slot_manager,
            in_memory_manager,
            semaphore,
            flush_counter,
        })
    }

    /// One full scan over every slot and tablet.
    pub async fn scan_once(self: &Arc<Self>) {
        let mut passive_memory_usage = 0i64;
        let mut total_dynamic_usage = 0i64;
        let mut forced_candidates: Vec<ForcedRotationCandidate> = Vec::new();
        let mut rotations: Vec<(Arc<TabletSlot>, TabletId)> = Vec::new();
        let mut flushes: Vec<(Arc<TabletSlot>, TabletId, MountRevision, Store)> = Vec::new();

        for slot in self.slot_manager.slots() {
            let mut state = slot.state().lock();
            for tablet_id in state.tablet_ids() {
                let Ok(manager) = state.store_manager(tablet_id) else {
                    continue;
                };
                if manager.is_overflow_rotation_needed() && !manager.is_rotation_scheduled() {
                    debug!(%tablet_id, "scheduling store rotation due to overflow");
                    manager.schedule_rotation();
                    rotations.push((Arc::clone(&slot), tablet_id));
                } else if manager.is_periodic_rotation_needed() && !manager.is_rotation_scheduled()
                {
                    info!(%tablet_id, "scheduling periodic store rotation");
                    manager.schedule_rotation();
                    rotations.push((Arc::clone(&slot), tablet_id));
                }

                let mount_revision = manager.tablet().mount_revision;
                for store in manager.flushable_stores() {
                    passive_memory_usage += store.data_size();
                    flushes.push((Arc::clone(&slot), tablet_id, mount_revision, store));
                }
                total_dynamic_usage += manager.tablet().dynamic_memory_usage();

                if manager.is_forced_rotation_possible() && !manager.is_rotation_scheduled() {
                    let active_size = manager
                        .tablet()
                        .active_store()
                        .map(|store| store.data_size())
                        .unwrap_or(0);
                    if active_size >= self.config.store_flusher.min_forced_flush_data_size {
                        forced_candidates.push(ForcedRotationCandidate {
                            memory_usage: active_size,
                            tablet_id,
                            slot: Arc::clone(&slot),
                        });
                    }
                }
            }
        }

        for (slot, tablet_id) in rotations {
            if let Err(e) = slot.rotate_store(tablet_id).await {
                error!(%tablet_id, %e, "error rotating store");
            }
        }

        for (slot, tablet_id, mount_revision, store) in flushes {
            let Some(guard) = self.semaphore.try_acquire() else {
                break;
            };
            let flusher = Arc::clone(self);
            tokio::spawn(async move {
                flusher
                    .flush_store(guard, slot, tablet_id, mount_revision, store)
                    .await;
            });
        }

        // Under sustained pressure, rotate the heaviest active stores until
        // the passive pool would relieve it. Candidates are drained from the
        // back of an ascending sort, so ties resolve deterministically.
        forced_candidates.sort_by(|a, b| {
            a.memory_usage
                .cmp(&b.memory_usage)
                .then(a.tablet_id.cmp(&b.tablet_id))
        });
        while self.is_rotation_forced(total_dynamic_usage, passive_memory_usage)
            && !forced_candidates.is_empty()
        {
            let candidate = forced_candidates.pop().expect("non-empty");
            info!(
                tablet_id = %candidate.tablet_id,
                memory_usage = candidate.memory_usage,
                total_dynamic_usage,
                limit = self.config.tablet_dynamic_memory_limit,
                "scheduling store rotation due to memory pressure"
            );
            {
                let mut state = candidate.slot.state().lock();
                if let Ok(manager) = state.store_manager(candidate.tablet_id) {
                    manager.schedule_rotation();
                }
            }
            if let Err(e) = candidate.slot.rotate_store(candidate.tablet_id).await {
                error!(tablet_id = %candidate.tablet_id, %e, "error force-rotating store");
            }
            passive_memory_usage += candidate.memory_usage;
        }
    }

    fn is_rotation_forced(&self, total_dynamic_usage: i64, passive_memory_usage: i64) -> bool {
        total_dynamic_usage - passive_memory_usage > self.config.tablet_dynamic_memory_limit
    }

    async fn flush_store(
        self: Arc<Self>,
        _guard: SemaphoreGuard,
        slot: Arc<TabletSlot>,
        tablet_id: TabletId,
        mount_revision: MountRevision,
        store: Store,
    ) {
        let store_id = store.id();
        {
            let mut state = slot.state().lock();
            let Ok(manager) = state.store_manager(tablet_id) else {
                return;
            };
            if manager.begin_store_flush(store_id).is_err() {
                return;
            }
        }

        match self
            .do_flush(&slot, tablet_id, mount_revision, &store)
            .await
        {
            Ok(chunk_id) => {
                self.flush_counter.recorder(&[("outcome", "ok")]).inc(1);
                info!(%tablet_id, %store_id, %chunk_id, "store flush completed");
            }
            Err(e) => {
                self.flush_counter.recorder(&[("outcome", "error")]).inc(1);
                error!(%tablet_id, %store_id, %e, "error flushing tablet store, backing off");
                let mut state = slot.state().lock();
                if let Ok(manager) = state.store_manager(tablet_id) {
                    let _ = manager.backoff_store_flush(store_id);
                }
            }
        }
    }

    async fn do_flush(
        &self,
        slot: &Arc<TabletSlot>,
        tablet_id: TabletId,
        mount_revision: MountRevision,
        store: &Store,
    ) -> Result<ChunkId> {
        info!(%tablet_id, store_id = %store.id(), "store flush started");

        // The memory store reader is synchronous; rows stream out in batches
        // of max_rows_per_read.
        let (rows, max_rows_per_read, in_memory_mode, config_revision) = {
            let mut state = slot.state().lock();
            let manager = state.store_manager(tablet_id)?;
            let rows = match store {
                Store::SortedDynamic(dynamic) => dynamic.read_all(),
                Store::OrderedDynamic(ordered) => ordered
                    .read_rows(ordered.starting_row_index(), i64::MAX)
                    .into_iter()
                    .map(|row| VersionedRow {
                        key: data_types::RowKey(vec![data_types::Value::Int64(row.row_index)]),
                        values: row
                            .row
                            .values
                            .iter()
                            .enumerate()
                            .map(|(column_index, value)| data_types::VersionedValue {
                                column_index,
                                value: value.clone(),
                                timestamp: row.commit_timestamp,
                            })
                            .collect(),
                        write_timestamps: vec![row.commit_timestamp],
                        delete_timestamps: vec![],
                    })
                    .collect(),
                Store::Chunk(_) => unreachable!("only dynamic stores flush"),
            };
            (
                rows,
                manager.tablet().mount_config.max_rows_per_read,
                manager.in_memory_mode(),
                manager.in_memory_config_revision(),
            )
        };

        let chunk_id = allocate_chunk_id();
        let backend_writer = slot.chunk_backend().writer(chunk_id);

        // In-memory tablets capture blocks at write time.
        let intercepting_cache = match (&self.in_memory_manager, in_memory_mode) {
            (Some(manager), mode) if mode != InMemoryMode::None => {
                Some(manager.create_intercepting_block_cache(mode, config_revision))
            }
            _ => None,
        };

        let mut block_sizes = Vec::new();
        let write_blocks = async {
            match &intercepting_cache {
                Some(cache) => {
                    let writer =
                        InterceptingChunkWriter::new(backend_writer, Arc::clone(cache) as _);
                    for batch in rows.chunks(max_rows_per_read.max(1)) {
                        let block = encode_row_block(batch);
                        block_sizes.push(block.size() as u64);
                        writer.write_block(block).await?;
                    }
                    let meta = chunk_meta_for_rows(&rows, block_sizes.clone());
                    writer.close(meta.clone()).await?;
                    Ok::<_, crate::Error>(meta)
                }
                None => {
                    for batch in rows.chunks(max_rows_per_read.max(1)) {
                        let block = encode_row_block(batch);
                        block_sizes.push(block.size() as u64);
                        backend_writer.write_block(block).await?;
                    }
                    let meta = chunk_meta_for_rows(&rows, block_sizes.clone());
                    backend_writer.close(meta.clone()).await?;
                    Ok(meta)
                }
            }
        };
        let meta = write_blocks.await?;

        if let Some(manager) = &self.in_memory_manager {
            manager.finalize_chunk(chunk_id, meta.clone())?;
        }

        slot.commit_stores_update(CommitStoresUpdateRequest {
            tablet_id,
            mount_revision,
            stores_to_remove: vec![store.id()],
            stores_to_add: vec![StoreAddDescriptor {
                chunk_id,
                meta,
                backing_store_id: Some(store.id()),
            }],
        })
        .await?;
        Ok(chunk_id)
    }
}

/// Drive the flusher until shutdown.
pub async fn run_store_flusher(flusher: Arc<StoreFlusher>, shutdown: CancellationToken) {
    if !flusher.config.store_flusher.enable_store_flusher {
        return;
    }
    let period = flusher.config.store_flusher.scan_period;
    loop {
        if shutdown.is_cancelled() {
            info!("store flusher shutdown");
            return;
        }
        flusher.scan_once().await;
        tokio::select!(
            _ = tokio::time::sleep(period) => {},
            _ = shutdown.cancelled() => {},
        );
    }
}

/// Used by scanners that remove stores: the removal side of a stores update.
pub fn removal_only_update(
    tablet_id: TabletId,
    mount_revision: MountRevision,
    stores_to_remove: Vec<StoreId>,
) -> CommitStoresUpdateRequest {
    CommitStoresUpdateRequest {
        tablet_id,
        mount_revision,
        stores_to_remove,
        stores_to_add: vec![],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::simple_schema;
    use crate::{ExecuteWriteRequest, OnStoresUpdatedRequest, TableMountConfig, WriteCommand};
    use chunk_client::MemoryChunkStore;
    use clock::{ClusterTag, LocalTimestampProvider, MockProvider, Time};
    use data_types::{CellId, ColumnFilter, RowKey, UnversionedRow, Value};

    fn slot_with_flusher(
        config: TabletNodeConfig,
    ) -> (Arc<TabletSlot>, Arc<StoreFlusher>, Arc<SlotManager>) {
        let slot = TabletSlot::new(
            CellId::new(1),
            config.clone(),
            ClusterTag(1),
            Arc::new(MockProvider::new(Time::from_timestamp_nanos(0))),
            Arc::new(LocalTimestampProvider::new(ClusterTag(1))),
            MemoryChunkStore::new(),
            None,
        );
        let slot_manager = SlotManager::new();
        slot_manager.register_slot(Arc::clone(&slot));
        let flusher = StoreFlusher::new(
            config,
            Arc::clone(&slot_manager),
            None,
            &metric::Registry::new(),
        );
        (slot, flusher, slot_manager)
    }

    fn tablet_id() -> TabletId {
        TabletId::new(1)
    }

    async fn write_rows(slot: &Arc<TabletSlot>, count: i64, base_timestamp: u64) {
        for k in 0..count {
            slot.execute_write(ExecuteWriteRequest {
                tablet_id: tablet_id(),
                mount_revision: MountRevision(1),
                transaction: None,
                commit_timestamp: Some(Timestamp(base_timestamp + k as u64)),
                commands: vec![WriteCommand::Write(UnversionedRow {
                    values: vec![Value::Int64(k), Value::String(format!("value-{k}"))],
                })],
            })
            .await
            .unwrap();
        }
    }

    async fn wait_for_flush(slot: &Arc<TabletSlot>) -> ChunkId {
        for _ in 0..200 {
            let chunk = {
                let mut state = slot.state().lock();
                let manager = state.store_manager(tablet_id()).unwrap();
                manager
                    .tablet()
                    .stores
                    .values()
                    .find_map(|store| store.as_chunk().map(|c| c.chunk_id()))
            };
            if let Some(chunk_id) = chunk {
                return chunk_id;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("flush did not complete");
    }

    #[tokio::test]
    async fn rotate_flush_and_read_back() {
        let (slot, flusher, _slot_manager) = slot_with_flusher(TabletNodeConfig::for_tests());
        slot.create_tablet(tablet_id(), simple_schema(), false, Default::default())
            .unwrap();

        write_rows(&slot, 1000, 100).await;
        slot.rotate_store(tablet_id()).await.unwrap();

        flusher.scan_once().await;
        let chunk_id = wait_for_flush(&slot).await;

        // The chunk exists in the backend and holds all rows.
        assert!(slot.chunk_backend().contains(chunk_id));
        {
            let mut state = slot.state().lock();
            let manager = state.store_manager(tablet_id()).unwrap();
            let chunk_store = manager.tablet().stores[&chunk_id.get()]
                .as_chunk()
                .cloned()
                .unwrap();
            assert_eq!(chunk_store.row_count(), 1000);
            // The flushed dynamic store still backs reads.
            assert!(chunk_store.backing_store().is_some());
        }

        // Reads before the backing release return every row.
        let keys: Vec<RowKey> = (0..1000).map(|k| RowKey(vec![Value::Int64(k)])).collect();
        let rows = slot
            .lookup(tablet_id(), keys.clone(), Timestamp::MAX, ColumnFilter::All)
            .await
            .unwrap();
        assert!(rows.iter().all(|row| row.is_some()));

        // After the master acknowledgment the backing store is gone and the
        // same rows come from chunk blocks.
        slot.acknowledge_stores_update(OnStoresUpdatedRequest {
            tablet_id: tablet_id(),
            chunk_ids: vec![chunk_id],
        })
        .await
        .unwrap();
        let sampled: Vec<RowKey> = (0..1000)
            .step_by(50)
            .map(|k| RowKey(vec![Value::Int64(k)]))
            .collect();
        let rows = slot
            .lookup(tablet_id(), sampled, Timestamp::MAX, ColumnFilter::All)
            .await
            .unwrap();
        assert!(rows.iter().all(|row| row.is_some()));
        assert_eq!(
            rows[3].as_ref().unwrap().values[1],
            Value::String("value-150".to_owned())
        );
    }

    #[tokio::test]
    async fn empty_rotation_produces_no_chunk() {
        let (slot, flusher, _slot_manager) = slot_with_flusher(TabletNodeConfig::for_tests());
        slot.create_tablet(tablet_id(), simple_schema(), false, Default::default())
            .unwrap();

        // Rotate with zero writes: a no-op.
        slot.rotate_store(tablet_id()).await.unwrap();
        flusher.scan_once().await;
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;

        let mut state = slot.state().lock();
        let manager = state.store_manager(tablet_id()).unwrap();
        assert!(manager
            .tablet()
            .stores
            .values()
            .all(|store| store.is_dynamic()));
        assert!(slot.chunk_backend().chunk_ids().is_empty());
    }

    #[tokio::test]
    async fn overflow_triggers_rotation_and_flush() {
        let (slot, flusher, _slot_manager) = slot_with_flusher(TabletNodeConfig::for_tests());
        slot.create_tablet(
            tablet_id(),
            simple_schema(),
            false,
            TableMountConfig {
                max_dynamic_store_row_count: 10,
                ..Default::default()
            },
        )
        .unwrap();

        write_rows(&slot, 10, 100).await;
        // First scan rotates, second scan flushes the rotated store.
        flusher.scan_once().await;
        flusher.scan_once().await;
        let chunk_id = wait_for_flush(&slot).await;
        assert!(slot.chunk_backend().contains(chunk_id));
    }

    #[tokio::test]
    async fn memory_pressure_forces_rotation_of_heaviest_store() {
        let mut config = TabletNodeConfig::for_tests();
        config.tablet_dynamic_memory_limit = 64;
        config.store_flusher.min_forced_flush_data_size = 1;
        let (slot, flusher, _slot_manager) = slot_with_flusher(config);

        let light = TabletId::new(1);
        let heavy = TabletId::new(2);
        for id in [light, heavy] {
            slot.create_tablet(id, simple_schema(), false, Default::default())
                .unwrap();
        }
        // The heavy tablet gets much more data.
        for (tablet, count) in [(light, 1i64), (heavy, 50)] {
            for k in 0..count {
                slot.execute_write(ExecuteWriteRequest {
                    tablet_id: tablet,
                    mount_revision: MountRevision(1),
                    transaction: None,
                    commit_timestamp: Some(Timestamp(100 + k as u64)),
                    commands: vec![WriteCommand::Write(UnversionedRow {
                        values: vec![Value::Int64(k), Value::String("x".repeat(32))],
                    })],
                })
                .await
                .unwrap();
            }
        }

        flusher.scan_once().await;

        // The heavy tablet was force-rotated; the light one may remain.
        let mut state = slot.state().lock();
        let heavy_manager = state.store_manager(heavy).unwrap();
        assert!(heavy_manager
            .tablet()
            .stores
            .values()
            .any(|store| store.state() == data_types::StoreState::PassiveDynamic
                || store.state() == data_types::StoreState::Flushing));
    }
}
