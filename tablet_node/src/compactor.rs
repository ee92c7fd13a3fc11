//! The store compactor: merges runs of small adjacent chunk stores.
//!
//! Same scan shape as the flusher: semaphore-bounded per-tablet tasks picked
//! up by a periodic slot scan. A compaction reads the picked stores' rows,
//! merges their MVCC histories per key, writes one replacement chunk and
//! posts a stores-update swapping the inputs for it.

use crate::{
    chunk_meta_for_rows, encode_row_block, ChunkStore, CommitStoresUpdateRequest, Result,
    SlotManager, StoreAddDescriptor, TabletNodeConfig, TabletSlot,
};
use async_core::{AsyncSemaphore, SemaphoreGuard};
use chunk_client::ChunkWriter;
use data_types::{
    ChunkId, EntityKind, MountRevision, RowKey, StoreState, TabletId, VersionedRow,
};
use observability_deps::tracing::{debug, error, info};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

static NEXT_COMPACTION_CHUNK_UNIQUE: AtomicU64 = AtomicU64::new(1);

fn allocate_chunk_id() -> ChunkId {
    let unique = NEXT_COMPACTION_CHUNK_UNIQUE.fetch_add(1, Ordering::Relaxed);
    ChunkId::new(EntityKind::Chunk, (1 << 62) | unique)
}

/// Merge the versioned histories of the same key from several stores.
pub fn merge_versioned_rows(inputs: Vec<Vec<VersionedRow>>) -> Vec<VersionedRow> {
    let mut merged: BTreeMap<RowKey, VersionedRow> = BTreeMap::new();
    for rows in inputs {
        for row in rows {
            let entry = merged.entry(row.key.clone()).or_insert_with(|| VersionedRow {
                key: row.key.clone(),
                ..Default::default()
            });
            entry.values.extend(row.values);
            entry.write_timestamps.extend(row.write_timestamps);
            entry.delete_timestamps.extend(row.delete_timestamps);
        }
    }
    let mut rows: Vec<VersionedRow> = merged.into_values().collect();
    for row in &mut rows {
        // Newest first, matching what store readers emit.
        row.values
            .sort_by(|a, b| (a.column_index, std::cmp::Reverse(a.timestamp))
                .cmp(&(b.column_index, std::cmp::Reverse(b.timestamp))));
        row.write_timestamps.sort_by_key(|ts| std::cmp::Reverse(*ts));
        row.write_timestamps.dedup();
        row.delete_timestamps.sort_by_key(|ts| std::cmp::Reverse(*ts));
        row.delete_timestamps.dedup();
    }
    rows
}

/// The store compactor of one node.
#[derive(Debug)]
pub struct StoreCompactor {
    config: TabletNodeConfig,
    slot_manager: Arc<SlotManager>,
    semaphore: Arc<AsyncSemaphore>,
}

impl StoreCompactor {
    /// Create a compactor over the node's slots.
    pub fn new(config: TabletNodeConfig, slot_manager: Arc<SlotManager>) -> Arc<Self> {
        let semaphore = AsyncSemaphore::new(config.store_compactor.max_concurrent_compactions);
        Arc::new(Self {
            config,
            slot_manager,
            semaphore,
        })
    }

    /// One scan over all slots; picks at most one run per tablet.
    pub async fn scan_once(self: &Arc<Self>) {
        let mut picked: Vec<(Arc<TabletSlot>, TabletId, MountRevision, Vec<Arc<ChunkStore>>)> =
            Vec::new();
        for slot in self.slot_manager.slots() {
            let mut state = slot.state().lock();
            for tablet_id in state.tablet_ids() {
                let Ok(manager) = state.store_manager(tablet_id) else {
                    continue;
                };
                let mount_revision = manager.tablet().mount_revision;
                let Some(run) = self.pick_compaction_run(manager) else {
                    continue;
                };
                // Claim the stores before releasing the lock.
                let mut claimed = Vec::with_capacity(run.len());
                let mut claim_failed = false;
                for store in &run {
                    if store.set_state(StoreState::Compacting).is_err() {
                        claim_failed = true;
                        break;
                    }
                    claimed.push(Arc::clone(store));
                }
                if claim_failed {
                    for store in claimed {
                        let _ = store.set_state(StoreState::Persistent);
                    }
                    continue;
                }
                picked.push((Arc::clone(&slot), tablet_id, mount_revision, claimed));
            }
        }

        for (slot, tablet_id, mount_revision, run) in picked {
            let Some(guard) = self.semaphore.try_acquire() else {
                for store in &run {
                    let _ = store.set_state(StoreState::Persistent);
                }
                break;
            };
            let compactor = Arc::clone(self);
            tokio::spawn(async move {
                compactor
                    .compact_run(guard, slot, tablet_id, mount_revision, run)
                    .await;
            });
        }
    }

    fn pick_compaction_run(
        &self,
        manager: &mut crate::StoreManager,
    ) -> Option<Vec<Arc<ChunkStore>>> {
        let config = &self.config.store_compactor;
        // Eden first, then each partition; runs never span partitions.
        let tablet = manager.tablet();
        let partitions = std::iter::once(&tablet.eden).chain(tablet.partitions.iter());
        for partition in partitions {
            let small: Vec<Arc<ChunkStore>> = partition
                .stores
                .iter()
                .filter(|store| {
                    store.state() == StoreState::Persistent
                        && store.backing_store().is_none()
                        && store.data_size() <= config.max_compaction_store_size
                })
                .take(config.max_compaction_store_count)
                .cloned()
                .collect();
            if small.len() >= config.min_compaction_store_count {
                return Some(small);
            }
        }
        None
    }

    async fn compact_run(
        self: Arc<Self>,
        _guard: SemaphoreGuard,
        slot: Arc<TabletSlot>,
        tablet_id: TabletId,
        mount_revision: MountRevision,
        run: Vec<Arc<ChunkStore>>,
    ) {
        let store_ids: Vec<_> = run.iter().map(|store| store.id()).collect();
        info!(%tablet_id, ?store_ids, "store compaction started");
        match self.do_compact(&slot, tablet_id, mount_revision, &run).await {
            Ok(chunk_id) => {
                info!(%tablet_id, %chunk_id, "store compaction completed");
            }
            Err(e) => {
                error!(%tablet_id, %e, "error compacting tablet stores, backing off");
                for store in &run {
                    let _ = store.set_state(StoreState::Persistent);
                }
            }
        }
    }

    async fn do_compact(
        &self,
        slot: &Arc<TabletSlot>,
        tablet_id: TabletId,
        mount_revision: MountRevision,
        run: &[Arc<ChunkStore>],
    ) -> Result<ChunkId> {
        let mut inputs = Vec::with_capacity(run.len());
        for store in run {
            inputs.push(store.read_all_rows().await?);
        }
        let rows = merge_versioned_rows(inputs);

        let max_rows_per_read = {
            let mut state = slot.state().lock();
            state
                .store_manager(tablet_id)?
                .tablet()
                .mount_config
                .max_rows_per_read
        };

        let chunk_id = allocate_chunk_id();
        let writer = slot.chunk_backend().writer(chunk_id);
        let mut block_sizes = Vec::new();
        for batch in rows.chunks(max_rows_per_read.max(1)) {
            let block = encode_row_block(batch);
            block_sizes.push(block.size() as u64);
            writer.write_block(block).await?;
        }
        let meta = chunk_meta_for_rows(&rows, block_sizes);
        writer.close(meta.clone()).await?;

        slot.commit_stores_update(CommitStoresUpdateRequest {
            tablet_id,
            mount_revision,
            stores_to_remove: run.iter().map(|store| store.id()).collect(),
            stores_to_add: vec![StoreAddDescriptor {
                chunk_id,
                meta,
                backing_store_id: None,
            }],
        })
        .await?;
        debug!(%tablet_id, %chunk_id, input_count = run.len(), "compaction stores update committed");
        Ok(chunk_id)
    }
}

/// Drive the compactor until shutdown.
pub async fn run_store_compactor(compactor: Arc<StoreCompactor>, shutdown: CancellationToken) {
    if !compactor.config.store_compactor.enable_store_compactor {
        return;
    }
    let period = compactor.config.store_compactor.scan_period;
    loop {
        if shutdown.is_cancelled() {
            info!("store compactor shutdown");
            return;
        }
        compactor.scan_once().await;
        tokio::select!(
            _ = tokio::time::sleep(period) => {},
            _ = shutdown.cancelled() => {},
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::simple_schema;
    use crate::{ExecuteWriteRequest, StoreFlusher, WriteCommand};
    use chunk_client::MemoryChunkStore;
    use clock::{ClusterTag, LocalTimestampProvider, MockProvider, Time};
    use data_types::{
        CellId, ColumnFilter, MountRevision, Timestamp, UnversionedRow, Value,
    };

    fn key(k: i64) -> RowKey {
        RowKey(vec![Value::Int64(k)])
    }

    #[test]
    fn merge_combines_histories_per_key() {
        let a = vec![VersionedRow {
            key: key(1),
            values: vec![data_types::VersionedValue {
                column_index: 1,
                value: Value::String("old".to_owned()),
                timestamp: Timestamp(100),
            }],
            write_timestamps: vec![Timestamp(100)],
            delete_timestamps: vec![],
        }];
        let b = vec![
            VersionedRow {
                key: key(1),
                values: vec![data_types::VersionedValue {
                    column_index: 1,
                    value: Value::String("new".to_owned()),
                    timestamp: Timestamp(200),
                }],
                write_timestamps: vec![Timestamp(200)],
                delete_timestamps: vec![],
            },
            VersionedRow {
                key: key(2),
                values: vec![],
                write_timestamps: vec![],
                delete_timestamps: vec![Timestamp(150)],
            },
        ];

        let merged = merge_versioned_rows(vec![a, b]);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].key, key(1));
        assert_eq!(merged[0].write_timestamps, vec![Timestamp(200), Timestamp(100)]);
        assert_eq!(merged[0].values[0].timestamp, Timestamp(200));
        assert_eq!(merged[1].delete_timestamps, vec![Timestamp(150)]);
    }

    #[tokio::test]
    async fn small_adjacent_chunks_get_merged() {
        let config = TabletNodeConfig::for_tests();
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
        let tablet_id = TabletId::new(1);
        slot.create_tablet(tablet_id, simple_schema(), false, Default::default())
            .unwrap();

        // Produce two small chunks by writing, rotating and flushing twice.
        let flusher = StoreFlusher::new(
            config.clone(),
            Arc::clone(&slot_manager),
            None,
            &metric::Registry::new(),
        );
        for round in 0..2i64 {
            for k in 0..5 {
                slot.execute_write(ExecuteWriteRequest {
                    tablet_id,
                    mount_revision: MountRevision(1),
                    transaction: None,
                    commit_timestamp: Some(Timestamp(100 + (round * 10 + k) as u64)),
                    commands: vec![WriteCommand::Write(UnversionedRow {
                        values: vec![
                            Value::Int64(round * 5 + k),
                            Value::String(format!("r{round}")),
                        ],
                    })],
                })
                .await
                .unwrap();
            }
            slot.rotate_store(tablet_id).await.unwrap();
            flusher.scan_once().await;
            // Wait until this round's flush lands.
            for _ in 0..200 {
                let chunk_count = {
                    let mut state = slot.state().lock();
                    let manager = state.store_manager(tablet_id).unwrap();
                    manager
                        .tablet()
                        .stores
                        .values()
                        .filter(|store| !store.is_dynamic())
                        .count()
                };
                if chunk_count == (round + 1) as usize {
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        }

        // Release the backing stores so the chunks become compactable.
        let chunk_ids: Vec<ChunkId> = {
            let mut state = slot.state().lock();
            let manager = state.store_manager(tablet_id).unwrap();
            manager
                .tablet()
                .stores
                .values()
                .filter_map(|store| store.as_chunk().map(|c| c.chunk_id()))
                .collect()
        };
        assert_eq!(chunk_ids.len(), 2);
        slot.acknowledge_stores_update(crate::OnStoresUpdatedRequest {
            tablet_id,
            chunk_ids: chunk_ids.clone(),
        })
        .await
        .unwrap();

        let compactor = StoreCompactor::new(config, slot_manager);
        compactor.scan_once().await;

        // Eventually one merged chunk replaces the two inputs.
        for _ in 0..200 {
            let done = {
                let mut state = slot.state().lock();
                let manager = state.store_manager(tablet_id).unwrap();
                let chunks: Vec<_> = manager
                    .tablet()
                    .stores
                    .values()
                    .filter_map(|store| store.as_chunk().cloned())
                    .collect();
                chunks.len() == 1 && !chunk_ids.contains(&chunks[0].chunk_id())
            };
            if done {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        // All ten rows survive the merge.
        let keys: Vec<RowKey> = (0..10).map(key).collect();
        let rows = slot
            .lookup(tablet_id, keys, Timestamp::MAX, ColumnFilter::All)
            .await
            .unwrap();
        assert!(rows.iter().all(|row| row.is_some()));
    }
}
