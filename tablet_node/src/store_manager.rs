//! Per-tablet store management: write routing, rotation, flush/preload
//! bookkeeping, stores updates and partition operations.

use crate::{
    ChunkStore, InMemoryManager, InvalidStateSnafu, NoSuchStoreSnafu, OrderedDynamicStore,
    Partition, Result, SortedDynamicStore, Store, TableMountConfig, Tablet,
};
use chunk_client::MemoryChunkStore;
use data_types::{
    ChunkId, ChunkMeta, InMemoryMode, LockMask, MountRevision, RowKey, StoreId, StoreState,
    TableSchema, TabletId, TabletState, Timestamp, TransactionId, UnversionedRow,
};
use observability_deps::tracing::{debug, info};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// One row command of a write request.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteCommand {
    /// Insert or update a row.
    Write(UnversionedRow),
    /// Delete a row by key.
    Delete(RowKey),
}

/// A prewritten row, remembered by its transaction for 2PC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowWriteRef {
    /// The tablet written to.
    pub tablet_id: TabletId,
    /// The store holding the staged row.
    pub store_id: StoreId,
    /// The staged key.
    pub key: RowKey,
}

/// A store added by a stores-update mutation.
#[derive(Debug, Clone)]
pub struct StoreAddDescriptor {
    /// The flushed chunk.
    pub chunk_id: ChunkId,
    /// Its meta.
    pub meta: ChunkMeta,
    /// The dynamic store the chunk replaces; kept as backing until the
    /// update is acknowledged.
    pub backing_store_id: Option<StoreId>,
}

/// Owns one tablet's stores and routes every read and write.
#[derive(Debug)]
pub struct StoreManager {
    tablet: Tablet,
    chunk_backend: Arc<MemoryChunkStore>,
    in_memory_manager: Option<Arc<InMemoryManager>>,
    flush_backoff_until: HashMap<StoreId, Instant>,
    error_backoff: Duration,
}

impl StoreManager {
    /// Create a manager for an unmounted tablet.
    pub fn new(
        tablet: Tablet,
        chunk_backend: Arc<MemoryChunkStore>,
        in_memory_manager: Option<Arc<InMemoryManager>>,
        error_backoff: Duration,
    ) -> Self {
        Self {
            tablet,
            chunk_backend,
            in_memory_manager,
            flush_backoff_until: HashMap::new(),
            error_backoff,
        }
    }

    /// The tablet.
    pub fn tablet(&self) -> &Tablet {
        &self.tablet
    }

    /// Mutable tablet access for the mutation handlers.
    pub fn tablet_mut(&mut self) -> &mut Tablet {
        &mut self.tablet
    }

    /// The chunk backend reads and flushes go through.
    pub fn chunk_backend(&self) -> &Arc<MemoryChunkStore> {
        &self.chunk_backend
    }

    /// Mount the tablet: allocate the first active store.
    pub fn mount(&mut self, mount_revision: MountRevision) -> Result<()> {
        if self.tablet.state != TabletState::Unmounted {
            return InvalidStateSnafu {
                entity: format!("tablet {}", self.tablet.id()),
                state: format!("{:?}", self.tablet.state),
                operation: "mount".to_owned(),
            }
            .fail();
        }
        self.tablet.mount_revision = mount_revision;
        self.tablet.state = TabletState::Mounted;
        self.create_active_store();
        info!(tablet_id = %self.tablet.id(), ?mount_revision, "tablet mounted");
        Ok(())
    }

    fn create_active_store(&mut self) {
        let store_id = self.tablet.allocate_store_id();
        let store = if self.tablet.ordered {
            let starting_row_index = self
                .tablet
                .stores
                .values()
                .filter_map(|s| s.as_ordered_dynamic())
                .map(|s| s.starting_row_index() + s.row_count() as i64)
                .max()
                .unwrap_or(0);
            Store::OrderedDynamic(OrderedDynamicStore::new(store_id, 0, starting_row_index))
        } else {
            Store::SortedDynamic(SortedDynamicStore::new(
                store_id,
                Arc::clone(self.tablet.schema()),
            ))
        };
        self.tablet.stores.insert(store_id, store);
        self.tablet.active_store_id = Some(store_id);
        debug!(tablet_id = %self.tablet.id(), %store_id, "active store allocated");
    }

    fn active_sorted_store(&self) -> Result<Arc<SortedDynamicStore>> {
        self.tablet
            .active_store()
            .and_then(|s| s.as_sorted_dynamic().cloned())
            .ok_or_else(|| {
                NoSuchStoreSnafu {
                    store_id: self
                        .tablet
                        .active_store_id
                        .unwrap_or_else(|| data_types::new_dynamic_store_id(0)),
                }
                .build()
            })
    }

    // -----------------------------------------------------------------------
    // Write path
    // -----------------------------------------------------------------------

    /// Execute row commands against the active store.
    ///
    /// With `commit_timestamp` given (non-transactional writes and replay)
    /// rows commit immediately; otherwise locks are taken for `transaction`
    /// and the returned row refs join its prewrite list.
    pub fn execute_write(
        &mut self,
        transaction: Option<(TransactionId, Timestamp)>,
        commands: &[WriteCommand],
        commit_timestamp: Option<Timestamp>,
    ) -> Result<Vec<RowWriteRef>> {
        if self.tablet.state != TabletState::Mounted {
            return InvalidStateSnafu {
                entity: format!("tablet {}", self.tablet.id()),
                state: format!("{:?}", self.tablet.state),
                operation: "write".to_owned(),
            }
            .fail();
        }
        if self.tablet.ordered {
            return self.execute_ordered_write(commands, commit_timestamp);
        }

        let store = self.active_sorted_store()?;
        let schema = Arc::clone(self.tablet.schema());
        let mut row_refs = Vec::with_capacity(commands.len());
        for command in commands {
            match command {
                WriteCommand::Write(row) => {
                    let touched: Vec<usize> = (schema.key_column_count..schema.columns.len())
                        .filter(|i| !matches!(row.values.get(*i), Some(data_types::Value::Null)))
                        .collect();
                    let mut lock_mask = schema.lock_mask_for(touched);
                    if lock_mask == LockMask::EMPTY {
                        lock_mask = LockMask::PRIMARY;
                    }
                    let key = store.write_row(transaction, row, commit_timestamp, lock_mask)?;
                    row_refs.push(RowWriteRef {
                        tablet_id: self.tablet.id(),
                        store_id: store.id(),
                        key,
                    });
                }
                WriteCommand::Delete(key) => {
                    store.delete_row(transaction, key, commit_timestamp)?;
                    row_refs.push(RowWriteRef {
                        tablet_id: self.tablet.id(),
                        store_id: store.id(),
                        key: key.clone(),
                    });
                }
            }
        }
        Ok(row_refs)
    }

    fn execute_ordered_write(
        &mut self,
        commands: &[WriteCommand],
        commit_timestamp: Option<Timestamp>,
    ) -> Result<Vec<RowWriteRef>> {
        // Ordered rows commit at append time; the caller assigns the
        // timestamp (the transaction manager does so in its commit hook).
        let Some(timestamp) = commit_timestamp else {
            return InvalidStateSnafu {
                entity: format!("tablet {}", self.tablet.id()),
                state: "ordered".to_owned(),
                operation: "write without commit timestamp".to_owned(),
            }
            .fail();
        };
        let store = self
            .tablet
            .active_store()
            .and_then(|s| s.as_ordered_dynamic().cloned())
            .ok_or_else(|| {
                NoSuchStoreSnafu {
                    store_id: data_types::new_dynamic_store_id(0),
                }
                .build()
            })?;
        let mut row_refs = Vec::new();
        for command in commands {
            match command {
                WriteCommand::Write(row) => {
                    let row_index = store.append_row(row.clone(), timestamp);
                    row_refs.push(RowWriteRef {
                        tablet_id: self.tablet.id(),
                        store_id: store.id(),
                        key: RowKey(vec![data_types::Value::Int64(row_index)]),
                    });
                }
                WriteCommand::Delete(_) => {
                    return InvalidStateSnafu {
                        entity: format!("tablet {}", self.tablet.id()),
                        state: "ordered".to_owned(),
                        operation: "delete".to_owned(),
                    }
                    .fail();
                }
            }
        }
        Ok(row_refs)
    }

    // -----------------------------------------------------------------------
    // Rotation
    // -----------------------------------------------------------------------

    /// Whether the active store crossed a size threshold.
    pub fn is_overflow_rotation_needed(&self) -> bool {
        let Some(store) = self.tablet.active_store() else {
            return false;
        };
        store.row_count() as usize >= self.tablet.mount_config.max_dynamic_store_row_count
            || store.data_size() >= self.tablet.mount_config.max_dynamic_store_size
    }

    /// Whether the periodic rotation interval elapsed with data present.
    pub fn is_periodic_rotation_needed(&self) -> bool {
        let Some(period) = self.tablet.mount_config.dynamic_store_rotation_period else {
            return false;
        };
        let Some(store) = self.tablet.active_store() else {
            return false;
        };
        store.row_count() > 0 && self.tablet.last_rotation_at.elapsed() >= period
    }

    /// Whether a forced rotation could relieve memory pressure.
    pub fn is_forced_rotation_possible(&self) -> bool {
        self.tablet
            .active_store()
            .map(|store| store.row_count() > 0)
            .unwrap_or(false)
    }

    /// Whether a rotation mutation is already in flight.
    pub fn is_rotation_scheduled(&self) -> bool {
        self.tablet.rotation_scheduled
    }

    /// Mark a rotation mutation as posted.
    pub fn schedule_rotation(&mut self) {
        self.tablet.rotation_scheduled = true;
    }

    /// Apply a rotation: freeze the active store and allocate a fresh one.
    ///
    /// Rotating an empty active store is a no-op, so a rotation with no
    /// intervening writes produces no new chunk downstream.
    pub fn rotate(&mut self) -> Result<bool> {
        self.tablet.rotation_scheduled = false;
        let Some(active) = self.tablet.active_store().cloned() else {
            return Ok(false);
        };
        if active.row_count() == 0 {
            debug!(tablet_id = %self.tablet.id(), "rotation skipped, active store is empty");
            return Ok(false);
        }

        match &active {
            Store::SortedDynamic(store) => store.set_state(StoreState::PassiveDynamic)?,
            Store::OrderedDynamic(store) => store.set_state(StoreState::PassiveDynamic)?,
            Store::Chunk(_) => unreachable!("active store is always dynamic"),
        }
        self.create_active_store();
        self.tablet.last_rotation_at = Instant::now();
        info!(tablet_id = %self.tablet.id(), frozen_store = %active.id(), "store rotated");
        Ok(true)
    }

    // -----------------------------------------------------------------------
    // Flush bookkeeping
    // -----------------------------------------------------------------------

    /// Passive stores eligible for flushing right now.
    pub fn flushable_stores(&self) -> Vec<Store> {
        self.tablet
            .stores
            .values()
            .filter(|store| store.is_dynamic() && store.state() == StoreState::PassiveDynamic)
            .filter(|store| {
                self.flush_backoff_until
                    .get(&store.id())
                    .map(|until| Instant::now() >= *until)
                    .unwrap_or(true)
            })
            .cloned()
            .collect()
    }

    /// Move a passive store into `Flushing`.
    pub fn begin_store_flush(&mut self, store_id: StoreId) -> Result<()> {
        let store = self
            .tablet
            .stores
            .get(&store_id)
            .ok_or_else(|| NoSuchStoreSnafu { store_id }.build())?;
        match store {
            Store::SortedDynamic(s) => s.set_state(StoreState::Flushing),
            Store::OrderedDynamic(s) => s.set_state(StoreState::Flushing),
            Store::Chunk(_) => InvalidStateSnafu {
                entity: format!("store {store_id}"),
                state: "persistent".to_owned(),
                operation: "flush".to_owned(),
            }
            .fail(),
        }
    }

    /// Record a failed flush: the store cools down, then returns to the
    /// flushable pool.
    pub fn backoff_store_flush(&mut self, store_id: StoreId) -> Result<()> {
        let store = self
            .tablet
            .stores
            .get(&store_id)
            .ok_or_else(|| NoSuchStoreSnafu { store_id }.build())?;
        match store {
            Store::SortedDynamic(s) => {
                s.set_state(StoreState::FlushFailed)?;
                s.set_state(StoreState::PassiveDynamic)?;
            }
            Store::OrderedDynamic(s) => {
                s.set_state(StoreState::FlushFailed)?;
                s.set_state(StoreState::PassiveDynamic)?;
            }
            Store::Chunk(_) => {
                return InvalidStateSnafu {
                    entity: format!("store {store_id}"),
                    state: "persistent".to_owned(),
                    operation: "flush backoff".to_owned(),
                }
                .fail()
            }
        }
        self.flush_backoff_until
            .insert(store_id, Instant::now() + self.error_backoff);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Stores update
    // -----------------------------------------------------------------------

    /// Apply a commit-tablet-stores-update mutation: add flushed chunks (in
    /// eden, holding their backing dynamic stores) and drop replaced stores.
    pub fn commit_stores_update(
        &mut self,
        stores_to_remove: &[StoreId],
        stores_to_add: &[StoreAddDescriptor],
    ) -> Result<()> {
        for descriptor in stores_to_add {
            let chunk_store = ChunkStore::new(
                descriptor.chunk_id,
                descriptor.meta.clone(),
                Arc::clone(&self.chunk_backend),
            );

            // Freshly intercepted in-memory data transfers to the store.
            if let Some(manager) = &self.in_memory_manager {
                if let Some(data) = manager.evict_intercepted_chunk_data(descriptor.chunk_id) {
                    if data.is_finalized() {
                        chunk_store.install_in_memory(data);
                    }
                }
            }

            if let Some(backing_id) = descriptor.backing_store_id {
                if let Some(backing) = self
                    .tablet
                    .stores
                    .get(&backing_id)
                    .and_then(|s| s.as_sorted_dynamic().cloned())
                {
                    chunk_store.set_backing_store(backing);
                }
            }

            self.tablet.eden.stores.push(Arc::clone(&chunk_store));
            self.tablet
                .stores
                .insert(chunk_store.id(), Store::Chunk(chunk_store));
        }

        for store_id in stores_to_remove {
            if let Some(store) = self.tablet.stores.remove(store_id) {
                match &store {
                    Store::SortedDynamic(s) => {
                        let _ = s.set_state(StoreState::Removed);
                    }
                    Store::OrderedDynamic(s) => {
                        let _ = s.set_state(StoreState::Removed);
                    }
                    Store::Chunk(s) => {
                        let _ = s.set_state(StoreState::RemoveCommitting);
                        let _ = s.set_state(StoreState::Removed);
                        self.tablet
                            .eden
                            .stores
                            .retain(|existing| existing.id() != *store_id);
                        for partition in &mut self.tablet.partitions {
                            partition.stores.retain(|existing| existing.id() != *store_id);
                        }
                    }
                }
            }
            self.flush_backoff_until.remove(store_id);
        }

        debug!(
            tablet_id = %self.tablet.id(),
            added = stores_to_add.len(),
            removed = stores_to_remove.len(),
            "tablet stores updated"
        );
        Ok(())
    }

    /// Release the backing store of an acknowledged flush.
    pub fn release_backing_store(&mut self, chunk_id: ChunkId) {
        if let Some(Store::Chunk(store)) = self.tablet.stores.get(&chunk_id.get()) {
            store.release_backing_store();
        }
    }

    /// Advance an ordered tablet's trim point, dropping stores entirely
    /// below it.
    pub fn trim_rows(&mut self, trimmed_row_count: i64) -> Result<()> {
        if !self.tablet.ordered {
            return InvalidStateSnafu {
                entity: format!("tablet {}", self.tablet.id()),
                state: "sorted".to_owned(),
                operation: "trim".to_owned(),
            }
            .fail();
        }
        if trimmed_row_count <= self.tablet.trimmed_row_count {
            return Ok(());
        }
        self.tablet.trimmed_row_count = trimmed_row_count;

        let fully_trimmed: Vec<StoreId> = self
            .tablet
            .stores
            .values()
            .filter_map(|store| {
                let ordered = store.as_ordered_dynamic()?;
                let end = ordered.starting_row_index() + ordered.row_count() as i64;
                (ordered.state() == StoreState::PassiveDynamic && end <= trimmed_row_count)
                    .then(|| ordered.id())
            })
            .collect();
        for store_id in &fully_trimmed {
            self.tablet.stores.remove(store_id);
        }
        debug!(
            tablet_id = %self.tablet.id(),
            trimmed_row_count,
            dropped_stores = fully_trimmed.len(),
            "ordered tablet trimmed"
        );
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Partitions
    // -----------------------------------------------------------------------

    /// Split a partition at the given interior pivot keys.
    pub fn split_partition(&mut self, partition_index: usize, pivot_keys: Vec<RowKey>) -> Result<()> {
        if partition_index >= self.tablet.partitions.len() {
            return InvalidStateSnafu {
                entity: format!("tablet {}", self.tablet.id()),
                state: format!("{} partitions", self.tablet.partitions.len()),
                operation: format!("split partition {partition_index}"),
            }
            .fail();
        }
        let old = self.tablet.partitions.remove(partition_index);

        let mut bounds = vec![old.pivot_key.clone()];
        bounds.extend(pivot_keys);
        let mut new_partitions = Vec::with_capacity(bounds.len());
        for (index, pivot) in bounds.iter().enumerate() {
            let next = bounds.get(index + 1).cloned().or_else(|| old.next_pivot_key.clone());
            new_partitions.push(Partition::new(pivot.clone(), next));
        }

        // Stores fall into whichever new partition contains their min key.
        for store in old.stores {
            let index = store
                .min_key()
                .and_then(|key| new_partitions.iter().position(|p| p.contains(key)))
                .unwrap_or(0);
            new_partitions[index].stores.push(store);
        }

        for (offset, partition) in new_partitions.into_iter().enumerate() {
            self.tablet.partitions.insert(partition_index + offset, partition);
        }
        info!(tablet_id = %self.tablet.id(), partition_index, "partition split");
        Ok(())
    }

    /// Collapse partitions `[first_index, last_index]` into one.
    pub fn merge_partitions(&mut self, first_index: usize, last_index: usize) -> Result<()> {
        if first_index > last_index || last_index >= self.tablet.partitions.len() {
            return InvalidStateSnafu {
                entity: format!("tablet {}", self.tablet.id()),
                state: format!("{} partitions", self.tablet.partitions.len()),
                operation: format!("merge partitions {first_index}..={last_index}"),
            }
            .fail();
        }
        let merged_range: Vec<Partition> = self
            .tablet
            .partitions
            .drain(first_index..=last_index)
            .collect();
        let mut merged = Partition::new(
            merged_range.first().expect("non-empty range").pivot_key.clone(),
            merged_range.last().expect("non-empty range").next_pivot_key.clone(),
        );
        for partition in merged_range {
            merged.stores.extend(partition.stores);
        }
        self.tablet.partitions.insert(first_index, merged);
        info!(tablet_id = %self.tablet.id(), first_index, last_index, "partitions merged");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Preload and scan support
    // -----------------------------------------------------------------------

    /// The configured in-memory mode.
    pub fn in_memory_mode(&self) -> InMemoryMode {
        self.tablet.mount_config.in_memory_mode
    }

    /// The in-memory config revision.
    pub fn in_memory_config_revision(&self) -> u64 {
        self.tablet.in_memory_config_revision
    }

    /// Change the in-memory mode, invalidating resident data.
    pub fn set_in_memory_mode(&mut self, mode: InMemoryMode) {
        if self.tablet.mount_config.in_memory_mode == mode {
            return;
        }
        self.tablet.mount_config.in_memory_mode = mode;
        self.tablet.in_memory_config_revision += 1;
        for store in self.tablet.stores.values() {
            if let Store::Chunk(chunk_store) = store {
                chunk_store.evict_in_memory();
            }
        }
    }

    /// The next chunk store the preloader should pick up, if any.
    pub fn peek_store_for_preload(&self) -> Option<Arc<ChunkStore>> {
        let mode = self.in_memory_mode();
        self.tablet.stores.values().find_map(|store| {
            store
                .as_chunk()
                .filter(|chunk_store| chunk_store.needs_preload(mode))
                .cloned()
        })
    }

    /// The stores relevant to a point lookup of `key`: dynamic stores, eden,
    /// and the containing partition.
    pub fn stores_for_key(&self, key: &RowKey) -> Vec<Store> {
        let mut stores: Vec<Store> = self
            .tablet
            .stores
            .values()
            .filter(|store| store.is_dynamic() && store.state() != StoreState::Removed)
            .cloned()
            .collect();
        for chunk_store in &self.tablet.eden.stores {
            stores.push(Store::Chunk(Arc::clone(chunk_store)));
        }
        if let Some(partition) = self.tablet.find_containing_partition(key) {
            for chunk_store in &partition.stores {
                stores.push(Store::Chunk(Arc::clone(chunk_store)));
            }
        }
        stores
    }

    /// The schema, shared with read sessions.
    pub fn schema(&self) -> Arc<TableSchema> {
        Arc::clone(self.tablet.schema())
    }
}

/// Convenience constructor for a mounted sorted tablet, used by the slot and
/// by tests.
pub fn mounted_sorted_tablet(
    tablet_id: TabletId,
    schema: Arc<TableSchema>,
    mount_config: TableMountConfig,
    chunk_backend: Arc<MemoryChunkStore>,
    in_memory_manager: Option<Arc<InMemoryManager>>,
    error_backoff: Duration,
) -> StoreManager {
    let tablet = Tablet::new(
        tablet_id,
        schema,
        false,
        mount_config,
        RowKey::empty(),
        None,
    );
    let mut manager = StoreManager::new(tablet, chunk_backend, in_memory_manager, error_backoff);
    manager.mount(MountRevision(1)).expect("fresh tablet mounts");
    manager
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::simple_schema;
    use assert_matches::assert_matches;
    use data_types::Value;

    fn manager() -> StoreManager {
        mounted_sorted_tablet(
            TabletId::new(1),
            simple_schema(),
            TableMountConfig {
                max_dynamic_store_row_count: 4,
                ..Default::default()
            },
            MemoryChunkStore::new(),
            None,
            Duration::from_millis(10),
        )
    }

    fn write(k: i64, v: &str) -> WriteCommand {
        WriteCommand::Write(UnversionedRow {
            values: vec![Value::Int64(k), Value::String(v.to_owned())],
        })
    }

    fn key(k: i64) -> RowKey {
        RowKey(vec![Value::Int64(k)])
    }

    #[test]
    fn writes_land_in_the_active_store() {
        let mut manager = manager();
        let refs = manager
            .execute_write(None, &[write(1, "a"), write(2, "b")], Some(Timestamp(10)))
            .unwrap();
        assert_eq!(refs.len(), 2);
        assert_eq!(refs[0].store_id, manager.tablet().active_store_id.unwrap());
        assert_eq!(manager.tablet().active_store().unwrap().row_count(), 2);
    }

    #[test]
    fn rotation_freezes_and_replaces_the_active_store() {
        let mut manager = manager();
        manager
            .execute_write(None, &[write(1, "a")], Some(Timestamp(10)))
            .unwrap();
        let old_active = manager.tablet().active_store_id.unwrap();

        assert!(manager.rotate().unwrap());
        let new_active = manager.tablet().active_store_id.unwrap();
        assert_ne!(old_active, new_active);
        assert_eq!(
            manager.tablet().stores[&old_active].state(),
            StoreState::PassiveDynamic
        );
        assert_eq!(manager.flushable_stores().len(), 1);

        // Rotating again with no writes is a no-op.
        assert!(!manager.rotate().unwrap());
        assert_eq!(manager.tablet().active_store_id.unwrap(), new_active);
    }

    #[test]
    fn overflow_rotation_trigger() {
        let mut manager = manager();
        assert!(!manager.is_overflow_rotation_needed());
        for k in 0..4 {
            manager
                .execute_write(None, &[write(k, "v")], Some(Timestamp(10)))
                .unwrap();
        }
        assert!(manager.is_overflow_rotation_needed());
    }

    #[test]
    fn flush_backoff_cycles_the_store_state() {
        let mut manager = manager();
        manager
            .execute_write(None, &[write(1, "a")], Some(Timestamp(10)))
            .unwrap();
        manager.rotate().unwrap();
        let passive_id = manager.flushable_stores()[0].id();

        manager.begin_store_flush(passive_id).unwrap();
        assert!(manager.flushable_stores().is_empty());

        manager.backoff_store_flush(passive_id).unwrap();
        // Within the backoff window the store is not offered.
        assert!(manager.flushable_stores().is_empty());
        std::thread::sleep(Duration::from_millis(15));
        assert_eq!(manager.flushable_stores().len(), 1);
    }

    #[test]
    fn stores_update_installs_chunk_with_backing() {
        let mut manager = manager();
        manager
            .execute_write(None, &[write(1, "a")], Some(Timestamp(10)))
            .unwrap();
        manager.rotate().unwrap();
        let passive_id = manager.flushable_stores()[0].id();
        manager.begin_store_flush(passive_id).unwrap();

        let chunk_id = ChunkId::new(data_types::EntityKind::Chunk, 99);
        manager
            .commit_stores_update(
                &[passive_id],
                &[StoreAddDescriptor {
                    chunk_id,
                    meta: ChunkMeta::default(),
                    backing_store_id: Some(passive_id),
                }],
            )
            .unwrap();

        assert!(!manager.tablet().stores.contains_key(&passive_id));
        let chunk_store = manager.tablet().stores[&chunk_id.get()]
            .as_chunk()
            .cloned()
            .unwrap();
        // Reads still reach the flushed rows through the backing store.
        assert!(chunk_store.backing_store().is_some());
        assert_eq!(manager.tablet().eden.stores.len(), 1);

        manager.release_backing_store(chunk_id);
        assert!(chunk_store.backing_store().is_none());
    }

    #[test]
    fn split_and_merge_partitions_redistribute_stores() {
        let mut manager = manager();
        manager.tablet_mut().partitions = vec![Partition::new(RowKey::empty(), None)];

        let backend = Arc::clone(manager.chunk_backend());
        let low = ChunkStore::new(
            ChunkId::new(data_types::EntityKind::Chunk, 1),
            ChunkMeta {
                misc: Some(data_types::MiscExt {
                    min_key: Some(key(1)),
                    max_key: Some(key(4)),
                    ..Default::default()
                }),
                blocks: None,
            },
            Arc::clone(&backend),
        );
        let high = ChunkStore::new(
            ChunkId::new(data_types::EntityKind::Chunk, 2),
            ChunkMeta {
                misc: Some(data_types::MiscExt {
                    min_key: Some(key(10)),
                    max_key: Some(key(20)),
                    ..Default::default()
                }),
                blocks: None,
            },
            backend,
        );
        manager.tablet_mut().partitions[0].stores.push(low);
        manager.tablet_mut().partitions[0].stores.push(high);

        manager.split_partition(0, vec![key(5)]).unwrap();
        assert_eq!(manager.tablet().partitions.len(), 2);
        assert_eq!(manager.tablet().partitions[0].stores.len(), 1);
        assert_eq!(manager.tablet().partitions[1].stores.len(), 1);
        assert_eq!(manager.tablet().partitions[1].pivot_key, key(5));

        manager.merge_partitions(0, 1).unwrap();
        assert_eq!(manager.tablet().partitions.len(), 1);
        assert_eq!(manager.tablet().partitions[0].stores.len(), 2);
        assert_eq!(manager.tablet().partitions[0].next_pivot_key, None);

        assert_matches!(
            manager.merge_partitions(0, 5),
            Err(crate::Error::InvalidState { .. })
        );
    }

    #[test]
    fn ordered_tablets_append_with_absolute_indexes() {
        let tablet = Tablet::new(
            TabletId::new(2),
            simple_schema(),
            true,
            TableMountConfig::default(),
            RowKey::empty(),
            None,
        );
        let mut manager = StoreManager::new(
            tablet,
            MemoryChunkStore::new(),
            None,
            Duration::from_millis(10),
        );
        manager.mount(MountRevision(1)).unwrap();

        let refs = manager
            .execute_write(None, &[write(10, "a"), write(11, "b")], Some(Timestamp(5)))
            .unwrap();
        assert_eq!(refs[0].key, key(0));
        assert_eq!(refs[1].key, key(1));

        // Rotation carries the absolute index forward.
        manager.rotate().unwrap();
        let refs = manager
            .execute_write(None, &[write(12, "c")], Some(Timestamp(6)))
            .unwrap();
        assert_eq!(refs[0].key, key(2));
    }
}
