//! The tablet entity.

use crate::{Partition, Store, TableMountConfig};
use data_types::{MountRevision, RowKey, StoreId, TableSchema, TabletId, TabletState};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

/// A tablet: one distribution unit of a table, served by one cell.
#[derive(Debug)]
pub struct Tablet {
    id: TabletId,
    schema: Arc<TableSchema>,
    /// Whether rows are addressed by key (sorted) or by index (ordered).
    pub ordered: bool,
    /// Mount-time configuration.
    pub mount_config: TableMountConfig,
    /// Bumped on every mount.
    pub mount_revision: MountRevision,
    /// The mount state machine.
    pub state: TabletState,
    /// Inclusive lower key bound of this tablet (sorted tablets).
    pub pivot_key: RowKey,
    /// Exclusive upper key bound; `None` means unbounded.
    pub next_pivot_key: Option<RowKey>,
    /// All stores by id, the active one included.
    pub stores: HashMap<StoreId, Store>,
    /// Id of the single active dynamic store.
    pub active_store_id: Option<StoreId>,
    /// The eden partition.
    pub eden: Partition,
    /// Non-eden partitions, pivot-ordered (sorted tablets only).
    pub partitions: Vec<Partition>,
    /// Deduplicates rotation requests.
    pub rotation_scheduled: bool,
    /// When the last rotation happened, for periodic rotation.
    pub last_rotation_at: Instant,
    /// Bumped whenever the in-memory configuration changes.
    pub in_memory_config_revision: u64,
    /// Deterministic source of fresh dynamic store ids.
    pub next_store_unique: u64,
    /// Ordered tablets: rows below this absolute index have been trimmed.
    pub trimmed_row_count: i64,
}

impl Tablet {
    /// Create an unmounted tablet.
    pub fn new(
        id: TabletId,
        schema: Arc<TableSchema>,
        ordered: bool,
        mount_config: TableMountConfig,
        pivot_key: RowKey,
        next_pivot_key: Option<RowKey>,
    ) -> Self {
        Self {
            id,
            schema,
            ordered,
            mount_config,
            mount_revision: MountRevision(0),
            state: TabletState::Unmounted,
            pivot_key,
            next_pivot_key,
            stores: HashMap::new(),
            active_store_id: None,
            eden: Partition::eden(),
            partitions: Vec::new(),
            rotation_scheduled: false,
            last_rotation_at: Instant::now(),
            in_memory_config_revision: 0,
            next_store_unique: id.get().unique() << 20,
            trimmed_row_count: 0,
        }
    }

    /// The tablet id.
    pub fn id(&self) -> TabletId {
        self.id
    }

    /// The table schema.
    pub fn schema(&self) -> &Arc<TableSchema> {
        &self.schema
    }

    /// The active store, if the tablet is mounted.
    pub fn active_store(&self) -> Option<&Store> {
        self.active_store_id.and_then(|id| self.stores.get(&id))
    }

    /// A fresh, deterministic dynamic store id.
    pub fn allocate_store_id(&mut self) -> StoreId {
        self.next_store_unique += 1;
        data_types::new_dynamic_store_id(self.next_store_unique)
    }

    /// The partition containing `key`, if any non-eden partition does.
    pub fn find_containing_partition(&self, key: &RowKey) -> Option<&Partition> {
        self.partitions.iter().find(|p| p.contains(key))
    }

    /// Total size of dynamic stores, the tablet's dynamic memory footprint.
    pub fn dynamic_memory_usage(&self) -> i64 {
        self.stores
            .values()
            .filter(|store| store.is_dynamic())
            .map(|store| store.data_size())
            .sum()
    }
}
