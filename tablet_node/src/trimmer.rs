//! The ordered tablet trimmer: drops the prefix beyond the retention window.

use crate::{SlotManager, TabletNodeConfig, TabletSlot};
use data_types::TabletId;
use observability_deps::tracing::{error, info};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// The trimmer of one node.
#[derive(Debug)]
pub struct StoreTrimmer {
    config: TabletNodeConfig,
    slot_manager: Arc<SlotManager>,
}

impl StoreTrimmer {
    /// Create a trimmer over the node's slots.
    pub fn new(config: TabletNodeConfig, slot_manager: Arc<SlotManager>) -> Arc<Self> {
        Arc::new(Self {
            config,
            slot_manager,
        })
    }

    /// One scan: compute the trim point of every ordered tablet whose
    /// retention window is exceeded and post the trim mutations.
    pub async fn scan_once(&self) {
        let mut trims: Vec<(Arc<TabletSlot>, TabletId, i64)> = Vec::new();
        for slot in self.slot_manager.slots() {
            let mut state = slot.state().lock();
            for tablet_id in state.tablet_ids() {
                let Ok(manager) = state.store_manager(tablet_id) else {
                    continue;
                };
                let tablet = manager.tablet();
                if !tablet.ordered {
                    continue;
                }
                let retained = tablet.mount_config.retained_row_count;
                if retained == usize::MAX {
                    continue;
                }
                let total_rows = tablet
                    .stores
                    .values()
                    .filter_map(|store| store.as_ordered_dynamic())
                    .map(|store| store.starting_row_index() + store.row_count() as i64)
                    .max()
                    .unwrap_or(0);
                let desired = total_rows - retained as i64;
                if desired > tablet.trimmed_row_count {
                    trims.push((Arc::clone(&slot), tablet_id, desired));
                }
            }
        }

        for (slot, tablet_id, trimmed_row_count) in trims {
            if let Err(e) = slot.trim_rows(tablet_id, trimmed_row_count).await {
                error!(%tablet_id, %e, "error trimming ordered tablet");
            }
        }
    }
}

/// Drive the trimmer until shutdown.
pub async fn run_store_trimmer(trimmer: Arc<StoreTrimmer>, shutdown: CancellationToken) {
    let period = trimmer.config.store_flusher.scan_period;
    loop {
        if shutdown.is_cancelled() {
            info!("store trimmer shutdown");
            return;
        }
        trimmer.scan_once().await;
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
    use crate::{ExecuteWriteRequest, TableMountConfig, TabletSlot, WriteCommand};
    use chunk_client::MemoryChunkStore;
    use clock::{ClusterTag, LocalTimestampProvider, MockProvider, Time};
    use data_types::{CellId, MountRevision, Timestamp, UnversionedRow, Value};

    #[tokio::test]
    async fn trimmer_advances_the_trim_point() {
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
        slot.create_tablet(
            tablet_id,
            simple_schema(),
            true,
            TableMountConfig {
                retained_row_count: 10,
                ..Default::default()
            },
        )
        .unwrap();

        for k in 0..25i64 {
            slot.execute_write(ExecuteWriteRequest {
                tablet_id,
                mount_revision: MountRevision(1),
                transaction: None,
                commit_timestamp: Some(Timestamp(100 + k as u64)),
                commands: vec![WriteCommand::Write(UnversionedRow {
                    values: vec![Value::Int64(k), Value::String("v".to_owned())],
                })],
            })
            .await
            .unwrap();
        }

        let trimmer = StoreTrimmer::new(config, slot_manager);
        trimmer.scan_once().await;

        let mut state = slot.state().lock();
        let manager = state.store_manager(tablet_id).unwrap();
        // 25 rows written, 10 retained.
        assert_eq!(manager.tablet().trimmed_row_count, 15);

        // A second scan with no new rows changes nothing.
        drop(state);
        trimmer.scan_once().await;
        let mut state = slot.state().lock();
        let manager = state.store_manager(tablet_id).unwrap();
        assert_eq!(manager.tablet().trimmed_row_count, 15);
    }
}
