//! The chunk sweeper: frees chunks no tablet references anymore.
//!
//! Compaction and trimming leave replaced chunks behind in the node's chunk
//! backend. The sweeper collects unreferenced candidates and removes those
//! that stayed unreferenced for two consecutive scans, which keeps chunks
//! alive between their flush completing and the stores-update applying.

use crate::{SlotManager, Store, TabletNodeConfig};
use data_types::{CellId, ChunkId};
use observability_deps::tracing::{debug, info};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// The chunk sweeper of one node.
#[derive(Debug)]
pub struct ChunkSweeper {
    config: TabletNodeConfig,
    slot_manager: Arc<SlotManager>,
    previous_candidates: Mutex<HashMap<CellId, HashSet<ChunkId>>>,
}

impl ChunkSweeper {
    /// Create a sweeper over the node's slots.
    pub fn new(config: TabletNodeConfig, slot_manager: Arc<SlotManager>) -> Arc<Self> {
        Arc::new(Self {
            config,
            slot_manager,
            previous_candidates: Mutex::new(HashMap::new()),
        })
    }

    /// One scan: sweep chunks unreferenced in this scan and the previous one.
    pub fn scan_once(&self) -> usize {
        let mut swept = 0;
        for slot in self.slot_manager.slots() {
            let mut referenced: HashSet<ChunkId> = HashSet::new();
            {
                let mut state = slot.state().lock();
                for tablet_id in state.tablet_ids() {
                    let Ok(manager) = state.store_manager(tablet_id) else {
                        continue;
                    };
                    for store in manager.tablet().stores.values() {
                        if let Store::Chunk(chunk_store) = store {
                            referenced.insert(chunk_store.chunk_id());
                        }
                    }
                }
            }

            let backend = slot.chunk_backend();
            let candidates: HashSet<ChunkId> = backend
                .chunk_ids()
                .into_iter()
                .filter(|chunk_id| !referenced.contains(chunk_id))
                .collect();

            let mut previous = self.previous_candidates.lock();
            let slot_previous = previous.entry(slot.cell_id()).or_default();
            for chunk_id in candidates.intersection(slot_previous) {
                if backend.remove(*chunk_id) {
                    debug!(%chunk_id, "unreferenced chunk swept");
                    swept += 1;
                }
            }
            *slot_previous = candidates;
        }
        swept
    }
}

/// Drive the sweeper until shutdown.
pub async fn run_chunk_sweeper(sweeper: Arc<ChunkSweeper>, shutdown: CancellationToken) {
    let period = sweeper.config.store_compactor.scan_period;
    loop {
        if shutdown.is_cancelled() {
            info!("chunk sweeper shutdown");
            return;
        }
        sweeper.scan_once();
        tokio::select!(
            _ = tokio::time::sleep(period) => {},
            _ = shutdown.cancelled() => {},
        );
    }
}
