//! The storage node registry entry.

use data_types::{ChunkId, MediumIndex, NodeId, NodeState, RackId};
use std::collections::{BTreeSet, HashSet};

/// Replication queue priorities: rf==1 is most urgent.
pub const REPLICATION_PRIORITY_COUNT: usize = 3;

/// Load statistics a node reports with every heartbeat.
#[derive(Debug, Clone, Copy, Default)]
pub struct NodeStatistics {
    /// Active write sessions.
    pub session_count: u32,
    /// Used bytes across all locations.
    pub used_space: i64,
    /// Free bytes across all locations.
    pub available_space: i64,
    /// Whether the node refuses new data.
    pub full: bool,
}

/// A storage node as the master sees it.
#[derive(Debug)]
pub struct StorageNode {
    id: NodeId,
    /// The node's RPC address.
    pub address: String,
    /// The failure domain the node lives in.
    pub rack: RackId,
    /// Media the node advertises locations for.
    pub media: BTreeSet<MediumIndex>,
    /// Heartbeat state.
    pub state: NodeState,
    /// Last reported load statistics.
    pub statistics: NodeStatistics,
    /// Chunks with a stored replica on this node.
    pub stored_chunks: HashSet<ChunkId>,
    /// Chunks with a cached replica on this node.
    pub cached_chunks: HashSet<ChunkId>,
    /// Per-priority replication queues consumed by heartbeats.
    pub chunks_to_replicate: [BTreeSet<ChunkId>; REPLICATION_PRIORITY_COUNT],
    /// Removal queue consumed by heartbeats.
    pub chunks_to_remove: BTreeSet<ChunkId>,
}

impl StorageNode {
    /// Create a freshly registered node.
    pub fn new(id: NodeId, address: String, rack: RackId, media: BTreeSet<MediumIndex>) -> Self {
        Self {
            id,
            address,
            rack,
            media,
            state: NodeState::Registered,
            statistics: NodeStatistics::default(),
            stored_chunks: HashSet::new(),
            cached_chunks: HashSet::new(),
            chunks_to_replicate: Default::default(),
            chunks_to_remove: BTreeSet::new(),
        }
    }

    /// The node id.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Fraction of the node's space in use, biased away from 0/0.
    pub fn fill_factor(&self) -> f64 {
        (1.0 + self.statistics.used_space as f64)
            / (1.0 + self.statistics.used_space as f64 + self.statistics.available_space as f64)
    }

    /// Drop all scheduled replicator work, e.g. on re-registration.
    pub fn clear_scheduled_work(&mut self) {
        for queue in &mut self.chunks_to_replicate {
            queue.clear();
        }
        self.chunks_to_remove.clear();
    }

    /// Remove `chunk_id` from every replication queue and the removal queue.
    pub fn purge_chunk(&mut self, chunk_id: ChunkId) {
        for queue in &mut self.chunks_to_replicate {
            queue.remove(&chunk_id);
        }
        self.chunks_to_remove.remove(&chunk_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fill_factor_tracks_usage() {
        let mut node = StorageNode::new(
            NodeId(1),
            "node-1:9012".to_owned(),
            RackId(0),
            BTreeSet::from([MediumIndex(0)]),
        );
        assert!(node.fill_factor() < 1.0);

        node.statistics.used_space = 900;
        node.statistics.available_space = 100;
        assert!((node.fill_factor() - 0.9).abs() < 0.01);

        node.statistics.used_space = 0;
        node.statistics.available_space = 1000;
        assert!(node.fill_factor() < 0.01);
    }

    #[test]
    fn purge_clears_all_queues() {
        let mut node = StorageNode::new(
            NodeId(1),
            "node-1:9012".to_owned(),
            RackId(0),
            BTreeSet::new(),
        );
        let chunk = ChunkId::new(data_types::EntityKind::Chunk, 5);
        node.chunks_to_replicate[0].insert(chunk);
        node.chunks_to_replicate[2].insert(chunk);
        node.chunks_to_remove.insert(chunk);

        node.purge_chunk(chunk);
        assert!(node.chunks_to_replicate.iter().all(|q| q.is_empty()));
        assert!(node.chunks_to_remove.is_empty());
    }
}
