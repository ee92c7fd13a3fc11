//! The chunk entity: an immutable unit of storage with multi-replica
//! placement state.

use crate::ChunkTreeStatistics;
use data_types::{
    ChunkId, ChunkListId, ChunkMeta, ChunkReplica, ErasureCodec, MediumIndex, MiscExt, NodeId,
    ReplicaIndex, ReplicationPolicy, RowKey, Timestamp,
};
use std::collections::{BTreeSet, HashMap};

/// Scanner scheduling flags of a chunk.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChunkFlags {
    /// Queued for a replicator refresh.
    pub refresh_scheduled: bool,
    /// Queued for a replication-factor update sweep.
    pub rf_update_scheduled: bool,
    /// Queued for sealing.
    pub seal_scheduled: bool,
}

/// A chunk: confirmed once its meta arrives, sealed (journals) once its row
/// count is final.
#[derive(Debug)]
pub struct Chunk {
    id: ChunkId,
    /// Whether the writer has confirmed the chunk with its meta.
    pub confirmed: bool,
    /// Chunk meta; populated on confirmation.
    pub meta: ChunkMeta,
    /// Per-medium replication requirements.
    pub policy: ReplicationPolicy,
    /// Journal read quorum.
    pub read_quorum: u8,
    /// Journal write quorum.
    pub write_quorum: u8,
    /// Scanner flags.
    pub flags: ChunkFlags,
    /// Stored replicas, at most one per node per medium.
    stored_replicas: Vec<(MediumIndex, ChunkReplica)>,
    /// Cached replicas, if the chunk is cacheable.
    pub cached_replicas: Option<BTreeSet<(MediumIndex, NodeId)>>,
    /// Parent chunk lists; a chunk may appear under the same list repeatedly.
    parents: HashMap<ChunkListId, u32>,
}

impl Chunk {
    /// Create an unconfirmed chunk.
    pub fn new(id: ChunkId, policy: ReplicationPolicy) -> Self {
        Self {
            id,
            confirmed: false,
            meta: ChunkMeta::default(),
            policy,
            read_quorum: 0,
            write_quorum: 0,
            flags: ChunkFlags::default(),
            stored_replicas: Vec::new(),
            cached_replicas: None,
            parents: HashMap::new(),
        }
    }

    /// The chunk id.
    pub fn id(&self) -> ChunkId {
        self.id
    }

    /// Whether this is a journal chunk.
    pub fn is_journal(&self) -> bool {
        self.id.is_journal()
    }

    /// Whether this is an erasure-coded chunk.
    pub fn is_erasure(&self) -> bool {
        self.id.is_erasure()
    }

    /// The erasure codec from the meta, `None` until confirmed.
    pub fn erasure_codec(&self) -> ErasureCodec {
        self.misc().map(|m| m.erasure_codec).unwrap_or_default()
    }

    fn misc(&self) -> Option<&MiscExt> {
        self.meta.misc.as_ref()
    }

    /// Whether the chunk's row count is final. Non-journal chunks are sealed
    /// by construction once confirmed.
    pub fn is_sealed(&self) -> bool {
        if !self.is_journal() {
            return self.confirmed;
        }
        self.misc().map(|m| m.sealed).unwrap_or(false)
    }

    /// Install the final row count of a journal chunk. All replica indexes
    /// collapse to the seal sentinel.
    pub fn seal(&mut self, row_count: i64) {
        let misc = self.meta.misc.get_or_insert_with(Default::default);
        misc.row_count = row_count;
        misc.sealed = true;
        for (_, replica) in &mut self.stored_replicas {
            replica.replica_index = ReplicaIndex::SEAL;
        }
    }

    /// Confirm the chunk with its meta.
    pub fn confirm(&mut self, meta: ChunkMeta) {
        self.meta = meta;
        self.confirmed = true;
    }

    /// Logical row count, 0 until confirmed.
    pub fn row_count(&self) -> i64 {
        self.misc().map(|m| m.row_count).unwrap_or(0)
    }

    /// Smallest key, for sorted chunks.
    pub fn min_key(&self) -> Option<&RowKey> {
        self.misc().and_then(|m| m.min_key.as_ref())
    }

    /// Largest key, for sorted chunks.
    pub fn max_key(&self) -> Option<&RowKey> {
        self.misc().and_then(|m| m.max_key.as_ref())
    }

    /// Largest commit timestamp, for versioned chunks.
    pub fn max_timestamp(&self) -> Timestamp {
        self.misc().map(|m| m.max_timestamp).unwrap_or(Timestamp::NULL)
    }

    /// Statistics of this chunk as a subtree leaf.
    pub fn statistics(&self) -> ChunkTreeStatistics {
        match self.misc() {
            Some(misc) => ChunkTreeStatistics {
                row_count: misc.row_count,
                chunk_count: 1,
                uncompressed_data_size: misc.uncompressed_data_size,
                compressed_data_size: misc.compressed_data_size,
                data_weight: misc.data_weight,
                rank: 0,
                sealed: self.is_sealed(),
            },
            None => ChunkTreeStatistics {
                chunk_count: 1,
                ..ChunkTreeStatistics::empty()
            },
        }
    }

    /// Stored replicas on all media.
    pub fn stored_replicas(&self) -> &[(MediumIndex, ChunkReplica)] {
        &self.stored_replicas
    }

    /// Stored replicas on one medium.
    pub fn stored_replicas_on(
        &self,
        medium: MediumIndex,
    ) -> impl Iterator<Item = ChunkReplica> + '_ {
        self.stored_replicas
            .iter()
            .filter(move |(m, _)| *m == medium)
            .map(|(_, r)| *r)
    }

    /// Add a stored replica; a second replica on the same node and medium is
    /// ignored.
    pub fn add_replica(&mut self, medium: MediumIndex, replica: ChunkReplica) -> bool {
        let duplicate = self
            .stored_replicas
            .iter()
            .any(|(m, r)| *m == medium && r.node_id == replica.node_id);
        if duplicate {
            return false;
        }
        self.stored_replicas.push((medium, replica));
        true
    }

    /// Remove the stored replica held by `node_id` on `medium`.
    pub fn remove_replica(&mut self, medium: MediumIndex, node_id: NodeId) -> bool {
        let before = self.stored_replicas.len();
        self.stored_replicas
            .retain(|(m, r)| !(*m == medium && r.node_id == node_id));
        self.stored_replicas.len() != before
    }

    /// Parent chunk lists with multiplicities.
    pub fn parents(&self) -> &HashMap<ChunkListId, u32> {
        &self.parents
    }

    pub(crate) fn add_parent(&mut self, parent: ChunkListId) {
        *self.parents.entry(parent).or_insert(0) += 1;
    }

    pub(crate) fn remove_parent(&mut self, parent: ChunkListId) {
        if let Some(count) = self.parents.get_mut(&parent) {
            *count -= 1;
            if *count == 0 {
                self.parents.remove(&parent);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use data_types::EntityKind;

    fn journal_chunk() -> Chunk {
        Chunk::new(
            ChunkId::new(EntityKind::JournalChunk, 1),
            ReplicationPolicy::with_factor(3),
        )
    }

    #[test]
    fn replicas_are_unique_per_node_and_medium() {
        let mut chunk = journal_chunk();
        let medium = MediumIndex(0);
        let replica = ChunkReplica {
            node_id: NodeId(1),
            replica_index: ReplicaIndex::GENERIC,
        };

        assert!(chunk.add_replica(medium, replica));
        assert!(!chunk.add_replica(medium, replica));
        // The same node on another medium is a distinct replica.
        assert!(chunk.add_replica(MediumIndex(1), replica));
        assert_eq!(chunk.stored_replicas().len(), 2);

        assert!(chunk.remove_replica(medium, NodeId(1)));
        assert!(!chunk.remove_replica(medium, NodeId(1)));
    }

    #[test]
    fn sealing_fixes_row_count_and_replica_indexes() {
        let mut chunk = journal_chunk();
        chunk.confirm(ChunkMeta {
            misc: Some(MiscExt {
                row_count: 5,
                sealed: false,
                ..Default::default()
            }),
            blocks: None,
        });
        chunk.add_replica(
            MediumIndex(0),
            ChunkReplica {
                node_id: NodeId(1),
                replica_index: ReplicaIndex(2),
            },
        );

        assert!(!chunk.is_sealed());
        chunk.seal(17);
        assert!(chunk.is_sealed());
        assert_eq!(chunk.row_count(), 17);
        assert_eq!(
            chunk.stored_replicas()[0].1.replica_index,
            ReplicaIndex::SEAL
        );
    }

    #[test]
    fn parent_links_are_multisets() {
        let mut chunk = journal_chunk();
        let list = ChunkListId::new(9);

        chunk.add_parent(list);
        chunk.add_parent(list);
        assert_eq!(chunk.parents()[&list], 2);

        chunk.remove_parent(list);
        assert_eq!(chunk.parents()[&list], 1);
        chunk.remove_parent(list);
        assert!(chunk.parents().is_empty());
    }
}
