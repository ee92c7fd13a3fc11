//! The journal chunk sealer.
//!
//! A journal chunk is seal-ready once it is confirmed, attached, unsealed,
//! has a read quorum of replicas, and no owner is mid-update. The seal task
//! itself is asynchronous (it talks to the replica nodes); only the final row
//! count installation is deterministic master state.

use crate::{ChunkMaster, MasterCommunicationFailedSnafu, Result};
use async_trait::async_trait;
use data_types::{ChunkId, NodeId};
use observability_deps::tracing::debug;
use std::collections::VecDeque;

/// Talks to journal replica holders during sealing.
#[async_trait]
pub trait JournalQuorumClient: Send + Sync + std::fmt::Debug {
    /// Abort outstanding write sessions on at least `read_quorum` replicas.
    async fn abort_sessions(
        &self,
        chunk_id: ChunkId,
        replicas: &[NodeId],
        read_quorum: u8,
    ) -> Result<()>;

    /// The row count agreed on by at least `read_quorum` replicas.
    async fn compute_quorum_row_count(
        &self,
        chunk_id: ChunkId,
        replicas: &[NodeId],
        read_quorum: u8,
    ) -> Result<i64>;
}

/// The sealer's scan queue.
#[derive(Debug)]
pub struct SealerState {
    seal_queue: VecDeque<ChunkId>,
    enabled: bool,
}

impl SealerState {
    pub(crate) fn new(enabled: bool) -> Self {
        Self {
            seal_queue: VecDeque::new(),
            enabled,
        }
    }

    /// Chunks waiting to be sealed.
    pub fn queue_len(&self) -> usize {
        self.seal_queue.len()
    }
}

impl ChunkMaster {
    /// Whether sealing `chunk_id` is still outstanding.
    pub fn is_seal_needed(&self, chunk_id: ChunkId) -> bool {
        match self.forest.chunk(chunk_id) {
            Ok(chunk) => chunk.is_journal() && chunk.confirmed && !chunk.is_sealed(),
            Err(_) => false,
        }
    }

    /// Whether a seal task may start for `chunk_id` right now.
    pub fn can_be_sealed(&self, chunk_id: ChunkId) -> bool {
        let Ok(chunk) = self.forest.chunk(chunk_id) else {
            return false;
        };
        self.is_seal_needed(chunk_id)
            && chunk.stored_replicas().len() >= chunk.read_quorum as usize
            && !chunk.parents().is_empty()
    }

    /// Queue a journal chunk for sealing.
    pub fn schedule_chunk_seal(&mut self, chunk_id: ChunkId) {
        if !self.is_seal_needed(chunk_id) {
            return;
        }
        let Ok(chunk) = self.forest.chunk_mut(chunk_id) else {
            return;
        };
        if chunk.flags.seal_scheduled {
            return;
        }
        chunk.flags.seal_scheduled = true;
        self.sealer.seal_queue.push_back(chunk_id);
        debug!(%chunk_id, "chunk added to seal queue");
    }

    /// Dequeue up to the per-pass budget of seal-ready chunks. Chunks that
    /// are needed but not yet ready are requeued by the caller with backoff.
    pub fn seal_pass(&mut self) -> Vec<SealCandidate> {
        if !self.sealer.enabled || !self.config.sealer.enable_chunk_sealer {
            return vec![];
        }
        let mut candidates = Vec::new();
        for _ in 0..self.config.sealer.max_chunks_per_seal {
            let Some(chunk_id) = self.sealer.seal_queue.pop_front() else {
                break;
            };
            if let Ok(chunk) = self.forest.chunk_mut(chunk_id) {
                chunk.flags.seal_scheduled = false;
            }
            if !self.can_be_sealed(chunk_id) {
                continue;
            }
            let chunk = self.forest.chunk(chunk_id).expect("checked above");
            candidates.push(SealCandidate {
                chunk_id,
                read_quorum: chunk.read_quorum,
                replicas: chunk
                    .stored_replicas()
                    .iter()
                    .map(|(_, r)| r.node_id)
                    .collect(),
            });
        }
        candidates
    }

    /// Toggle the sealer, logging the change.
    pub fn set_sealer_enabled(&mut self, enabled: bool) {
        if self.sealer.enabled != enabled {
            observability_deps::tracing::info!(enabled, "chunk sealer toggled");
            self.sealer.enabled = enabled;
        }
    }
}

/// Everything a seal task needs, captured while the master lock was held.
#[derive(Debug, Clone)]
pub struct SealCandidate {
    /// The journal chunk to seal.
    pub chunk_id: ChunkId,
    /// Its read quorum.
    pub read_quorum: u8,
    /// Current replica holders.
    pub replicas: Vec<NodeId>,
}

/// Run one seal: abort sessions at a quorum, compute the quorum row count,
/// then install it. Returns the sealed row count.
pub async fn seal_chunk_via_quorum(
    candidate: &SealCandidate,
    client: &dyn JournalQuorumClient,
) -> Result<i64> {
    if candidate.replicas.is_empty() {
        return MasterCommunicationFailedSnafu {
            message: format!("no replicas of chunk {} are known", candidate.chunk_id),
        }
        .fail();
    }
    client
        .abort_sessions(
            candidate.chunk_id,
            &candidate.replicas,
            candidate.read_quorum,
        )
        .await?;
    client
        .compute_quorum_row_count(
            candidate.chunk_id,
            &candidate.replicas,
            candidate.read_quorum,
        )
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::master::test_fixture::TestMaster;
    use crate::Error;
    use chunk_model::ChunkTreeRef;
    use data_types::{
        ChunkListKind, ChunkMeta, EntityKind, MiscExt, ReplicaIndex, ReplicationPolicy,
        DEFAULT_MEDIUM,
    };
    use parking_lot::Mutex;

    fn journal_chunk(fixture: &mut TestMaster, holders: &[NodeId]) -> ChunkId {
        let chunk_id = fixture.master.create_chunk(
            EntityKind::JournalChunk,
            ReplicationPolicy::with_factor(3),
            2,
            2,
        );
        let replicas = holders
            .iter()
            .map(|n| (*n, DEFAULT_MEDIUM, ReplicaIndex::GENERIC))
            .collect();
        fixture
            .master
            .confirm_chunk(
                chunk_id,
                ChunkMeta {
                    misc: Some(MiscExt {
                        row_count: 0,
                        sealed: false,
                        ..Default::default()
                    }),
                    blocks: None,
                },
                replicas,
            )
            .unwrap();
        chunk_id
    }

    #[derive(Debug, Default)]
    struct MockQuorumClient {
        row_count: i64,
        fail_quorum: bool,
        aborted: Mutex<Vec<ChunkId>>,
    }

    #[async_trait]
    impl JournalQuorumClient for MockQuorumClient {
        async fn abort_sessions(
            &self,
            chunk_id: ChunkId,
            _replicas: &[NodeId],
            _read_quorum: u8,
        ) -> Result<()> {
            self.aborted.lock().push(chunk_id);
            Ok(())
        }

        async fn compute_quorum_row_count(
            &self,
            chunk_id: ChunkId,
            _replicas: &[NodeId],
            _read_quorum: u8,
        ) -> Result<i64> {
            if self.fail_quorum {
                return MasterCommunicationFailedSnafu {
                    message: format!("quorum read failed for {chunk_id}"),
                }
                .fail();
            }
            Ok(self.row_count)
        }
    }

    #[test]
    fn seal_readiness_requires_quorum_and_attachment() {
        let mut fixture = TestMaster::new();
        let a = fixture.online_node(1);
        let b = fixture.online_node(2);
        let chunk = journal_chunk(&mut fixture, &[a]);

        // One replica < read quorum of two.
        assert!(fixture.master.is_seal_needed(chunk));
        assert!(!fixture.master.can_be_sealed(chunk));

        fixture
            .master
            .add_chunk_replica(b, chunk, DEFAULT_MEDIUM, ReplicaIndex::GENERIC)
            .unwrap();
        // Still detached from any chunk list.
        assert!(!fixture.master.can_be_sealed(chunk));

        let root = fixture.master.create_chunk_list(ChunkListKind::JournalRoot);
        fixture
            .master
            .attach(root, &[ChunkTreeRef::Chunk(chunk)])
            .unwrap();
        assert!(fixture.master.can_be_sealed(chunk));
    }

    #[tokio::test]
    async fn seal_pass_produces_candidates_and_quorum_seals() {
        let mut fixture = TestMaster::new();
        let a = fixture.online_node(1);
        let b = fixture.online_node(2);
        let chunk = journal_chunk(&mut fixture, &[a, b]);
        let root = fixture.master.create_chunk_list(ChunkListKind::JournalRoot);
        fixture
            .master
            .attach(root, &[ChunkTreeRef::Chunk(chunk)])
            .unwrap();

        fixture.master.schedule_chunk_seal(chunk);
        let candidates = fixture.master.seal_pass();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].chunk_id, chunk);
        assert_eq!(candidates[0].replicas.len(), 2);

        let client = MockQuorumClient {
            row_count: 1234,
            ..Default::default()
        };
        let row_count = seal_chunk_via_quorum(&candidates[0], &client).await.unwrap();
        fixture.master.seal_chunk(chunk, row_count).unwrap();

        let sealed = fixture.master.forest().chunk(chunk).unwrap();
        assert!(sealed.is_sealed());
        assert_eq!(sealed.row_count(), 1234);
        assert_eq!(
            sealed.stored_replicas()[0].1.replica_index,
            ReplicaIndex::SEAL
        );
        assert_eq!(*client.aborted.lock(), vec![chunk]);

        // Sealing is terminal; the chunk does not requeue.
        fixture.master.schedule_chunk_seal(chunk);
        assert!(fixture.master.seal_pass().is_empty());
    }

    #[tokio::test]
    async fn failed_quorum_leaves_chunk_unsealed() {
        let mut fixture = TestMaster::new();
        let a = fixture.online_node(1);
        let b = fixture.online_node(2);
        let chunk = journal_chunk(&mut fixture, &[a, b]);
        let root = fixture.master.create_chunk_list(ChunkListKind::JournalRoot);
        fixture
            .master
            .attach(root, &[ChunkTreeRef::Chunk(chunk)])
            .unwrap();

        fixture.master.schedule_chunk_seal(chunk);
        let candidates = fixture.master.seal_pass();
        let client = MockQuorumClient {
            fail_quorum: true,
            ..Default::default()
        };
        let result = seal_chunk_via_quorum(&candidates[0], &client).await;
        assert!(matches!(result, Err(Error::MasterCommunicationFailed { .. })));
        assert!(fixture.master.is_seal_needed(chunk));

        // The caller requeues with backoff; the next pass retries.
        fixture.master.schedule_chunk_seal(chunk);
        assert_eq!(fixture.master.seal_pass().len(), 1);
    }

    #[test]
    fn disabled_sealer_produces_nothing() {
        let mut fixture = TestMaster::new();
        let a = fixture.online_node(1);
        let b = fixture.online_node(2);
        let chunk = journal_chunk(&mut fixture, &[a, b]);
        let root = fixture.master.create_chunk_list(ChunkListKind::JournalRoot);
        fixture
            .master
            .attach(root, &[ChunkTreeRef::Chunk(chunk)])
            .unwrap();

        fixture.master.set_sealer_enabled(false);
        fixture.master.schedule_chunk_seal(chunk);
        assert!(fixture.master.seal_pass().is_empty());

        fixture.master.set_sealer_enabled(true);
        assert_eq!(fixture.master.seal_pass().len(), 1);
    }
}
