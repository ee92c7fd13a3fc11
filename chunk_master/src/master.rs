//! The chunk master state and its node/chunk lifecycle operations.

use crate::{
    ChunkManagerConfig, JobInfo, JobRegistry, JobStartInfo, JobStopInfo, NoSuchNodeSnafu,
    NodeLeaseTracker, NodeStatistics, PlacementState, ReplicatorState, Result, SealerState,
    StorageNode,
};
use chunk_model::{ChunkForest, ChunkTreeRef};
use clock::TimeProvider;
use data_types::{
    ChunkId, ChunkListId, ChunkListKind, ChunkMeta, ChunkReplica, ChunkSpec, EntityKind,
    ExtensionTag, MediumIndex, NodeId, NodeState, RackId, ReplicaIndex, ReplicationPolicy,
    TabletId, DEFAULT_MEDIUM,
};
use metric::{Metric, U64Counter, U64Gauge};
use observability_deps::tracing::{debug, info};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// A storage class across the cluster.
#[derive(Debug, Clone)]
pub struct Medium {
    /// The medium index, referenced by chunks and nodes.
    pub index: MediumIndex,
    /// Human-readable name.
    pub name: String,
    /// Scheduling priority among media.
    pub priority: u32,
    /// Whether replicas on this medium may be dropped under pressure.
    pub transient: bool,
    /// Whether this medium holds cache replicas only.
    pub cache: bool,
    /// Rack-awareness cap for replicated chunks.
    pub max_replicas_per_rack: usize,
}

impl Medium {
    fn default_medium() -> Self {
        Self {
            index: DEFAULT_MEDIUM,
            name: "default".to_owned(),
            priority: 0,
            transient: false,
            cache: false,
            max_replicas_per_rack: 1,
        }
    }
}

/// The response to an incremental heartbeat.
#[derive(Debug, Default)]
pub struct HeartbeatResponse {
    /// Jobs the node must start.
    pub jobs_to_start: Vec<JobStartInfo>,
    /// Jobs the node must stop.
    pub jobs_to_stop: Vec<JobStopInfo>,
}

pub(crate) struct MasterMetrics {
    pub jobs_scheduled: Metric<U64Counter>,
    pub lost_chunks: U64Gauge,
    pub lost_vital_chunks: U64Gauge,
}

impl MasterMetrics {
    fn new(registry: &metric::Registry) -> Self {
        let jobs_scheduled: Metric<U64Counter> = registry.register_metric(
            "chunk_master_jobs_scheduled",
            "jobs handed to nodes, by type",
        );
        let lost: Metric<U64Gauge> =
            registry.register_metric("chunk_master_lost_chunks", "chunks with no known replica");
        Self {
            jobs_scheduled,
            lost_chunks: lost.recorder(&[("vital", "false")]),
            lost_vital_chunks: lost.recorder(&[("vital", "true")]),
        }
    }
}

impl std::fmt::Debug for MasterMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MasterMetrics")
    }
}

/// The master-side chunk manager state.
///
/// Mutated only from the chunk manager's automaton invoker; background
/// scanners take it through a mutex but never hold it across suspension
/// points.
#[derive(Debug)]
pub struct ChunkMaster {
    pub(crate) config: ChunkManagerConfig,
    pub(crate) time_provider: Arc<dyn TimeProvider>,
    pub(crate) forest: ChunkForest,
    pub(crate) nodes: HashMap<NodeId, StorageNode>,
    pub(crate) media: HashMap<MediumIndex, Medium>,
    pub(crate) jobs: JobRegistry,
    pub(crate) placement: PlacementState,
    pub(crate) replicator: ReplicatorState,
    pub(crate) sealer: SealerState,
    pub(crate) leases: NodeLeaseTracker,
    pub(crate) owner_replication_factors: HashMap<TabletId, u8>,
    pub(crate) metrics: MasterMetrics,
    next_node_id: u32,
}

impl ChunkMaster {
    /// Create a master with the default medium registered.
    pub fn new(
        config: ChunkManagerConfig,
        time_provider: Arc<dyn TimeProvider>,
        metric_registry: &metric::Registry,
    ) -> Self {
        let leases = NodeLeaseTracker::new(config.leases.clone());
        let sealer = SealerState::new(config.sealer.enable_chunk_sealer);
        Self {
            config,
            time_provider,
            forest: ChunkForest::new(),
            nodes: HashMap::new(),
            media: HashMap::from([(DEFAULT_MEDIUM, Medium::default_medium())]),
            jobs: JobRegistry::new(),
            placement: PlacementState::default(),
            replicator: ReplicatorState::default(),
            sealer,
            leases,
            owner_replication_factors: HashMap::new(),
            metrics: MasterMetrics::new(metric_registry),
            next_node_id: 0,
        }
    }

    /// The chunk tree.
    pub fn forest(&self) -> &ChunkForest {
        &self.forest
    }

    /// Register an additional medium.
    pub fn register_medium(&mut self, medium: Medium) {
        self.media.insert(medium.index, medium);
    }

    /// Declare the replication factor an owner (tablet) demands of its
    /// chunks; picked up by the RF update sweep.
    pub fn set_owner_replication_factor(&mut self, owner: TabletId, replication_factor: u8) {
        self.owner_replication_factors
            .insert(owner, replication_factor);
    }

    // -----------------------------------------------------------------------
    // Node lifecycle
    // -----------------------------------------------------------------------

    /// Register a storage node.
    pub fn register_node(
        &mut self,
        address: impl Into<String>,
        rack: RackId,
        media: BTreeSet<MediumIndex>,
    ) -> NodeId {
        self.next_node_id += 1;
        let node_id = NodeId(self.next_node_id);
        let node = StorageNode::new(node_id, address.into(), rack, media);

        info!(%node_id, address = %node.address, %rack, "node registered");
        self.placement.on_node_registered(&node);
        self.leases
            .on_node_registered(node_id, self.time_provider.now());
        self.nodes.insert(node_id, node);
        node_id
    }

    /// Borrow a node.
    pub fn node(&self, node_id: NodeId) -> Result<&StorageNode> {
        self.nodes
            .get(&node_id)
            .ok_or_else(|| NoSuchNodeSnafu { node_id }.build())
    }

    pub(crate) fn node_mut(&mut self, node_id: NodeId) -> Result<&mut StorageNode> {
        self.nodes
            .get_mut(&node_id)
            .ok_or_else(|| NoSuchNodeSnafu { node_id }.build())
    }

    /// The first full heartbeat: reports complete statistics and every
    /// stored replica, and brings the node online.
    pub fn full_heartbeat(
        &mut self,
        node_id: NodeId,
        statistics: NodeStatistics,
        stored_replicas: Vec<(ChunkId, MediumIndex, ReplicaIndex)>,
    ) -> Result<()> {
        let now = self.time_provider.now();
        {
            let node = self.node_mut(node_id)?;
            node.statistics = statistics;
            node.state = NodeState::Online;
            node.clear_scheduled_work();
        }
        self.leases.on_node_online(node_id, now);
        if let Some(node) = self.nodes.get(&node_id) {
            self.placement.on_node_updated(node);
        }

        for (chunk_id, medium, replica_index) in stored_replicas {
            self.add_chunk_replica(node_id, chunk_id, medium, replica_index)?;
        }
        info!(%node_id, "node online");
        Ok(())
    }

    /// A periodic heartbeat: updates statistics, applies replica deltas,
    /// reconciles running jobs and hands out new ones.
    pub fn incremental_heartbeat(
        &mut self,
        node_id: NodeId,
        statistics: NodeStatistics,
        added_replicas: Vec<(ChunkId, MediumIndex, ReplicaIndex)>,
        removed_replicas: Vec<(ChunkId, MediumIndex)>,
        running_jobs: Vec<JobInfo>,
    ) -> Result<HeartbeatResponse> {
        let now = self.time_provider.now();
        {
            let node = self.node_mut(node_id)?;
            node.statistics = statistics;
        }
        let state = self.node(node_id)?.state;
        self.leases.on_heartbeat(node_id, state, now);
        if let Some(node) = self.nodes.get(&node_id) {
            self.placement.on_node_updated(node);
        }

        for (chunk_id, medium, replica_index) in added_replicas {
            self.add_chunk_replica(node_id, chunk_id, medium, replica_index)?;
        }
        for (chunk_id, medium) in removed_replicas {
            self.remove_chunk_replica(node_id, chunk_id, medium)?;
        }

        Ok(self.schedule_jobs(node_id, running_jobs)?)
    }

    /// Forget a node: its replicas become missing, its jobs are dropped, and
    /// every affected chunk is queued for a refresh.
    pub fn unregister_node(&mut self, node_id: NodeId) -> Result<()> {
        let stored: Vec<_> = self.node(node_id)?.stored_chunks.iter().copied().collect();
        for chunk_id in stored {
            if let Ok(chunk) = self.forest.chunk_mut(chunk_id) {
                let media: Vec<_> = chunk
                    .stored_replicas()
                    .iter()
                    .filter(|(_, r)| r.node_id == node_id)
                    .map(|(m, _)| *m)
                    .collect();
                for medium in media {
                    chunk.remove_replica(medium, node_id);
                }
            }
            self.schedule_chunk_refresh(chunk_id);
        }

        let node_jobs: Vec<_> = self.jobs.jobs_on_node(node_id).map(|j| j.id).collect();
        for job_id in node_jobs {
            if let Some(job) = self.jobs.unregister(job_id) {
                self.schedule_chunk_refresh(job.chunk_id);
            }
        }

        let was_online = {
            let node = self.node_mut(node_id)?;
            let was_online = node.state == NodeState::Online;
            node.state = NodeState::Unregistered;
            was_online
        };
        self.leases.on_node_unregistered(node_id, was_online);
        let node = self.nodes.remove(&node_id).expect("checked above");
        self.placement.on_node_unregistered(node.id());
        info!(%node_id, "node unregistered");
        Ok(())
    }

    /// Expire leases against the current time; each expired node is
    /// unregistered the way the lease tracker's mutation would.
    pub fn expire_node_leases(&mut self) -> Vec<NodeId> {
        let now = self.time_provider.now();
        let expired = self.leases.collect_expired(now);
        for node_id in &expired {
            info!(node_id = %node_id, "node lease expired");
            // Unregistration is retriable; a node that re-registers later is
            // a new node.
            let _ = self.unregister_node(*node_id);
        }
        expired
    }

    // -----------------------------------------------------------------------
    // Chunk lifecycle
    // -----------------------------------------------------------------------

    /// Create an unconfirmed chunk.
    pub fn create_chunk(
        &mut self,
        kind: EntityKind,
        policy: ReplicationPolicy,
        read_quorum: u8,
        write_quorum: u8,
    ) -> ChunkId {
        let chunk_id = self.forest.create_chunk(kind, policy);
        let chunk = self.forest.chunk_mut(chunk_id).expect("just created");
        chunk.read_quorum = read_quorum;
        chunk.write_quorum = write_quorum;
        debug!(%chunk_id, "chunk created");
        chunk_id
    }

    /// Create a chunk list.
    pub fn create_chunk_list(&mut self, kind: ChunkListKind) -> ChunkListId {
        self.forest.create_chunk_list(kind)
    }

    /// Attach children to a chunk list.
    pub fn attach(&mut self, list: ChunkListId, children: &[ChunkTreeRef]) -> Result<()> {
        self.forest.attach(list, children)?;
        Ok(())
    }

    /// Confirm a chunk with its meta and initial replica set.
    pub fn confirm_chunk(
        &mut self,
        chunk_id: ChunkId,
        meta: ChunkMeta,
        replicas: Vec<(NodeId, MediumIndex, ReplicaIndex)>,
    ) -> Result<()> {
        self.forest.chunk_mut(chunk_id)?.confirm(meta);
        for (node_id, medium, replica_index) in replicas {
            self.add_chunk_replica(node_id, chunk_id, medium, replica_index)?;
        }
        self.schedule_chunk_refresh(chunk_id);
        if chunk_id.is_journal() {
            self.schedule_chunk_seal(chunk_id);
        }
        debug!(%chunk_id, "chunk confirmed");
        Ok(())
    }

    /// Install the quorum row count of a journal chunk. The deterministic
    /// half of sealing; the quorum computation happens in the sealer task.
    pub fn seal_chunk(&mut self, chunk_id: ChunkId, row_count: i64) -> Result<()> {
        self.forest.chunk_mut(chunk_id)?.seal(row_count);
        self.schedule_chunk_refresh(chunk_id);
        info!(%chunk_id, row_count, "journal chunk sealed");
        Ok(())
    }

    /// Record a replica on a node, updating both sides of the index.
    pub fn add_chunk_replica(
        &mut self,
        node_id: NodeId,
        chunk_id: ChunkId,
        medium: MediumIndex,
        replica_index: ReplicaIndex,
    ) -> Result<()> {
        let chunk = self.forest.chunk_mut(chunk_id)?;
        let added = chunk.add_replica(
            medium,
            ChunkReplica {
                node_id,
                replica_index,
            },
        );
        if added {
            self.node_mut(node_id)?.stored_chunks.insert(chunk_id);
            self.schedule_chunk_refresh(chunk_id);
        }
        Ok(())
    }

    /// Erase a replica from a node.
    pub fn remove_chunk_replica(
        &mut self,
        node_id: NodeId,
        chunk_id: ChunkId,
        medium: MediumIndex,
    ) -> Result<()> {
        if let Ok(chunk) = self.forest.chunk_mut(chunk_id) {
            chunk.remove_replica(medium, node_id);
            self.schedule_chunk_refresh(chunk_id);
        }
        self.node_mut(node_id)?.stored_chunks.remove(&chunk_id);
        Ok(())
    }

    /// Build the spec a reader needs to consume `chunk_id`.
    pub fn fetch_chunk_spec(
        &self,
        chunk_id: ChunkId,
        extension_tags: &[ExtensionTag],
    ) -> Result<ChunkSpec> {
        let chunk = self.forest.chunk(chunk_id)?;
        Ok(ChunkSpec {
            chunk_id,
            erasure_codec: chunk.erasure_codec(),
            replicas: chunk.stored_replicas().iter().map(|(_, r)| *r).collect(),
            meta: chunk.meta.filtered(extension_tags),
            lower_limit: Default::default(),
            upper_limit: Default::default(),
            row_count_override: (!chunk.is_sealed()).then(|| chunk.row_count()),
            data_weight_override: None,
            override_timestamp: None,
            max_clip_timestamp: None,
        })
    }

    pub(crate) fn now(&self) -> clock::Time {
        self.time_provider.now()
    }
}

pub(crate) fn default_media() -> BTreeSet<MediumIndex> {
    BTreeSet::from([DEFAULT_MEDIUM])
}

#[cfg(test)]
pub(crate) mod test_fixture {
    use super::*;
    use crate::ChunkManagerConfig;
    use clock::{MockProvider, Time};

    /// A master over a mock clock plus helpers shared by the control plane
    /// tests.
    pub(crate) struct TestMaster {
        pub master: ChunkMaster,
        pub time_provider: Arc<MockProvider>,
        pub metric_registry: Arc<metric::Registry>,
    }

    impl TestMaster {
        pub fn new() -> Self {
            Self::with_config(ChunkManagerConfig::for_tests())
        }

        pub fn with_config(config: ChunkManagerConfig) -> Self {
            let time_provider = Arc::new(MockProvider::new(Time::from_timestamp_nanos(0)));
            let metric_registry = Arc::new(metric::Registry::new());
            let master = ChunkMaster::new(
                config,
                Arc::clone(&time_provider) as _,
                &metric_registry,
            );
            Self {
                master,
                time_provider,
                metric_registry,
            }
        }

        /// Register an online node with the given rack and equal, low load.
        pub fn online_node(&mut self, rack: u16) -> NodeId {
            let node_id = self.master.register_node(
                format!("node-{}", self.master.nodes.len() + 1),
                RackId(rack),
                default_media(),
            );
            self.master
                .full_heartbeat(
                    node_id,
                    NodeStatistics {
                        session_count: 0,
                        used_space: 0,
                        available_space: 1_000_000,
                        full: false,
                    },
                    vec![],
                )
                .unwrap();
            node_id
        }

        /// A confirmed chunk with `replication_factor` on the default medium
        /// and replicas on the given nodes.
        pub fn confirmed_chunk(&mut self, replication_factor: u8, holders: &[NodeId]) -> ChunkId {
            let chunk_id = self.master.create_chunk(
                EntityKind::Chunk,
                ReplicationPolicy::with_factor(replication_factor),
                0,
                0,
            );
            let replicas = holders
                .iter()
                .map(|node_id| (*node_id, DEFAULT_MEDIUM, ReplicaIndex::GENERIC))
                .collect();
            self.master
                .confirm_chunk(
                    chunk_id,
                    ChunkMeta {
                        misc: Some(data_types::MiscExt {
                            row_count: 1,
                            uncompressed_data_size: 100,
                            compressed_data_size: 60,
                            data_weight: 110,
                            sealed: true,
                            ..Default::default()
                        }),
                        blocks: None,
                    },
                    replicas,
                )
                .unwrap();
            chunk_id
        }

        /// Drain the refresh queue.
        pub fn refresh_all(&mut self) {
            while self.master.refresh_pass() > 0 {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_fixture::TestMaster;
    use super::*;

    #[test]
    fn register_and_heartbeat_brings_node_online() {
        let mut fixture = TestMaster::new();
        let node_id = fixture.master.register_node("n1", RackId(1), default_media());
        assert_eq!(fixture.master.node(node_id).unwrap().state, NodeState::Registered);
        assert_eq!(fixture.master.leases.online_node_count(), 0);

        fixture
            .master
            .full_heartbeat(node_id, NodeStatistics::default(), vec![])
            .unwrap();
        assert_eq!(fixture.master.node(node_id).unwrap().state, NodeState::Online);
        assert_eq!(fixture.master.leases.online_node_count(), 1);
    }

    #[test]
    fn lease_expiry_unregisters_the_node() {
        let mut fixture = TestMaster::new();
        let node_id = fixture.online_node(1);
        let chunk_id = fixture.confirmed_chunk(3, &[node_id]);

        fixture
            .time_provider
            .inc(std::time::Duration::from_secs(3600));
        let expired = fixture.master.expire_node_leases();
        assert_eq!(expired, vec![node_id]);
        assert!(fixture.master.node(node_id).is_err());

        // The chunk survives with zero replicas and a pending refresh.
        let chunk = fixture.master.forest().chunk(chunk_id).unwrap();
        assert!(chunk.stored_replicas().is_empty());
    }

    #[test]
    fn fetch_chunk_spec_filters_meta() {
        let mut fixture = TestMaster::new();
        let node_id = fixture.online_node(1);
        let chunk_id = fixture.confirmed_chunk(3, &[node_id]);

        let spec = fixture
            .master
            .fetch_chunk_spec(chunk_id, &[ExtensionTag::Misc])
            .unwrap();
        assert_eq!(spec.replicas.len(), 1);
        assert!(spec.meta.misc.is_some());
        assert!(spec.meta.blocks.is_none());
        assert_eq!(spec.row_count_override, None);
    }
}
