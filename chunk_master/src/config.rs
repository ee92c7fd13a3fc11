//! Control plane configuration.

use std::time::Duration;

/// Configuration of the replicator proper.
#[derive(Debug, Clone)]
pub struct ChunkReplicatorConfig {
    /// Maximum concurrent outgoing replication jobs per node.
    pub max_replication_fan_out: usize,
    /// Maximum concurrent incoming replication jobs per node.
    pub max_replication_fan_in: usize,
    /// Maximum concurrent removal jobs per node.
    pub max_removal_jobs_per_node: usize,
    /// Jobs running longer than this are stopped and their chunk refreshed.
    pub job_timeout: Duration,
    /// Below this many online nodes the replicator schedules nothing.
    pub min_online_node_count: Option<usize>,
    /// Above this fraction of lost chunks the replicator schedules nothing.
    pub max_lost_chunk_fraction: Option<f64>,
    /// Nodes below this fill factor are not balancing sources.
    pub min_balancing_fill_factor: f64,
    /// Required fill factor gap between balancing source and target.
    pub min_balancing_fill_factor_diff: f64,
    /// Weight of (active + hinted) sessions in the load factor.
    pub active_sessions_penalty_coeff: f64,
}

impl Default for ChunkReplicatorConfig {
    fn default() -> Self {
        Self {
            max_replication_fan_out: 4,
            max_replication_fan_in: 8,
            max_removal_jobs_per_node: 16,
            job_timeout: Duration::from_secs(600),
            min_online_node_count: None,
            max_lost_chunk_fraction: None,
            min_balancing_fill_factor: 0.1,
            min_balancing_fill_factor_diff: 0.02,
            active_sessions_penalty_coeff: 0.0001,
        }
    }
}

/// Configuration of the journal chunk sealer.
#[derive(Debug, Clone)]
pub struct ChunkSealerConfig {
    /// Whether the sealer runs at all.
    pub enable_chunk_sealer: bool,
    /// Concurrent seal tasks.
    pub max_concurrent_chunk_seals: usize,
    /// Chunks dequeued per sealer pass.
    pub max_chunks_per_seal: usize,
    /// Requeue delay after a failed seal.
    pub chunk_seal_backoff: Duration,
}

impl Default for ChunkSealerConfig {
    fn default() -> Self {
        Self {
            enable_chunk_sealer: true,
            max_concurrent_chunk_seals: 10,
            max_chunks_per_seal: 100,
            chunk_seal_backoff: Duration::from_secs(30),
        }
    }
}

/// Configuration of the node lease tracker.
#[derive(Debug, Clone)]
pub struct NodeLeaseConfig {
    /// Lease of a node that has registered but never heartbeated.
    pub unconfirmed_node_timeout: Duration,
    /// Lease of a registered (not yet online) node.
    pub registered_node_timeout: Duration,
    /// Lease of an online node.
    pub online_node_timeout: Duration,
}

impl Default for NodeLeaseConfig {
    fn default() -> Self {
        Self {
            unconfirmed_node_timeout: Duration::from_secs(30),
            registered_node_timeout: Duration::from_secs(60),
            online_node_timeout: Duration::from_secs(120),
        }
    }
}

/// Top-level chunk manager configuration.
#[derive(Debug, Clone, Default)]
pub struct ChunkManagerConfig {
    /// Delay between scheduling a refresh and acting on it.
    pub chunk_refresh_delay: Duration,
    /// Period of the refresh scan.
    pub chunk_refresh_period: Duration,
    /// Chunks processed per refresh pass.
    pub max_chunks_per_refresh: usize,
    /// Chunks processed per replication-factor update pass.
    pub max_chunks_per_rf_update: usize,
    /// Replicator knobs.
    pub replicator: ChunkReplicatorConfig,
    /// Sealer knobs.
    pub sealer: ChunkSealerConfig,
    /// Lease knobs.
    pub leases: NodeLeaseConfig,
}

impl ChunkManagerConfig {
    /// Defaults suitable for tests: no refresh delay, generous budgets.
    pub fn for_tests() -> Self {
        Self {
            chunk_refresh_delay: Duration::ZERO,
            chunk_refresh_period: Duration::from_millis(100),
            max_chunks_per_refresh: 1000,
            max_chunks_per_rf_update: 1000,
            replicator: Default::default(),
            sealer: Default::default(),
            leases: Default::default(),
        }
    }
}
