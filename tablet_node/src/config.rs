//! Tablet node and per-table mount configuration.

use data_types::InMemoryMode;
use std::time::Duration;

/// Store flusher knobs.
#[derive(Debug, Clone)]
pub struct StoreFlusherConfig {
    /// Whether the flusher runs.
    pub enable_store_flusher: bool,
    /// Concurrent flush tasks per node.
    pub max_concurrent_flushes: usize,
    /// Active stores below this size are not forced-rotation candidates.
    pub min_forced_flush_data_size: i64,
    /// Period of the flusher scan.
    pub scan_period: Duration,
}

impl Default for StoreFlusherConfig {
    fn default() -> Self {
        Self {
            enable_store_flusher: true,
            max_concurrent_flushes: 16,
            min_forced_flush_data_size: 1024,
            scan_period: Duration::from_secs(1),
        }
    }
}

/// Store compactor knobs.
#[derive(Debug, Clone)]
pub struct StoreCompactorConfig {
    /// Whether the compactor runs.
    pub enable_store_compactor: bool,
    /// Concurrent compaction tasks per node.
    pub max_concurrent_compactions: usize,
    /// Minimum adjacent small stores to bother merging.
    pub min_compaction_store_count: usize,
    /// Maximum stores merged by one compaction.
    pub max_compaction_store_count: usize,
    /// Stores above this size are not "small" and never picked.
    pub max_compaction_store_size: i64,
    /// Period of the compactor scan.
    pub scan_period: Duration,
}

impl Default for StoreCompactorConfig {
    fn default() -> Self {
        Self {
            enable_store_compactor: true,
            max_concurrent_compactions: 4,
            min_compaction_store_count: 2,
            max_compaction_store_count: 8,
            max_compaction_store_size: 16 * 1024 * 1024,
            scan_period: Duration::from_secs(1),
        }
    }
}

/// In-memory manager knobs.
#[derive(Debug, Clone)]
pub struct InMemoryManagerConfig {
    /// Concurrent preload tasks per node.
    pub max_concurrent_preloads: usize,
    /// How long intercepted chunk data outlives its writer.
    pub intercepted_data_retention_time: Duration,
}

impl Default for InMemoryManagerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_preloads: 4,
            intercepted_data_retention_time: Duration::from_secs(30),
        }
    }
}

/// Transaction manager knobs.
#[derive(Debug, Clone)]
pub struct TransactionManagerConfig {
    /// Period of the leader's barrier check.
    pub barrier_check_period: Duration,
    /// Size of the pool remembering recently aborted transaction ids.
    pub max_aborted_transaction_pool_size: usize,
    /// Whether commits with a foreign clock cluster tag are rejected.
    pub reject_incorrect_clock_cluster_tag: bool,
}

impl Default for TransactionManagerConfig {
    fn default() -> Self {
        Self {
            barrier_check_period: Duration::from_millis(100),
            max_aborted_transaction_pool_size: 1000,
            reject_incorrect_clock_cluster_tag: false,
        }
    }
}

/// Top-level tablet node configuration.
#[derive(Debug, Clone, Default)]
pub struct TabletNodeConfig {
    /// Flusher knobs.
    pub store_flusher: StoreFlusherConfig,
    /// Compactor knobs.
    pub store_compactor: StoreCompactorConfig,
    /// In-memory manager knobs.
    pub in_memory_manager: InMemoryManagerConfig,
    /// Transaction manager knobs.
    pub transaction_manager: TransactionManagerConfig,
    /// Backoff applied to a store after a failed flush or preload.
    pub error_backoff_time: Duration,
    /// Node-wide budget for dynamic store memory.
    pub tablet_dynamic_memory_limit: i64,
    /// Node-wide budget for in-memory (static) chunk data.
    pub tablet_static_memory_limit: i64,
}

impl TabletNodeConfig {
    /// Defaults suitable for tests: small budgets, no backoff delays.
    pub fn for_tests() -> Self {
        Self {
            store_flusher: StoreFlusherConfig {
                scan_period: Duration::from_millis(10),
                ..Default::default()
            },
            store_compactor: StoreCompactorConfig {
                scan_period: Duration::from_millis(10),
                ..Default::default()
            },
            in_memory_manager: InMemoryManagerConfig {
                intercepted_data_retention_time: Duration::from_millis(50),
                ..Default::default()
            },
            transaction_manager: Default::default(),
            error_backoff_time: Duration::from_millis(10),
            tablet_dynamic_memory_limit: 64 * 1024 * 1024,
            tablet_static_memory_limit: 64 * 1024 * 1024,
        }
    }
}

/// Per-table settings applied at mount time.
#[derive(Debug, Clone)]
pub struct TableMountConfig {
    /// Residency mode for chunk data.
    pub in_memory_mode: InMemoryMode,
    /// Rotation threshold on the active store's row count.
    pub max_dynamic_store_row_count: usize,
    /// Rotation threshold on the active store's byte size.
    pub max_dynamic_store_size: i64,
    /// Periodic rotation interval; `None` disables it.
    pub dynamic_store_rotation_period: Option<Duration>,
    /// Rows streamed per read batch during flush and compaction.
    pub max_rows_per_read: usize,
    /// Ordered tablets: rows kept beyond the trim point.
    pub retained_row_count: usize,
    /// Row versions older than this are dropped by compaction.
    pub min_data_versions: usize,
}

impl Default for TableMountConfig {
    fn default() -> Self {
        Self {
            in_memory_mode: InMemoryMode::None,
            max_dynamic_store_row_count: 1_000_000,
            max_dynamic_store_size: 256 * 1024 * 1024,
            dynamic_store_rotation_period: None,
            max_rows_per_read: 1024,
            retained_row_count: usize::MAX,
            min_data_versions: 1,
        }
    }
}
