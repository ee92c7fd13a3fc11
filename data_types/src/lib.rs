//! Shared data types: object ids, entity states, rows, schemas, read limits
//! and chunk metadata.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use snafu::Snafu;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

pub use clock::{ClusterTag, Timestamp};

/// Errors constructing or validating shared types.
#[derive(Debug, Snafu, Clone)]
#[allow(missing_docs)]
pub enum Error {
    #[snafu(display("unknown entity kind {kind}"))]
    UnknownEntityKind { kind: u16 },

    #[snafu(display("object {id} is a {actual:?}, expected {expected:?}"))]
    WrongEntityKind {
        id: ObjectId,
        actual: EntityKind,
        expected: EntityKind,
    },

    #[snafu(display("sort order violation: key {index} out of order"))]
    SortOrderViolation { index: usize },

    #[snafu(display("row has {actual} values but schema has {expected} columns"))]
    ColumnCountMismatch { actual: usize, expected: usize },

    #[snafu(display("value for column '{column}' has the wrong type"))]
    ValueTypeMismatch { column: String },
}

#[allow(missing_docs)]
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The kind of entity an [`ObjectId`] refers to, encoded into the id itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u16)]
pub enum EntityKind {
    /// A regular replicated chunk.
    Chunk = 1,
    /// An erasure-coded chunk.
    ErasureChunk = 2,
    /// An appendable journal chunk.
    JournalChunk = 3,
    /// An ordered sequence of chunk tree nodes.
    ChunkList = 4,
    /// A clipped window onto a chunk.
    ChunkView = 5,
    /// An in-memory tablet store.
    DynamicStore = 6,
    /// A tablet.
    Tablet = 7,
    /// A tablet transaction.
    Transaction = 8,
    /// A tablet cell.
    TabletCell = 9,
}

impl EntityKind {
    fn from_u16(kind: u16) -> Result<Self> {
        Ok(match kind {
            1 => Self::Chunk,
            2 => Self::ErasureChunk,
            3 => Self::JournalChunk,
            4 => Self::ChunkList,
            5 => Self::ChunkView,
            6 => Self::DynamicStore,
            7 => Self::Tablet,
            8 => Self::Transaction,
            9 => Self::TabletCell,
            kind => return UnknownEntityKindSnafu { kind }.fail(),
        })
    }
}

/// A 128-bit object id with the entity kind packed into the upper bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId(u128);

impl ObjectId {
    /// Build an id from its parts.
    pub fn new(kind: EntityKind, unique: u64) -> Self {
        Self(((kind as u128) << 64) | unique as u128)
    }

    /// The entity kind embedded in the id.
    pub fn kind(&self) -> EntityKind {
        EntityKind::from_u16((self.0 >> 64) as u16).expect("id constructed with a valid kind")
    }

    /// The unique part of the id.
    pub fn unique(&self) -> u64 {
        self.0 as u64
    }

    /// Raw wire value.
    pub fn as_u128(&self) -> u128 {
        self.0
    }

    /// Parse a wire value, validating the embedded kind.
    pub fn from_u128(raw: u128) -> Result<Self> {
        EntityKind::from_u16((raw >> 64) as u16)?;
        Ok(Self(raw))
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}-{:x}", self.kind(), self.unique())
    }
}

macro_rules! typed_object_id {
    ($(#[$docs:meta])* $name:ident => $($kind:ident)|+) => {
        $(#[$docs])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(ObjectId);

        impl $name {
            /// Wrap an [`ObjectId`], validating its kind.
            pub fn try_from_object(id: ObjectId) -> Result<Self> {
                match id.kind() {
                    $(EntityKind::$kind)|+ => Ok(Self(id)),
                    actual => WrongEntityKindSnafu {
                        id,
                        actual,
                        // The first admissible kind names the expectation.
                        expected: first_kind!($($kind),+),
                    }
                    .fail(),
                }
            }

            /// The underlying object id.
            pub fn get(&self) -> ObjectId {
                self.0
            }

            /// The entity kind of this id.
            pub fn kind(&self) -> EntityKind {
                self.0.kind()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

macro_rules! first_kind {
    ($first:ident $(, $rest:ident)*) => {
        EntityKind::$first
    };
}

typed_object_id! {
    /// Identifies a chunk of any flavor.
    ChunkId => Chunk | ErasureChunk | JournalChunk
}
typed_object_id! {
    /// Identifies a chunk list.
    ChunkListId => ChunkList
}
typed_object_id! {
    /// Identifies a chunk view.
    ChunkViewId => ChunkView
}
typed_object_id! {
    /// Identifies a tablet.
    TabletId => Tablet
}
typed_object_id! {
    /// Identifies a tablet transaction.
    TransactionId => Transaction
}
typed_object_id! {
    /// Identifies a tablet cell.
    CellId => TabletCell
}

impl ChunkId {
    /// Construct a fresh id of the given chunk flavor.
    pub fn new(kind: EntityKind, unique: u64) -> Self {
        Self::try_from_object(ObjectId::new(kind, unique)).expect("chunk kind")
    }

    /// Whether this is a journal chunk.
    pub fn is_journal(&self) -> bool {
        self.kind() == EntityKind::JournalChunk
    }

    /// Whether this is an erasure-coded chunk.
    pub fn is_erasure(&self) -> bool {
        self.kind() == EntityKind::ErasureChunk
    }
}

impl ChunkListId {
    /// Construct a fresh chunk list id.
    pub fn new(unique: u64) -> Self {
        Self(ObjectId::new(EntityKind::ChunkList, unique))
    }
}

impl ChunkViewId {
    /// Construct a fresh chunk view id.
    pub fn new(unique: u64) -> Self {
        Self(ObjectId::new(EntityKind::ChunkView, unique))
    }
}

impl TabletId {
    /// Construct a fresh tablet id.
    pub fn new(unique: u64) -> Self {
        Self(ObjectId::new(EntityKind::Tablet, unique))
    }
}

impl TransactionId {
    /// Construct a fresh transaction id.
    pub fn new(unique: u64) -> Self {
        Self(ObjectId::new(EntityKind::Transaction, unique))
    }
}

impl CellId {
    /// Construct a fresh cell id.
    pub fn new(unique: u64) -> Self {
        Self(ObjectId::new(EntityKind::TabletCell, unique))
    }
}

/// Identifies a tablet store: either a dynamic store or, for chunk stores,
/// the id of the backing chunk.
pub type StoreId = ObjectId;

/// Construct a fresh dynamic store id.
pub fn new_dynamic_store_id(unique: u64) -> StoreId {
    ObjectId::new(EntityKind::DynamicStore, unique)
}

macro_rules! fmt_display_tuple {
    () => {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}", self.0)
        }
    };
}

/// Identifies a storage node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub u32);

impl fmt::Display for NodeId {
    fmt_display_tuple!();
}

/// Identifies a failure domain for storage nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RackId(pub u16);

impl fmt::Display for RackId {
    fmt_display_tuple!();
}

/// Identifies a storage class (e.g. SSD vs HDD) across the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MediumIndex(pub u16);

impl fmt::Display for MediumIndex {
    fmt_display_tuple!();
}

/// The default medium every node advertises.
pub const DEFAULT_MEDIUM: MediumIndex = MediumIndex(0);

/// Bumped on every mount; requests carrying a stale revision are rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct MountRevision(pub u64);

/// Identifies a replicator job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct JobId(pub uuid::Uuid);

impl JobId {
    /// Generate a fresh job id.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fmt_display_tuple!();
}

/// The index of a replica within an (erasure-coded) chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReplicaIndex(pub u16);

impl ReplicaIndex {
    /// The index of a non-erasure replica.
    pub const GENERIC: Self = Self(0);

    /// The reserved sentinel marking a sealed journal replica on the wire.
    pub const SEAL: Self = Self(0xFFFF);
}

impl fmt::Display for ReplicaIndex {
    fmt_display_tuple!();
}

/// One stored replica location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChunkReplica {
    /// The node holding the replica.
    pub node_id: NodeId,
    /// The replica index ([`ReplicaIndex::SEAL`] once a journal replica is
    /// sealed).
    pub replica_index: ReplicaIndex,
}

/// The heartbeat state of a storage node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// Registered but no full heartbeat received yet.
    Registered,
    /// Fully operational.
    Online,
    /// Being removed from the cluster.
    Unregistered,
}

/// The lifecycle state of a tablet store.
///
/// Dynamic stores progress `ActiveDynamic -> PassiveDynamic -> Flushing ->`
/// (gone, replaced by a chunk store); chunk stores progress `Persistent ->
/// Compacting -> RemoveCommitting -> Removed`. The walk is acyclic except for
/// the failure edges back from `Flushing`/`Compacting`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreState {
    /// The single dynamic store accepting writes.
    ActiveDynamic,
    /// A rotated dynamic store waiting to be flushed.
    PassiveDynamic,
    /// Being flushed to a chunk.
    Flushing,
    /// Flush failed; cooling down before returning to `PassiveDynamic`.
    FlushFailed,
    /// An immutable chunk store.
    Persistent,
    /// Being merged with neighbors.
    Compacting,
    /// Compaction output committed; waiting for the stores-update mutation.
    RemoveCommitting,
    /// Detached from the tablet.
    Removed,
}

/// The mount state of a tablet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TabletState {
    /// Not attached to any cell.
    Unmounted,
    /// Mount in progress.
    Mounting,
    /// Serving reads and writes.
    Mounted,
    /// Unmounting: draining row locks.
    UnmountWaitingForLocks,
    /// Unmounting: rotating the active store.
    UnmountRotating,
    /// Unmounting: flushing passive stores.
    UnmountFlushing,
}

impl TabletState {
    /// Whether the tablet is somewhere in the unmount workflow.
    pub fn is_in_unmount_workflow(&self) -> bool {
        matches!(
            self,
            Self::UnmountWaitingForLocks | Self::UnmountRotating | Self::UnmountFlushing
        )
    }
}

/// The state of a tablet transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Accepting writes and actions.
    Active,
    /// Commit prepared on the leader only.
    TransientCommitPrepared,
    /// Commit prepared through a replicated mutation.
    PersistentCommitPrepared,
    /// Abort requested but not yet replicated.
    TransientAbortPrepared,
    /// Committed; may still await serialization.
    Committed,
    /// Globally ordered behind the serialization barrier.
    Serialized,
    /// Aborted.
    Aborted,
}

/// The kind of work a replicator job performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobType {
    /// Copy a chunk replica to new nodes.
    Replicate,
    /// Remove a chunk replica from a node.
    Remove,
    /// Seal a journal chunk replica.
    Seal,
}

/// The state a node reports for a running job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// Still running.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
}

/// How a tablet keeps chunk data resident.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InMemoryMode {
    /// No residency; blocks are read on demand.
    None,
    /// Compressed blocks stay in memory.
    Compressed,
    /// Blocks are decompressed on preload and stay in memory.
    Uncompressed,
}

/// What a chunk list roots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkListKind {
    /// A static table subtree.
    Static,
    /// The root of a sorted dynamic table; children are per-tablet lists.
    SortedDynamicRoot,
    /// A per-tablet list of a sorted dynamic table.
    SortedDynamicTablet,
    /// A nested list below a tablet list.
    SortedDynamicSubtablet,
    /// The root of a journal.
    JournalRoot,
    /// The root of hunk storage.
    HunkRoot,
}

/// What a write session is created for; placement may weigh them differently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionType {
    /// A user-facing write.
    User,
    /// Replication traffic.
    Replication,
    /// Journal sealing traffic.
    Seal,
}

/// The erasure codec of a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErasureCodec {
    /// Plain replication, no coding.
    None,
    /// Reed-Solomon with the given data/parity split.
    ReedSolomon {
        /// Number of data parts.
        data_parts: u8,
        /// Number of parity parts.
        parity_parts: u8,
    },
}

impl ErasureCodec {
    /// Total part count, 0 for plain replication.
    pub fn total_parts(&self) -> u8 {
        match self {
            Self::None => 0,
            Self::ReedSolomon {
                data_parts,
                parity_parts,
            } => data_parts + parity_parts,
        }
    }

    /// The number of parts that may be lost while staying repairable; losing
    /// a whole rack must not exceed it, so it doubles as the per-rack cap.
    pub fn guaranteed_repairable_parts(&self) -> u8 {
        match self {
            Self::None => 0,
            Self::ReedSolomon { parity_parts, .. } => *parity_parts,
        }
    }
}

/// The compression codec of a chunk's blocks.
///
/// The physical block format is out of scope here; the codec tag is carried
/// so that readers route blocks through the decompression pool when needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionCodec {
    /// Blocks are stored as written.
    None,
}

// ---------------------------------------------------------------------------
// Rows and schemas
// ---------------------------------------------------------------------------

/// The type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    /// 64-bit signed integer.
    Int64,
    /// 64-bit unsigned integer.
    Uint64,
    /// 64-bit float.
    Double,
    /// Boolean.
    Boolean,
    /// Arbitrary bytes.
    Bytes,
    /// UTF-8 string.
    String,
}

/// A single cell value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Value {
    /// Absent / SQL NULL; sorts before everything.
    Null,
    /// 64-bit signed integer.
    Int64(i64),
    /// 64-bit unsigned integer.
    Uint64(u64),
    /// 64-bit float with total ordering.
    Double(ordered_float::OrderedFloat<f64>),
    /// Boolean.
    Boolean(bool),
    /// Arbitrary bytes.
    Bytes(Vec<u8>),
    /// UTF-8 string.
    String(String),
}

impl Value {
    fn type_rank(&self) -> u8 {
        match self {
            Self::Null => 0,
            Self::Int64(_) => 1,
            Self::Uint64(_) => 2,
            Self::Double(_) => 3,
            Self::Boolean(_) => 4,
            Self::Bytes(_) => 5,
            Self::String(_) => 6,
        }
    }

    /// Whether this value matches the schema type.
    pub fn is_of_type(&self, value_type: ValueType) -> bool {
        matches!(
            (self, value_type),
            (Self::Null, _)
                | (Self::Int64(_), ValueType::Int64)
                | (Self::Uint64(_), ValueType::Uint64)
                | (Self::Double(_), ValueType::Double)
                | (Self::Boolean(_), ValueType::Boolean)
                | (Self::Bytes(_), ValueType::Bytes)
                | (Self::String(_), ValueType::String)
        )
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Int64(a), Self::Int64(b)) => a.cmp(b),
            (Self::Uint64(a), Self::Uint64(b)) => a.cmp(b),
            (Self::Double(a), Self::Double(b)) => a.cmp(b),
            (Self::Boolean(a), Self::Boolean(b)) => a.cmp(b),
            (Self::Bytes(a), Self::Bytes(b)) => a.cmp(b),
            (Self::String(a), Self::String(b)) => a.cmp(b),
            (a, b) => a.type_rank().cmp(&b.type_rank()),
        }
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A row key: the key-column prefix of a row.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct RowKey(pub Vec<Value>);

impl RowKey {
    /// An empty (minimal) key.
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    /// Number of key values.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the key has no values.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A full row of schema-ordered values; the first `key_column_count` values
/// form the key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnversionedRow {
    /// One value per schema column.
    pub values: Vec<Value>,
}

impl UnversionedRow {
    /// The key prefix of this row under `schema`.
    pub fn key(&self, schema: &TableSchema) -> RowKey {
        RowKey(self.values[..schema.key_column_count].to_vec())
    }
}

/// One versioned (timestamped) cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedValue {
    /// Index of the column in the schema.
    pub column_index: usize,
    /// The value written.
    pub value: Value,
    /// The commit timestamp of the write.
    pub timestamp: Timestamp,
}

/// A row fragment carrying MVCC history, as produced by store readers and
/// consumed by the row merger.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VersionedRow {
    /// The row key.
    pub key: RowKey,
    /// Versioned non-key values, newest first per column.
    pub values: Vec<VersionedValue>,
    /// Commit timestamps of writes touching this row, newest first.
    pub write_timestamps: Vec<Timestamp>,
    /// Commit timestamps of deletions of this row, newest first.
    pub delete_timestamps: Vec<Timestamp>,
}

impl VersionedRow {
    /// Whether the row carries neither values nor tombstones.
    pub fn is_empty(&self) -> bool {
        self.write_timestamps.is_empty() && self.delete_timestamps.is_empty()
    }
}

/// Schema of one column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSchema {
    /// Column name.
    pub name: String,
    /// Column type.
    pub value_type: ValueType,
    /// Lock index for non-key columns; columns sharing an index conflict.
    /// Lock 0 is the primary lock taken by deletions.
    pub lock_index: u8,
}

/// A table schema: key columns first, then value columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    /// All columns, key prefix first.
    pub columns: Vec<ColumnSchema>,
    /// Length of the key prefix.
    pub key_column_count: usize,
}

impl TableSchema {
    /// Number of distinct locks referenced by value columns (at least 1, the
    /// primary lock).
    pub fn lock_count(&self) -> u8 {
        self.columns[self.key_column_count..]
            .iter()
            .map(|c| c.lock_index + 1)
            .max()
            .unwrap_or(1)
            .max(1)
    }

    /// The lock mask a write touching `column_indexes` must take.
    pub fn lock_mask_for(&self, column_indexes: impl IntoIterator<Item = usize>) -> LockMask {
        let mut mask = LockMask::EMPTY;
        for index in column_indexes {
            mask = mask.with_lock(self.columns[index].lock_index);
        }
        mask
    }

    /// Validate that `row` matches this schema and its key is fully typed.
    pub fn validate_row(&self, row: &UnversionedRow) -> Result<()> {
        if row.values.len() != self.columns.len() {
            return ColumnCountMismatchSnafu {
                actual: row.values.len(),
                expected: self.columns.len(),
            }
            .fail();
        }
        for (value, column) in row.values.iter().zip(&self.columns) {
            if !value.is_of_type(column.value_type) {
                return ValueTypeMismatchSnafu {
                    column: column.name.clone(),
                }
                .fail();
            }
        }
        Ok(())
    }
}

/// A bitmap of row locks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LockMask(pub u32);

impl LockMask {
    /// No locks.
    pub const EMPTY: Self = Self(0);
    /// The primary lock, taken by deletions and whole-row writes.
    pub const PRIMARY: Self = Self(1);

    /// This mask plus the given lock index.
    pub fn with_lock(self, index: u8) -> Self {
        Self(self.0 | (1 << index))
    }

    /// Whether the two masks share any lock.
    pub fn intersects(&self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// Iterate the lock indexes present in the mask.
    pub fn iter(&self) -> impl Iterator<Item = u8> + '_ {
        (0..32u8).filter(move |i| self.0 & (1 << i) != 0)
    }
}

/// Which columns a read returns.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ColumnFilter {
    /// All columns.
    #[default]
    All,
    /// Only the listed column indexes.
    Indexes(Vec<usize>),
}

impl ColumnFilter {
    /// Whether the filter admits `column_index`.
    pub fn contains(&self, column_index: usize) -> bool {
        match self {
            Self::All => true,
            Self::Indexes(indexes) => indexes.contains(&column_index),
        }
    }
}

// ---------------------------------------------------------------------------
// Read limits
// ---------------------------------------------------------------------------

/// A lower or upper bound of a chunk tree read, in up to four dimensions.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReadLimit {
    /// Bound on the logical row index.
    pub row_index: Option<i64>,
    /// Bound on the chunk index.
    pub chunk_index: Option<i64>,
    /// Bound on the byte offset.
    pub offset: Option<i64>,
    /// Bound on the row key.
    pub key: Option<RowKey>,
}

impl ReadLimit {
    /// The unbounded limit.
    pub fn unbounded() -> Self {
        Self::default()
    }

    /// A limit bounding only the row index.
    pub fn at_row_index(row_index: i64) -> Self {
        Self {
            row_index: Some(row_index),
            ..Default::default()
        }
    }

    /// A limit bounding only the key.
    pub fn at_key(key: RowKey) -> Self {
        Self {
            key: Some(key),
            ..Default::default()
        }
    }

    /// Whether no dimension is bounded.
    pub fn is_unbounded(&self) -> bool {
        self.row_index.is_none()
            && self.chunk_index.is_none()
            && self.offset.is_none()
            && self.key.is_none()
    }
}

// ---------------------------------------------------------------------------
// Chunk metadata
// ---------------------------------------------------------------------------

/// Miscellaneous chunk statistics carried in the chunk meta.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MiscExt {
    /// Logical rows in the chunk (records, for journal chunks).
    pub row_count: i64,
    /// Total uncompressed byte size.
    pub uncompressed_data_size: i64,
    /// Total compressed byte size.
    pub compressed_data_size: i64,
    /// Weight of the data for quota accounting.
    pub data_weight: i64,
    /// Whether a journal chunk's row count is final.
    pub sealed: bool,
    /// The compression codec of the blocks.
    pub compression_codec: CompressionCodec,
    /// The erasure codec, `None` for replicated chunks.
    pub erasure_codec: ErasureCodec,
    /// Smallest key in the chunk, for sorted chunks.
    pub min_key: Option<RowKey>,
    /// Largest key in the chunk, for sorted chunks.
    pub max_key: Option<RowKey>,
    /// Smallest commit timestamp in the chunk.
    pub min_timestamp: Timestamp,
    /// Largest commit timestamp in the chunk.
    pub max_timestamp: Timestamp,
}

impl Default for CompressionCodec {
    fn default() -> Self {
        Self::None
    }
}

impl Default for ErasureCodec {
    fn default() -> Self {
        Self::None
    }
}

/// Per-block sizes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BlocksExt {
    /// The byte size of each block, in order.
    pub block_sizes: Vec<u64>,
}

/// Extension tags used to filter chunk meta when building chunk specs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExtensionTag {
    /// [`MiscExt`].
    Misc,
    /// [`BlocksExt`].
    Blocks,
}

/// Immutable metadata describing a chunk.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChunkMeta {
    /// Statistics extension; absent when filtered out.
    pub misc: Option<MiscExt>,
    /// Block layout extension; absent when filtered out.
    pub blocks: Option<BlocksExt>,
}

impl ChunkMeta {
    /// A copy containing only the extensions named in `tags`.
    pub fn filtered(&self, tags: &[ExtensionTag]) -> Self {
        Self {
            misc: tags
                .contains(&ExtensionTag::Misc)
                .then(|| self.misc.clone())
                .flatten(),
            blocks: tags
                .contains(&ExtensionTag::Blocks)
                .then(|| self.blocks.clone())
                .flatten(),
        }
    }
}

/// Everything a reader needs to consume a chunk, as served by the master.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkSpec {
    /// The chunk.
    pub chunk_id: ChunkId,
    /// Erasure codec of the chunk.
    pub erasure_codec: ErasureCodec,
    /// Current replica locations.
    pub replicas: Vec<ChunkReplica>,
    /// Chunk meta with extensions filtered by the request's tag set.
    pub meta: ChunkMeta,
    /// Lower read bound induced by the tree walk.
    pub lower_limit: ReadLimit,
    /// Upper read bound induced by the tree walk.
    pub upper_limit: ReadLimit,
    /// Overrides the row count (journal chunks read before seal).
    pub row_count_override: Option<i64>,
    /// Overrides the data weight.
    pub data_weight_override: Option<i64>,
    /// Chunk view modifier: timestamp overriding all row timestamps.
    pub override_timestamp: Option<Timestamp>,
    /// Chunk view modifier: clip timestamps above this bound.
    pub max_clip_timestamp: Option<Timestamp>,
}

/// Per-medium replication requirements of a chunk owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationPolicy {
    /// Desired replicas per medium.
    pub replication_factors: BTreeMap<MediumIndex, u8>,
    /// Whether losing the chunk is reported as a vital loss.
    pub vital: bool,
    /// Whether balancing may move replicas.
    pub movable: bool,
}

impl ReplicationPolicy {
    /// Uniform policy on the default medium.
    pub fn with_factor(replication_factor: u8) -> Self {
        Self {
            replication_factors: BTreeMap::from([(DEFAULT_MEDIUM, replication_factor)]),
            vital: true,
            movable: true,
        }
    }

    /// The replication factor on `medium`, zero if the medium is not used.
    pub fn factor(&self, medium: MediumIndex) -> u8 {
        self.replication_factors.get(&medium).copied().unwrap_or(0)
    }
}
