//! Chunk lists and chunk views.

use crate::{ChunkTreeStatistics, CumulativeStatsEntry};
use data_types::{
    ChunkId, ChunkListId, ChunkListKind, ChunkViewId, ReadLimit, StoreId, TabletId, Timestamp,
};
use std::collections::HashSet;

/// A reference to one child of a chunk list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChunkTreeRef {
    /// A chunk leaf.
    Chunk(ChunkId),
    /// A nested chunk list.
    ChunkList(ChunkListId),
    /// A clipped window onto a chunk.
    ChunkView(ChunkViewId),
    /// An unflushed dynamic store of a mounted tablet.
    DynamicStore(StoreId),
}

/// An ordered sequence of chunk tree children with prefix-sum statistics.
///
/// Lists form a DAG: a chunk may appear under many lists, and a list under
/// many parents. The `version` counter is bumped on every structural change
/// and serves as the traverser's optimistic lock token.
#[derive(Debug)]
pub struct ChunkList {
    id: ChunkListId,
    /// What this list roots; decides append behavior at upload time.
    pub kind: ChunkListKind,
    /// Children in order.
    pub(crate) children: Vec<ChunkTreeRef>,
    /// `cumulative[i]` sums children `0..=i`.
    pub(crate) cumulative: Vec<CumulativeStatsEntry>,
    /// Aggregate statistics of the subtree.
    pub(crate) statistics: ChunkTreeStatistics,
    /// Parent lists.
    pub(crate) parents: HashSet<ChunkListId>,
    /// Tablets owning this list (for tablet lists).
    pub owners: HashSet<TabletId>,
    /// Pessimistic "children are key-sorted" flag.
    pub sorted: bool,
    /// Whether rebalancing may change the child set.
    pub rebalancing_enabled: bool,
    /// Structural version; the traverser's optimistic lock token.
    pub(crate) version: u64,
}

impl ChunkList {
    /// Create an empty list of `kind`.
    pub fn new(id: ChunkListId, kind: ChunkListKind) -> Self {
        Self {
            id,
            kind,
            children: Vec::new(),
            cumulative: Vec::new(),
            statistics: ChunkTreeStatistics::empty(),
            parents: HashSet::new(),
            owners: HashSet::new(),
            sorted: matches!(
                kind,
                ChunkListKind::SortedDynamicRoot
                    | ChunkListKind::SortedDynamicTablet
                    | ChunkListKind::SortedDynamicSubtablet
            ),
            rebalancing_enabled: matches!(kind, ChunkListKind::Static),
            version: 0,
        }
    }

    /// The list id.
    pub fn id(&self) -> ChunkListId {
        self.id
    }

    /// Children in order.
    pub fn children(&self) -> &[ChunkTreeRef] {
        &self.children
    }

    /// Prefix sums aligned with [`ChunkList::children`].
    pub fn cumulative(&self) -> &[CumulativeStatsEntry] {
        &self.cumulative
    }

    /// Aggregate statistics of the subtree.
    pub fn statistics(&self) -> &ChunkTreeStatistics {
        &self.statistics
    }

    /// Parent lists.
    pub fn parents(&self) -> &HashSet<ChunkListId> {
        &self.parents
    }

    /// The optimistic lock token.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Whether children carry a meaningful row order (journal and static
    /// subtrees do; a sorted-dynamic root's tablets each restart at row 0).
    pub fn is_ordered(&self) -> bool {
        matches!(
            self.kind,
            ChunkListKind::Static | ChunkListKind::JournalRoot
        )
    }
}

/// A window onto an underlying chunk: clipped by a read range and optionally
/// retimestamped.
#[derive(Debug)]
pub struct ChunkView {
    id: ChunkViewId,
    /// The chunk the view clips.
    pub underlying: ChunkId,
    /// Lower clip bound.
    pub lower_limit: ReadLimit,
    /// Upper clip bound.
    pub upper_limit: ReadLimit,
    /// Overrides all row timestamps of the underlying chunk.
    pub override_timestamp: Option<Timestamp>,
    /// Clips row versions above this timestamp.
    pub max_clip_timestamp: Option<Timestamp>,
}

impl ChunkView {
    /// Create a view over `underlying` clipped to the given range.
    pub fn new(
        id: ChunkViewId,
        underlying: ChunkId,
        lower_limit: ReadLimit,
        upper_limit: ReadLimit,
    ) -> Self {
        Self {
            id,
            underlying,
            lower_limit,
            upper_limit,
            override_timestamp: None,
            max_clip_timestamp: None,
        }
    }

    /// The view id.
    pub fn id(&self) -> ChunkViewId {
        self.id
    }
}
