//! The arena owning all chunk tree entities, addressed by stable ids.
//!
//! Parent links are back-references kept consistent by [`ChunkForest::attach`]
//! and [`ChunkForest::detach`]; statistics flow upward through the DAG on
//! every structural change.

use crate::{
    Chunk, ChunkList, ChunkTreeRef, ChunkTreeStatistics, ChunkView, CumulativeStatsEntry, Error,
    NoSuchChunkListSnafu, NoSuchChunkSnafu, NoSuchChunkViewSnafu, Result, WouldFormCycleSnafu,
};
use data_types::{
    ChunkId, ChunkListId, ChunkListKind, ChunkViewId, EntityKind, ReplicationPolicy, RowKey,
    TabletId,
};
use std::collections::{HashMap, HashSet, VecDeque};

/// Owns every chunk, chunk list and chunk view of one master.
#[derive(Debug, Default)]
pub struct ChunkForest {
    chunks: HashMap<ChunkId, Chunk>,
    lists: HashMap<ChunkListId, ChunkList>,
    views: HashMap<ChunkViewId, ChunkView>,
    next_unique: u64,
}

impl ChunkForest {
    /// Create an empty forest.
    pub fn new() -> Self {
        Default::default()
    }

    fn next_unique(&mut self) -> u64 {
        self.next_unique += 1;
        self.next_unique
    }

    // -----------------------------------------------------------------------
    // Entity lifecycle
    // -----------------------------------------------------------------------

    /// Create an unconfirmed chunk of the given flavor.
    pub fn create_chunk(&mut self, kind: EntityKind, policy: ReplicationPolicy) -> ChunkId {
        let id = ChunkId::new(kind, self.next_unique());
        self.chunks.insert(id, Chunk::new(id, policy));
        id
    }

    /// Create an empty chunk list.
    pub fn create_chunk_list(&mut self, kind: ChunkListKind) -> ChunkListId {
        let unique = self.next_unique();
        let id = ChunkListId::new(unique);
        self.lists.insert(id, ChunkList::new(id, kind));
        id
    }

    /// Create a chunk view over `underlying`.
    pub fn create_chunk_view(&mut self, view: impl FnOnce(ChunkViewId) -> ChunkView) -> ChunkViewId {
        let unique = self.next_unique();
        let id = ChunkViewId::new(unique);
        self.views.insert(id, view(id));
        id
    }

    /// Destroy a chunk. The caller detaches it from all parents first.
    pub fn remove_chunk(&mut self, chunk_id: ChunkId) -> Result<Chunk> {
        self.chunks
            .remove(&chunk_id)
            .ok_or_else(|| NoSuchChunkSnafu { chunk_id }.build())
    }

    /// Whether `chunk_id` still exists.
    pub fn contains_chunk(&self, chunk_id: ChunkId) -> bool {
        self.chunks.contains_key(&chunk_id)
    }

    /// Number of chunks in the forest.
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// All chunk ids, in no particular order.
    pub fn chunk_ids(&self) -> impl Iterator<Item = ChunkId> + '_ {
        self.chunks.keys().copied()
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    /// Borrow a chunk.
    pub fn chunk(&self, chunk_id: ChunkId) -> Result<&Chunk> {
        self.chunks
            .get(&chunk_id)
            .ok_or_else(|| NoSuchChunkSnafu { chunk_id }.build())
    }

    /// Mutably borrow a chunk.
    pub fn chunk_mut(&mut self, chunk_id: ChunkId) -> Result<&mut Chunk> {
        self.chunks
            .get_mut(&chunk_id)
            .ok_or_else(|| NoSuchChunkSnafu { chunk_id }.build())
    }

    /// Borrow a chunk list.
    pub fn list(&self, chunk_list_id: ChunkListId) -> Result<&ChunkList> {
        self.lists
            .get(&chunk_list_id)
            .ok_or_else(|| NoSuchChunkListSnafu { chunk_list_id }.build())
    }

    /// Record that `owner` (a tablet) owns the given list.
    pub fn set_list_owner(&mut self, chunk_list_id: ChunkListId, owner: TabletId) -> Result<()> {
        self.list_mut(chunk_list_id)?.owners.insert(owner);
        Ok(())
    }

    /// Borrow a chunk view.
    pub fn view(&self, chunk_view_id: ChunkViewId) -> Result<&ChunkView> {
        self.views
            .get(&chunk_view_id)
            .ok_or_else(|| NoSuchChunkViewSnafu { chunk_view_id }.build())
    }

    // -----------------------------------------------------------------------
    // Structure
    // -----------------------------------------------------------------------

    /// Append `children` to a chunk list.
    ///
    /// Maintains parent back-links, prefix sums, aggregate statistics of the
    /// list and all its ancestors, and bumps the list version.
    pub fn attach(&mut self, chunk_list_id: ChunkListId, children: &[ChunkTreeRef]) -> Result<()> {
        // Reject children whose subtree already contains the target list.
        for child in children {
            if let ChunkTreeRef::ChunkList(child_list) = child {
                if *child_list == chunk_list_id || self.subtree_contains(*child_list, chunk_list_id)?
                {
                    return WouldFormCycleSnafu { chunk_list_id }.fail();
                }
            }
        }

        // Validate all children exist before mutating anything.
        for child in children {
            self.child_statistics(*child)?;
        }
        self.list(chunk_list_id)?;

        for child in children {
            let statistics = self.child_statistics(*child)?;
            match child {
                ChunkTreeRef::Chunk(id) => {
                    self.chunk_mut(*id)?.add_parent(chunk_list_id);
                }
                ChunkTreeRef::ChunkList(id) => {
                    self.list_mut(*id)?.parents.insert(chunk_list_id);
                }
                ChunkTreeRef::ChunkView(_) | ChunkTreeRef::DynamicStore(_) => {}
            }
            let list = self.list_mut(chunk_list_id)?;
            let prefix = list.cumulative.last().copied().unwrap_or_default();
            list.cumulative.push(prefix.plus(&statistics));
            list.children.push(*child);
        }

        let list = self.list_mut(chunk_list_id)?;
        list.version += 1;
        self.recompute_statistics(chunk_list_id)?;
        self.propagate_to_ancestors(chunk_list_id)?;
        Ok(())
    }

    /// Remove the first occurrence of each of `children` from a chunk list.
    pub fn detach(&mut self, chunk_list_id: ChunkListId, children: &[ChunkTreeRef]) -> Result<()> {
        self.list(chunk_list_id)?;
        for child in children {
            let position = self
                .list(chunk_list_id)?
                .children
                .iter()
                .position(|c| c == child);
            let Some(position) = position else { continue };

            self.list_mut(chunk_list_id)?.children.remove(position);
            match child {
                ChunkTreeRef::Chunk(id) => {
                    if let Ok(chunk) = self.chunk_mut(*id) {
                        chunk.remove_parent(chunk_list_id);
                    }
                }
                ChunkTreeRef::ChunkList(id) => {
                    if let Ok(list) = self.list_mut(*id) {
                        list.parents.remove(&chunk_list_id);
                    }
                }
                ChunkTreeRef::ChunkView(_) | ChunkTreeRef::DynamicStore(_) => {}
            }
        }

        self.rebuild_cumulative(chunk_list_id)?;
        let list = self.list_mut(chunk_list_id)?;
        list.version += 1;
        self.recompute_statistics(chunk_list_id)?;
        self.propagate_to_ancestors(chunk_list_id)?;
        Ok(())
    }

    fn list_mut(&mut self, chunk_list_id: ChunkListId) -> Result<&mut ChunkList> {
        self.lists
            .get_mut(&chunk_list_id)
            .ok_or_else(|| NoSuchChunkListSnafu { chunk_list_id }.build())
    }

    fn subtree_contains(&self, root: ChunkListId, needle: ChunkListId) -> Result<bool> {
        let mut queue = VecDeque::from([root]);
        let mut seen = HashSet::new();
        while let Some(current) = queue.pop_front() {
            if !seen.insert(current) {
                continue;
            }
            if current == needle {
                return Ok(true);
            }
            for child in &self.list(current)?.children {
                if let ChunkTreeRef::ChunkList(id) = child {
                    queue.push_back(*id);
                }
            }
        }
        Ok(false)
    }

    fn rebuild_cumulative(&mut self, chunk_list_id: ChunkListId) -> Result<()> {
        let children = self.list(chunk_list_id)?.children.clone();
        let mut cumulative = Vec::with_capacity(children.len());
        let mut prefix = CumulativeStatsEntry::default();
        for child in children {
            prefix = prefix.plus(&self.child_statistics(child)?);
            cumulative.push(prefix);
        }
        self.list_mut(chunk_list_id)?.cumulative = cumulative;
        Ok(())
    }

    fn recompute_statistics(&mut self, chunk_list_id: ChunkListId) -> Result<()> {
        let children = self.list(chunk_list_id)?.children.clone();
        let mut statistics = ChunkTreeStatistics::empty();
        let mut max_child_rank = -1;
        for child in children {
            let child_statistics = self.child_statistics(child)?;
            statistics.accumulate(&child_statistics);
            max_child_rank = max_child_rank.max(child_statistics.rank);
        }
        statistics.rank = max_child_rank + 1;
        self.list_mut(chunk_list_id)?.statistics = statistics;
        Ok(())
    }

    // Recompute ancestors in topological (deepest first) order, so that every
    // list is refreshed only after all its changed children are.
    fn propagate_to_ancestors(&mut self, changed: ChunkListId) -> Result<()> {
        let mut depth: HashMap<ChunkListId, usize> = HashMap::new();
        let mut queue = VecDeque::from([(changed, 0usize)]);
        while let Some((current, d)) = queue.pop_front() {
            for parent in self.list(current)?.parents.clone() {
                let entry = depth.entry(parent).or_insert(0);
                if *entry < d + 1 {
                    *entry = d + 1;
                    queue.push_back((parent, d + 1));
                }
            }
        }
        let mut ancestors: Vec<_> = depth.into_iter().collect();
        ancestors.sort_by_key(|(_, d)| *d);
        for (ancestor, _) in ancestors {
            self.rebuild_cumulative(ancestor)?;
            self.recompute_statistics(ancestor)?;
            self.list_mut(ancestor)?.version += 1;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Traverser support
    // -----------------------------------------------------------------------

    /// Statistics of any child reference. Dynamic stores report an unsealed,
    /// zero-sized subtree (their row count is open-ended).
    pub fn child_statistics(&self, child: ChunkTreeRef) -> Result<ChunkTreeStatistics> {
        Ok(match child {
            ChunkTreeRef::Chunk(id) => self.chunk(id)?.statistics(),
            ChunkTreeRef::ChunkList(id) => *self.list(id)?.statistics(),
            ChunkTreeRef::ChunkView(id) => self.chunk(self.view(id)?.underlying)?.statistics(),
            ChunkTreeRef::DynamicStore(_) => ChunkTreeStatistics {
                sealed: false,
                ..ChunkTreeStatistics::empty()
            },
        })
    }

    /// Whether a child contributes no rows and never will.
    pub fn child_is_empty(&self, child: ChunkTreeRef) -> Result<bool> {
        Ok(match child {
            ChunkTreeRef::Chunk(id) => {
                let chunk = self.chunk(id)?;
                chunk.confirmed && chunk.row_count() == 0
            }
            ChunkTreeRef::ChunkView(id) => {
                let chunk = self.chunk(self.view(id)?.underlying)?;
                chunk.confirmed && chunk.row_count() == 0
            }
            ChunkTreeRef::ChunkList(id) => self.list(id)?.children().is_empty(),
            ChunkTreeRef::DynamicStore(_) => false,
        })
    }

    /// The smallest key below a child, `None` when undefined (empty subtrees,
    /// dynamic stores, unkeyed chunks).
    pub fn child_min_key(&self, child: ChunkTreeRef) -> Result<Option<RowKey>> {
        Ok(match child {
            ChunkTreeRef::Chunk(id) => self.chunk(id)?.min_key().cloned(),
            ChunkTreeRef::ChunkView(id) => {
                let view = self.view(id)?;
                let underlying = self.chunk(view.underlying)?.min_key().cloned();
                match (&view.lower_limit.key, underlying) {
                    (Some(clip), Some(min)) => Some(min.max(clip.clone())),
                    (Some(clip), None) => Some(clip.clone()),
                    (None, min) => min,
                }
            }
            ChunkTreeRef::ChunkList(id) => {
                let list = self.list(id)?;
                for child in list.children() {
                    if !self.child_is_empty(*child)? {
                        if let Some(key) = self.child_min_key(*child)? {
                            return Ok(Some(key));
                        }
                    }
                }
                None
            }
            ChunkTreeRef::DynamicStore(_) => None,
        })
    }

    /// The largest key below a child, `None` when undefined.
    pub fn child_max_key(&self, child: ChunkTreeRef) -> Result<Option<RowKey>> {
        Ok(match child {
            ChunkTreeRef::Chunk(id) => self.chunk(id)?.max_key().cloned(),
            ChunkTreeRef::ChunkView(id) => {
                let view = self.view(id)?;
                let underlying = self.chunk(view.underlying)?.max_key().cloned();
                match (&view.upper_limit.key, underlying) {
                    (Some(clip), Some(max)) => Some(max.min(clip.clone())),
                    (Some(clip), None) => Some(clip.clone()),
                    (None, max) => max,
                }
            }
            ChunkTreeRef::ChunkList(id) => {
                let list = self.list(id)?;
                for child in list.children().iter().rev() {
                    if !self.child_is_empty(*child)? {
                        if let Some(key) = self.child_max_key(*child)? {
                            return Ok(Some(key));
                        }
                    }
                }
                None
            }
            ChunkTreeRef::DynamicStore(_) => None,
        })
    }

    /// Validate a traverser's recorded version of a list.
    pub fn check_version(&self, chunk_list_id: ChunkListId, expected: u64) -> Result<()> {
        let list = self.list(chunk_list_id)?;
        if list.version() != expected {
            return Err(Error::OptimisticLockFailure {
                chunk_list_id,
                expected,
            });
        }
        Ok(())
    }
}
