//! Walks a chunk tree under read limits and emits overlapping leaves.
//!
//! The walk keeps an explicit stack and records each list's version on push;
//! if a list changes while the walk is parked between steps, the next step
//! fails with a retriable optimistic-lock error. A step emits at most
//! [`MAX_CHUNKS_PER_STEP`] leaves, after which the driver is expected to
//! yield its invoker (charging elapsed time to the reader) and call
//! [`ChunkTreeTraverser::run_step`] again.

use crate::{ChunkForest, ChunkTreeRef, Result};
use data_types::{ChunkListId, ReadLimit, RowKey, Timestamp};

/// Leaves emitted per synchronous batch before yielding.
pub const MAX_CHUNKS_PER_STEP: usize = 1000;

/// A leaf overlapping the read limits, with its induced sub-range.
#[derive(Debug, Clone, PartialEq)]
pub struct TraversedLeaf {
    /// The leaf: a chunk or a dynamic store. Chunk views are resolved to
    /// their underlying chunk with the clip folded into the limits.
    pub leaf: ChunkTreeRef,
    /// Absolute row index of the leaf's first row within the walked root.
    pub row_index: i64,
    /// Lower bound within the leaf.
    pub lower_limit: ReadLimit,
    /// Upper bound within the leaf.
    pub upper_limit: ReadLimit,
    /// Chunk view modifier, if the leaf was reached through a view.
    pub override_timestamp: Option<Timestamp>,
    /// Chunk view modifier, if the leaf was reached through a view.
    pub max_clip_timestamp: Option<Timestamp>,
}

/// Consumes traversed leaves.
pub trait ChunkVisitor {
    /// Handle one leaf; return `false` to stop the walk.
    fn on_leaf(&mut self, leaf: TraversedLeaf) -> bool;
}

impl<F: FnMut(TraversedLeaf) -> bool> ChunkVisitor for F {
    fn on_leaf(&mut self, leaf: TraversedLeaf) -> bool {
        self(leaf)
    }
}

/// The outcome of one traverser step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// The walk is complete (or the visitor stopped it).
    Finished,
    /// The step budget was spent; call `run_step` again after yielding.
    Yielded,
}

#[derive(Debug)]
struct StackEntry {
    list: ChunkListId,
    version: u64,
    child_index: usize,
    row_index: i64,
    lower: ReadLimit,
    upper: ReadLimit,
}

/// Binary search tolerating entries whose ordering key is missing.
///
/// Returns the position of the first entry for which `is_less` holds,
/// scanning left past missing entries at each probe; `len` if none.
fn upper_bound_with_missing_values(
    len: usize,
    is_less: &dyn Fn(usize) -> bool,
    is_missing: &dyn Fn(usize) -> bool,
) -> usize {
    if len == 0 {
        return 0;
    }
    let mut start = 0usize;
    let mut end = len;
    loop {
        let distance = end - start;
        if distance <= 1 {
            break;
        }
        let median = start + distance / 2;
        let mut cur = median;
        while cur > start && is_missing(cur) {
            cur -= 1;
        }
        if is_missing(cur) {
            start = median;
        } else if is_less(cur) {
            end = cur;
        } else {
            start = median;
        }
    }
    if !is_missing(start) && is_less(start) {
        start
    } else {
        end
    }
}

/// A resumable chunk tree walk.
#[derive(Debug)]
pub struct ChunkTreeTraverser {
    stack: Vec<StackEntry>,
}

impl ChunkTreeTraverser {
    /// Start a walk from `root` bounded by `lower`/`upper`.
    pub fn new(
        forest: &ChunkForest,
        root: ChunkListId,
        lower: ReadLimit,
        upper: ReadLimit,
    ) -> Result<Self> {
        let child_index = Self::start_child_index(forest, root, &lower)?;
        let version = forest.list(root)?.version();
        Ok(Self {
            stack: vec![StackEntry {
                list: root,
                version,
                child_index,
                row_index: 0,
                lower,
                upper,
            }],
        })
    }

    /// Whether the walk has finished.
    pub fn is_finished(&self) -> bool {
        self.stack.is_empty()
    }

    /// Process up to [`MAX_CHUNKS_PER_STEP`] leaves.
    pub fn run_step(
        &mut self,
        forest: &ChunkForest,
        visitor: &mut dyn ChunkVisitor,
    ) -> Result<StepOutcome> {
        let mut visited = 0usize;
        while visited < MAX_CHUNKS_PER_STEP {
            let (top_list, top_version, child_index, entry_row_index, entry_lower, entry_upper) = {
                let Some(top) = self.stack.last() else {
                    return Ok(StepOutcome::Finished);
                };
                (
                    top.list,
                    top.version,
                    top.child_index,
                    top.row_index,
                    top.lower.clone(),
                    top.upper.clone(),
                )
            };
            if let Err(e) = forest.check_version(top_list, top_version) {
                self.stack.clear();
                return Err(e);
            }

            let list = forest.list(top_list)?;
            if child_index == list.children().len() {
                self.stack.pop();
                continue;
            }
            let child = list.children()[child_index];

            // Empty children have no min/max keys; skip them outright.
            if forest.child_is_empty(child)? {
                self.stack.last_mut().expect("entry exists").child_index += 1;
                continue;
            }

            let statistics = *list.statistics();
            let ordered = list.is_ordered();
            let sorted = list.sorted;
            let child_count = list.children().len();

            let prev_sum = |member: fn(&crate::CumulativeStatsEntry) -> i64| -> i64 {
                if child_index == 0 {
                    0
                } else {
                    member(&list.cumulative()[child_index - 1])
                }
            };
            let current_sum =
                |member: fn(&crate::CumulativeStatsEntry) -> i64, fallback: i64| -> i64 {
                    if child_index == child_count - 1 {
                        fallback
                    } else {
                        member(&list.cumulative()[child_index])
                    }
                };

            let mut child_lower = ReadLimit::unbounded();
            let mut child_upper = ReadLimit::unbounded();
            let mut row_index = 0i64;

            if ordered {
                // Row index.
                {
                    let child_limit = prev_sum(|e| e.row_count);
                    row_index = entry_row_index + child_limit;
                    if let Some(upper_row) = entry_upper.row_index {
                        if upper_row <= child_limit {
                            self.stack.pop();
                            continue;
                        }
                        child_lower.row_index = Some(child_limit);
                        let total_rows = if statistics.sealed {
                            statistics.row_count
                        } else {
                            i64::MAX
                        };
                        child_upper.row_index = Some(current_sum(|e| e.row_count, total_rows));
                    } else if entry_lower.row_index.is_some() {
                        child_lower.row_index = Some(child_limit);
                    }
                }

                // Chunk index.
                {
                    let child_limit = prev_sum(|e| e.chunk_count);
                    if let Some(upper_chunk) = entry_upper.chunk_index {
                        if upper_chunk <= child_limit {
                            self.stack.pop();
                            continue;
                        }
                        child_lower.chunk_index = Some(child_limit);
                        child_upper.chunk_index =
                            Some(current_sum(|e| e.chunk_count, statistics.chunk_count));
                    } else if entry_lower.chunk_index.is_some() {
                        child_lower.chunk_index = Some(child_limit);
                    }
                }

                // Offset.
                {
                    let child_limit = prev_sum(|e| e.data_size);
                    if let Some(upper_offset) = entry_upper.offset {
                        if upper_offset <= child_limit {
                            self.stack.pop();
                            continue;
                        }
                        child_lower.offset = Some(child_limit);
                        child_upper.offset =
                            Some(current_sum(|e| e.data_size, statistics.uncompressed_data_size));
                    } else if entry_lower.offset.is_some() {
                        child_lower.offset = Some(child_limit);
                    }
                }
            }

            // Key.
            if let Some(upper_key) = &entry_upper.key {
                child_lower.key = forest.child_min_key(child)?;
                if let Some(child_min) = &child_lower.key {
                    if upper_key <= child_min {
                        if sorted {
                            // Children are key-ordered; everything further
                            // right is beyond the bound too.
                            self.stack.pop();
                        } else {
                            self.stack.last_mut().expect("entry exists").child_index += 1;
                        }
                        continue;
                    }
                }
                child_upper.key = forest.child_max_key(child)?;
            } else if entry_lower.key.is_some() {
                child_lower.key = forest.child_min_key(child)?;
            }

            let entry = self.stack.last_mut().expect("entry exists");
            entry.child_index += 1;
            let (start_limit, end_limit) =
                Self::induced_subtree_limits(entry, &child_lower, &child_upper);

            match child {
                ChunkTreeRef::ChunkList(child_list) => {
                    let child_index = Self::start_child_index(forest, child_list, &start_limit)?;
                    let version = forest.list(child_list)?.version();
                    self.stack.push(StackEntry {
                        list: child_list,
                        version,
                        child_index,
                        row_index,
                        lower: start_limit,
                        upper: end_limit,
                    });
                }
                ChunkTreeRef::Chunk(_) | ChunkTreeRef::DynamicStore(_) => {
                    let leaf = TraversedLeaf {
                        leaf: child,
                        row_index,
                        lower_limit: start_limit,
                        upper_limit: end_limit,
                        override_timestamp: None,
                        max_clip_timestamp: None,
                    };
                    if !visitor.on_leaf(leaf) {
                        self.stack.clear();
                        return Ok(StepOutcome::Finished);
                    }
                    visited += 1;
                }
                ChunkTreeRef::ChunkView(view_id) => {
                    let view = forest.view(view_id)?;
                    let leaf = TraversedLeaf {
                        leaf: ChunkTreeRef::Chunk(view.underlying),
                        row_index,
                        lower_limit: merge_lower(&start_limit, &view.lower_limit),
                        upper_limit: merge_upper(&end_limit, &view.upper_limit),
                        override_timestamp: view.override_timestamp,
                        max_clip_timestamp: view.max_clip_timestamp,
                    };
                    if !visitor.on_leaf(leaf) {
                        self.stack.clear();
                        return Ok(StepOutcome::Finished);
                    }
                    visited += 1;
                }
            }
        }
        Ok(StepOutcome::Yielded)
    }

    fn start_child_index(
        forest: &ChunkForest,
        list_id: ChunkListId,
        lower: &ReadLimit,
    ) -> Result<usize> {
        let list = forest.list(list_id)?;
        if list.children().is_empty() {
            return Ok(0);
        }
        let statistics = *list.statistics();
        let cumulative = list.cumulative();
        let child_count = list.children().len();
        let mut result = 0usize;

        let mut adjust =
            |member: fn(&crate::CumulativeStatsEntry) -> i64, limit: i64, total: i64, prefix: usize| {
                if limit < total {
                    let position = cumulative[..prefix].partition_point(|e| member(e) <= limit);
                    result = result.max(position);
                } else {
                    result = child_count;
                }
            };

        if let Some(row_limit) = lower.row_index {
            let total_rows = if statistics.sealed {
                statistics.row_count
            } else {
                i64::MAX
            };
            // Prefix sums at or past the first unsealed child understate the
            // real row count; the search must not step over them.
            let mut sealed_prefix = child_count;
            for (index, child) in list.children().iter().enumerate() {
                if !forest.child_statistics(*child)?.sealed {
                    sealed_prefix = index;
                    break;
                }
            }
            adjust(|e| e.row_count, row_limit, total_rows, sealed_prefix);
        }
        if let Some(chunk_limit) = lower.chunk_index {
            adjust(|e| e.chunk_count, chunk_limit, statistics.chunk_count, child_count);
        }
        if let Some(offset_limit) = lower.offset {
            adjust(
                |e| e.data_size,
                offset_limit,
                statistics.uncompressed_data_size,
                child_count,
            );
        }

        if let Some(key_limit) = &lower.key {
            // Search the children in reverse: skip the suffix of children
            // entirely below the key, tolerating empty ones.
            let max_keys = list
                .children()
                .iter()
                .map(|child| forest.child_max_key(*child))
                .collect::<Result<Vec<Option<RowKey>>>>()?;
            let empties = list
                .children()
                .iter()
                .map(|child| forest.child_is_empty(*child))
                .collect::<Result<Vec<bool>>>()?;

            let reversed = |i: usize| child_count - 1 - i;
            let position = upper_bound_with_missing_values(
                child_count,
                &|i| match &max_keys[reversed(i)] {
                    Some(max_key) => key_limit > max_key,
                    None => false,
                },
                &|i| empties[reversed(i)],
            );
            result = result.max(child_count - position);
        }

        Ok(result)
    }

    fn induced_subtree_limits(
        entry: &StackEntry,
        child_lower: &ReadLimit,
        child_upper: &ReadLimit,
    ) -> (ReadLimit, ReadLimit) {
        let mut start = ReadLimit::unbounded();
        let mut end = ReadLimit::unbounded();

        // Row index.
        if let (Some(lower_row), Some(child_row)) = (entry.lower.row_index, child_lower.row_index)
        {
            let new_lower = lower_row - child_row;
            if new_lower > 0 {
                start.row_index = Some(new_lower);
            }
        }
        if let (Some(upper_row), Some(child_upper_row)) =
            (entry.upper.row_index, child_upper.row_index)
        {
            if upper_row < child_upper_row {
                end.row_index = Some(upper_row - child_lower.row_index.unwrap_or(0));
            }
        }

        // Chunk index.
        if let (Some(lower_chunk), Some(child_chunk)) =
            (entry.lower.chunk_index, child_lower.chunk_index)
        {
            let new_lower = lower_chunk - child_chunk;
            if new_lower > 0 {
                start.chunk_index = Some(new_lower);
            }
        }
        if let (Some(upper_chunk), Some(child_upper_chunk)) =
            (entry.upper.chunk_index, child_upper.chunk_index)
        {
            if upper_chunk < child_upper_chunk {
                end.chunk_index = Some(upper_chunk - child_lower.chunk_index.unwrap_or(0));
            }
        }

        // Offset.
        if let (Some(lower_offset), Some(child_offset)) = (entry.lower.offset, child_lower.offset)
        {
            let new_lower = lower_offset - child_offset;
            if new_lower > 0 {
                start.offset = Some(new_lower);
            }
        }
        if let (Some(upper_offset), Some(child_upper_offset)) =
            (entry.upper.offset, child_upper.offset)
        {
            if upper_offset < child_upper_offset {
                end.offset = Some(upper_offset - child_lower.offset.unwrap_or(0));
            }
        }

        // Key.
        if let Some(lower_key) = &entry.lower.key {
            let tighter = match &child_lower.key {
                Some(child_key) => lower_key > child_key,
                None => true,
            };
            if tighter {
                start.key = Some(lower_key.clone());
            }
        }
        if let Some(upper_key) = &entry.upper.key {
            let tighter = match &child_upper.key {
                Some(child_key) => upper_key < child_key,
                None => true,
            };
            if tighter {
                end.key = Some(upper_key.clone());
            }
        }

        (start, end)
    }
}

fn merge_lower(a: &ReadLimit, b: &ReadLimit) -> ReadLimit {
    ReadLimit {
        row_index: max_option(a.row_index, b.row_index),
        chunk_index: max_option(a.chunk_index, b.chunk_index),
        offset: max_option(a.offset, b.offset),
        key: max_option(a.key.clone(), b.key.clone()),
    }
}

fn merge_upper(a: &ReadLimit, b: &ReadLimit) -> ReadLimit {
    ReadLimit {
        row_index: min_option(a.row_index, b.row_index),
        chunk_index: min_option(a.chunk_index, b.chunk_index),
        offset: min_option(a.offset, b.offset),
        key: min_option(a.key.clone(), b.key.clone()),
    }
}

fn max_option<T: Ord>(a: Option<T>, b: Option<T>) -> Option<T> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, None) => a,
        (None, b) => b,
    }
}

fn min_option<T: Ord>(a: Option<T>, b: Option<T>) -> Option<T> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, None) => a,
        (None, b) => b,
    }
}

/// Walk `root` to completion synchronously, collecting all overlapping
/// leaves. The non-preemptable variant used by admin tooling and tests.
pub fn enumerate_chunks(
    forest: &ChunkForest,
    root: ChunkListId,
    lower: ReadLimit,
    upper: ReadLimit,
) -> Result<Vec<TraversedLeaf>> {
    let mut traverser = ChunkTreeTraverser::new(forest, root, lower, upper)?;
    let mut leaves = Vec::new();
    let mut visitor = |leaf: TraversedLeaf| {
        leaves.push(leaf);
        true
    };
    while traverser.run_step(forest, &mut visitor)? == StepOutcome::Yielded {}
    Ok(leaves)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ChunkView;
    use data_types::{
        ChunkId, ChunkListKind, ChunkMeta, EntityKind, MiscExt, ReplicationPolicy, Value,
    };

    fn key(v: i64) -> RowKey {
        RowKey(vec![Value::Int64(v)])
    }

    fn add_chunk(
        forest: &mut ChunkForest,
        rows: i64,
        keys: Option<(i64, i64)>,
        sealed: bool,
    ) -> ChunkId {
        let id = forest.create_chunk(EntityKind::Chunk, ReplicationPolicy::with_factor(3));
        forest.chunk_mut(id).unwrap().confirm(ChunkMeta {
            misc: Some(MiscExt {
                row_count: rows,
                uncompressed_data_size: rows * 10,
                sealed,
                min_key: keys.map(|(min, _)| key(min)),
                max_key: keys.map(|(_, max)| key(max)),
                ..Default::default()
            }),
            blocks: None,
        });
        id
    }

    fn leaf_ids(leaves: &[TraversedLeaf]) -> Vec<ChunkTreeRef> {
        leaves.iter().map(|l| l.leaf).collect()
    }

    #[test]
    fn unbounded_walk_emits_all_leaves_in_order() {
        let mut forest = ChunkForest::new();
        let root = forest.create_chunk_list(ChunkListKind::Static);
        let inner = forest.create_chunk_list(ChunkListKind::Static);
        let a = add_chunk(&mut forest, 10, None, true);
        let b = add_chunk(&mut forest, 20, None, true);
        let c = add_chunk(&mut forest, 30, None, true);

        forest.attach(inner, &[ChunkTreeRef::Chunk(b)]).unwrap();
        forest
            .attach(
                root,
                &[
                    ChunkTreeRef::Chunk(a),
                    ChunkTreeRef::ChunkList(inner),
                    ChunkTreeRef::Chunk(c),
                ],
            )
            .unwrap();

        let leaves = enumerate_chunks(
            &forest,
            root,
            ReadLimit::unbounded(),
            ReadLimit::unbounded(),
        )
        .unwrap();
        assert_eq!(
            leaf_ids(&leaves),
            vec![
                ChunkTreeRef::Chunk(a),
                ChunkTreeRef::Chunk(b),
                ChunkTreeRef::Chunk(c)
            ]
        );
        assert_eq!(
            leaves.iter().map(|l| l.row_index).collect::<Vec<_>>(),
            vec![0, 10, 30]
        );
    }

    #[test]
    fn row_limits_clip_and_skip() {
        let mut forest = ChunkForest::new();
        let root = forest.create_chunk_list(ChunkListKind::Static);
        let a = add_chunk(&mut forest, 10, None, true);
        let b = add_chunk(&mut forest, 10, None, true);
        let c = add_chunk(&mut forest, 10, None, true);
        forest
            .attach(
                root,
                &[
                    ChunkTreeRef::Chunk(a),
                    ChunkTreeRef::Chunk(b),
                    ChunkTreeRef::Chunk(c),
                ],
            )
            .unwrap();

        // Rows [12, 25): skips chunk a, clips b's start and c's end.
        let leaves = enumerate_chunks(
            &forest,
            root,
            ReadLimit::at_row_index(12),
            ReadLimit::at_row_index(25),
        )
        .unwrap();
        assert_eq!(
            leaf_ids(&leaves),
            vec![ChunkTreeRef::Chunk(b), ChunkTreeRef::Chunk(c)]
        );
        assert_eq!(leaves[0].lower_limit.row_index, Some(2));
        assert_eq!(leaves[0].upper_limit.row_index, None);
        assert_eq!(leaves[1].lower_limit.row_index, None);
        assert_eq!(leaves[1].upper_limit.row_index, Some(5));
    }

    #[test]
    fn key_limits_respect_chunk_key_ranges() {
        let mut forest = ChunkForest::new();
        let root = forest.create_chunk_list(ChunkListKind::SortedDynamicTablet);
        let a = add_chunk(&mut forest, 5, Some((0, 9)), true);
        let b = add_chunk(&mut forest, 5, Some((10, 19)), true);
        let c = add_chunk(&mut forest, 5, Some((20, 29)), true);
        forest
            .attach(
                root,
                &[
                    ChunkTreeRef::Chunk(a),
                    ChunkTreeRef::Chunk(b),
                    ChunkTreeRef::Chunk(c),
                ],
            )
            .unwrap();

        let leaves = enumerate_chunks(
            &forest,
            root,
            ReadLimit::at_key(key(12)),
            ReadLimit::at_key(key(20)),
        )
        .unwrap();
        // Chunk a lies entirely below key 12; chunk c's min key (20) is not
        // below the exclusive upper bound.
        assert_eq!(leaf_ids(&leaves), vec![ChunkTreeRef::Chunk(b)]);
        assert_eq!(leaves[0].lower_limit.key, Some(key(12)));
        // Chunk b ends at key 19, inside the bound; no upper clip is needed.
        assert_eq!(leaves[0].upper_limit.key, None);
    }

    #[test]
    fn empty_children_are_tolerated_in_key_search() {
        let mut forest = ChunkForest::new();
        let root = forest.create_chunk_list(ChunkListKind::SortedDynamicTablet);
        let a = add_chunk(&mut forest, 5, Some((0, 9)), true);
        let empty = add_chunk(&mut forest, 0, None, true);
        let b = add_chunk(&mut forest, 5, Some((10, 19)), true);
        forest
            .attach(
                root,
                &[
                    ChunkTreeRef::Chunk(a),
                    ChunkTreeRef::Chunk(empty),
                    ChunkTreeRef::Chunk(b),
                ],
            )
            .unwrap();

        let leaves = enumerate_chunks(
            &forest,
            root,
            ReadLimit::at_key(key(15)),
            ReadLimit::unbounded(),
        )
        .unwrap();
        assert_eq!(leaf_ids(&leaves), vec![ChunkTreeRef::Chunk(b)]);
    }

    #[test]
    fn empty_list_produces_no_leaves() {
        let mut forest = ChunkForest::new();
        let root = forest.create_chunk_list(ChunkListKind::Static);
        let leaves = enumerate_chunks(
            &forest,
            root,
            ReadLimit::at_row_index(0),
            ReadLimit::at_row_index(100),
        )
        .unwrap();
        assert!(leaves.is_empty());
    }

    #[test]
    fn unsealed_tail_is_open_ended() {
        let mut forest = ChunkForest::new();
        let root = forest.create_chunk_list(ChunkListKind::JournalRoot);
        let sealed = add_chunk(&mut forest, 10, None, true);
        let unsealed = add_chunk(&mut forest, 0, None, false);
        forest
            .attach(
                root,
                &[ChunkTreeRef::Chunk(sealed), ChunkTreeRef::Chunk(unsealed)],
            )
            .unwrap();

        // An upper bound beyond the sealed prefix still reaches the unsealed
        // tail chunk, whose row count is not final.
        let leaves = enumerate_chunks(
            &forest,
            root,
            ReadLimit::at_row_index(10),
            ReadLimit::at_row_index(1_000_000),
        )
        .unwrap();
        assert_eq!(leaf_ids(&leaves), vec![ChunkTreeRef::Chunk(unsealed)]);
    }

    #[test]
    fn dynamic_store_leaves_are_emitted() {
        let mut forest = ChunkForest::new();
        let root = forest.create_chunk_list(ChunkListKind::SortedDynamicTablet);
        let chunk = add_chunk(&mut forest, 5, Some((0, 9)), true);
        let store = data_types::new_dynamic_store_id(77);
        forest
            .attach(
                root,
                &[ChunkTreeRef::Chunk(chunk), ChunkTreeRef::DynamicStore(store)],
            )
            .unwrap();

        // A key range above the chunk still yields the dynamic store, whose
        // key span is unknown.
        let leaves = enumerate_chunks(
            &forest,
            root,
            ReadLimit::at_key(key(100)),
            ReadLimit::unbounded(),
        )
        .unwrap();
        assert_eq!(leaf_ids(&leaves), vec![ChunkTreeRef::DynamicStore(store)]);
    }

    #[test]
    fn chunk_views_resolve_to_clipped_chunks() {
        let mut forest = ChunkForest::new();
        let root = forest.create_chunk_list(ChunkListKind::SortedDynamicTablet);
        let chunk = add_chunk(&mut forest, 10, Some((0, 99)), true);
        let view = forest.create_chunk_view(|id| {
            let mut view = ChunkView::new(
                id,
                chunk,
                ReadLimit::at_key(key(10)),
                ReadLimit::at_key(key(50)),
            );
            view.max_clip_timestamp = Some(Timestamp(500));
            view
        });
        forest.attach(root, &[ChunkTreeRef::ChunkView(view)]).unwrap();

        let leaves = enumerate_chunks(
            &forest,
            root,
            ReadLimit::at_key(key(30)),
            ReadLimit::unbounded(),
        )
        .unwrap();
        assert_eq!(leaves.len(), 1);
        assert_eq!(leaves[0].leaf, ChunkTreeRef::Chunk(chunk));
        // The walk's lower bound tightens the view's clip; the view's upper
        // clip survives.
        assert_eq!(leaves[0].lower_limit.key, Some(key(30)));
        assert_eq!(leaves[0].upper_limit.key, Some(key(50)));
        assert_eq!(leaves[0].max_clip_timestamp, Some(Timestamp(500)));
    }

    #[test]
    fn concurrent_modification_fails_the_walk() {
        let mut forest = ChunkForest::new();
        let root = forest.create_chunk_list(ChunkListKind::Static);
        for _ in 0..3 {
            let chunk = add_chunk(&mut forest, 1, None, true);
            forest.attach(root, &[ChunkTreeRef::Chunk(chunk)]).unwrap();
        }

        let mut traverser = ChunkTreeTraverser::new(
            &forest,
            root,
            ReadLimit::unbounded(),
            ReadLimit::unbounded(),
        )
        .unwrap();

        // Mutate the list between construction and the first step.
        let late = add_chunk(&mut forest, 1, None, true);
        forest.attach(root, &[ChunkTreeRef::Chunk(late)]).unwrap();

        let mut visitor = |_leaf: TraversedLeaf| true;
        assert!(matches!(
            traverser.run_step(&forest, &mut visitor),
            Err(crate::Error::OptimisticLockFailure { .. })
        ));
        assert!(traverser.is_finished());
    }

    #[test]
    fn pacing_yields_after_step_budget() {
        let mut forest = ChunkForest::new();
        let root = forest.create_chunk_list(ChunkListKind::Static);
        let chunks: Vec<_> = (0..MAX_CHUNKS_PER_STEP + 5)
            .map(|_| ChunkTreeRef::Chunk(add_chunk(&mut forest, 1, None, true)))
            .collect();
        forest.attach(root, &chunks).unwrap();

        let mut traverser = ChunkTreeTraverser::new(
            &forest,
            root,
            ReadLimit::unbounded(),
            ReadLimit::unbounded(),
        )
        .unwrap();

        let count = std::cell::Cell::new(0usize);
        let mut visitor = |_leaf: TraversedLeaf| {
            count.set(count.get() + 1);
            true
        };
        assert_eq!(
            traverser.run_step(&forest, &mut visitor).unwrap(),
            StepOutcome::Yielded
        );
        assert_eq!(count.get(), MAX_CHUNKS_PER_STEP);
        assert_eq!(
            traverser.run_step(&forest, &mut visitor).unwrap(),
            StepOutcome::Finished
        );
        assert_eq!(count.get(), MAX_CHUNKS_PER_STEP + 5);
    }

    #[test]
    fn visitor_can_stop_the_walk() {
        let mut forest = ChunkForest::new();
        let root = forest.create_chunk_list(ChunkListKind::Static);
        let chunks: Vec<_> = (0..5)
            .map(|_| ChunkTreeRef::Chunk(add_chunk(&mut forest, 1, None, true)))
            .collect();
        forest.attach(root, &chunks).unwrap();

        let mut traverser = ChunkTreeTraverser::new(
            &forest,
            root,
            ReadLimit::unbounded(),
            ReadLimit::unbounded(),
        )
        .unwrap();
        let mut count = 0usize;
        let mut visitor = |_leaf: TraversedLeaf| {
            count += 1;
            count < 2
        };
        assert_eq!(
            traverser.run_step(&forest, &mut visitor).unwrap(),
            StepOutcome::Finished
        );
        assert_eq!(count, 2);
    }
}
