//! Key-range partitions of a sorted tablet.

use crate::ChunkStore;
use data_types::RowKey;
use std::sync::Arc;

/// A key range `[pivot_key, next_pivot_key)` and the chunk stores covering
/// it. The unit of compaction and preload.
#[derive(Debug, Clone)]
pub struct Partition {
    /// Inclusive lower bound.
    pub pivot_key: RowKey,
    /// Exclusive upper bound; `None` means unbounded.
    pub next_pivot_key: Option<RowKey>,
    /// Chunk stores covering this range.
    pub stores: Vec<Arc<ChunkStore>>,
}

impl Partition {
    /// A partition covering `[pivot_key, next_pivot_key)`.
    pub fn new(pivot_key: RowKey, next_pivot_key: Option<RowKey>) -> Self {
        Self {
            pivot_key,
            next_pivot_key,
            stores: Vec::new(),
        }
    }

    /// The eden partition: covers everything and receives freshly flushed
    /// chunks before partition balancing moves them out.
    pub fn eden() -> Self {
        Self::new(RowKey::empty(), None)
    }

    /// Whether `key` falls into this partition's range.
    pub fn contains(&self, key: &RowKey) -> bool {
        if key < &self.pivot_key {
            return false;
        }
        match &self.next_pivot_key {
            Some(next) => key < next,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use data_types::Value;

    fn key(v: i64) -> RowKey {
        RowKey(vec![Value::Int64(v)])
    }

    #[test]
    fn containment_respects_pivots() {
        let partition = Partition::new(key(10), Some(key(20)));
        assert!(!partition.contains(&key(9)));
        assert!(partition.contains(&key(10)));
        assert!(partition.contains(&key(19)));
        assert!(!partition.contains(&key(20)));

        let last = Partition::new(key(20), None);
        assert!(last.contains(&key(1_000_000)));

        // The empty pivot admits every key.
        assert!(Partition::eden().contains(&key(i64::MIN)));
    }
}
