//! The store sum type.

use crate::{ChunkStore, OrderedDynamicStore, SortedDynamicStore};
use data_types::{StoreId, StoreState};
use std::sync::Arc;

/// Any store a tablet may own.
#[derive(Debug, Clone)]
pub enum Store {
    /// The sorted in-memory MVCC store.
    SortedDynamic(Arc<SortedDynamicStore>),
    /// The append-only in-memory store.
    OrderedDynamic(Arc<OrderedDynamicStore>),
    /// An immutable chunk store.
    Chunk(Arc<ChunkStore>),
}

impl Store {
    /// The store id.
    pub fn id(&self) -> StoreId {
        match self {
            Self::SortedDynamic(store) => store.id(),
            Self::OrderedDynamic(store) => store.id(),
            Self::Chunk(store) => store.id(),
        }
    }

    /// The lifecycle state.
    pub fn state(&self) -> StoreState {
        match self {
            Self::SortedDynamic(store) => store.state(),
            Self::OrderedDynamic(store) => store.state(),
            Self::Chunk(store) => store.state(),
        }
    }

    /// Whether this is a dynamic (in-memory, mutable) store.
    pub fn is_dynamic(&self) -> bool {
        !matches!(self, Self::Chunk(_))
    }

    /// Rough payload size in bytes.
    pub fn data_size(&self) -> i64 {
        match self {
            Self::SortedDynamic(store) => store.data_size(),
            Self::OrderedDynamic(store) => store.data_size(),
            Self::Chunk(store) => store.data_size(),
        }
    }

    /// Committed row count.
    pub fn row_count(&self) -> i64 {
        match self {
            Self::SortedDynamic(store) => store.row_count() as i64,
            Self::OrderedDynamic(store) => store.row_count() as i64,
            Self::Chunk(store) => store.row_count(),
        }
    }

    /// Downcast to the sorted dynamic store.
    pub fn as_sorted_dynamic(&self) -> Option<&Arc<SortedDynamicStore>> {
        match self {
            Self::SortedDynamic(store) => Some(store),
            _ => None,
        }
    }

    /// Downcast to the ordered dynamic store.
    pub fn as_ordered_dynamic(&self) -> Option<&Arc<OrderedDynamicStore>> {
        match self {
            Self::OrderedDynamic(store) => Some(store),
            _ => None,
        }
    }

    /// Downcast to the chunk store.
    pub fn as_chunk(&self) -> Option<&Arc<ChunkStore>> {
        match self {
            Self::Chunk(store) => Some(store),
            _ => None,
        }
    }
}
