//! The persistent chunk tree model.
//!
//! Chunks, chunk lists and chunk views live in an id-addressed
//! [`ChunkForest`] arena; parent links are back-references validated on
//! access. The [`traverser`] walks a tree under read limits and emits the
//! leaves that overlap them.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

mod chunk;
mod chunk_list;
mod forest;
mod statistics;
pub mod traverser;

pub use chunk::*;
pub use chunk_list::*;
pub use forest::*;
pub use statistics::*;

use data_types::{ChunkId, ChunkListId, ChunkViewId};
use snafu::Snafu;

/// Errors of the chunk tree model.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum Error {
    #[snafu(display("no such chunk: {chunk_id}"))]
    NoSuchChunk { chunk_id: ChunkId },

    #[snafu(display("no such chunk list: {chunk_list_id}"))]
    NoSuchChunkList { chunk_list_id: ChunkListId },

    #[snafu(display("no such chunk view: {chunk_view_id}"))]
    NoSuchChunkView { chunk_view_id: ChunkViewId },

    #[snafu(display(
        "optimistic locking failed for chunk list {chunk_list_id}: version {expected} is gone"
    ))]
    OptimisticLockFailure {
        chunk_list_id: ChunkListId,
        expected: u64,
    },

    #[snafu(display("chunk list {chunk_list_id} would form a cycle"))]
    WouldFormCycle { chunk_list_id: ChunkListId },
}

#[allow(missing_docs)]
pub type Result<T, E = Error> = std::result::Result<T, E>;
