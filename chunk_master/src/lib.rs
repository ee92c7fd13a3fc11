//! The master-side chunk control plane.
//!
//! [`ChunkMaster`] owns the persistent chunk tree, the storage node registry
//! and the job state; the placement, replicator, sealer and lease tracker
//! logic lives in impl blocks over that one state object, which is only ever
//! touched from the chunk manager's automaton invoker.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

mod config;
mod job;
mod lease_tracker;
mod master;
mod node;
mod placement;
mod replicator;
mod sealer;
pub mod service;

pub use config::*;
pub use job::*;
pub use lease_tracker::*;
pub use master::*;
pub use node::*;
pub use placement::*;
pub use replicator::*;
pub use sealer::*;

use data_types::{ChunkId, NodeId};
use snafu::Snafu;

/// Errors of the chunk control plane.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum Error {
    #[snafu(display("no such node: {node_id}"))]
    NoSuchNode { node_id: NodeId },

    #[snafu(display("no such chunk: {chunk_id}"))]
    NoSuchChunk { chunk_id: ChunkId },

    #[snafu(display(
        "all target nodes failed: {found} of at least {min_needed} placement candidates found"
    ))]
    AllTargetNodesFailed { found: usize, min_needed: usize },

    #[snafu(display("master communication failed: {message}"))]
    MasterCommunicationFailed { message: String },

    #[snafu(display("chunk {chunk_id} is not seal-ready"))]
    NotSealReady { chunk_id: ChunkId },

    #[snafu(display("chunk tree error: {source}"))]
    ChunkTree { source: chunk_model::Error },
}

impl From<chunk_model::Error> for Error {
    fn from(source: chunk_model::Error) -> Self {
        Self::ChunkTree { source }
    }
}

#[allow(missing_docs)]
pub type Result<T, E = Error> = std::result::Result<T, E>;
