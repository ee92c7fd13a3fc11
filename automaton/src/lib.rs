//! The replicated state machine contract.
//!
//! Components submit [`Mutation`]s; registered handlers apply them
//! deterministically, in strict FIFO order, on the cell's automaton invoker.
//! Snapshots are a pair of streams per component ("keys" then "values"),
//! prefixed with a reign number that loaders refuse to exceed.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

mod entity_map;
mod machine;
mod wire;

pub use entity_map::*;
pub use machine::*;
pub use wire::*;
