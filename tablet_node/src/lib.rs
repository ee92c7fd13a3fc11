//! The tablet storage engine.
//!
//! Each tablet is an LSM-style stack of one active dynamic store, rotated
//! passive dynamic stores and immutable chunk stores, coordinated by a
//! per-cell replicated state machine. Background scanners flush, compact,
//! trim and preload; the transaction manager provides MVCC two-phase commit
//! with barrier-ordered serialization.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

mod chunk_store;
mod compactor;
mod config;
mod flusher;
mod in_memory;
mod lookup;
mod memory;
mod mutations;
mod ordered_dynamic_store;
mod partition;
mod row_codec;
mod row_merger;
mod slot;
mod sorted_dynamic_store;
mod store;
mod store_manager;
mod sweeper;
mod tablet;
mod transaction;
mod transaction_manager;
mod trimmer;

pub use chunk_store::*;
pub use compactor::*;
pub use config::*;
pub use flusher::*;
pub use in_memory::*;
pub use lookup::*;
pub use memory::*;
pub use mutations::*;
pub use ordered_dynamic_store::*;
pub use partition::*;
pub use row_codec::*;
pub use row_merger::*;
pub use slot::*;
pub use sorted_dynamic_store::*;
pub use store::*;
pub use store_manager::*;
pub use sweeper::*;
pub use tablet::*;
pub use transaction::*;
pub use transaction_manager::*;
pub use trimmer::*;

use data_types::{RowKey, StoreId, TabletId, TransactionId};
use snafu::Snafu;

#[cfg(test)]
pub(crate) mod test_support {
    use data_types::{ColumnSchema, TableSchema, ValueType};
    use std::sync::Arc;

    /// A one-key-column, one-value-column schema shared by unit tests.
    pub(crate) fn simple_schema() -> Arc<TableSchema> {
        Arc::new(TableSchema {
            columns: vec![
                ColumnSchema {
                    name: "key".to_owned(),
                    value_type: ValueType::Int64,
                    lock_index: 0,
                },
                ColumnSchema {
                    name: "value".to_owned(),
                    value_type: ValueType::String,
                    lock_index: 0,
                },
            ],
            key_column_count: 1,
        })
    }
}

/// Errors of the tablet engine.
#[derive(Debug, Snafu, Clone)]
#[allow(missing_docs)]
pub enum Error {
    #[snafu(display("no such tablet: {tablet_id}"))]
    NoSuchTablet { tablet_id: TabletId },

    #[snafu(display("no such transaction: {transaction_id}"))]
    NoSuchTransaction { transaction_id: TransactionId },

    #[snafu(display("no such store: {store_id}"))]
    NoSuchStore { store_id: StoreId },

    #[snafu(display("{entity} is in invalid state {state} for {operation}"))]
    InvalidState {
        entity: String,
        state: String,
        operation: String,
    },

    #[snafu(display(
        "row lock conflict on key {key:?}: lock {lock_index} held by transaction {holder}"
    ))]
    RowLockConflict {
        key: RowKey,
        lock_index: u8,
        holder: TransactionId,
    },

    #[snafu(display("sort order violation: {message}"))]
    SortOrderViolation { message: String },

    #[snafu(display("invalid mount revision: expected {expected:?}, got {actual:?}"))]
    InvalidMountRevision {
        expected: data_types::MountRevision,
        actual: data_types::MountRevision,
    },

    #[snafu(display("schema violation: {source}"))]
    Schema { source: data_types::Error },

    #[snafu(display("chunk I/O failed: {message}"))]
    ChunkIo { message: String },

    #[snafu(display("wire decoding failed: {message}"))]
    Wire { message: String },

    #[snafu(display("timestamp from wrong clock: cluster tag {actual}, expected {expected}"))]
    WrongClockClusterTag {
        expected: clock::ClusterTag,
        actual: clock::ClusterTag,
    },

    #[snafu(display("tablet cell is decommissioned"))]
    Decommissioned,

    #[snafu(display("in-memory config revision changed: expected {expected}, got {actual}"))]
    ConfigRevisionMismatch { expected: u64, actual: u64 },

    #[snafu(display("resource overdraft: {message}"))]
    ResourceOverdraft { message: String },
}

impl From<chunk_client::Error> for Error {
    fn from(e: chunk_client::Error) -> Self {
        Self::ChunkIo {
            message: e.to_string(),
        }
    }
}

impl From<automaton::WireError> for Error {
    fn from(e: automaton::WireError) -> Self {
        Self::Wire {
            message: e.to_string(),
        }
    }
}

#[allow(missing_docs)]
pub type Result<T, E = Error> = std::result::Result<T, E>;
