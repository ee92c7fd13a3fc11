//! The tablet transaction entity.

use crate::RowWriteRef;
use automaton::{Persist, WireReader, WireResult, WireWriter};
use bytes::Bytes;
use clock::ClusterTag;
use data_types::{Timestamp, TransactionId, TransactionState};
use std::time::Duration;

/// The signature of a transaction whose client has sent every part.
pub const FINAL_TRANSACTION_SIGNATURE: u32 = 0xFFFF_FFFF;

/// An opaque action registered with a transaction, replayed through its
/// registered handlers at prepare/commit/abort/serialize time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionAction {
    /// Selects the registered handler set.
    pub action_type: String,
    /// Handler-defined payload.
    pub payload: Bytes,
}

impl Persist for TransactionAction {
    fn save(&self, writer: &mut WireWriter) {
        writer.write_string(&self.action_type);
        writer.write_bytes(&self.payload);
    }

    fn load(reader: &mut WireReader<'_>) -> WireResult<Self> {
        Ok(Self {
            action_type: reader.read_string()?,
            payload: Bytes::from(reader.read_bytes()?),
        })
    }
}

/// A tablet transaction.
#[derive(Debug)]
pub struct Transaction {
    id: TransactionId,
    /// The snapshot timestamp reads and conflict checks run against.
    pub start_timestamp: Timestamp,
    /// Lease timeout.
    pub timeout: Duration,
    /// The replicated state.
    pub persistent_state: TransactionState,
    /// The leader-only state; may run ahead of the persistent one.
    pub transient_state: TransactionState,
    /// Set on prepare.
    pub prepare_timestamp: Timestamp,
    /// Set on commit.
    pub commit_timestamp: Timestamp,
    /// The clock domain the commit timestamp came from.
    pub commit_timestamp_cluster_tag: ClusterTag,
    /// Completion bitmap accumulated from transient requests.
    pub transient_signature: u32,
    /// Completion bitmap accumulated from replicated requests.
    pub persistent_signature: u32,
    /// Rows staged by the current write request, not yet confirmed.
    pub prelocked_rows: Vec<RowWriteRef>,
    /// Rows holding locks for this transaction.
    pub locked_rows: Vec<RowWriteRef>,
    /// Registered actions in registration order.
    pub actions: Vec<TransactionAction>,
    /// Whether the transaction originates from another cell.
    pub foreign: bool,
    /// Whether the transaction only exists on the leader.
    pub transient: bool,
    /// Whether a lease is registered for it.
    pub has_lease: bool,
}

impl Transaction {
    /// Create an active transaction.
    pub fn new(id: TransactionId, start_timestamp: Timestamp, timeout: Duration) -> Self {
        Self {
            id,
            start_timestamp,
            timeout,
            persistent_state: TransactionState::Active,
            transient_state: TransactionState::Active,
            prepare_timestamp: Timestamp::NULL,
            commit_timestamp: Timestamp::NULL,
            commit_timestamp_cluster_tag: ClusterTag::INVALID,
            transient_signature: 0,
            persistent_signature: 0,
            prelocked_rows: Vec::new(),
            locked_rows: Vec::new(),
            actions: Vec::new(),
            foreign: false,
            transient: true,
            has_lease: false,
        }
    }

    /// The transaction id.
    pub fn id(&self) -> TransactionId {
        self.id
    }

    /// Move every prelocked row into the confirmed locked set.
    pub fn confirm_prelocked_rows(&mut self) {
        let staged = std::mem::take(&mut self.prelocked_rows);
        self.locked_rows.extend(staged);
    }
}

// Only fields that must survive a snapshot are persisted; transient
// bookkeeping (prelocked rows, lease flags) is rebuilt by the leader.
impl Persist for Transaction {
    fn save(&self, writer: &mut WireWriter) {
        writer.write_u64(self.start_timestamp.0);
        writer.write_u64(self.timeout.as_millis() as u64);
        writer.write_u8(persistent_state_to_wire(self.persistent_state));
        writer.write_u64(self.prepare_timestamp.0);
        writer.write_u64(self.commit_timestamp.0);
        writer.write_u16(self.commit_timestamp_cluster_tag.0);
        writer.write_u32(self.persistent_signature);
        writer.write_bool(self.foreign);
        self.locked_rows.save(writer);
        self.actions.save(writer);
    }

    fn load(reader: &mut WireReader<'_>) -> WireResult<Self> {
        let start_timestamp = Timestamp(reader.read_u64()?);
        let timeout = Duration::from_millis(reader.read_u64()?);
        let persistent_state = persistent_state_from_wire(reader.read_u8()?)?;
        let prepare_timestamp = Timestamp(reader.read_u64()?);
        let commit_timestamp = Timestamp(reader.read_u64()?);
        let commit_timestamp_cluster_tag = ClusterTag(reader.read_u16()?);
        let persistent_signature = reader.read_u32()?;
        let foreign = reader.read_bool()?;
        let locked_rows = Vec::<RowWriteRef>::load(reader)?;
        let actions = Vec::<TransactionAction>::load(reader)?;

        // The id is restored by the entity map's keys stream.
        let mut transaction = Self::new(
            TransactionId::new(0),
            start_timestamp,
            timeout,
        );
        transaction.persistent_state = persistent_state;
        transaction.transient_state = persistent_state;
        transaction.prepare_timestamp = prepare_timestamp;
        transaction.commit_timestamp = commit_timestamp;
        transaction.commit_timestamp_cluster_tag = commit_timestamp_cluster_tag;
        transaction.persistent_signature = persistent_signature;
        transaction.transient_signature = persistent_signature;
        transaction.foreign = foreign;
        transaction.locked_rows = locked_rows;
        transaction.actions = actions;
        transaction.transient = false;
        Ok(transaction)
    }
}

impl Transaction {
    pub(crate) fn set_id(&mut self, id: TransactionId) {
        self.id = id;
    }
}

impl Default for Transaction {
    fn default() -> Self {
        Self::new(TransactionId::new(0), Timestamp::NULL, Duration::ZERO)
    }
}

impl Persist for RowWriteRef {
    fn save(&self, writer: &mut WireWriter) {
        writer.write_u128(self.tablet_id.get().as_u128());
        writer.write_u128(self.store_id.as_u128());
        crate::row_codec::write_key(writer, &self.key);
    }

    fn load(reader: &mut WireReader<'_>) -> WireResult<Self> {
        let tablet_raw = reader.read_u128()?;
        let store_raw = reader.read_u128()?;
        let key = crate::row_codec::read_key(reader).map_err(|e| {
            automaton::MalformedSnafu {
                message: e.to_string(),
            }
            .build()
        })?;
        let tablet_id = data_types::ObjectId::from_u128(tablet_raw)
            .and_then(data_types::TabletId::try_from_object)
            .map_err(|e| {
                automaton::MalformedSnafu {
                    message: e.to_string(),
                }
                .build()
            })?;
        let store_id = data_types::ObjectId::from_u128(store_raw).map_err(|e| {
            automaton::MalformedSnafu {
                message: e.to_string(),
            }
            .build()
        })?;
        Ok(Self {
            tablet_id,
            store_id,
            key,
        })
    }
}

fn persistent_state_to_wire(state: TransactionState) -> u8 {
    match state {
        TransactionState::Active => 0,
        TransactionState::TransientCommitPrepared => 1,
        TransactionState::PersistentCommitPrepared => 2,
        TransactionState::TransientAbortPrepared => 3,
        TransactionState::Committed => 4,
        TransactionState::Serialized => 5,
        TransactionState::Aborted => 6,
    }
}

fn persistent_state_from_wire(raw: u8) -> WireResult<TransactionState> {
    Ok(match raw {
        0 => TransactionState::Active,
        1 => TransactionState::TransientCommitPrepared,
        2 => TransactionState::PersistentCommitPrepared,
        3 => TransactionState::TransientAbortPrepared,
        4 => TransactionState::Committed,
        5 => TransactionState::Serialized,
        6 => TransactionState::Aborted,
        raw => {
            return Err(automaton::MalformedSnafu {
                message: format!("unknown transaction state {raw}"),
            }
            .build())
        }
    })
}
