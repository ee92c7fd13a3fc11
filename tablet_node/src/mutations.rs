//! Wire codecs for the tablet cell's mutation payloads.
//!
//! All integers little-endian, byte strings length-prefixed; every payload
//! decodes to exactly one value, and the apply handlers refuse trailing
//! bytes. The method-name constants double as the automaton registration
//! keys.

use crate::row_codec::{read_key, read_value, write_key, write_value};
use crate::{Result, StoreAddDescriptor, TransactionAction, WriteCommand};
use automaton::{WireReader, WireWriter};
use bytes::Bytes;
use data_types::{
    BlocksExt, ChunkId, ChunkMeta, CompressionCodec, ErasureCodec, MiscExt, MountRevision,
    ObjectId, RowKey, StoreId, TabletId, Timestamp, TransactionId, UnversionedRow,
};
use std::time::Duration;

/// Method name of [`ExecuteWriteRequest`].
pub const METHOD_EXECUTE_WRITE: &str = "tablet.execute_write";
/// Method name of [`RotateStoreRequest`].
pub const METHOD_ROTATE_STORE: &str = "tablet.rotate_store";
/// Method name of [`CommitStoresUpdateRequest`].
pub const METHOD_COMMIT_STORES_UPDATE: &str = "tablet.commit_tablet_stores_update";
/// Method name of [`SplitPartitionRequest`].
pub const METHOD_SPLIT_PARTITION: &str = "tablet.split_partition";
/// Method name of [`MergePartitionsRequest`].
pub const METHOD_MERGE_PARTITIONS: &str = "tablet.merge_partitions";
/// Method name of [`RegisterTransactionActionsRequest`].
pub const METHOD_REGISTER_TRANSACTION_ACTIONS: &str = "tablet.register_transaction_actions";
/// Method name of [`HandleTransactionBarrierRequest`].
pub const METHOD_HANDLE_TRANSACTION_BARRIER: &str = "tablet.handle_transaction_barrier";
/// Method name of [`PrepareCommitRequest`].
pub const METHOD_PREPARE_COMMIT: &str = "tablet.prepare_transaction_commit";
/// Method name of [`CommitTransactionRequest`].
pub const METHOD_COMMIT_TRANSACTION: &str = "tablet.commit_transaction";
/// Method name of [`AbortTransactionRequest`].
pub const METHOD_ABORT_TRANSACTION: &str = "tablet.abort_transaction";

fn write_tablet_id(writer: &mut WireWriter, tablet_id: TabletId) {
    writer.write_u128(tablet_id.get().as_u128());
}

fn read_tablet_id(reader: &mut WireReader<'_>) -> Result<TabletId> {
    let raw = reader.read_u128()?;
    ObjectId::from_u128(raw)
        .and_then(TabletId::try_from_object)
        .map_err(|e| crate::Error::Wire {
            message: e.to_string(),
        })
}

fn write_transaction_id(writer: &mut WireWriter, transaction_id: TransactionId) {
    writer.write_u128(transaction_id.get().as_u128());
}

fn read_transaction_id(reader: &mut WireReader<'_>) -> Result<TransactionId> {
    let raw = reader.read_u128()?;
    ObjectId::from_u128(raw)
        .and_then(TransactionId::try_from_object)
        .map_err(|e| crate::Error::Wire {
            message: e.to_string(),
        })
}

fn write_chunk_meta(writer: &mut WireWriter, meta: &ChunkMeta) {
    match &meta.misc {
        Some(misc) => {
            writer.write_bool(true);
            writer.write_i64(misc.row_count);
            writer.write_i64(misc.uncompressed_data_size);
            writer.write_i64(misc.compressed_data_size);
            writer.write_i64(misc.data_weight);
            writer.write_bool(misc.sealed);
            writer.write_u8(match misc.compression_codec {
                CompressionCodec::None => 0,
            });
            match misc.erasure_codec {
                ErasureCodec::None => writer.write_u8(0),
                ErasureCodec::ReedSolomon {
                    data_parts,
                    parity_parts,
                } => {
                    writer.write_u8(1);
                    writer.write_u8(data_parts);
                    writer.write_u8(parity_parts);
                }
            }
            match &misc.min_key {
                Some(key) => {
                    writer.write_bool(true);
                    write_key(writer, key);
                }
                None => writer.write_bool(false),
            }
            match &misc.max_key {
                Some(key) => {
                    writer.write_bool(true);
                    write_key(writer, key);
                }
                None => writer.write_bool(false),
            }
            writer.write_u64(misc.min_timestamp.0);
            writer.write_u64(misc.max_timestamp.0);
        }
        None => writer.write_bool(false),
    }
    match &meta.blocks {
        Some(blocks) => {
            writer.write_bool(true);
            writer.write_u32(blocks.block_sizes.len() as u32);
            for size in &blocks.block_sizes {
                writer.write_u64(*size);
            }
        }
        None => writer.write_bool(false),
    }
}

fn read_chunk_meta(reader: &mut WireReader<'_>) -> Result<ChunkMeta> {
    let misc = if reader.read_bool()? {
        let row_count = reader.read_i64()?;
        let uncompressed_data_size = reader.read_i64()?;
        let compressed_data_size = reader.read_i64()?;
        let data_weight = reader.read_i64()?;
        let sealed = reader.read_bool()?;
        let compression_codec = match reader.read_u8()? {
            0 => CompressionCodec::None,
            tag => {
                return Err(crate::Error::Wire {
                    message: format!("unknown compression codec {tag}"),
                })
            }
        };
        let erasure_codec = match reader.read_u8()? {
            0 => ErasureCodec::None,
            1 => ErasureCodec::ReedSolomon {
                data_parts: reader.read_u8()?,
                parity_parts: reader.read_u8()?,
            },
            tag => {
                return Err(crate::Error::Wire {
                    message: format!("unknown erasure codec {tag}"),
                })
            }
        };
        let min_key = if reader.read_bool()? {
            Some(read_key(reader)?)
        } else {
            None
        };
        let max_key = if reader.read_bool()? {
            Some(read_key(reader)?)
        } else {
            None
        };
        Some(MiscExt {
            row_count,
            uncompressed_data_size,
            compressed_data_size,
            data_weight,
            sealed,
            compression_codec,
            erasure_codec,
            min_key,
            max_key,
            min_timestamp: Timestamp(reader.read_u64()?),
            max_timestamp: Timestamp(reader.read_u64()?),
        })
    } else {
        None
    };
    let blocks = if reader.read_bool()? {
        let count = reader.read_u32()? as usize;
        let mut block_sizes = Vec::with_capacity(count);
        for _ in 0..count {
            block_sizes.push(reader.read_u64()?);
        }
        Some(BlocksExt { block_sizes })
    } else {
        None
    };
    Ok(ChunkMeta { misc, blocks })
}

/// The execute-write mutation: row commands of one (optional) transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecuteWriteRequest {
    /// The tablet written to.
    pub tablet_id: TabletId,
    /// Guards against stale requests across remounts.
    pub mount_revision: MountRevision,
    /// The writing transaction; `None` for non-transactional writes.
    pub transaction: Option<(TransactionId, Timestamp)>,
    /// Immediate commit timestamp for non-transactional writes and replay.
    pub commit_timestamp: Option<Timestamp>,
    /// The row commands.
    pub commands: Vec<WriteCommand>,
}

impl ExecuteWriteRequest {
    /// Encode into a mutation payload.
    pub fn encode(&self) -> Bytes {
        let mut writer = WireWriter::new();
        write_tablet_id(&mut writer, self.tablet_id);
        writer.write_u64(self.mount_revision.0);
        match &self.transaction {
            Some((id, start_timestamp)) => {
                writer.write_bool(true);
                write_transaction_id(&mut writer, *id);
                writer.write_u64(start_timestamp.0);
            }
            None => writer.write_bool(false),
        }
        match self.commit_timestamp {
            Some(timestamp) => {
                writer.write_bool(true);
                writer.write_u64(timestamp.0);
            }
            None => writer.write_bool(false),
        }
        writer.write_u32(self.commands.len() as u32);
        for command in &self.commands {
            match command {
                WriteCommand::Write(row) => {
                    writer.write_u8(0);
                    writer.write_u32(row.values.len() as u32);
                    for value in &row.values {
                        write_value(&mut writer, value);
                    }
                }
                WriteCommand::Delete(key) => {
                    writer.write_u8(1);
                    write_key(&mut writer, key);
                }
            }
        }
        writer.finish()
    }

    /// Decode a mutation payload.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut reader = WireReader::new(payload);
        let tablet_id = read_tablet_id(&mut reader)?;
        let mount_revision = MountRevision(reader.read_u64()?);
        let transaction = if reader.read_bool()? {
            let id = read_transaction_id(&mut reader)?;
            let start_timestamp = Timestamp(reader.read_u64()?);
            Some((id, start_timestamp))
        } else {
            None
        };
        let commit_timestamp = if reader.read_bool()? {
            Some(Timestamp(reader.read_u64()?))
        } else {
            None
        };
        let command_count = reader.read_u32()? as usize;
        let mut commands = Vec::with_capacity(command_count);
        for _ in 0..command_count {
            match reader.read_u8()? {
                0 => {
                    let value_count = reader.read_u32()? as usize;
                    let mut values = Vec::with_capacity(value_count);
                    for _ in 0..value_count {
                        values.push(read_value(&mut reader)?);
                    }
                    commands.push(WriteCommand::Write(UnversionedRow { values }));
                }
                1 => commands.push(WriteCommand::Delete(read_key(&mut reader)?)),
                tag => {
                    return Err(crate::Error::Wire {
                        message: format!("unknown write command tag {tag}"),
                    })
                }
            }
        }
        reader.expect_eof()?;
        Ok(Self {
            tablet_id,
            mount_revision,
            transaction,
            commit_timestamp,
            commands,
        })
    }
}

/// The rotate-store mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotateStoreRequest {
    /// The tablet to rotate.
    pub tablet_id: TabletId,
    /// Stale-request guard.
    pub mount_revision: MountRevision,
}

impl RotateStoreRequest {
    /// Encode into a mutation payload.
    pub fn encode(&self) -> Bytes {
        let mut writer = WireWriter::new();
        write_tablet_id(&mut writer, self.tablet_id);
        writer.write_u64(self.mount_revision.0);
        writer.finish()
    }

    /// Decode a mutation payload.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut reader = WireReader::new(payload);
        let tablet_id = read_tablet_id(&mut reader)?;
        let mount_revision = MountRevision(reader.read_u64()?);
        reader.expect_eof()?;
        Ok(Self {
            tablet_id,
            mount_revision,
        })
    }
}

/// The commit-tablet-stores-update mutation posted by the flusher and the
/// compactor.
#[derive(Debug, Clone)]
pub struct CommitStoresUpdateRequest {
    /// The tablet whose store set changes.
    pub tablet_id: TabletId,
    /// Stale-request guard.
    pub mount_revision: MountRevision,
    /// Stores replaced by this update.
    pub stores_to_remove: Vec<StoreId>,
    /// Chunk stores added by this update.
    pub stores_to_add: Vec<StoreAddDescriptor>,
}

impl CommitStoresUpdateRequest {
    /// Encode into a mutation payload.
    pub fn encode(&self) -> Bytes {
        let mut writer = WireWriter::new();
        write_tablet_id(&mut writer, self.tablet_id);
        writer.write_u64(self.mount_revision.0);
        writer.write_u32(self.stores_to_remove.len() as u32);
        for store_id in &self.stores_to_remove {
            writer.write_u128(store_id.as_u128());
        }
        writer.write_u32(self.stores_to_add.len() as u32);
        for descriptor in &self.stores_to_add {
            writer.write_u128(descriptor.chunk_id.get().as_u128());
            write_chunk_meta(&mut writer, &descriptor.meta);
            match descriptor.backing_store_id {
                Some(store_id) => {
                    writer.write_bool(true);
                    writer.write_u128(store_id.as_u128());
                }
                None => writer.write_bool(false),
            }
        }
        writer.finish()
    }

    /// Decode a mutation payload.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut reader = WireReader::new(payload);
        let tablet_id = read_tablet_id(&mut reader)?;
        let mount_revision = MountRevision(reader.read_u64()?);
        let remove_count = reader.read_u32()? as usize;
        let mut stores_to_remove = Vec::with_capacity(remove_count);
        for _ in 0..remove_count {
            stores_to_remove.push(ObjectId::from_u128(reader.read_u128()?).map_err(|e| {
                crate::Error::Wire {
                    message: e.to_string(),
                }
            })?);
        }
        let add_count = reader.read_u32()? as usize;
        let mut stores_to_add = Vec::with_capacity(add_count);
        for _ in 0..add_count {
            let chunk_id = ObjectId::from_u128(reader.read_u128()?)
                .and_then(ChunkId::try_from_object)
                .map_err(|e| crate::Error::Wire {
                    message: e.to_string(),
                })?;
            let meta = read_chunk_meta(&mut reader)?;
            let backing_store_id = if reader.read_bool()? {
                Some(
                    ObjectId::from_u128(reader.read_u128()?).map_err(|e| crate::Error::Wire {
                        message: e.to_string(),
                    })?,
                )
            } else {
                None
            };
            stores_to_add.push(StoreAddDescriptor {
                chunk_id,
                meta,
                backing_store_id,
            });
        }
        reader.expect_eof()?;
        Ok(Self {
            tablet_id,
            mount_revision,
            stores_to_remove,
            stores_to_add,
        })
    }
}

/// The on-tablet-stores-updated mutation: the master has acknowledged a
/// stores update, so backing stores can be released.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnStoresUpdatedRequest {
    /// The tablet.
    pub tablet_id: TabletId,
    /// The acknowledged chunks.
    pub chunk_ids: Vec<ChunkId>,
}

/// Method name of [`OnStoresUpdatedRequest`].
pub const METHOD_ON_STORES_UPDATED: &str = "tablet.on_tablet_stores_updated";

impl OnStoresUpdatedRequest {
    /// Encode into a mutation payload.
    pub fn encode(&self) -> Bytes {
        let mut writer = WireWriter::new();
        write_tablet_id(&mut writer, self.tablet_id);
        writer.write_u32(self.chunk_ids.len() as u32);
        for chunk_id in &self.chunk_ids {
            writer.write_u128(chunk_id.get().as_u128());
        }
        writer.finish()
    }

    /// Decode a mutation payload.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut reader = WireReader::new(payload);
        let tablet_id = read_tablet_id(&mut reader)?;
        let count = reader.read_u32()? as usize;
        let mut chunk_ids = Vec::with_capacity(count);
        for _ in 0..count {
            chunk_ids.push(
                ObjectId::from_u128(reader.read_u128()?)
                    .and_then(ChunkId::try_from_object)
                    .map_err(|e| crate::Error::Wire {
                        message: e.to_string(),
                    })?,
            );
        }
        reader.expect_eof()?;
        Ok(Self {
            tablet_id,
            chunk_ids,
        })
    }
}

/// The trim-rows mutation: advances an ordered tablet's trim point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrimRowsRequest {
    /// The ordered tablet.
    pub tablet_id: TabletId,
    /// Stale-request guard.
    pub mount_revision: MountRevision,
    /// Rows below this absolute index are dropped.
    pub trimmed_row_count: i64,
}

/// Method name of [`TrimRowsRequest`].
pub const METHOD_TRIM_ROWS: &str = "tablet.trim_rows";

impl TrimRowsRequest {
    /// Encode into a mutation payload.
    pub fn encode(&self) -> Bytes {
        let mut writer = WireWriter::new();
        write_tablet_id(&mut writer, self.tablet_id);
        writer.write_u64(self.mount_revision.0);
        writer.write_i64(self.trimmed_row_count);
        writer.finish()
    }

    /// Decode a mutation payload.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut reader = WireReader::new(payload);
        let tablet_id = read_tablet_id(&mut reader)?;
        let mount_revision = MountRevision(reader.read_u64()?);
        let trimmed_row_count = reader.read_i64()?;
        reader.expect_eof()?;
        Ok(Self {
            tablet_id,
            mount_revision,
            trimmed_row_count,
        })
    }
}

/// The split-partition mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct SplitPartitionRequest {
    /// The tablet.
    pub tablet_id: TabletId,
    /// The partition to split.
    pub partition_index: u32,
    /// Interior boundary keys.
    pub pivot_keys: Vec<RowKey>,
}

impl SplitPartitionRequest {
    /// Encode into a mutation payload.
    pub fn encode(&self) -> Bytes {
        let mut writer = WireWriter::new();
        write_tablet_id(&mut writer, self.tablet_id);
        writer.write_u32(self.partition_index);
        writer.write_u32(self.pivot_keys.len() as u32);
        for key in &self.pivot_keys {
            write_key(&mut writer, key);
        }
        writer.finish()
    }

    /// Decode a mutation payload.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut reader = WireReader::new(payload);
        let tablet_id = read_tablet_id(&mut reader)?;
        let partition_index = reader.read_u32()?;
        let key_count = reader.read_u32()? as usize;
        let mut pivot_keys = Vec::with_capacity(key_count);
        for _ in 0..key_count {
            pivot_keys.push(read_key(&mut reader)?);
        }
        reader.expect_eof()?;
        Ok(Self {
            tablet_id,
            partition_index,
            pivot_keys,
        })
    }
}

/// The merge-partitions mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergePartitionsRequest {
    /// The tablet.
    pub tablet_id: TabletId,
    /// First partition of the merged range.
    pub first_partition_index: u32,
    /// Last partition of the merged range, inclusive.
    pub last_partition_index: u32,
}

impl MergePartitionsRequest {
    /// Encode into a mutation payload.
    pub fn encode(&self) -> Bytes {
        let mut writer = WireWriter::new();
        write_tablet_id(&mut writer, self.tablet_id);
        writer.write_u32(self.first_partition_index);
        writer.write_u32(self.last_partition_index);
        writer.finish()
    }

    /// Decode a mutation payload.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut reader = WireReader::new(payload);
        let tablet_id = read_tablet_id(&mut reader)?;
        let first_partition_index = reader.read_u32()?;
        let last_partition_index = reader.read_u32()?;
        reader.expect_eof()?;
        Ok(Self {
            tablet_id,
            first_partition_index,
            last_partition_index,
        })
    }
}

/// The register-transaction-actions mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct RegisterTransactionActionsRequest {
    /// The transaction.
    pub transaction_id: TransactionId,
    /// Its start timestamp (creates the transaction on first contact).
    pub transaction_start_timestamp: Timestamp,
    /// Its lease timeout.
    pub transaction_timeout: Duration,
    /// Completion bitmap part carried by this request.
    pub signature: u32,
    /// The actions.
    pub actions: Vec<TransactionAction>,
}

impl RegisterTransactionActionsRequest {
    /// Encode into a mutation payload.
    pub fn encode(&self) -> Bytes {
        let mut writer = WireWriter::new();
        write_transaction_id(&mut writer, self.transaction_id);
        writer.write_u64(self.transaction_start_timestamp.0);
        writer.write_u64(self.transaction_timeout.as_millis() as u64);
        writer.write_u32(self.signature);
        writer.write_u32(self.actions.len() as u32);
        for action in &self.actions {
            writer.write_string(&action.action_type);
            writer.write_bytes(&action.payload);
        }
        writer.finish()
    }

    /// Decode a mutation payload.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut reader = WireReader::new(payload);
        let transaction_id = read_transaction_id(&mut reader)?;
        let transaction_start_timestamp = Timestamp(reader.read_u64()?);
        let transaction_timeout = Duration::from_millis(reader.read_u64()?);
        let signature = reader.read_u32()?;
        let action_count = reader.read_u32()? as usize;
        let mut actions = Vec::with_capacity(action_count);
        for _ in 0..action_count {
            actions.push(TransactionAction {
                action_type: reader.read_string()?,
                payload: Bytes::from(reader.read_bytes()?),
            });
        }
        reader.expect_eof()?;
        Ok(Self {
            transaction_id,
            transaction_start_timestamp,
            transaction_timeout,
            signature,
            actions,
        })
    }
}

/// The handle-transaction-barrier mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandleTransactionBarrierRequest {
    /// Serialize everything committed at or below this timestamp.
    pub barrier_timestamp: Timestamp,
}

impl HandleTransactionBarrierRequest {
    /// Encode into a mutation payload.
    pub fn encode(&self) -> Bytes {
        let mut writer = WireWriter::new();
        writer.write_u64(self.barrier_timestamp.0);
        writer.finish()
    }

    /// Decode a mutation payload.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut reader = WireReader::new(payload);
        let barrier_timestamp = Timestamp(reader.read_u64()?);
        reader.expect_eof()?;
        Ok(Self { barrier_timestamp })
    }
}

/// The prepare-commit mutation (persistent prepare).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrepareCommitRequest {
    /// The transaction.
    pub transaction_id: TransactionId,
    /// The prepare timestamp.
    pub prepare_timestamp: Timestamp,
    /// Clock domain of the prepare timestamp.
    pub prepare_timestamp_cluster_tag: u16,
}

impl PrepareCommitRequest {
    /// Encode into a mutation payload.
    pub fn encode(&self) -> Bytes {
        let mut writer = WireWriter::new();
        write_transaction_id(&mut writer, self.transaction_id);
        writer.write_u64(self.prepare_timestamp.0);
        writer.write_u16(self.prepare_timestamp_cluster_tag);
        writer.finish()
    }

    /// Decode a mutation payload.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut reader = WireReader::new(payload);
        let transaction_id = read_transaction_id(&mut reader)?;
        let prepare_timestamp = Timestamp(reader.read_u64()?);
        let prepare_timestamp_cluster_tag = reader.read_u16()?;
        reader.expect_eof()?;
        Ok(Self {
            transaction_id,
            prepare_timestamp,
            prepare_timestamp_cluster_tag,
        })
    }
}

/// The commit-transaction mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitTransactionRequest {
    /// The transaction.
    pub transaction_id: TransactionId,
    /// The commit timestamp.
    pub commit_timestamp: Timestamp,
    /// Clock domain of the commit timestamp.
    pub commit_timestamp_cluster_tag: u16,
}

impl CommitTransactionRequest {
    /// Encode into a mutation payload.
    pub fn encode(&self) -> Bytes {
        let mut writer = WireWriter::new();
        write_transaction_id(&mut writer, self.transaction_id);
        writer.write_u64(self.commit_timestamp.0);
        writer.write_u16(self.commit_timestamp_cluster_tag);
        writer.finish()
    }

    /// Decode a mutation payload.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut reader = WireReader::new(payload);
        let transaction_id = read_transaction_id(&mut reader)?;
        let commit_timestamp = Timestamp(reader.read_u64()?);
        let commit_timestamp_cluster_tag = reader.read_u16()?;
        reader.expect_eof()?;
        Ok(Self {
            transaction_id,
            commit_timestamp,
            commit_timestamp_cluster_tag,
        })
    }
}

/// The abort-transaction mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AbortTransactionRequest {
    /// The transaction.
    pub transaction_id: TransactionId,
    /// Whether a prepared transaction may be displaced.
    pub force: bool,
}

impl AbortTransactionRequest {
    /// Encode into a mutation payload.
    pub fn encode(&self) -> Bytes {
        let mut writer = WireWriter::new();
        write_transaction_id(&mut writer, self.transaction_id);
        writer.write_bool(self.force);
        writer.finish()
    }

    /// Decode a mutation payload.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut reader = WireReader::new(payload);
        let transaction_id = read_transaction_id(&mut reader)?;
        let force = reader.read_bool()?;
        reader.expect_eof()?;
        Ok(Self {
            transaction_id,
            force,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use data_types::Value;

    #[test]
    fn execute_write_roundtrip() {
        let request = ExecuteWriteRequest {
            tablet_id: TabletId::new(3),
            mount_revision: MountRevision(7),
            transaction: Some((TransactionId::new(9), Timestamp(100))),
            commit_timestamp: None,
            commands: vec![
                WriteCommand::Write(UnversionedRow {
                    values: vec![Value::Int64(1), Value::String("v".to_owned())],
                }),
                WriteCommand::Delete(RowKey(vec![Value::Int64(2)])),
            ],
        };
        let payload = request.encode();
        assert_eq!(ExecuteWriteRequest::decode(&payload).unwrap(), request);
    }

    #[test]
    fn stores_update_roundtrip() {
        let request = CommitStoresUpdateRequest {
            tablet_id: TabletId::new(3),
            mount_revision: MountRevision(7),
            stores_to_remove: vec![data_types::new_dynamic_store_id(5)],
            stores_to_add: vec![StoreAddDescriptor {
                chunk_id: ChunkId::new(data_types::EntityKind::Chunk, 11),
                meta: ChunkMeta {
                    misc: Some(MiscExt {
                        row_count: 1000,
                        sealed: true,
                        min_key: Some(RowKey(vec![Value::Int64(1)])),
                        max_key: Some(RowKey(vec![Value::Int64(999)])),
                        min_timestamp: Timestamp(10),
                        max_timestamp: Timestamp(500),
                        ..Default::default()
                    }),
                    blocks: Some(BlocksExt {
                        block_sizes: vec![4096, 2048],
                    }),
                },
                backing_store_id: Some(data_types::new_dynamic_store_id(5)),
            }],
        };
        let payload = request.encode();
        let decoded = CommitStoresUpdateRequest::decode(&payload).unwrap();
        assert_eq!(decoded.tablet_id, request.tablet_id);
        assert_eq!(decoded.stores_to_remove, request.stores_to_remove);
        assert_eq!(decoded.stores_to_add[0].chunk_id, request.stores_to_add[0].chunk_id);
        assert_eq!(decoded.stores_to_add[0].meta, request.stores_to_add[0].meta);
        assert_eq!(
            decoded.stores_to_add[0].backing_store_id,
            request.stores_to_add[0].backing_store_id
        );
    }

    #[test]
    fn transaction_mutation_roundtrips() {
        let register = RegisterTransactionActionsRequest {
            transaction_id: TransactionId::new(1),
            transaction_start_timestamp: Timestamp(50),
            transaction_timeout: Duration::from_secs(30),
            signature: 0xFFFF_FFFF,
            actions: vec![TransactionAction {
                action_type: "custom".to_owned(),
                payload: Bytes::from_static(b"data"),
            }],
        };
        assert_eq!(
            RegisterTransactionActionsRequest::decode(&register.encode()).unwrap(),
            register
        );

        let barrier = HandleTransactionBarrierRequest {
            barrier_timestamp: Timestamp(777),
        };
        assert_eq!(
            HandleTransactionBarrierRequest::decode(&barrier.encode()).unwrap(),
            barrier
        );

        let commit = CommitTransactionRequest {
            transaction_id: TransactionId::new(2),
            commit_timestamp: Timestamp(120),
            commit_timestamp_cluster_tag: 5,
        };
        assert_eq!(
            CommitTransactionRequest::decode(&commit.encode()).unwrap(),
            commit
        );
    }

    #[test]
    fn partition_mutation_roundtrips() {
        let split = SplitPartitionRequest {
            tablet_id: TabletId::new(1),
            partition_index: 0,
            pivot_keys: vec![RowKey(vec![Value::Int64(10)])],
        };
        assert_eq!(SplitPartitionRequest::decode(&split.encode()).unwrap(), split);

        let merge = MergePartitionsRequest {
            tablet_id: TabletId::new(1),
            first_partition_index: 0,
            last_partition_index: 2,
        };
        assert_eq!(
            MergePartitionsRequest::decode(&merge.encode()).unwrap(),
            merge
        );
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let request = RotateStoreRequest {
            tablet_id: TabletId::new(1),
            mount_revision: MountRevision(1),
        };
        let payload = request.encode();
        assert!(RotateStoreRequest::decode(&payload[..payload.len() - 1]).is_err());

        // Trailing bytes are refused too.
        let mut extended = payload.to_vec();
        extended.push(0);
        assert!(RotateStoreRequest::decode(&extended).is_err());
    }
}
