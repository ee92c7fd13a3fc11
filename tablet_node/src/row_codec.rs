//! Block encoding of versioned rows.
//!
//! Chunk stores keep their rows in blocks of this format; flush and
//! compaction write it, lookups and preloads read it. Integers are
//! little-endian, byte strings length-prefixed, matching the mutation wire
//! conventions.

use crate::{Result, WireSnafu};
use automaton::{WireReader, WireWriter};
use bytes::Bytes;
use chunk_client::Block;
use data_types::{RowKey, Timestamp, Value, VersionedRow, VersionedValue};
use snafu::ensure;

const TAG_NULL: u8 = 0;
const TAG_INT64: u8 = 1;
const TAG_UINT64: u8 = 2;
const TAG_DOUBLE: u8 = 3;
const TAG_BOOLEAN: u8 = 4;
const TAG_BYTES: u8 = 5;
const TAG_STRING: u8 = 6;

pub(crate) fn write_value(writer: &mut WireWriter, value: &Value) {
    match value {
        Value::Null => writer.write_u8(TAG_NULL),
        Value::Int64(v) => {
            writer.write_u8(TAG_INT64);
            writer.write_i64(*v);
        }
        Value::Uint64(v) => {
            writer.write_u8(TAG_UINT64);
            writer.write_u64(*v);
        }
        Value::Double(v) => {
            writer.write_u8(TAG_DOUBLE);
            writer.write_u64(v.to_bits());
        }
        Value::Boolean(v) => {
            writer.write_u8(TAG_BOOLEAN);
            writer.write_bool(*v);
        }
        Value::Bytes(v) => {
            writer.write_u8(TAG_BYTES);
            writer.write_bytes(v);
        }
        Value::String(v) => {
            writer.write_u8(TAG_STRING);
            writer.write_string(v);
        }
    }
}

pub(crate) fn read_value(reader: &mut WireReader<'_>) -> Result<Value> {
    let tag = reader.read_u8()?;
    Ok(match tag {
        TAG_NULL => Value::Null,
        TAG_INT64 => Value::Int64(reader.read_i64()?),
        TAG_UINT64 => Value::Uint64(reader.read_u64()?),
        TAG_DOUBLE => Value::Double(f64::from_bits(reader.read_u64()?).into()),
        TAG_BOOLEAN => Value::Boolean(reader.read_bool()?),
        TAG_BYTES => Value::Bytes(reader.read_bytes()?),
        TAG_STRING => Value::String(reader.read_string()?),
        tag => {
            return WireSnafu {
                message: format!("unknown value tag {tag:#x}"),
            }
            .fail()
        }
    })
}

pub(crate) fn write_key(writer: &mut WireWriter, key: &RowKey) {
    writer.write_u32(key.0.len() as u32);
    for value in &key.0 {
        write_value(writer, value);
    }
}

pub(crate) fn read_key(reader: &mut WireReader<'_>) -> Result<RowKey> {
    let len = reader.read_u32()? as usize;
    let mut values = Vec::with_capacity(len);
    for _ in 0..len {
        values.push(read_value(reader)?);
    }
    Ok(RowKey(values))
}

fn write_versioned_row(writer: &mut WireWriter, row: &VersionedRow) {
    write_key(writer, &row.key);
    writer.write_u32(row.values.len() as u32);
    for value in &row.values {
        writer.write_u32(value.column_index as u32);
        writer.write_u64(value.timestamp.0);
        write_value(writer, &value.value);
    }
    writer.write_u32(row.write_timestamps.len() as u32);
    for timestamp in &row.write_timestamps {
        writer.write_u64(timestamp.0);
    }
    writer.write_u32(row.delete_timestamps.len() as u32);
    for timestamp in &row.delete_timestamps {
        writer.write_u64(timestamp.0);
    }
}

fn read_versioned_row(reader: &mut WireReader<'_>) -> Result<VersionedRow> {
    let key = read_key(reader)?;
    let value_count = reader.read_u32()? as usize;
    let mut values = Vec::with_capacity(value_count);
    for _ in 0..value_count {
        let column_index = reader.read_u32()? as usize;
        let timestamp = Timestamp(reader.read_u64()?);
        let value = read_value(reader)?;
        values.push(VersionedValue {
            column_index,
            value,
            timestamp,
        });
    }
    let write_count = reader.read_u32()? as usize;
    let mut write_timestamps = Vec::with_capacity(write_count);
    for _ in 0..write_count {
        write_timestamps.push(Timestamp(reader.read_u64()?));
    }
    let delete_count = reader.read_u32()? as usize;
    let mut delete_timestamps = Vec::with_capacity(delete_count);
    for _ in 0..delete_count {
        delete_timestamps.push(Timestamp(reader.read_u64()?));
    }
    Ok(VersionedRow {
        key,
        values,
        write_timestamps,
        delete_timestamps,
    })
}

/// Encode a batch of versioned rows into one block.
pub fn encode_row_block(rows: &[VersionedRow]) -> Block {
    let mut writer = WireWriter::new();
    writer.write_u32(rows.len() as u32);
    for row in rows {
        write_versioned_row(&mut writer, row);
    }
    Block(writer.finish())
}

/// Decode a block produced by [`encode_row_block`].
pub fn decode_row_block(block: &Block) -> Result<Vec<VersionedRow>> {
    let mut reader = WireReader::new(&block.0);
    let count = reader.read_u32()? as usize;
    let mut rows = Vec::with_capacity(count);
    for _ in 0..count {
        rows.push(read_versioned_row(&mut reader)?);
    }
    ensure!(
        reader.remaining() == 0,
        WireSnafu {
            message: format!("{} trailing bytes in row block", reader.remaining()),
        }
    );
    Ok(rows)
}

/// The empty block, used by tests constructing degenerate chunks.
pub fn empty_row_block() -> Block {
    Block(Bytes::from_static(&[0, 0, 0, 0]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_row() -> VersionedRow {
        VersionedRow {
            key: RowKey(vec![Value::Int64(7), Value::String("k".to_owned())]),
            values: vec![
                VersionedValue {
                    column_index: 2,
                    value: Value::String("new".to_owned()),
                    timestamp: Timestamp(200),
                },
                VersionedValue {
                    column_index: 2,
                    value: Value::String("old".to_owned()),
                    timestamp: Timestamp(100),
                },
                VersionedValue {
                    column_index: 3,
                    value: Value::Double(2.5.into()),
                    timestamp: Timestamp(200),
                },
            ],
            write_timestamps: vec![Timestamp(200), Timestamp(100)],
            delete_timestamps: vec![Timestamp(150)],
        }
    }

    #[test]
    fn block_roundtrip() {
        let rows = vec![sample_row(), VersionedRow::default()];
        let block = encode_row_block(&rows);
        let decoded = decode_row_block(&block).unwrap();
        assert_eq!(decoded, rows);
    }

    #[test]
    fn empty_block_decodes_to_nothing() {
        assert!(decode_row_block(&empty_row_block()).unwrap().is_empty());
    }

    #[test]
    fn truncated_block_is_rejected() {
        let block = encode_row_block(&[sample_row()]);
        let truncated = Block(block.0.slice(..block.0.len() - 3));
        assert!(decode_row_block(&truncated).is_err());
    }
}
