//! Merges per-store row fragments into the row visible at a timestamp.

use data_types::{ColumnFilter, RowKey, TableSchema, Timestamp, UnversionedRow, Value, VersionedRow};
use std::sync::Arc;

/// Merges [`VersionedRow`] fragments for one key under MVCC rules: the
/// latest delete wins over older writes, and each column resolves to its
/// newest value above the delete.
#[derive(Debug)]
pub struct SchemafulRowMerger {
    schema: Arc<TableSchema>,
    column_filter: ColumnFilter,
    partial_rows: Vec<VersionedRow>,
}

impl SchemafulRowMerger {
    /// A merger for one lookup.
    pub fn new(schema: Arc<TableSchema>, column_filter: ColumnFilter) -> Self {
        Self {
            schema,
            column_filter,
            partial_rows: Vec::new(),
        }
    }

    /// Feed one store's fragment. Fragments are already clipped to the read
    /// timestamp by their stores.
    pub fn add_partial_row(&mut self, row: VersionedRow) {
        self.partial_rows.push(row);
    }

    /// Resolve the merged row; `None` if the key does not exist (or its
    /// latest event is a delete).
    pub fn build(self, key: &RowKey) -> Option<UnversionedRow> {
        if self.partial_rows.is_empty() {
            return None;
        }

        let latest_write = self
            .partial_rows
            .iter()
            .flat_map(|row| row.write_timestamps.iter().copied())
            .max()
            .unwrap_or(Timestamp::NULL);
        let latest_delete = self
            .partial_rows
            .iter()
            .flat_map(|row| row.delete_timestamps.iter().copied())
            .max()
            .unwrap_or(Timestamp::NULL);

        if latest_write == Timestamp::NULL || latest_delete >= latest_write {
            return None;
        }

        let mut values = Vec::with_capacity(self.schema.columns.len());
        values.extend(key.0.iter().cloned());
        for column_index in self.schema.key_column_count..self.schema.columns.len() {
            if !self.column_filter.contains(column_index) {
                values.push(Value::Null);
                continue;
            }
            // Newest value above the delete horizon.
            let mut best: Option<(Timestamp, &Value)> = None;
            for row in &self.partial_rows {
                for versioned in &row.values {
                    if versioned.column_index != column_index {
                        continue;
                    }
                    if versioned.timestamp <= latest_delete {
                        continue;
                    }
                    if best.map(|(ts, _)| versioned.timestamp > ts).unwrap_or(true) {
                        best = Some((versioned.timestamp, &versioned.value));
                    }
                }
            }
            values.push(best.map(|(_, value)| value.clone()).unwrap_or(Value::Null));
        }
        Some(UnversionedRow { values })
    }
}
