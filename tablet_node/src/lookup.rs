//! The row lookup path.
//!
//! For each key the session consults every relevant store: dynamic stores
//! synchronously (waiting out blocked rows), chunk stores synchronously when
//! their data is resident and through block reads otherwise; the async
//! fragments are collected in parallel. Fragments merge under MVCC rules.

use crate::{LookupOutcome, Result, SchemafulRowMerger, Store};
use data_types::{ColumnFilter, RowKey, TableSchema, Timestamp, UnversionedRow};
use futures::future::join_all;
use observability_deps::tracing::debug;
use std::sync::Arc;

/// Look up `keys` at `timestamp` across their relevant stores.
///
/// `keyed_stores` pairs each key with the stores its partition (plus eden and
/// the dynamic set) contributes; the caller captures that list under the
/// automaton invoker and runs the session outside it.
pub async fn lookup_rows(
    schema: Arc<TableSchema>,
    timestamp: Timestamp,
    column_filter: ColumnFilter,
    keyed_stores: Vec<(RowKey, Vec<Store>)>,
) -> Result<Vec<Option<UnversionedRow>>> {
    debug!(key_count = keyed_stores.len(), %timestamp, "looking up rows");
    let mut results = Vec::with_capacity(keyed_stores.len());
    for (key, stores) in keyed_stores {
        results.push(lookup_one(&schema, timestamp, &column_filter, key, stores).await?);
    }
    Ok(results)
}

async fn lookup_one(
    schema: &Arc<TableSchema>,
    timestamp: Timestamp,
    column_filter: &ColumnFilter,
    key: RowKey,
    stores: Vec<Store>,
) -> Result<Option<UnversionedRow>> {
    let mut merger = SchemafulRowMerger::new(Arc::clone(schema), column_filter.clone());
    let mut async_lookups = Vec::new();

    for store in &stores {
        match store {
            Store::SortedDynamic(dynamic) => {
                // A row with a prepared lock below the read timestamp may
                // commit below it; wait for the writer to finish and retry.
                loop {
                    match dynamic.lookup(&key, timestamp, column_filter) {
                        LookupOutcome::Ok(Some(row)) => {
                            merger.add_partial_row(row);
                            break;
                        }
                        LookupOutcome::Ok(None) => break,
                        LookupOutcome::Blocked {
                            lock_index,
                            prepared_timestamp,
                            ..
                        } => {
                            debug!(
                                lock_index,
                                %prepared_timestamp,
                                "lookup blocked on a prepared row, waiting"
                            );
                            dynamic.wait_row_unblocked().await;
                        }
                    }
                }
            }
            // Ordered stores are addressed by row index, not key.
            Store::OrderedDynamic(_) => {}
            Store::Chunk(chunk) => match chunk.try_lookup_sync(&key, timestamp, column_filter) {
                Some(row) => {
                    if let Some(row) = row? {
                        merger.add_partial_row(row);
                    }
                }
                None => {
                    async_lookups.push(chunk.lookup_from_chunk(&key, timestamp, column_filter));
                }
            },
        }
    }

    if !async_lookups.is_empty() {
        for fragment in join_all(async_lookups).await {
            if let Some(row) = fragment? {
                merger.add_partial_row(row);
            }
        }
    }
    Ok(merger.build(&key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::simple_schema;
    use crate::{
        encode_row_block, mounted_sorted_tablet, ChunkStore, StoreManager, TableMountConfig,
        WriteCommand,
    };
    use chunk_client::{ChunkWriter, MemoryChunkStore};
    use data_types::{
        ChunkId, ChunkMeta, EntityKind, MiscExt, TabletId, TransactionId, UnversionedRow, Value,
        VersionedRow, VersionedValue,
    };
    use std::time::Duration;

    fn key(k: i64) -> RowKey {
        RowKey(vec![Value::Int64(k)])
    }

    fn row(k: i64, v: &str) -> UnversionedRow {
        UnversionedRow {
            values: vec![Value::Int64(k), Value::String(v.to_owned())],
        }
    }

    fn manager() -> StoreManager {
        mounted_sorted_tablet(
            TabletId::new(1),
            simple_schema(),
            TableMountConfig::default(),
            MemoryChunkStore::new(),
            None,
            Duration::from_millis(10),
        )
    }

    async fn lookup_single(manager: &StoreManager, k: i64, ts: u64) -> Option<UnversionedRow> {
        let stores = manager.stores_for_key(&key(k));
        let mut rows = lookup_rows(
            manager.schema(),
            Timestamp(ts),
            ColumnFilter::All,
            vec![(key(k), stores)],
        )
        .await
        .unwrap();
        rows.pop().unwrap()
    }

    #[tokio::test]
    async fn lookup_merges_dynamic_and_chunk_fragments() {
        let mut manager = manager();

        // An older version lives in a chunk store.
        let chunk_id = ChunkId::new(EntityKind::Chunk, 50);
        let backend = Arc::clone(manager.chunk_backend());
        let writer = backend.writer(chunk_id);
        writer
            .write_block(encode_row_block(&[VersionedRow {
                key: key(1),
                values: vec![VersionedValue {
                    column_index: 1,
                    value: Value::String("from-chunk".to_owned()),
                    timestamp: Timestamp(50),
                }],
                write_timestamps: vec![Timestamp(50)],
                delete_timestamps: vec![],
            }]))
            .await
            .unwrap();
        let meta = ChunkMeta {
            misc: Some(MiscExt {
                row_count: 1,
                sealed: true,
                min_key: Some(key(1)),
                max_key: Some(key(1)),
                ..Default::default()
            }),
            blocks: None,
        };
        writer.close(meta.clone()).await.unwrap();
        let chunk_store = ChunkStore::new(chunk_id, meta, backend);
        manager.tablet_mut().eden.stores.push(Arc::clone(&chunk_store));
        manager
            .tablet_mut()
            .stores
            .insert(chunk_store.id(), crate::Store::Chunk(chunk_store));

        // A newer version lives in the active dynamic store.
        manager
            .execute_write(
                None,
                &[WriteCommand::Write(row(1, "from-dynamic"))],
                Some(Timestamp(100)),
            )
            .unwrap();

        // At ts 60 only the chunk version is visible; at 100 the dynamic one
        // wins the merge.
        let at_60 = lookup_single(&manager, 1, 60).await.unwrap();
        assert_eq!(at_60.values[1], Value::String("from-chunk".to_owned()));
        let at_100 = lookup_single(&manager, 1, 100).await.unwrap();
        assert_eq!(at_100.values[1], Value::String("from-dynamic".to_owned()));
        assert!(lookup_single(&manager, 2, 100).await.is_none());
    }

    #[tokio::test]
    async fn blocked_lookup_waits_for_commit() {
        let mut manager = manager();
        let transaction_id = TransactionId::new(9);

        manager
            .execute_write(
                Some((transaction_id, Timestamp(100))),
                &[WriteCommand::Write(row(1, "pending"))],
                None,
            )
            .unwrap();
        let active = manager
            .tablet()
            .active_store()
            .unwrap()
            .as_sorted_dynamic()
            .cloned()
            .unwrap();
        active.prepare_row(transaction_id, &key(1), Timestamp(110));

        let stores = manager.stores_for_key(&key(1));
        let schema = manager.schema();
        let reader = tokio::spawn(async move {
            lookup_rows(
                schema,
                Timestamp(115),
                ColumnFilter::All,
                vec![(key(1), stores)],
            )
            .await
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!reader.is_finished());

        active.commit_row(transaction_id, &key(1), Timestamp(112));
        let mut rows = reader.await.unwrap().unwrap();
        let found = rows.pop().unwrap().unwrap();
        assert_eq!(found.values[1], Value::String("pending".to_owned()));
    }

    #[tokio::test]
    async fn prewrite_returns_row_refs() {
        let mut manager = manager();
        let transaction_id = TransactionId::new(3);
        let refs = manager
            .execute_write(
                Some((transaction_id, Timestamp(10))),
                &[WriteCommand::Write(row(5, "x"))],
                None,
            )
            .unwrap();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].key, key(5));
        assert_eq!(refs[0].tablet_id, TabletId::new(1));
    }
}
