//! The tablet slot: one cell's automaton, transaction manager and tablets.
//!
//! Every mutation handler runs on the slot's serial automaton invoker; the
//! leader validates requests, posts mutations, and consumes their results
//! through per-method result queues (apply order equals submission order on
//! one cell, so the front of the queue always belongs to the mutation being
//! applied). Cross-cell effects (chunk attach/detach toward the master) are
//! queued into an in-order outbox, hive style.

use crate::{
    AbortTransactionRequest, CommitStoresUpdateRequest, CommitTransactionRequest, Error,
    ExecuteWriteRequest, HandleTransactionBarrierRequest, InMemoryManager,
    InvalidMountRevisionSnafu, MergePartitionsRequest, NoSuchTabletSnafu, OnStoresUpdatedRequest,
    PrepareCommitRequest, RegisterTransactionActionsRequest, Result, RotateStoreRequest,
    RowWriteRef, SplitPartitionRequest, StoreManager, TableMountConfig, TabletNodeConfig,
    Transaction, TransactionHooks, TransactionManager, METHOD_ABORT_TRANSACTION,
    METHOD_COMMIT_STORES_UPDATE, METHOD_COMMIT_TRANSACTION, METHOD_EXECUTE_WRITE,
    METHOD_HANDLE_TRANSACTION_BARRIER, METHOD_MERGE_PARTITIONS, METHOD_ON_STORES_UPDATED,
    METHOD_PREPARE_COMMIT, METHOD_REGISTER_TRANSACTION_ACTIONS, METHOD_ROTATE_STORE,
    METHOD_SPLIT_PARTITION,
};
use async_core::{invoke_on, AsyncError, Promise, PromiseFuture, SerialInvoker};
use automaton::{LocalAutomaton, Mutation};
use chunk_client::MemoryChunkStore;
use clock::{ClusterTag, Time, TimeProvider, TimestampProvider};
use data_types::{
    CellId, ChunkId, ColumnFilter, MountRevision, RowKey, TableSchema, TabletId, Timestamp,
    TransactionId, UnversionedRow,
};
use observability_deps::tracing::{debug, warn};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// A cross-cell message queued toward the master.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MasterMessage {
    /// A flushed or compacted chunk joined a tablet.
    ChunkAttached {
        /// The tablet.
        tablet_id: TabletId,
        /// The chunk.
        chunk_id: ChunkId,
    },
    /// A store left a tablet.
    ChunkDetached {
        /// The tablet.
        tablet_id: TabletId,
        /// The departed store.
        store_id: data_types::StoreId,
    },
}

/// The replicated per-cell state: tablets plus the transaction manager.
#[derive(Debug)]
pub struct TabletCellState {
    config: TabletNodeConfig,
    store_managers: HashMap<TabletId, StoreManager>,
    transaction_manager: TransactionManager,
    master_outbox: Vec<MasterMessage>,
}

struct CellHooks<'a> {
    store_managers: &'a mut HashMap<TabletId, StoreManager>,
}

impl CellHooks<'_> {
    fn sorted_store(
        &self,
        row: &RowWriteRef,
    ) -> Option<Arc<crate::SortedDynamicStore>> {
        self.store_managers
            .get(&row.tablet_id)?
            .tablet()
            .stores
            .get(&row.store_id)?
            .as_sorted_dynamic()
            .cloned()
    }
}

impl TransactionHooks for CellHooks<'_> {
    fn on_transaction_prepared(&mut self, transaction: &mut Transaction, _persistent: bool) {
        for row in &transaction.locked_rows {
            if let Some(store) = self.sorted_store(row) {
                store.prepare_row(transaction.id(), &row.key, transaction.prepare_timestamp);
            }
        }
    }

    fn on_transaction_committed(&mut self, transaction: &mut Transaction) {
        for row in &transaction.locked_rows {
            if let Some(store) = self.sorted_store(row) {
                store.commit_row(transaction.id(), &row.key, transaction.commit_timestamp);
            }
        }
    }

    fn on_transaction_serialized(&mut self, _transaction: &mut Transaction) {}

    fn on_transaction_aborted(&mut self, transaction: &mut Transaction) {
        for row in &transaction.locked_rows {
            if let Some(store) = self.sorted_store(row) {
                store.abort_row(transaction.id(), &row.key);
            }
        }
    }
}

impl TabletCellState {
    /// Ids of the tablets hosted on this cell.
    pub fn tablet_ids(&self) -> Vec<TabletId> {
        self.store_managers.keys().copied().collect()
    }

    /// The store manager of one tablet.
    pub fn store_manager(&mut self, tablet_id: TabletId) -> Result<&mut StoreManager> {
        self.store_managers
            .get_mut(&tablet_id)
            .ok_or_else(|| NoSuchTabletSnafu { tablet_id }.build())
    }

    /// The cell's transaction manager.
    pub fn transaction_manager(&mut self) -> &mut TransactionManager {
        &mut self.transaction_manager
    }

    fn validate_mount_revision(
        manager: &StoreManager,
        mount_revision: MountRevision,
    ) -> Result<()> {
        let actual = manager.tablet().mount_revision;
        if actual != mount_revision {
            return InvalidMountRevisionSnafu {
                expected: actual,
                actual: mount_revision,
            }
            .fail();
        }
        Ok(())
    }

    fn apply_execute_write(
        &mut self,
        request: &ExecuteWriteRequest,
        now: Time,
    ) -> Result<Vec<RowWriteRef>> {
        let manager = self.store_manager(request.tablet_id)?;
        Self::validate_mount_revision(manager, request.mount_revision)?;

        if let Some((transaction_id, start_timestamp)) = request.transaction {
            // First contact creates the transaction persistently.
            self.transaction_manager.get_or_create_transaction(
                transaction_id,
                start_timestamp,
                std::time::Duration::from_secs(60),
                false,
                now,
            )?;
        }

        let manager = self.store_manager(request.tablet_id)?;
        let row_refs = manager.execute_write(
            request.transaction,
            &request.commands,
            request.commit_timestamp,
        )?;

        if let Some((transaction_id, _)) = request.transaction {
            let transaction = self
                .transaction_manager
                .find_transaction(transaction_id)
                .expect("created above");
            transaction.prelocked_rows.extend(row_refs.iter().cloned());
            transaction.confirm_prelocked_rows();
        }
        Ok(row_refs)
    }

    fn apply_commit_stores_update(&mut self, request: &CommitStoresUpdateRequest) -> Result<()> {
        let manager = self.store_manager(request.tablet_id)?;
        Self::validate_mount_revision(manager, request.mount_revision)?;
        manager.commit_stores_update(&request.stores_to_remove, &request.stores_to_add)?;

        for descriptor in &request.stores_to_add {
            self.master_outbox.push(MasterMessage::ChunkAttached {
                tablet_id: request.tablet_id,
                chunk_id: descriptor.chunk_id,
            });
        }
        for store_id in &request.stores_to_remove {
            self.master_outbox.push(MasterMessage::ChunkDetached {
                tablet_id: request.tablet_id,
                store_id: *store_id,
            });
        }
        Ok(())
    }
}

type WriteResultQueue = Mutex<VecDeque<Promise<Result<Vec<RowWriteRef>>>>>;

/// One tablet cell hosted on this node.
pub struct TabletSlot {
    cell_id: CellId,
    automaton: Arc<LocalAutomaton>,
    state: Arc<Mutex<TabletCellState>>,
    time_provider: Arc<dyn TimeProvider>,
    timestamp_provider: Arc<dyn TimestampProvider>,
    chunk_backend: Arc<MemoryChunkStore>,
    in_memory_manager: Option<Arc<InMemoryManager>>,
    write_results: Arc<WriteResultQueue>,
    ack_queues: Arc<Mutex<HashMap<&'static str, VecDeque<Promise<Result<()>>>>>>,
}

impl std::fmt::Debug for TabletSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TabletSlot")
            .field("cell_id", &self.cell_id)
            .finish()
    }
}

impl TabletSlot {
    /// Create a slot with its automaton and register all mutation handlers.
    pub fn new(
        cell_id: CellId,
        config: TabletNodeConfig,
        clock_cluster_tag: ClusterTag,
        time_provider: Arc<dyn TimeProvider>,
        timestamp_provider: Arc<dyn TimestampProvider>,
        chunk_backend: Arc<MemoryChunkStore>,
        in_memory_manager: Option<Arc<InMemoryManager>>,
    ) -> Arc<Self> {
        let automaton = LocalAutomaton::new(SerialInvoker::new("tablet-automaton"));
        let transaction_manager = TransactionManager::new(
            config.transaction_manager.clone(),
            clock_cluster_tag,
            Arc::clone(&timestamp_provider),
        );
        let state = Arc::new(Mutex::new(TabletCellState {
            config: config.clone(),
            store_managers: HashMap::new(),
            transaction_manager,
            master_outbox: Vec::new(),
        }));

        let slot = Arc::new(Self {
            cell_id,
            automaton,
            state,
            time_provider,
            timestamp_provider,
            chunk_backend,
            in_memory_manager,
            write_results: Arc::new(Mutex::new(VecDeque::new())),
            ack_queues: Arc::new(Mutex::new(HashMap::new())),
        });
        slot.register_handlers();
        slot
    }

    /// The cell id.
    pub fn cell_id(&self) -> CellId {
        self.cell_id
    }

    /// The cell's automaton.
    pub fn automaton(&self) -> &Arc<LocalAutomaton> {
        &self.automaton
    }

    /// The cell state; scanners take it briefly, never across suspension
    /// points.
    pub fn state(&self) -> &Arc<Mutex<TabletCellState>> {
        &self.state
    }

    /// The timestamp provider of this cell's clock domain.
    pub fn timestamp_provider(&self) -> &Arc<dyn TimestampProvider> {
        &self.timestamp_provider
    }

    /// The chunk backend flushes write into.
    pub fn chunk_backend(&self) -> &Arc<MemoryChunkStore> {
        &self.chunk_backend
    }

    fn register_handlers(self: &Arc<Self>) {
        // Snapshot streams: keys first, then values, per the entity map
        // layout.
        let state = Arc::clone(&self.state);
        self.automaton
            .register_saver("transaction_manager.keys", move |context| {
                state.lock().transaction_manager.save_keys(context);
            });
        let state = Arc::clone(&self.state);
        self.automaton
            .register_saver("transaction_manager.values", move |context| {
                state.lock().transaction_manager.save_values(context);
            });
        let state = Arc::clone(&self.state);
        self.automaton
            .register_loader("transaction_manager.keys", move |context| {
                state.lock().transaction_manager.load_keys(context)
            });
        let state = Arc::clone(&self.state);
        self.automaton
            .register_loader("transaction_manager.values", move |context| {
                state.lock().transaction_manager.load_values(context)
            });

        self.register_write_handler();
        self.register_ack_handler(METHOD_ROTATE_STORE, |state, payload| {
            let request = RotateStoreRequest::decode(payload)?;
            let manager = state.store_manager(request.tablet_id)?;
            TabletCellState::validate_mount_revision(manager, request.mount_revision)?;
            manager.rotate()?;
            Ok(())
        });
        self.register_ack_handler(METHOD_COMMIT_STORES_UPDATE, |state, payload| {
            let request = CommitStoresUpdateRequest::decode(payload)?;
            state.apply_commit_stores_update(&request)
        });
        self.register_ack_handler(METHOD_ON_STORES_UPDATED, |state, payload| {
            let request = OnStoresUpdatedRequest::decode(payload)?;
            let manager = state.store_manager(request.tablet_id)?;
            for chunk_id in request.chunk_ids {
                manager.release_backing_store(chunk_id);
            }
            Ok(())
        });
        self.register_ack_handler(crate::METHOD_TRIM_ROWS, |state, payload| {
            let request = crate::TrimRowsRequest::decode(payload)?;
            let manager = state.store_manager(request.tablet_id)?;
            TabletCellState::validate_mount_revision(manager, request.mount_revision)?;
            manager.trim_rows(request.trimmed_row_count)
        });
        self.register_ack_handler(METHOD_SPLIT_PARTITION, |state, payload| {
            let request = SplitPartitionRequest::decode(payload)?;
            state
                .store_manager(request.tablet_id)?
                .split_partition(request.partition_index as usize, request.pivot_keys)
        });
        self.register_ack_handler(METHOD_MERGE_PARTITIONS, |state, payload| {
            let request = MergePartitionsRequest::decode(payload)?;
            state.store_manager(request.tablet_id)?.merge_partitions(
                request.first_partition_index as usize,
                request.last_partition_index as usize,
            )
        });

        let time_provider = Arc::clone(&self.time_provider);
        self.register_ack_handler_with(
            METHOD_REGISTER_TRANSACTION_ACTIONS,
            move |state, payload| {
                let request = RegisterTransactionActionsRequest::decode(payload)?;
                state.transaction_manager.register_transaction_actions(
                    request.transaction_id,
                    request.transaction_start_timestamp,
                    request.transaction_timeout,
                    request.signature,
                    request.actions,
                    time_provider.now(),
                )
            },
        );
        self.register_ack_handler(METHOD_PREPARE_COMMIT, |state, payload| {
            let request = PrepareCommitRequest::decode(payload)?;
            let mut hooks = CellHooks {
                store_managers: &mut state.store_managers,
            };
            state.transaction_manager.prepare_commit(
                request.transaction_id,
                true,
                request.prepare_timestamp,
                ClusterTag(request.prepare_timestamp_cluster_tag),
                &mut hooks,
            )
        });
        self.register_ack_handler(METHOD_COMMIT_TRANSACTION, |state, payload| {
            let request = CommitTransactionRequest::decode(payload)?;
            let mut hooks = CellHooks {
                store_managers: &mut state.store_managers,
            };
            state.transaction_manager.commit_transaction(
                request.transaction_id,
                request.commit_timestamp,
                ClusterTag(request.commit_timestamp_cluster_tag),
                &mut hooks,
            )
        });
        self.register_ack_handler(METHOD_ABORT_TRANSACTION, |state, payload| {
            let request = AbortTransactionRequest::decode(payload)?;
            let mut hooks = CellHooks {
                store_managers: &mut state.store_managers,
            };
            state.transaction_manager.abort_transaction(
                request.transaction_id,
                request.force,
                &mut hooks,
            )
        });
        self.register_ack_handler(METHOD_HANDLE_TRANSACTION_BARRIER, |state, payload| {
            let request = HandleTransactionBarrierRequest::decode(payload)?;
            let mut hooks = CellHooks {
                store_managers: &mut state.store_managers,
            };
            state
                .transaction_manager
                .handle_barrier(request.barrier_timestamp, &mut hooks);
            Ok(())
        });
    }

    fn register_write_handler(self: &Arc<Self>) {
        let state = Arc::clone(&self.state);
        let results = Arc::clone(&self.write_results);
        let time_provider = Arc::clone(&self.time_provider);
        self.automaton
            .register_method(METHOD_EXECUTE_WRITE, move |mutation: &Mutation| {
                let outcome = match ExecuteWriteRequest::decode(&mutation.payload) {
                    Ok(request) => state
                        .lock()
                        .apply_execute_write(&request, time_provider.now()),
                    Err(e) => Err(e),
                };
                if let Err(e) = &outcome {
                    debug!(%e, "execute-write mutation rejected");
                }
                if let Some(promise) = results.lock().pop_front() {
                    promise.try_set(outcome);
                }
            });
    }

    fn register_ack_handler(
        self: &Arc<Self>,
        method: &'static str,
        apply: impl Fn(&mut TabletCellState, &[u8]) -> Result<()> + Send + Sync + 'static,
    ) {
        self.register_ack_handler_with(method, apply)
    }

    fn register_ack_handler_with(
        self: &Arc<Self>,
        method: &'static str,
        apply: impl Fn(&mut TabletCellState, &[u8]) -> Result<()> + Send + Sync + 'static,
    ) {
        let state = Arc::clone(&self.state);
        let ack_queues = Arc::clone(&self.ack_queues);
        self.automaton.register_method(method, move |mutation| {
            let outcome = apply(&mut state.lock(), &mutation.payload);
            if let Err(e) = &outcome {
                warn!(method = %mutation.method, %e, "mutation rejected");
            }
            if let Some(promise) = ack_queues
                .lock()
                .get_mut(method)
                .and_then(|queue| queue.pop_front())
            {
                promise.try_set(outcome);
            }
        });
    }

    fn post_acked(&self, method: &'static str, payload: bytes::Bytes) -> PromiseFuture<Result<()>> {
        let promise = Promise::new();
        let future = promise.future();
        self.ack_queues
            .lock()
            .entry(method)
            .or_default()
            .push_back(promise);
        let commit = self.automaton.commit_mutation(Mutation::new(method, payload));
        let queues = Arc::clone(&self.ack_queues);
        commit.subscribe(move |result| {
            // A mutation refused before apply (bad reign) must not leave its
            // promise queued forever.
            if let Err(e) = result {
                if let Some(promise) = queues
                    .lock()
                    .get_mut(method)
                    .and_then(|queue| queue.pop_front())
                {
                    promise.try_set_error(AsyncError::Failed(e.to_string()));
                }
            }
        });
        future
    }

    async fn await_ack(&self, future: PromiseFuture<Result<()>>) -> Result<()> {
        match future.await {
            Ok(result) => result,
            Err(e) => Err(Error::Wire {
                message: e.to_string(),
            }),
        }
    }

    // -----------------------------------------------------------------------
    // Tablet lifecycle (master directives)
    // -----------------------------------------------------------------------

    /// Create and mount a tablet on this cell.
    pub fn create_tablet(
        &self,
        tablet_id: TabletId,
        schema: Arc<TableSchema>,
        ordered: bool,
        mount_config: TableMountConfig,
    ) -> Result<()> {
        let tablet = crate::Tablet::new(
            tablet_id,
            schema,
            ordered,
            mount_config,
            RowKey::empty(),
            None,
        );
        let mut state = self.state.lock();
        let error_backoff = state.config.error_backoff_time;
        let mut manager = StoreManager::new(
            tablet,
            Arc::clone(&self.chunk_backend),
            self.in_memory_manager.clone(),
            error_backoff,
        );
        manager.mount(MountRevision(1))?;
        state.store_managers.insert(tablet_id, manager);
        Ok(())
    }

    /// The mount revision of a tablet.
    pub fn mount_revision(&self, tablet_id: TabletId) -> Result<MountRevision> {
        let mut state = self.state.lock();
        Ok(state.store_manager(tablet_id)?.tablet().mount_revision)
    }

    // -----------------------------------------------------------------------
    // Write and read paths
    // -----------------------------------------------------------------------

    /// Post an execute-write mutation and await its row refs.
    pub async fn execute_write(&self, request: ExecuteWriteRequest) -> Result<Vec<RowWriteRef>> {
        let promise = Promise::new();
        let future = promise.future();
        self.write_results.lock().push_back(promise);
        let commit = self
            .automaton
            .commit_mutation(Mutation::new(METHOD_EXECUTE_WRITE, request.encode()));
        let results = Arc::clone(&self.write_results);
        commit.subscribe(move |result| {
            if let Err(e) = result {
                if let Some(promise) = results.lock().pop_front() {
                    promise.try_set_error(AsyncError::Failed(e.to_string()));
                }
            }
        });
        match future.await {
            Ok(result) => result,
            Err(e) => Err(Error::Wire {
                message: e.to_string(),
            }),
        }
    }

    /// Look up rows at `timestamp`.
    pub async fn lookup(
        &self,
        tablet_id: TabletId,
        keys: Vec<RowKey>,
        timestamp: Timestamp,
        column_filter: ColumnFilter,
    ) -> Result<Vec<Option<UnversionedRow>>> {
        // Capture the per-key store lists under the automaton lock, then run
        // the session outside it.
        let slot_state = Arc::clone(&self.state);
        let keyed_stores = invoke_on(&**self.automaton.invoker(), move || {
            let mut state = slot_state.lock();
            let manager = state.store_manager(tablet_id)?;
            let schema = manager.schema();
            let keyed: Vec<(RowKey, Vec<crate::Store>)> = keys
                .into_iter()
                .map(|key| {
                    let stores = manager.stores_for_key(&key);
                    (key, stores)
                })
                .collect();
            Ok::<_, Error>((schema, keyed))
        })
        .await
        .map_err(|e| Error::Wire {
            message: e.to_string(),
        })??;

        let (schema, keyed) = keyed_stores;
        crate::lookup_rows(schema, timestamp, column_filter, keyed).await
    }

    // -----------------------------------------------------------------------
    // Transactions
    // -----------------------------------------------------------------------

    /// Register transaction actions through a mutation.
    pub async fn register_transaction_actions(
        &self,
        request: RegisterTransactionActionsRequest,
    ) -> Result<()> {
        let future = self.post_acked(METHOD_REGISTER_TRANSACTION_ACTIONS, request.encode());
        self.await_ack(future).await
    }

    /// Prepare a commit. Transient prepares run leader-side only; persistent
    /// ones replicate.
    pub async fn prepare_commit(
        &self,
        transaction_id: TransactionId,
        persistent: bool,
        prepare_timestamp: Timestamp,
    ) -> Result<()> {
        let cluster_tag = self.timestamp_provider.cluster_tag();
        if persistent {
            let future = self.post_acked(
                METHOD_PREPARE_COMMIT,
                PrepareCommitRequest {
                    transaction_id,
                    prepare_timestamp,
                    prepare_timestamp_cluster_tag: cluster_tag.0,
                }
                .encode(),
            );
            return self.await_ack(future).await;
        }

        let state = Arc::clone(&self.state);
        invoke_on(&**self.automaton.invoker(), move || {
            let mut state = state.lock();
            let state = &mut *state;
            let mut hooks = CellHooks {
                store_managers: &mut state.store_managers,
            };
            state.transaction_manager.prepare_commit(
                transaction_id,
                false,
                prepare_timestamp,
                cluster_tag,
                &mut hooks,
            )
        })
        .await
        .map_err(|e| Error::Wire {
            message: e.to_string(),
        })?
    }

    /// Commit a transaction through a mutation.
    pub async fn commit_transaction(
        &self,
        transaction_id: TransactionId,
        commit_timestamp: Timestamp,
    ) -> Result<()> {
        let future = self.post_acked(
            METHOD_COMMIT_TRANSACTION,
            CommitTransactionRequest {
                transaction_id,
                commit_timestamp,
                commit_timestamp_cluster_tag: self.timestamp_provider.cluster_tag().0,
            }
            .encode(),
        );
        self.await_ack(future).await
    }

    /// Abort a transaction through a mutation.
    pub async fn abort_transaction(&self, transaction_id: TransactionId, force: bool) -> Result<()> {
        let future = self.post_acked(
            METHOD_ABORT_TRANSACTION,
            AbortTransactionRequest {
                transaction_id,
                force,
            }
            .encode(),
        );
        self.await_ack(future).await
    }

    /// Leader-side barrier check: propose a barrier mutation if the minimum
    /// prepare timestamp advanced.
    pub async fn check_barrier(&self) -> Result<Option<Timestamp>> {
        let state = Arc::clone(&self.state);
        let candidate = invoke_on(&**self.automaton.invoker(), move || {
            state.lock().transaction_manager.check_barrier()
        })
        .await
        .map_err(|e| Error::Wire {
            message: e.to_string(),
        })?;

        let Some(barrier_timestamp) = candidate else {
            return Ok(None);
        };
        let future = self.post_acked(
            METHOD_HANDLE_TRANSACTION_BARRIER,
            HandleTransactionBarrierRequest { barrier_timestamp }.encode(),
        );
        self.await_ack(future).await?;
        Ok(Some(barrier_timestamp))
    }

    /// Expire transaction leases; each expiry proposes an abort.
    pub async fn expire_transaction_leases(&self) -> Result<Vec<TransactionId>> {
        let now = self.time_provider.now();
        let state = Arc::clone(&self.state);
        let expired = invoke_on(&**self.automaton.invoker(), move || {
            state.lock().transaction_manager.collect_expired_leases(now)
        })
        .await
        .map_err(|e| Error::Wire {
            message: e.to_string(),
        })?;

        for transaction_id in &expired {
            debug!(transaction_id = %transaction_id, "transaction lease expired, aborting");
            if let Err(e) = self.abort_transaction(*transaction_id, true).await {
                warn!(transaction_id = %transaction_id, %e, "error aborting expired transaction");
            }
        }
        Ok(expired)
    }

    // -----------------------------------------------------------------------
    // Background-scanner entry points
    // -----------------------------------------------------------------------

    /// Post a rotate-store mutation.
    pub async fn rotate_store(&self, tablet_id: TabletId) -> Result<()> {
        let mount_revision = self.mount_revision(tablet_id)?;
        let future = self.post_acked(
            METHOD_ROTATE_STORE,
            RotateStoreRequest {
                tablet_id,
                mount_revision,
            }
            .encode(),
        );
        self.await_ack(future).await
    }

    /// Post a commit-tablet-stores-update mutation.
    pub async fn commit_stores_update(&self, request: CommitStoresUpdateRequest) -> Result<()> {
        let future = self.post_acked(METHOD_COMMIT_STORES_UPDATE, request.encode());
        self.await_ack(future).await
    }

    /// Post an on-tablet-stores-updated mutation (master acknowledgment).
    pub async fn acknowledge_stores_update(&self, request: OnStoresUpdatedRequest) -> Result<()> {
        let future = self.post_acked(METHOD_ON_STORES_UPDATED, request.encode());
        self.await_ack(future).await
    }

    /// Post a trim-rows mutation for an ordered tablet.
    pub async fn trim_rows(&self, tablet_id: TabletId, trimmed_row_count: i64) -> Result<()> {
        let mount_revision = self.mount_revision(tablet_id)?;
        let future = self.post_acked(
            crate::METHOD_TRIM_ROWS,
            crate::TrimRowsRequest {
                tablet_id,
                mount_revision,
                trimmed_row_count,
            }
            .encode(),
        );
        self.await_ack(future).await
    }

    /// Drain the queued master messages, preserving order.
    pub fn take_master_messages(&self) -> Vec<MasterMessage> {
        std::mem::take(&mut self.state.lock().master_outbox)
    }
}

/// All slots hosted by one node; the background scanners walk it.
#[derive(Debug, Default)]
pub struct SlotManager {
    slots: parking_lot::RwLock<Vec<Arc<TabletSlot>>>,
}

impl SlotManager {
    /// Create an empty slot manager.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Host a slot.
    pub fn register_slot(&self, slot: Arc<TabletSlot>) {
        self.slots.write().push(slot);
    }

    /// Remove a slot, e.g. on a master directive.
    pub fn remove_slot(&self, cell_id: CellId) {
        self.slots.write().retain(|slot| slot.cell_id() != cell_id);
    }

    /// Snapshot of the hosted slots.
    pub fn slots(&self) -> Vec<Arc<TabletSlot>> {
        self.slots.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::simple_schema;
    use assert_matches::assert_matches;
    use clock::{LocalTimestampProvider, MockProvider};
    use data_types::Value;

    const TAG: ClusterTag = ClusterTag(3);

    fn slot_with_clock() -> (Arc<TabletSlot>, Arc<LocalTimestampProvider>) {
        let time_provider = Arc::new(MockProvider::new(Time::from_timestamp_nanos(0)));
        let timestamp_provider = Arc::new(LocalTimestampProvider::new(TAG));
        let slot = TabletSlot::new(
            CellId::new(1),
            TabletNodeConfig::for_tests(),
            TAG,
            time_provider,
            Arc::clone(&timestamp_provider) as _,
            MemoryChunkStore::new(),
            None,
        );
        (slot, timestamp_provider)
    }

    fn slot() -> Arc<TabletSlot> {
        slot_with_clock().0
    }

    fn tablet_id() -> TabletId {
        TabletId::new(1)
    }

    fn key(k: i64) -> RowKey {
        RowKey(vec![Value::Int64(k)])
    }

    fn write_request(
        transaction: Option<(TransactionId, Timestamp)>,
        commit_timestamp: Option<Timestamp>,
        k: i64,
        v: &str,
    ) -> ExecuteWriteRequest {
        ExecuteWriteRequest {
            tablet_id: tablet_id(),
            mount_revision: MountRevision(1),
            transaction,
            commit_timestamp,
            commands: vec![crate::WriteCommand::Write(UnversionedRow {
                values: vec![Value::Int64(k), Value::String(v.to_owned())],
            })],
        }
    }

    #[tokio::test]
    async fn write_commit_read_roundtrip() {
        let slot = slot();
        slot.create_tablet(tablet_id(), simple_schema(), false, Default::default())
            .unwrap();

        let transaction_id = TransactionId::new(7);
        slot.execute_write(write_request(
            Some((transaction_id, Timestamp(100))),
            None,
            1,
            "value",
        ))
        .await
        .unwrap();
        slot.register_transaction_actions(RegisterTransactionActionsRequest {
            transaction_id,
            transaction_start_timestamp: Timestamp(100),
            transaction_timeout: std::time::Duration::from_secs(60),
            signature: crate::FINAL_TRANSACTION_SIGNATURE,
            actions: vec![],
        })
        .await
        .unwrap();

        slot.prepare_commit(transaction_id, true, Timestamp(110))
            .await
            .unwrap();

        // A read below the prepare timestamp sees nothing and is not blocked.
        let rows = slot
            .lookup(tablet_id(), vec![key(1)], Timestamp(105), ColumnFilter::All)
            .await
            .unwrap();
        assert!(rows[0].is_none());

        // A concurrent read above the prepare timestamp blocks until commit.
        let reading_slot = Arc::clone(&slot);
        let blocked_read = tokio::spawn(async move {
            reading_slot
                .lookup(tablet_id(), vec![key(1)], Timestamp(115), ColumnFilter::All)
                .await
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!blocked_read.is_finished());

        slot.commit_transaction(transaction_id, Timestamp(120))
            .await
            .unwrap();

        let rows = blocked_read.await.unwrap().unwrap();
        assert_eq!(
            rows[0].as_ref().unwrap().values[1],
            Value::String("value".to_owned())
        );

        // At 119 the row is invisible; at 120 it is there.
        let rows = slot
            .lookup(tablet_id(), vec![key(1)], Timestamp(119), ColumnFilter::All)
            .await
            .unwrap();
        assert!(rows[0].is_none());
        let rows = slot
            .lookup(tablet_id(), vec![key(1)], Timestamp(120), ColumnFilter::All)
            .await
            .unwrap();
        assert!(rows[0].is_some());
    }

    #[tokio::test]
    async fn barrier_serializes_in_commit_timestamp_order() {
        let (slot, clock) = slot_with_clock();
        slot.create_tablet(tablet_id(), simple_schema(), false, Default::default())
            .unwrap();

        let order: Arc<Mutex<Vec<Timestamp>>> = Default::default();
        {
            let order = Arc::clone(&order);
            let mut state = slot.state().lock();
            state.transaction_manager.register_action_handlers(
                "record",
                crate::ActionHandlers {
                    serialize: Some(Box::new(move |transaction, _action| {
                        order.lock().push(transaction.commit_timestamp);
                    })),
                    ..Default::default()
                },
            );
        }

        // Two transactions commit in reverse timestamp order.
        for (unique, commit_ts) in [(1u64, 300u64), (2, 200)] {
            let transaction_id = TransactionId::new(unique);
            slot.register_transaction_actions(RegisterTransactionActionsRequest {
                transaction_id,
                transaction_start_timestamp: Timestamp(100),
                transaction_timeout: std::time::Duration::from_secs(60),
                signature: crate::FINAL_TRANSACTION_SIGNATURE,
                actions: vec![crate::TransactionAction {
                    action_type: "record".to_owned(),
                    payload: bytes::Bytes::new(),
                }],
            })
            .await
            .unwrap();
            slot.prepare_commit(transaction_id, true, Timestamp(commit_ts - 10))
                .await
                .unwrap();
            slot.commit_transaction(transaction_id, Timestamp(commit_ts))
                .await
                .unwrap();
        }

        // With no prepared transactions left, the barrier candidate is the
        // latest cluster timestamp; advance it past both commits.
        clock.observe(Timestamp(310));
        let barrier = slot.check_barrier().await.unwrap();
        assert_eq!(barrier, Some(Timestamp(310)));
        assert_eq!(*order.lock(), vec![Timestamp(200), Timestamp(300)]);
    }

    #[tokio::test]
    async fn conflicting_write_is_rejected() {
        let slot = slot();
        slot.create_tablet(tablet_id(), simple_schema(), false, Default::default())
            .unwrap();

        let first = TransactionId::new(1);
        slot.execute_write(write_request(Some((first, Timestamp(100))), None, 1, "a"))
            .await
            .unwrap();

        let second = TransactionId::new(2);
        let err = slot
            .execute_write(write_request(Some((second, Timestamp(101))), None, 1, "b"))
            .await
            .unwrap_err();
        assert_matches!(err, Error::RowLockConflict { .. });
    }

    #[tokio::test]
    async fn abort_releases_locks() {
        let slot = slot();
        slot.create_tablet(tablet_id(), simple_schema(), false, Default::default())
            .unwrap();

        let transaction_id = TransactionId::new(1);
        slot.execute_write(write_request(
            Some((transaction_id, Timestamp(100))),
            None,
            1,
            "staged",
        ))
        .await
        .unwrap();
        slot.abort_transaction(transaction_id, false).await.unwrap();

        // The row never became visible and the lock is free.
        let rows = slot
            .lookup(tablet_id(), vec![key(1)], Timestamp::MAX, ColumnFilter::All)
            .await
            .unwrap();
        assert!(rows[0].is_none());

        let other = TransactionId::new(2);
        slot.execute_write(write_request(Some((other, Timestamp(102))), None, 1, "next"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn stale_mount_revision_is_rejected() {
        let slot = slot();
        slot.create_tablet(tablet_id(), simple_schema(), false, Default::default())
            .unwrap();

        let mut request = write_request(None, Some(Timestamp(10)), 1, "x");
        request.mount_revision = MountRevision(99);
        let err = slot.execute_write(request).await.unwrap_err();
        assert_matches!(err, Error::InvalidMountRevision { .. });
    }

    #[tokio::test]
    async fn snapshot_roundtrip_restores_transactions() {
        let original = slot();
        let transaction_id = TransactionId::new(5);
        original
            .register_transaction_actions(crate::RegisterTransactionActionsRequest {
                transaction_id,
                transaction_start_timestamp: Timestamp(100),
                transaction_timeout: std::time::Duration::from_secs(60),
                signature: crate::FINAL_TRANSACTION_SIGNATURE,
                actions: vec![],
            })
            .await
            .unwrap();
        original
            .prepare_commit(transaction_id, true, Timestamp(110))
            .await
            .unwrap();

        let snapshot = original.automaton().save_snapshot();

        // A fresh slot loads the snapshot and can drive the transaction to
        // completion.
        let restored = slot();
        restored.automaton().load_snapshot(&snapshot).unwrap();
        {
            let mut state = restored.state().lock();
            assert_eq!(state.transaction_manager().transaction_count(), 1);
            assert_eq!(
                state.transaction_manager().min_prepare_timestamp(),
                Timestamp(110)
            );
        }
        restored
            .commit_transaction(transaction_id, Timestamp(120))
            .await
            .unwrap();

        // Save -> load -> save is byte-stable.
        let reloaded = slot();
        reloaded.automaton().load_snapshot(&snapshot).unwrap();
        assert_eq!(reloaded.automaton().save_snapshot(), snapshot);
    }

    #[tokio::test]
    async fn master_outbox_records_stores_updates_in_order() {
        let slot = slot();
        slot.create_tablet(tablet_id(), simple_schema(), false, Default::default())
            .unwrap();
        slot.execute_write(write_request(None, Some(Timestamp(10)), 1, "x"))
            .await
            .unwrap();
        slot.rotate_store(tablet_id()).await.unwrap();

        let passive_id = {
            let mut state = slot.state().lock();
            state
                .store_manager(tablet_id())
                .unwrap()
                .flushable_stores()[0]
                .id()
        };
        let chunk_id = ChunkId::new(data_types::EntityKind::Chunk, 77);
        slot.commit_stores_update(CommitStoresUpdateRequest {
            tablet_id: tablet_id(),
            mount_revision: MountRevision(1),
            stores_to_remove: vec![passive_id],
            stores_to_add: vec![crate::StoreAddDescriptor {
                chunk_id,
                meta: Default::default(),
                backing_store_id: Some(passive_id),
            }],
        })
        .await
        .unwrap();

        let messages = slot.take_master_messages();
        assert_eq!(
            messages,
            vec![
                MasterMessage::ChunkAttached {
                    tablet_id: tablet_id(),
                    chunk_id
                },
                MasterMessage::ChunkDetached {
                    tablet_id: tablet_id(),
                    store_id: passive_id
                },
            ]
        );
        assert!(slot.take_master_messages().is_empty());
    }
}
