//! The per-cell MVCC transaction state machine.
//!
//! Two-phase commit with transient and persistent prepare, commit-timestamp
//! ordering per clock domain, and a serialization barrier: committed
//! transactions park in per-cluster-tag heaps keyed by commit timestamp, and
//! the periodic barrier mutation (minimum prepare timestamp over the
//! prepared set) pops and serializes every transaction at or below it.

use crate::{
    DecommissionedSnafu, InvalidStateSnafu, NoSuchTransactionSnafu, Result, Transaction,
    TransactionAction, TransactionManagerConfig, WrongClockClusterTagSnafu,
    FINAL_TRANSACTION_SIGNATURE,
};
use automaton::EntityMap;
use clock::{ClusterTag, Time, Timestamp, TimestampProvider};
use data_types::{TransactionId, TransactionState};
use observability_deps::tracing::{debug, info, warn};
use std::collections::{BTreeSet, BinaryHeap, HashMap, HashSet, VecDeque};
use std::cmp::Reverse;
use std::sync::Arc;
use std::time::Duration;

/// Callbacks the hosting cell wires into transaction state changes; this is
/// where row locks get prepared, committed and released.
pub trait TransactionHooks {
    /// Runs under the prepare mutation (or transiently on the leader).
    fn on_transaction_prepared(&mut self, transaction: &mut Transaction, persistent: bool);
    /// Runs under the commit mutation.
    fn on_transaction_committed(&mut self, transaction: &mut Transaction);
    /// Runs when the barrier serializes the transaction.
    fn on_transaction_serialized(&mut self, transaction: &mut Transaction);
    /// Runs under the abort mutation.
    fn on_transaction_aborted(&mut self, transaction: &mut Transaction);
}

/// Hooks that do nothing; unit tests and action-only cells.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTransactionHooks;

impl TransactionHooks for NoopTransactionHooks {
    fn on_transaction_prepared(&mut self, _transaction: &mut Transaction, _persistent: bool) {}
    fn on_transaction_committed(&mut self, _transaction: &mut Transaction) {}
    fn on_transaction_serialized(&mut self, _transaction: &mut Transaction) {}
    fn on_transaction_aborted(&mut self, _transaction: &mut Transaction) {}
}

type ActionCallback = Box<dyn Fn(&Transaction, &TransactionAction) + Send>;

/// Handlers for one registered action type.
#[derive(Default)]
pub struct ActionHandlers {
    /// Runs at prepare.
    pub prepare: Option<ActionCallback>,
    /// Runs at commit.
    pub commit: Option<ActionCallback>,
    /// Runs at abort.
    pub abort: Option<ActionCallback>,
    /// Runs at serialization.
    pub serialize: Option<ActionCallback>,
}

impl std::fmt::Debug for ActionHandlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ActionHandlers")
    }
}

/// The transaction manager of one tablet cell.
#[derive(Debug)]
pub struct TransactionManager {
    config: TransactionManagerConfig,
    clock_cluster_tag: ClusterTag,
    timestamp_provider: Arc<dyn TimestampProvider>,
    persistent: EntityMap<TransactionId, Transaction>,
    transient: EntityMap<TransactionId, Transaction>,
    serializing_heaps: HashMap<ClusterTag, BinaryHeap<Reverse<(Timestamp, TransactionId)>>>,
    last_serialized_commit_timestamps: HashMap<ClusterTag, Timestamp>,
    prepared_timestamps: BTreeSet<(Timestamp, TransactionId)>,
    transient_barrier_timestamp: Timestamp,
    min_commit_timestamp: Option<Timestamp>,
    aborted_id_pool: VecDeque<TransactionId>,
    aborted_id_set: HashSet<TransactionId>,
    leases: HashMap<TransactionId, Time>,
    action_handlers: HashMap<String, ActionHandlers>,
    decommissioned: bool,
    is_leader: bool,
}

impl TransactionManager {
    /// Create a manager bound to the cell's clock domain.
    pub fn new(
        config: TransactionManagerConfig,
        clock_cluster_tag: ClusterTag,
        timestamp_provider: Arc<dyn TimestampProvider>,
    ) -> Self {
        info!(%clock_cluster_tag, "transaction manager clock cluster tag set");
        Self {
            config,
            clock_cluster_tag,
            timestamp_provider,
            persistent: EntityMap::new(),
            transient: EntityMap::new(),
            serializing_heaps: HashMap::new(),
            last_serialized_commit_timestamps: HashMap::new(),
            prepared_timestamps: BTreeSet::new(),
            transient_barrier_timestamp: Timestamp::MIN,
            min_commit_timestamp: None,
            aborted_id_pool: VecDeque::new(),
            aborted_id_set: HashSet::new(),
            leases: HashMap::new(),
            action_handlers: HashMap::new(),
            decommissioned: false,
            is_leader: true,
        }
    }

    /// Register the handler set for an action type.
    pub fn register_action_handlers(&mut self, action_type: impl Into<String>, handlers: ActionHandlers) {
        self.action_handlers.insert(action_type.into(), handlers);
    }

    // -----------------------------------------------------------------------
    // Lookup and creation
    // -----------------------------------------------------------------------

    /// Find a transaction in either map.
    pub fn find_transaction(&mut self, id: TransactionId) -> Option<&mut Transaction> {
        if self.transient.contains_key(&id) {
            return self.transient.get_mut(&id);
        }
        self.persistent.get_mut(&id)
    }

    fn get_persistent_or_throw(&mut self, id: TransactionId) -> Result<&mut Transaction> {
        if !self.persistent.contains_key(&id) {
            return NoSuchTransactionSnafu { transaction_id: id }.fail();
        }
        Ok(self.persistent.get_mut(&id).expect("checked above"))
    }

    /// Find or create a transaction.
    pub fn get_or_create_transaction(
        &mut self,
        id: TransactionId,
        start_timestamp: Timestamp,
        timeout: Duration,
        transient: bool,
        now: Time,
    ) -> Result<&mut Transaction> {
        if self.transient.contains_key(&id) {
            return Ok(self.transient.get_mut(&id).expect("checked"));
        }
        if self.persistent.contains_key(&id) {
            return Ok(self.persistent.get_mut(&id).expect("checked"));
        }
        if transient && self.aborted_id_set.contains(&id) {
            return InvalidStateSnafu {
                entity: format!("transaction {id}"),
                state: "abort requested".to_owned(),
                operation: "create".to_owned(),
            }
            .fail();
        }
        if self.decommissioned {
            return DecommissionedSnafu.fail();
        }

        let mut transaction = Transaction::new(id, start_timestamp, timeout);
        transaction.transient = transient;
        if self.is_leader {
            transaction.has_lease = true;
            self.leases.insert(id, now.add(timeout));
        }
        debug!(transaction_id = %id, %start_timestamp, ?timeout, transient, "transaction started");

        let map = if transient {
            &mut self.transient
        } else {
            &mut self.persistent
        };
        map.insert(id, transaction);
        Ok(map.get_mut(&id).expect("just inserted"))
    }

    /// Promote a transient transaction into the persistent map.
    pub fn make_transaction_persistent(&mut self, id: TransactionId) -> Result<()> {
        if let Some(mut transaction) = self.transient.remove(&id) {
            transaction.transient = false;
            self.persistent.insert(id, transaction);
            debug!(transaction_id = %id, "transaction became persistent");
            return Ok(());
        }
        if self.persistent.contains_key(&id) {
            return Ok(());
        }
        NoSuchTransactionSnafu { transaction_id: id }.fail()
    }

    /// Apply a register-transaction-actions mutation.
    pub fn register_transaction_actions(
        &mut self,
        id: TransactionId,
        start_timestamp: Timestamp,
        timeout: Duration,
        signature: u32,
        actions: Vec<TransactionAction>,
        now: Time,
    ) -> Result<()> {
        let transaction =
            self.get_or_create_transaction(id, start_timestamp, timeout, false, now)?;
        if transaction.persistent_state != TransactionState::Active {
            return InvalidStateSnafu {
                entity: format!("transaction {id}"),
                state: format!("{:?}", transaction.persistent_state),
                operation: "register actions".to_owned(),
            }
            .fail();
        }
        for action in actions {
            debug!(transaction_id = %id, action_type = %action.action_type, "transaction action registered");
            transaction.actions.push(action);
        }
        transaction.persistent_signature = transaction.persistent_signature.wrapping_add(signature);
        transaction.transient_signature = transaction.persistent_signature;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Two-phase commit
    // -----------------------------------------------------------------------

    fn validate_timestamp_cluster_tag(
        &self,
        timestamp_cluster_tag: ClusterTag,
        foreign_exempt: bool,
    ) -> Result<()> {
        if self.clock_cluster_tag == ClusterTag::INVALID
            || timestamp_cluster_tag == ClusterTag::INVALID
        {
            return Ok(());
        }
        if self.clock_cluster_tag != timestamp_cluster_tag {
            if self.config.reject_incorrect_clock_cluster_tag && !foreign_exempt {
                return WrongClockClusterTagSnafu {
                    expected: self.clock_cluster_tag,
                    actual: timestamp_cluster_tag,
                }
                .fail();
            }
            warn!(
                expected = %self.clock_cluster_tag,
                actual = %timestamp_cluster_tag,
                "transaction timestamp generated from unexpected clock"
            );
        }
        Ok(())
    }

    /// Prepare a commit, transiently (leader-side, revertible) or
    /// persistently (replicated).
    pub fn prepare_commit(
        &mut self,
        id: TransactionId,
        persistent: bool,
        prepare_timestamp: Timestamp,
        prepare_timestamp_cluster_tag: ClusterTag,
        hooks: &mut dyn TransactionHooks,
    ) -> Result<()> {
        let clock_check =
            self.validate_timestamp_cluster_tag(prepare_timestamp_cluster_tag, false);
        clock_check?;

        let handlers = std::mem::take(&mut self.action_handlers);
        let result = (|| {
            let transaction = if persistent {
                self.get_persistent_or_throw(id)?
            } else {
                match self.find_transaction(id) {
                    Some(transaction) => transaction,
                    None => return NoSuchTransactionSnafu { transaction_id: id }.fail(),
                }
            };

            let state = if persistent {
                transaction.persistent_state
            } else {
                transaction.transient_state
            };
            let signature = if persistent {
                transaction.persistent_signature
            } else {
                transaction.transient_signature
            };

            // Persistent prepare may follow a transient one.
            if state != TransactionState::Active
                && !(persistent && state == TransactionState::TransientCommitPrepared)
            {
                return InvalidStateSnafu {
                    entity: format!("transaction {id}"),
                    state: format!("{state:?}"),
                    operation: "prepare commit".to_owned(),
                }
                .fail();
            }
            if signature != FINAL_TRANSACTION_SIGNATURE {
                return InvalidStateSnafu {
                    entity: format!("transaction {id}"),
                    state: format!("incomplete signature {signature:#x}"),
                    operation: "prepare commit".to_owned(),
                }
                .fail();
            }

            if state == TransactionState::Active {
                debug_assert_eq!(transaction.prepare_timestamp, Timestamp::NULL);
                transaction.prepare_timestamp = prepare_timestamp;
                if persistent {
                    transaction.persistent_state = TransactionState::PersistentCommitPrepared;
                } else {
                    transaction.transient_state = TransactionState::TransientCommitPrepared;
                }

                hooks.on_transaction_prepared(transaction, persistent);
                for action in transaction.actions.clone() {
                    if let Some(handler) =
                        handlers.get(&action.action_type).and_then(|h| h.prepare.as_ref())
                    {
                        handler(transaction, &action);
                    }
                }

                let entry = (prepare_timestamp, id);
                self.prepared_timestamps.insert(entry);
                debug!(
                    transaction_id = %id,
                    persistent,
                    %prepare_timestamp,
                    "transaction commit prepared"
                );
            }
            Ok(())
        })();
        self.action_handlers = handlers;
        result
    }

    /// Leader-side abort intent. Only `force` may displace a prepared
    /// transaction.
    pub fn prepare_abort(&mut self, id: TransactionId, force: bool) -> Result<()> {
        self.remember_aborted(id);
        let Some(transaction) = self.find_transaction(id) else {
            return NoSuchTransactionSnafu { transaction_id: id }.fail();
        };
        if transaction.transient_state != TransactionState::Active && !force {
            return InvalidStateSnafu {
                entity: format!("transaction {id}"),
                state: format!("{:?}", transaction.transient_state),
                operation: "prepare abort".to_owned(),
            }
            .fail();
        }
        if transaction.transient_state == TransactionState::Active {
            transaction.transient_state = TransactionState::TransientAbortPrepared;
            debug!(transaction_id = %id, "transaction abort prepared");
        }
        Ok(())
    }

    fn remember_aborted(&mut self, id: TransactionId) {
        if self.aborted_id_set.insert(id) {
            self.aborted_id_pool.push_back(id);
            while self.aborted_id_pool.len() > self.config.max_aborted_transaction_pool_size {
                if let Some(evicted) = self.aborted_id_pool.pop_front() {
                    self.aborted_id_set.remove(&evicted);
                }
            }
        }
    }

    /// Apply a commit mutation.
    pub fn commit_transaction(
        &mut self,
        id: TransactionId,
        commit_timestamp: Timestamp,
        commit_timestamp_cluster_tag: ClusterTag,
        hooks: &mut dyn TransactionHooks,
    ) -> Result<()> {
        let foreign = self
            .persistent
            .get(&id)
            .map(|t| t.foreign)
            .unwrap_or(false);
        self.validate_timestamp_cluster_tag(commit_timestamp_cluster_tag, foreign)?;

        let handlers = std::mem::take(&mut self.action_handlers);
        let fallback_tag = self.clock_cluster_tag;
        let result = (|| {
            let transaction = self.get_persistent_or_throw(id)?;
            match transaction.persistent_state {
                TransactionState::Committed => {
                    debug!(transaction_id = %id, "transaction is already committed");
                    return Ok(());
                }
                TransactionState::Active | TransactionState::PersistentCommitPrepared => {}
                state => {
                    return InvalidStateSnafu {
                        entity: format!("transaction {id}"),
                        state: format!("{state:?}"),
                        operation: "commit".to_owned(),
                    }
                    .fail()
                }
            }

            transaction.commit_timestamp = commit_timestamp;
            transaction.commit_timestamp_cluster_tag = commit_timestamp_cluster_tag;
            transaction.persistent_state = TransactionState::Committed;
            transaction.transient_state = TransactionState::Committed;

            hooks.on_transaction_committed(transaction);
            for action in transaction.actions.clone() {
                if let Some(handler) =
                    handlers.get(&action.action_type).and_then(|h| h.commit.as_ref())
                {
                    handler(transaction, &action);
                }
            }
            debug!(transaction_id = %id, %commit_timestamp, "transaction committed");

            let prepare_timestamp = transaction.prepare_timestamp;
            let heap_tag = if transaction.commit_timestamp_cluster_tag != ClusterTag::INVALID {
                transaction.commit_timestamp_cluster_tag
            } else {
                fallback_tag
            };

            self.close_lease(id);
            if prepare_timestamp != Timestamp::NULL {
                self.prepared_timestamps.remove(&(prepare_timestamp, id));
            }

            let heap = self.serializing_heaps.entry(heap_tag).or_default();
            heap.push(Reverse((commit_timestamp, id)));
            let heap_min = heap.peek().expect("just pushed").0 .0;
            self.min_commit_timestamp = Some(
                self.min_commit_timestamp
                    .map_or(heap_min, |current| current.min(heap_min)),
            );
            Ok(())
        })();
        self.action_handlers = handlers;
        result
    }

    /// Apply an abort mutation.
    pub fn abort_transaction(
        &mut self,
        id: TransactionId,
        force: bool,
        hooks: &mut dyn TransactionHooks,
    ) -> Result<()> {
        self.remember_aborted(id);
        let handlers = std::mem::take(&mut self.action_handlers);
        let result = (|| {
            let transaction = self.get_persistent_or_throw(id)?;
            if transaction.persistent_state == TransactionState::PersistentCommitPrepared && !force
            {
                return InvalidStateSnafu {
                    entity: format!("transaction {id}"),
                    state: format!("{:?}", transaction.persistent_state),
                    operation: "abort".to_owned(),
                }
                .fail();
            }

            transaction.persistent_state = TransactionState::Aborted;
            transaction.transient_state = TransactionState::Aborted;
            hooks.on_transaction_aborted(transaction);
            for action in transaction.actions.clone() {
                if let Some(handler) =
                    handlers.get(&action.action_type).and_then(|h| h.abort.as_ref())
                {
                    handler(transaction, &action);
                }
            }
            debug!(transaction_id = %id, force, "transaction aborted");

            let prepare_timestamp = transaction.prepare_timestamp;
            self.close_lease(id);
            if prepare_timestamp != Timestamp::NULL {
                self.prepared_timestamps.remove(&(prepare_timestamp, id));
            }
            self.persistent.remove(&id);
            Ok(())
        })();
        self.action_handlers = handlers;
        result
    }

    // -----------------------------------------------------------------------
    // Serialization barrier
    // -----------------------------------------------------------------------

    /// The barrier candidate: the minimum prepare timestamp over prepared
    /// transactions, or the latest known timestamp when none are prepared.
    pub fn min_prepare_timestamp(&self) -> Timestamp {
        self.prepared_timestamps
            .iter()
            .next()
            .map(|(timestamp, _)| *timestamp)
            .unwrap_or_else(|| self.timestamp_provider.latest())
    }

    /// The smallest commit timestamp still awaiting serialization.
    pub fn min_commit_timestamp(&self) -> Timestamp {
        self.min_commit_timestamp
            .unwrap_or_else(|| self.timestamp_provider.latest())
    }

    /// Leader-side check: returns the barrier timestamp to propose if it
    /// advanced since the last proposal.
    pub fn check_barrier(&mut self) -> Option<Timestamp> {
        if !self.is_leader {
            return None;
        }
        let candidate = self.min_prepare_timestamp();
        if candidate <= self.transient_barrier_timestamp {
            return None;
        }
        debug!(
            from = %self.transient_barrier_timestamp,
            to = %candidate,
            "committing transaction barrier"
        );
        self.transient_barrier_timestamp = candidate;
        Some(candidate)
    }

    /// Apply a handle-transaction-barrier mutation: serialize every committed
    /// transaction with commit timestamp at or below the barrier, in commit
    /// timestamp order per clock domain.
    pub fn handle_barrier(
        &mut self,
        barrier_timestamp: Timestamp,
        hooks: &mut dyn TransactionHooks,
    ) {
        debug!(%barrier_timestamp, "handling transaction barrier");
        let handlers = std::mem::take(&mut self.action_handlers);
        let tags: Vec<ClusterTag> = self.serializing_heaps.keys().copied().collect();
        for tag in tags {
            loop {
                let Some(Reverse((commit_timestamp, id))) = self
                    .serializing_heaps
                    .get_mut(&tag)
                    .and_then(|heap| heap.peek().copied())
                else {
                    break;
                };
                if commit_timestamp > barrier_timestamp {
                    break;
                }
                self.serializing_heaps
                    .get_mut(&tag)
                    .expect("heap exists")
                    .pop();

                // Serialized commit timestamps are strictly monotone per tag.
                if let Some(last) = self.last_serialized_commit_timestamps.get(&tag) {
                    debug_assert!(commit_timestamp > *last);
                }
                self.last_serialized_commit_timestamps
                    .insert(tag, commit_timestamp);

                if let Some(transaction) = self.persistent.get_mut(&id) {
                    transaction.persistent_state = TransactionState::Serialized;
                    transaction.transient_state = TransactionState::Serialized;
                    hooks.on_transaction_serialized(transaction);
                    for action in transaction.actions.clone() {
                        if let Some(handler) = handlers
                            .get(&action.action_type)
                            .and_then(|h| h.serialize.as_ref())
                        {
                            handler(transaction, &action);
                        }
                    }
                    debug!(transaction_id = %id, %commit_timestamp, "transaction serialized");
                }
                self.persistent.remove(&id);
            }
        }
        self.action_handlers = handlers;

        self.min_commit_timestamp = self
            .serializing_heaps
            .values()
            .filter_map(|heap| heap.peek().map(|Reverse((ts, _))| *ts))
            .min();
    }

    /// The last serialized commit timestamp per clock domain.
    pub fn last_serialized_commit_timestamp(&self, tag: ClusterTag) -> Option<Timestamp> {
        self.last_serialized_commit_timestamps.get(&tag).copied()
    }

    // -----------------------------------------------------------------------
    // Leases
    // -----------------------------------------------------------------------

    /// Renew a transaction's lease.
    pub fn ping_transaction(&mut self, id: TransactionId, now: Time) -> Result<()> {
        let timeout = match self.find_transaction(id) {
            Some(transaction) => transaction.timeout,
            None => return NoSuchTransactionSnafu { transaction_id: id }.fail(),
        };
        if let Some(deadline) = self.leases.get_mut(&id) {
            *deadline = now.add(timeout);
        }
        Ok(())
    }

    fn close_lease(&mut self, id: TransactionId) {
        self.leases.remove(&id);
    }

    /// Transactions whose leases expired; the caller proposes aborts.
    pub fn collect_expired_leases(&self, now: Time) -> Vec<TransactionId> {
        self.leases
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(id, _)| *id)
            .collect()
    }

    // -----------------------------------------------------------------------
    // Epoch changes, decommission, snapshots
    // -----------------------------------------------------------------------

    /// Accept no new transactions; existing ones drain.
    pub fn decommission(&mut self) {
        debug!("transaction manager decommissioned");
        self.decommissioned = true;
    }

    /// Whether decommissioning has fully drained.
    pub fn is_decommissioned(&self) -> bool {
        self.decommissioned && self.persistent.is_empty()
    }

    /// On losing leadership: drop transient transactions and roll
    /// transiently prepared ones back to their persistent state.
    pub fn stop_leading(&mut self) {
        self.is_leader = false;
        let transient_ids: Vec<TransactionId> = self.transient.keys().collect();
        for id in transient_ids {
            if let Some(transaction) = self.transient.get(&id) {
                if transaction.prepare_timestamp != Timestamp::NULL {
                    self.prepared_timestamps
                        .remove(&(transaction.prepare_timestamp, id));
                }
            }
            self.transient.remove(&id);
        }

        let persistent_ids: Vec<TransactionId> = self.persistent.keys().collect();
        for id in persistent_ids {
            let transaction = self.persistent.get_mut(&id).expect("listed");
            if transaction.transient_state == TransactionState::TransientCommitPrepared {
                self.prepared_timestamps
                    .remove(&(transaction.prepare_timestamp, id));
                transaction.prepare_timestamp = Timestamp::NULL;
            }
            transaction.transient_state = transaction.persistent_state;
            transaction.transient_signature = transaction.persistent_signature;
        }
        self.leases.clear();
    }

    /// On gaining leadership: recreate leases for live transactions.
    pub fn start_leading(&mut self, now: Time) {
        self.is_leader = true;
        self.transient_barrier_timestamp = Timestamp::MIN;
        let ids: Vec<TransactionId> = self.persistent.keys().collect();
        for id in ids {
            let transaction = self.persistent.get_mut(&id).expect("listed");
            if matches!(
                transaction.persistent_state,
                TransactionState::Active | TransactionState::PersistentCommitPrepared
            ) {
                transaction.has_lease = true;
                let deadline = now.add(transaction.timeout);
                self.leases.insert(id, deadline);
            }
        }
    }

    /// Write the snapshot keys stream.
    pub fn save_keys(&self, context: &mut automaton::SaveContext) {
        self.persistent.save_keys(context.writer());
    }

    /// Write the snapshot values stream.
    pub fn save_values(&self, context: &mut automaton::SaveContext) {
        self.persistent.save_values(context.writer());
        let mut tags: Vec<(ClusterTag, Timestamp)> = self
            .last_serialized_commit_timestamps
            .iter()
            .map(|(tag, ts)| (*tag, *ts))
            .collect();
        tags.sort();
        context.writer().write_u32(tags.len() as u32);
        for (tag, timestamp) in tags {
            context.writer().write_u16(tag.0);
            context.writer().write_u64(timestamp.0);
        }
        context.writer().write_bool(self.decommissioned);
    }

    /// Read the snapshot keys stream.
    pub fn load_keys(&mut self, context: &mut automaton::LoadContext<'_>) -> automaton::WireResult<()> {
        self.persistent.load_keys(context.reader())
    }

    /// Read the snapshot values stream and rebuild derived state.
    pub fn load_values(
        &mut self,
        context: &mut automaton::LoadContext<'_>,
    ) -> automaton::WireResult<()> {
        self.persistent.load_values(context.reader())?;
        let tag_count = context.reader().read_u32()?;
        self.last_serialized_commit_timestamps.clear();
        for _ in 0..tag_count {
            let tag = ClusterTag(context.reader().read_u16()?);
            let timestamp = Timestamp(context.reader().read_u64()?);
            self.last_serialized_commit_timestamps.insert(tag, timestamp);
        }
        self.decommissioned = context.reader().read_bool()?;

        // The values stream does not carry ids; restore them from the keys,
        // then rebuild the heaps and the prepared set.
        self.serializing_heaps.clear();
        self.prepared_timestamps.clear();
        self.min_commit_timestamp = None;
        let ids: Vec<TransactionId> = self.persistent.keys().collect();
        for id in ids {
            let (state, prepare_timestamp, commit_timestamp, commit_tag) = {
                let transaction = self.persistent.get_mut(&id).expect("listed");
                transaction.set_id(id);
                (
                    transaction.persistent_state,
                    transaction.prepare_timestamp,
                    transaction.commit_timestamp,
                    transaction.commit_timestamp_cluster_tag,
                )
            };
            match state {
                TransactionState::Committed => {
                    let tag = if commit_tag != ClusterTag::INVALID {
                        tag_or(commit_tag, self.clock_cluster_tag)
                    } else {
                        self.clock_cluster_tag
                    };
                    let heap = self.serializing_heaps.entry(tag).or_default();
                    heap.push(Reverse((commit_timestamp, id)));
                    self.min_commit_timestamp = Some(
                        self.min_commit_timestamp
                            .map_or(commit_timestamp, |m| m.min(commit_timestamp)),
                    );
                }
                TransactionState::PersistentCommitPrepared => {
                    self.prepared_timestamps.insert((prepare_timestamp, id));
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Number of live transactions.
    pub fn transaction_count(&self) -> usize {
        self.persistent.len() + self.transient.len()
    }
}

fn tag_or(tag: ClusterTag, fallback: ClusterTag) -> ClusterTag {
    if tag == ClusterTag::INVALID {
        fallback
    } else {
        tag
    }
}
