//! The chunk replicator: queue-driven refresh, classification and job
//! scheduling.
//!
//! Chunks are queued for refresh whenever their replica set may have changed.
//! A refresh classifies the chunk per medium (lost, under-/over-replicated,
//! misplaced, quorum-missing, ...) and enqueues replication/removal work onto
//! the holders' per-node queues. Heartbeats drain those queues into job
//! commands, bounded by per-node budgets.

use crate::{ChunkMaster, HeartbeatResponse, Job, JobInfo, JobStartInfo, JobStopInfo, Result,
    REPLICATION_PRIORITY_COUNT};
use clock::Time;
use data_types::{ChunkId, JobId, JobState, JobType, MediumIndex, NodeId, RackId, ReplicaIndex};
use observability_deps::tracing::{debug, info, trace, warn};
use std::collections::{HashMap, HashSet, VecDeque};

/// Replica accounting of one chunk on one medium.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplicaStatistics {
    /// Desired replicas.
    pub replication_factor: usize,
    /// Stored replicas.
    pub stored: usize,
    /// Cached replicas.
    pub cached: usize,
    /// In-flight replication targets not yet stored.
    pub plus: usize,
    /// In-flight removals of currently stored replicas.
    pub minus: usize,
}

impl std::fmt::Display for ReplicaStatistics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}+{}+{}-{}",
            self.stored, self.cached, self.plus, self.minus
        )
    }
}

#[derive(Debug)]
struct RefreshEntry {
    chunk_id: ChunkId,
    due: Time,
}

/// Refresh queue plus the classification indexes admin tooling enumerates.
#[derive(Debug, Default)]
pub struct ReplicatorState {
    refresh_queue: VecDeque<RefreshEntry>,
    rf_update_queue: VecDeque<ChunkId>,
    /// Chunks with no stored replica and no job that could recover one.
    pub lost_chunks: HashSet<ChunkId>,
    /// The vital subset of [`ReplicatorState::lost_chunks`].
    pub lost_vital_chunks: HashSet<ChunkId>,
    /// Chunks below their replication factor.
    pub underreplicated_chunks: HashSet<ChunkId>,
    /// Chunks above their replication factor.
    pub overreplicated_chunks: HashSet<ChunkId>,
    /// Chunks violating the per-rack replica cap.
    pub misplaced_chunks: HashSet<ChunkId>,
    /// Chunks whose replicas all share one rack.
    pub unsafely_placed_chunks: HashSet<ChunkId>,
    /// Journal chunks with fewer replicas than their read quorum.
    pub quorum_missing_chunks: HashSet<ChunkId>,
    /// Erasure chunks missing a data part.
    pub data_missing_chunks: HashSet<ChunkId>,
    /// Erasure chunks missing a parity part.
    pub parity_missing_chunks: HashSet<ChunkId>,
    last_enabled: Option<bool>,
}

impl ReplicatorState {
    fn drop_from_indexes(&mut self, chunk_id: ChunkId) {
        self.lost_chunks.remove(&chunk_id);
        self.lost_vital_chunks.remove(&chunk_id);
        self.underreplicated_chunks.remove(&chunk_id);
        self.overreplicated_chunks.remove(&chunk_id);
        self.misplaced_chunks.remove(&chunk_id);
        self.unsafely_placed_chunks.remove(&chunk_id);
        self.quorum_missing_chunks.remove(&chunk_id);
        self.data_missing_chunks.remove(&chunk_id);
        self.parity_missing_chunks.remove(&chunk_id);
    }
}

impl ChunkMaster {
    // -----------------------------------------------------------------------
    // Refresh queue
    // -----------------------------------------------------------------------

    /// Queue a chunk for a refresh after the configured delay.
    pub fn schedule_chunk_refresh(&mut self, chunk_id: ChunkId) {
        let Ok(chunk) = self.forest.chunk_mut(chunk_id) else {
            return;
        };
        if chunk.flags.refresh_scheduled {
            return;
        }
        chunk.flags.refresh_scheduled = true;
        let due = self.time_provider.now().add(self.config.chunk_refresh_delay);
        self.replicator
            .refresh_queue
            .push_back(RefreshEntry { chunk_id, due });
    }

    /// Process due refresh entries, up to the per-pass budget. Returns the
    /// number of chunks refreshed.
    pub fn refresh_pass(&mut self) -> usize {
        let now = self.time_provider.now();
        let mut count = 0;
        for _ in 0..self.config.max_chunks_per_refresh {
            let Some(entry) = self.replicator.refresh_queue.front() else {
                break;
            };
            if entry.due > now {
                break;
            }
            let entry = self.replicator.refresh_queue.pop_front().expect("non-empty");
            if let Ok(chunk) = self.forest.chunk_mut(entry.chunk_id) {
                chunk.flags.refresh_scheduled = false;
                self.refresh_chunk(entry.chunk_id);
            }
            count += 1;
        }
        if count > 0 {
            debug!(count, "incremental chunk refresh completed");
        }
        count
    }

    /// Replica accounting for `chunk_id` on `medium`, including in-flight
    /// jobs.
    pub fn replica_statistics(&self, chunk_id: ChunkId, medium: MediumIndex) -> ReplicaStatistics {
        let Ok(chunk) = self.forest.chunk(chunk_id) else {
            return ReplicaStatistics::default();
        };
        let stored_nodes: HashSet<NodeId> =
            chunk.stored_replicas_on(medium).map(|r| r.node_id).collect();
        let mut statistics = ReplicaStatistics {
            replication_factor: chunk.policy.factor(medium) as usize,
            stored: stored_nodes.len(),
            cached: chunk
                .cached_replicas
                .as_ref()
                .map(|c| c.iter().filter(|(m, _)| *m == medium).count())
                .unwrap_or(0),
            plus: 0,
            minus: 0,
        };
        if statistics.stored == 0 {
            return statistics;
        }
        for job in self.jobs.jobs_for_chunk(chunk_id) {
            if job.medium != medium {
                continue;
            }
            match job.job_type {
                JobType::Replicate => {
                    statistics.plus += job
                        .targets
                        .iter()
                        .filter(|target| !stored_nodes.contains(target))
                        .count();
                }
                JobType::Remove => {
                    if stored_nodes.contains(&job.source) {
                        statistics.minus += 1;
                    }
                }
                JobType::Seal => {}
            }
        }
        statistics
    }

    fn compute_replication_priority(statistics: &ReplicaStatistics) -> usize {
        debug_assert!(statistics.stored > 0);
        statistics.stored.min(REPLICATION_PRIORITY_COUNT) - 1
    }

    /// Classify one chunk and queue the work that drives it back to its
    /// replication factor.
    pub fn refresh_chunk(&mut self, chunk_id: ChunkId) {
        let Ok(chunk) = self.forest.chunk(chunk_id) else {
            return;
        };
        if !chunk.confirmed {
            return;
        }

        // Purge stale queue entries on every holder first.
        let holders: Vec<NodeId> = chunk
            .stored_replicas()
            .iter()
            .map(|(_, r)| r.node_id)
            .collect();
        let media: Vec<MediumIndex> = chunk.policy.replication_factors.keys().copied().collect();
        let vital = chunk.policy.vital;
        for node_id in &holders {
            if let Some(node) = self.nodes.get_mut(node_id) {
                node.purge_chunk(chunk_id);
            }
        }
        self.replicator.drop_from_indexes(chunk_id);

        for medium in media {
            self.refresh_chunk_on_medium(chunk_id, medium, vital);
        }

        self.metrics
            .lost_chunks
            .set(self.replicator.lost_chunks.len() as u64);
        self.metrics
            .lost_vital_chunks
            .set(self.replicator.lost_vital_chunks.len() as u64);
    }

    fn refresh_chunk_on_medium(&mut self, chunk_id: ChunkId, medium: MediumIndex, vital: bool) {
        let statistics = self.replica_statistics(chunk_id, medium);
        let replication_factor = statistics.replication_factor;

        if statistics.stored == 0 {
            self.replicator.lost_chunks.insert(chunk_id);
            if vital {
                self.replicator.lost_vital_chunks.insert(chunk_id);
            }
            trace!(%chunk_id, %statistics, replication_factor, "chunk is lost");
            return;
        }

        self.check_journal_quorum(chunk_id, medium);
        self.check_erasure_parts(chunk_id, medium);

        if statistics.stored - statistics.minus > replication_factor {
            self.replicator.overreplicated_chunks.insert(chunk_id);

            // Never start removals while new replicas are on the way.
            if statistics.plus > 0 {
                warn!(%chunk_id, %statistics, replication_factor,
                    "chunk is over-replicated, waiting for pending replications");
                return;
            }

            let redundant = statistics.stored - statistics.minus - replication_factor;
            let targets = self.removal_targets(chunk_id, medium, redundant);
            for node_id in &targets {
                if let Some(node) = self.nodes.get_mut(node_id) {
                    node.chunks_to_remove.insert(chunk_id);
                }
            }
            debug!(%chunk_id, %statistics, replication_factor, ?targets,
                "chunk is over-replicated, removal scheduled");
        } else if statistics.stored + statistics.plus < replication_factor {
            self.replicator.underreplicated_chunks.insert(chunk_id);

            // Never start replications while removals are in progress.
            if statistics.minus > 0 {
                debug!(%chunk_id, %statistics, replication_factor,
                    "chunk is under-replicated, waiting for pending removals");
                return;
            }

            let Some(source) = self.replication_source(chunk_id, medium) else {
                return;
            };
            let priority = Self::compute_replication_priority(&statistics);
            if let Some(node) = self.nodes.get_mut(&source) {
                node.chunks_to_replicate[priority].insert(chunk_id);
            }
            debug!(%chunk_id, %statistics, replication_factor, %source, priority,
                "chunk is under-replicated, replication scheduled");
        } else {
            self.check_rack_placement(chunk_id, medium, replication_factor);
            trace!(%chunk_id, %statistics, replication_factor, "chunk is OK");
        }
    }

    fn check_journal_quorum(&mut self, chunk_id: ChunkId, medium: MediumIndex) {
        let Ok(chunk) = self.forest.chunk(chunk_id) else {
            return;
        };
        if !chunk.is_journal() {
            return;
        }
        let stored = chunk.stored_replicas_on(medium).count();
        if stored < chunk.read_quorum as usize {
            self.replicator.quorum_missing_chunks.insert(chunk_id);
        }
    }

    fn check_erasure_parts(&mut self, chunk_id: ChunkId, medium: MediumIndex) {
        let Ok(chunk) = self.forest.chunk(chunk_id) else {
            return;
        };
        let data_types::ErasureCodec::ReedSolomon {
            data_parts,
            parity_parts,
        } = chunk.erasure_codec()
        else {
            return;
        };
        let present: HashSet<ReplicaIndex> = chunk
            .stored_replicas_on(medium)
            .map(|r| r.replica_index)
            .collect();
        if (0..data_parts).any(|part| !present.contains(&ReplicaIndex(part as u16))) {
            self.replicator.data_missing_chunks.insert(chunk_id);
        }
        if (data_parts..data_parts + parity_parts)
            .any(|part| !present.contains(&ReplicaIndex(part as u16)))
        {
            self.replicator.parity_missing_chunks.insert(chunk_id);
        }
    }

    fn check_rack_placement(
        &mut self,
        chunk_id: ChunkId,
        medium: MediumIndex,
        replication_factor: usize,
    ) {
        let Ok(chunk) = self.forest.chunk(chunk_id) else {
            return;
        };
        let racks: Vec<RackId> = chunk
            .stored_replicas_on(medium)
            .filter_map(|r| self.nodes.get(&r.node_id).map(|n| n.rack))
            .collect();
        if racks.is_empty() {
            return;
        }

        let mut usage: HashMap<RackId, usize> = HashMap::new();
        for rack in &racks {
            *usage.entry(*rack).or_default() += 1;
        }

        let distinct = usage.len();
        if replication_factor > 1 && racks.len() > 1 && distinct == 1 {
            self.replicator.unsafely_placed_chunks.insert(chunk_id);
        }

        let cap = self
            .media
            .get(&medium)
            .map(|m| m.max_replicas_per_rack)
            .unwrap_or(1);
        if usage.values().any(|count| *count > cap) {
            self.replicator.misplaced_chunks.insert(chunk_id);
            // A balancing replication toward a fresh rack; the redundant
            // replica is removed by a later refresh once the copy lands.
            if let Some(source) = self.replication_source(chunk_id, medium) {
                if let Some(node) = self.nodes.get_mut(&source) {
                    node.chunks_to_replicate[REPLICATION_PRIORITY_COUNT - 1].insert(chunk_id);
                }
                debug!(%chunk_id, %source, "chunk is misplaced, balancing replication scheduled");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Job scheduling
    // -----------------------------------------------------------------------

    /// Reconcile a node's running jobs and hand out new work within the
    /// configured budgets.
    pub fn schedule_jobs(
        &mut self,
        node_id: NodeId,
        running_jobs: Vec<JobInfo>,
    ) -> Result<HeartbeatResponse> {
        let mut response = HeartbeatResponse::default();

        let (replication_running, removal_running) =
            self.process_existing_jobs(node_id, &running_jobs, &mut response.jobs_to_stop);

        if self.is_replicator_enabled() {
            let replication_budget = self
                .config
                .replicator
                .max_replication_fan_out
                .saturating_sub(replication_running);
            let removal_budget = self
                .config
                .replicator
                .max_removal_jobs_per_node
                .saturating_sub(removal_running);
            self.schedule_new_jobs(
                node_id,
                replication_budget,
                removal_budget,
                &mut response.jobs_to_start,
            )?;
        }
        Ok(response)
    }

    fn process_existing_jobs(
        &mut self,
        node_id: NodeId,
        running_jobs: &[JobInfo],
        jobs_to_stop: &mut Vec<JobStopInfo>,
    ) -> (usize, usize) {
        let now = self.time_provider.now();
        let mut replication_count = 0;
        let mut removal_count = 0;
        let mut reported: HashSet<JobId> = HashSet::new();

        for info in running_jobs {
            reported.insert(info.job_id);
            let Some(job) = self.jobs.find(info.job_id) else {
                warn!(job_id = %info.job_id, %node_id, "stopping unknown or obsolete job");
                jobs_to_stop.push(JobStopInfo {
                    job_id: info.job_id,
                });
                continue;
            };
            let chunk_id = job.chunk_id;
            let job_type = job.job_type;
            let start_time = job.start_time;

            match info.state {
                JobState::Running => {
                    match job_type {
                        JobType::Replicate => replication_count += 1,
                        JobType::Remove => removal_count += 1,
                        JobType::Seal => {}
                    }
                    let elapsed = now.checked_duration_since(start_time).unwrap_or_default();
                    if elapsed > self.config.replicator.job_timeout {
                        warn!(job_id = %info.job_id, %node_id, ?elapsed, "job timed out");
                        jobs_to_stop.push(JobStopInfo {
                            job_id: info.job_id,
                        });
                        self.jobs.unregister(info.job_id);
                        self.schedule_chunk_refresh(chunk_id);
                    }
                }
                JobState::Completed | JobState::Failed => {
                    if info.state == JobState::Failed {
                        warn!(job_id = %info.job_id, %node_id, error = ?info.error, "job failed");
                    } else {
                        debug!(job_id = %info.job_id, %node_id, "job completed");
                    }
                    jobs_to_stop.push(JobStopInfo {
                        job_id: info.job_id,
                    });
                    self.jobs.unregister(info.job_id);
                    self.schedule_chunk_refresh(chunk_id);
                }
            }
        }

        // Jobs the master believes the node runs but the node did not report.
        let missing: Vec<JobId> = self
            .jobs
            .jobs_on_node(node_id)
            .filter(|job| !reported.contains(&job.id))
            .map(|job| job.id)
            .collect();
        for job_id in missing {
            warn!(%job_id, %node_id, "job is missing");
            jobs_to_stop.push(JobStopInfo { job_id });
            if let Some(job) = self.jobs.unregister(job_id) {
                self.schedule_chunk_refresh(job.chunk_id);
            }
        }

        (replication_count, removal_count)
    }

    fn schedule_new_jobs(
        &mut self,
        node_id: NodeId,
        mut replication_budget: usize,
        mut removal_budget: usize,
        jobs_to_start: &mut Vec<JobStartInfo>,
    ) -> Result<()> {
        // Replication, most urgent priority first.
        for priority in 0..REPLICATION_PRIORITY_COUNT {
            if replication_budget == 0 {
                break;
            }
            let queued: Vec<ChunkId> = self
                .node(node_id)?
                .chunks_to_replicate[priority]
                .iter()
                .copied()
                .collect();
            for chunk_id in queued {
                if replication_budget == 0 {
                    break;
                }
                let (scheduled, purged) =
                    self.schedule_replication_job(node_id, chunk_id, jobs_to_start);
                if scheduled {
                    replication_budget -= 1;
                }
                if purged {
                    self.node_mut(node_id)?.chunks_to_replicate[priority].remove(&chunk_id);
                }
            }
        }

        // Balancing, with whatever replication budget remains.
        if replication_budget > 0 {
            let source_fill = self.node(node_id)?.fill_factor();
            let target_fill = source_fill - self.config.replicator.min_balancing_fill_factor_diff;
            if source_fill > self.config.replicator.min_balancing_fill_factor
                && self.has_balancing_targets(data_types::DEFAULT_MEDIUM, target_fill)
            {
                let candidates = self.balancing_chunks(node_id, replication_budget);
                for chunk_id in candidates {
                    if replication_budget == 0 {
                        break;
                    }
                    if self.schedule_balancing_job(node_id, chunk_id, target_fill, jobs_to_start) {
                        replication_budget -= 1;
                    }
                }
            }
        }

        // Removal.
        let queued: Vec<ChunkId> = self
            .node(node_id)?
            .chunks_to_remove
            .iter()
            .copied()
            .collect();
        for chunk_id in queued {
            if removal_budget == 0 {
                break;
            }
            let (scheduled, purged) = self.schedule_removal_job(node_id, chunk_id, jobs_to_start);
            if scheduled {
                removal_budget -= 1;
            }
            if purged {
                self.node_mut(node_id)?.chunks_to_remove.remove(&chunk_id);
            }
        }
        Ok(())
    }

    // Returns (scheduled, purge-queue-entry).
    fn schedule_replication_job(
        &mut self,
        source: NodeId,
        chunk_id: ChunkId,
        jobs_to_start: &mut Vec<JobStartInfo>,
    ) -> (bool, bool) {
        let Ok(chunk) = self.forest.chunk(chunk_id) else {
            return (false, true);
        };
        if chunk.flags.refresh_scheduled {
            trace!(%chunk_id, "chunk to replicate is scheduled for another refresh");
            return (false, true);
        }

        // One medium's deficit per job; further media are picked up by the
        // refresh that follows completion.
        let media: Vec<MediumIndex> = chunk.policy.replication_factors.keys().copied().collect();
        for medium in media {
            let statistics = self.replica_statistics(chunk_id, medium);
            let needed = statistics
                .replication_factor
                .saturating_sub(statistics.stored + statistics.plus);
            if needed == 0 {
                continue;
            }

            let targets = self.replication_targets(chunk_id, medium, needed);
            if targets.is_empty() {
                trace!(%chunk_id, %medium, "no suitable replication targets");
                return (false, false);
            }

            let job = Job {
                id: JobId::new(),
                job_type: JobType::Replicate,
                chunk_id,
                medium,
                source,
                targets: targets.clone(),
                start_time: self.now(),
            };
            debug!(job_id = %job.id, %source, %chunk_id, ?targets, "replication job scheduled");
            jobs_to_start.push(JobStartInfo {
                job_id: job.id,
                job_type: JobType::Replicate,
                chunk_id,
                medium,
                target_nodes: targets.clone(),
            });
            self.jobs.register(job);
            self.metrics
                .jobs_scheduled
                .recorder(&[("type", "replicate")])
                .inc(1);
            return (true, targets.len() == needed);
        }
        (false, true)
    }

    fn schedule_balancing_job(
        &mut self,
        source: NodeId,
        chunk_id: ChunkId,
        target_fill: f64,
        jobs_to_start: &mut Vec<JobStartInfo>,
    ) -> bool {
        let Ok(chunk) = self.forest.chunk(chunk_id) else {
            return false;
        };
        if chunk.flags.refresh_scheduled {
            return false;
        }
        let medium = data_types::DEFAULT_MEDIUM;
        let Some(target) = self.balancing_target(chunk_id, medium, target_fill) else {
            return false;
        };
        self.on_session_hinted(target);

        let job = Job {
            id: JobId::new(),
            job_type: JobType::Replicate,
            chunk_id,
            medium,
            source,
            targets: vec![target],
            start_time: self.now(),
        };
        debug!(job_id = %job.id, %source, %chunk_id, %target, "balancing job scheduled");
        jobs_to_start.push(JobStartInfo {
            job_id: job.id,
            job_type: JobType::Replicate,
            chunk_id,
            medium,
            target_nodes: vec![target],
        });
        self.jobs.register(job);
        self.metrics
            .jobs_scheduled
            .recorder(&[("type", "balance")])
            .inc(1);
        true
    }

    fn schedule_removal_job(
        &mut self,
        source: NodeId,
        chunk_id: ChunkId,
        jobs_to_start: &mut Vec<JobStartInfo>,
    ) -> (bool, bool) {
        if let Ok(chunk) = self.forest.chunk(chunk_id) {
            if chunk.flags.refresh_scheduled {
                trace!(%chunk_id, "chunk to remove is scheduled for another refresh");
                return (false, false);
            }
        }

        let job = Job {
            id: JobId::new(),
            job_type: JobType::Remove,
            chunk_id,
            medium: data_types::DEFAULT_MEDIUM,
            source,
            targets: vec![],
            start_time: self.now(),
        };
        debug!(job_id = %job.id, %source, %chunk_id, "removal job scheduled");
        jobs_to_start.push(JobStartInfo {
            job_id: job.id,
            job_type: JobType::Remove,
            chunk_id,
            medium: data_types::DEFAULT_MEDIUM,
            target_nodes: vec![],
        });
        self.jobs.register(job);
        self.metrics
            .jobs_scheduled
            .recorder(&[("type", "remove")])
            .inc(1);
        (true, true)
    }

    /// Whether the replicator may schedule new jobs; logs state changes once.
    pub fn is_replicator_enabled(&mut self) -> bool {
        let config = &self.config.replicator;
        if let Some(needed) = config.min_online_node_count {
            let online = self.leases.online_node_count();
            if online < needed {
                if self.replicator.last_enabled != Some(false) {
                    info!(needed, online, "chunk replicator disabled: too few online nodes");
                    self.replicator.last_enabled = Some(false);
                }
                return false;
            }
        }

        let chunk_count = self.forest.chunk_count();
        if let Some(max_fraction) = config.max_lost_chunk_fraction {
            if chunk_count > 0 {
                let lost_fraction =
                    self.replicator.lost_chunks.len() as f64 / chunk_count as f64;
                if lost_fraction > max_fraction {
                    if self.replicator.last_enabled != Some(false) {
                        info!(
                            lost_fraction,
                            max_fraction, "chunk replicator disabled: too many lost chunks"
                        );
                        self.replicator.last_enabled = Some(false);
                    }
                    return false;
                }
            }
        }

        if self.replicator.last_enabled != Some(true) {
            info!("chunk replicator enabled");
            self.replicator.last_enabled = Some(true);
        }
        true
    }

    // -----------------------------------------------------------------------
    // Replication factor propagation
    // -----------------------------------------------------------------------

    /// Queue every chunk below a chunk list for the replication-factor
    /// update sweep.
    pub fn schedule_rf_update_for_list(
        &mut self,
        chunk_list_id: data_types::ChunkListId,
    ) -> Result<()> {
        let leaves = chunk_model::traverser::enumerate_chunks(
            &self.forest,
            chunk_list_id,
            Default::default(),
            Default::default(),
        )?;
        for leaf in leaves {
            if let chunk_model::ChunkTreeRef::Chunk(chunk_id) = leaf.leaf {
                self.schedule_rf_update(chunk_id);
            }
        }
        Ok(())
    }

    /// Queue a chunk for the replication-factor update sweep.
    pub fn schedule_rf_update(&mut self, chunk_id: ChunkId) {
        let Ok(chunk) = self.forest.chunk_mut(chunk_id) else {
            return;
        };
        if chunk.flags.rf_update_scheduled {
            return;
        }
        chunk.flags.rf_update_scheduled = true;
        self.replicator.rf_update_queue.push_back(chunk_id);
    }

    /// Recompute replication factors for queued chunks from their owners,
    /// refreshing every chunk whose factor changed. Returns the changed set.
    pub fn rf_update_pass(&mut self) -> Vec<(ChunkId, u8)> {
        let mut updates = Vec::new();
        for _ in 0..self.config.max_chunks_per_rf_update {
            let Some(chunk_id) = self.replicator.rf_update_queue.pop_front() else {
                break;
            };
            let Ok(chunk) = self.forest.chunk_mut(chunk_id) else {
                continue;
            };
            chunk.flags.rf_update_scheduled = false;

            let computed = self.compute_replication_factor(chunk_id);
            let chunk = self.forest.chunk_mut(chunk_id).expect("still alive");
            let medium = data_types::DEFAULT_MEDIUM;
            if chunk.policy.factor(medium) != computed {
                chunk.policy.replication_factors.insert(medium, computed);
                updates.push((chunk_id, computed));
                self.schedule_chunk_refresh(chunk_id);
            }
        }
        if !updates.is_empty() {
            debug!(count = updates.len(), "replication factor update applied");
        }
        updates
    }

    // The effective factor is the maximum demanded by any owner reachable
    // through the parent DAG; lists without owners are traversed through.
    fn compute_replication_factor(&self, chunk_id: ChunkId) -> u8 {
        let Ok(chunk) = self.forest.chunk(chunk_id) else {
            return 0;
        };
        let mut result = chunk.policy.factor(data_types::DEFAULT_MEDIUM);

        let mut visited = HashSet::new();
        let mut queue: VecDeque<data_types::ChunkListId> =
            chunk.parents().keys().copied().collect();
        while let Some(list_id) = queue.pop_front() {
            if !visited.insert(list_id) {
                continue;
            }
            let Ok(list) = self.forest.list(list_id) else {
                continue;
            };
            for owner in &list.owners {
                if let Some(rf) = self.owner_replication_factors.get(owner) {
                    result = result.max(*rf);
                }
            }
            queue.extend(list.parents().iter().copied());
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::master::test_fixture::TestMaster;
    use crate::{ChunkManagerConfig, NodeStatistics};
    use data_types::{ChunkListKind, EntityKind, TabletId, DEFAULT_MEDIUM};

    fn heartbeat_empty(fixture: &mut TestMaster, node: NodeId) -> HeartbeatResponse {
        fixture
            .master
            .incremental_heartbeat(
                node,
                NodeStatistics {
                    available_space: 1_000_000,
                    ..Default::default()
                },
                vec![],
                vec![],
                vec![],
            )
            .unwrap()
    }

    #[test]
    fn replicate_to_rf_lands_in_distinct_racks() {
        let mut fixture = TestMaster::new();
        let a = fixture.online_node(1);
        let b = fixture.online_node(2);
        let c = fixture.online_node(3);
        let d = fixture.online_node(1);
        let chunk = fixture.confirmed_chunk(3, &[a]);

        fixture.refresh_all();
        assert!(fixture
            .master
            .replicator
            .underreplicated_chunks
            .contains(&chunk));

        // The source node's heartbeat yields one replication job with two
        // targets in the two unoccupied racks.
        let response = heartbeat_empty(&mut fixture, a);
        assert_eq!(response.jobs_to_start.len(), 1);
        let start = &response.jobs_to_start[0];
        assert_eq!(start.job_type, JobType::Replicate);
        assert_eq!(start.chunk_id, chunk);
        assert_eq!(start.target_nodes.len(), 2);
        assert!(start.target_nodes.contains(&b) || start.target_nodes.contains(&c));
        assert!(!start.target_nodes.contains(&d));

        // Simulate completion: targets report the new replicas, the source
        // reports the job done.
        for target in &start.target_nodes {
            fixture
                .master
                .incremental_heartbeat(
                    *target,
                    NodeStatistics {
                        available_space: 1_000_000,
                        ..Default::default()
                    },
                    vec![(chunk, DEFAULT_MEDIUM, ReplicaIndex::GENERIC)],
                    vec![],
                    vec![],
                )
                .unwrap();
        }
        fixture
            .master
            .incremental_heartbeat(
                a,
                NodeStatistics {
                    available_space: 1_000_000,
                    ..Default::default()
                },
                vec![],
                vec![],
                vec![JobInfo {
                    job_id: start.job_id,
                    state: JobState::Completed,
                    error: None,
                }],
            )
            .unwrap();
        fixture.refresh_all();

        let replicas = fixture.master.forest().chunk(chunk).unwrap();
        assert_eq!(replicas.stored_replicas().len(), 3);
        let racks: std::collections::HashSet<RackId> = replicas
            .stored_replicas()
            .iter()
            .map(|(_, r)| fixture.master.node(r.node_id).unwrap().rack)
            .collect();
        assert_eq!(racks.len(), 3);
        assert!(!fixture
            .master
            .replicator
            .underreplicated_chunks
            .contains(&chunk));
        assert!(fixture.master.jobs.is_empty());
    }

    #[test]
    fn overreplicated_chunk_sheds_the_most_loaded_holder() {
        let mut fixture = TestMaster::new();
        let a = fixture.online_node(1);
        let b = fixture.online_node(2);
        let c = fixture.online_node(3);
        let d = fixture.online_node(4);
        {
            let node = fixture.master.node_mut(d).unwrap();
            node.statistics.used_space = 900_000;
            node.statistics.available_space = 100_000;
        }
        let chunk = fixture.confirmed_chunk(3, &[a, b, c, d]);

        fixture.refresh_all();
        assert!(fixture
            .master
            .replicator
            .overreplicated_chunks
            .contains(&chunk));

        // Exactly one removal job, on the most loaded holder.
        let response = heartbeat_empty(&mut fixture, d);
        assert_eq!(response.jobs_to_start.len(), 1);
        assert_eq!(response.jobs_to_start[0].job_type, JobType::Remove);
        for other in [a, b, c] {
            let response = heartbeat_empty(&mut fixture, other);
            assert!(response.jobs_to_start.is_empty());
        }
    }

    #[test]
    fn chunk_with_no_replicas_is_lost_not_scheduled() {
        let mut fixture = TestMaster::new();
        let a = fixture.online_node(1);
        let survivor = fixture.online_node(2);
        let chunk = fixture.confirmed_chunk(3, &[a]);

        fixture
            .time_provider
            .inc(std::time::Duration::from_secs(3600));
        fixture.master.expire_node_leases();
        // The survivor node re-registers to keep the cluster non-empty.
        let _ = survivor;
        let survivor = fixture.online_node(2);

        fixture.refresh_all();
        assert!(fixture.master.replicator.lost_chunks.contains(&chunk));
        assert!(fixture.master.replicator.lost_vital_chunks.contains(&chunk));

        let response = heartbeat_empty(&mut fixture, survivor);
        assert!(response.jobs_to_start.is_empty());
    }

    #[test]
    fn no_removals_while_replications_pending() {
        let mut fixture = TestMaster::new();
        let a = fixture.online_node(1);
        let b = fixture.online_node(2);
        let chunk = fixture.confirmed_chunk(1, &[a, b]);

        // An in-flight replication toward a third node keeps plus > 0.
        fixture.master.jobs.register(Job {
            id: JobId::new(),
            job_type: JobType::Replicate,
            chunk_id: chunk,
            medium: DEFAULT_MEDIUM,
            source: a,
            targets: vec![NodeId(999)],
            start_time: clock::Time::from_timestamp_nanos(0),
        });

        fixture.refresh_all();
        assert!(fixture
            .master
            .replicator
            .overreplicated_chunks
            .contains(&chunk));
        // But no removal was queued anywhere.
        for node in [a, b] {
            assert!(fixture
                .master
                .node(node)
                .unwrap()
                .chunks_to_remove
                .is_empty());
        }
    }

    #[test]
    fn job_timeout_stops_and_reschedules() {
        let mut fixture = TestMaster::new();
        let a = fixture.online_node(1);
        fixture.online_node(2);
        fixture.online_node(3);
        let chunk = fixture.confirmed_chunk(3, &[a]);

        fixture.refresh_all();
        let response = heartbeat_empty(&mut fixture, a);
        let job_id = response.jobs_to_start[0].job_id;

        fixture
            .time_provider
            .inc(std::time::Duration::from_secs(700));
        let response = fixture
            .master
            .incremental_heartbeat(
                a,
                NodeStatistics {
                    available_space: 1_000_000,
                    ..Default::default()
                },
                vec![],
                vec![],
                vec![JobInfo {
                    job_id,
                    state: JobState::Running,
                    error: None,
                }],
            )
            .unwrap();
        assert!(response
            .jobs_to_stop
            .iter()
            .any(|stop| stop.job_id == job_id));
        assert!(fixture.master.jobs.find(job_id).is_none());
    }

    #[test]
    fn unreported_job_is_stopped() {
        let mut fixture = TestMaster::new();
        let a = fixture.online_node(1);
        fixture.online_node(2);
        let chunk = fixture.confirmed_chunk(2, &[a]);

        fixture.refresh_all();
        let response = heartbeat_empty(&mut fixture, a);
        let job_id = response.jobs_to_start[0].job_id;
        let _ = chunk;

        // The next heartbeat omits the job entirely.
        let response = heartbeat_empty(&mut fixture, a);
        assert!(response
            .jobs_to_stop
            .iter()
            .any(|stop| stop.job_id == job_id));
    }

    #[test]
    fn replicator_disables_below_min_online_nodes() {
        let mut config = ChunkManagerConfig::for_tests();
        config.replicator.min_online_node_count = Some(3);
        let mut fixture = TestMaster::with_config(config);
        let a = fixture.online_node(1);
        fixture.online_node(2);
        let chunk = fixture.confirmed_chunk(3, &[a]);

        fixture.refresh_all();
        let response = heartbeat_empty(&mut fixture, a);
        assert!(response.jobs_to_start.is_empty());
        let _ = chunk;

        // A third node flips it back on.
        fixture.online_node(3);
        fixture.refresh_all();
        let response = heartbeat_empty(&mut fixture, a);
        assert_eq!(response.jobs_to_start.len(), 1);
    }

    #[test]
    fn rf_update_follows_owner_demands() {
        let mut fixture = TestMaster::new();
        let a = fixture.online_node(1);
        let chunk = fixture.confirmed_chunk(3, &[a]);

        let tablet = TabletId::new(1);
        let list = fixture
            .master
            .create_chunk_list(ChunkListKind::SortedDynamicTablet);
        fixture
            .master
            .attach(list, &[chunk_model::ChunkTreeRef::Chunk(chunk)])
            .unwrap();
        fixture.master.forest.set_list_owner(list, tablet).unwrap();
        fixture.master.set_owner_replication_factor(tablet, 5);

        // The sweep walks the chunk tree to find affected chunks.
        fixture.master.schedule_rf_update_for_list(list).unwrap();
        let updates = fixture.master.rf_update_pass();
        assert_eq!(updates, vec![(chunk, 5)]);
        assert_eq!(
            fixture
                .master
                .forest()
                .chunk(chunk)
                .unwrap()
                .policy
                .factor(DEFAULT_MEDIUM),
            5
        );
    }

    #[test]
    fn journal_chunk_below_quorum_is_quorum_missing_not_lost() {
        let mut fixture = TestMaster::new();
        let a = fixture.online_node(1);

        let chunk = fixture.master.create_chunk(
            EntityKind::JournalChunk,
            data_types::ReplicationPolicy::with_factor(3),
            2,
            2,
        );
        fixture
            .master
            .confirm_chunk(
                chunk,
                data_types::ChunkMeta {
                    misc: Some(data_types::MiscExt {
                        sealed: false,
                        ..Default::default()
                    }),
                    blocks: None,
                },
                vec![(a, DEFAULT_MEDIUM, ReplicaIndex::GENERIC)],
            )
            .unwrap();

        fixture.refresh_all();
        assert!(fixture
            .master
            .replicator
            .quorum_missing_chunks
            .contains(&chunk));
        assert!(!fixture.master.replicator.lost_chunks.contains(&chunk));
    }

    #[test]
    fn erasure_chunks_index_missing_parts() {
        let mut fixture = TestMaster::new();
        let a = fixture.online_node(1);
        let b = fixture.online_node(2);

        let chunk = fixture.master.create_chunk(
            EntityKind::ErasureChunk,
            data_types::ReplicationPolicy::with_factor(3),
            0,
            0,
        );
        fixture
            .master
            .confirm_chunk(
                chunk,
                data_types::ChunkMeta {
                    misc: Some(data_types::MiscExt {
                        row_count: 1,
                        sealed: true,
                        erasure_codec: data_types::ErasureCodec::ReedSolomon {
                            data_parts: 2,
                            parity_parts: 1,
                        },
                        ..Default::default()
                    }),
                    blocks: None,
                },
                vec![
                    (a, DEFAULT_MEDIUM, ReplicaIndex(0)),
                    (b, DEFAULT_MEDIUM, ReplicaIndex(2)),
                ],
            )
            .unwrap();

        fixture.refresh_all();
        // Data part 1 is missing; parity part 2 is present.
        assert!(fixture.master.replicator.data_missing_chunks.contains(&chunk));
        assert!(!fixture
            .master
            .replicator
            .parity_missing_chunks
            .contains(&chunk));
    }
}
