//! Replicator jobs and the per-chunk job index.

use clock::Time;
use data_types::{ChunkId, JobId, JobState, JobType, MediumIndex, NodeId};
use std::collections::HashMap;

/// A job the master has commanded a node to run.
#[derive(Debug, Clone)]
pub struct Job {
    /// The job id.
    pub id: JobId,
    /// What the job does.
    pub job_type: JobType,
    /// The chunk being worked on.
    pub chunk_id: ChunkId,
    /// The medium the job operates on.
    pub medium: MediumIndex,
    /// The node running the job.
    pub source: NodeId,
    /// Replication targets; empty for removals and seals.
    pub targets: Vec<NodeId>,
    /// When the job was scheduled.
    pub start_time: Time,
}

/// What a node reports about one of its running jobs.
#[derive(Debug, Clone)]
pub struct JobInfo {
    /// The job id.
    pub job_id: JobId,
    /// Reported state.
    pub state: JobState,
    /// Failure message for [`JobState::Failed`].
    pub error: Option<String>,
}

/// A command to start a job, shipped in a heartbeat response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobStartInfo {
    /// The job id.
    pub job_id: JobId,
    /// What to do.
    pub job_type: JobType,
    /// The chunk to work on.
    pub chunk_id: ChunkId,
    /// The medium to work on.
    pub medium: MediumIndex,
    /// Target nodes, for replications.
    pub target_nodes: Vec<NodeId>,
}

/// A command to stop a job, shipped in a heartbeat response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobStopInfo {
    /// The job id.
    pub job_id: JobId,
}

/// All outstanding jobs, indexed by id, chunk and target.
#[derive(Debug, Default)]
pub struct JobRegistry {
    jobs: HashMap<JobId, Job>,
    by_chunk: HashMap<ChunkId, Vec<JobId>>,
    incoming_replications: HashMap<NodeId, usize>,
}

impl JobRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Default::default()
    }

    /// Track a freshly scheduled job.
    pub fn register(&mut self, job: Job) {
        self.by_chunk.entry(job.chunk_id).or_default().push(job.id);
        for target in &job.targets {
            *self.incoming_replications.entry(*target).or_default() += 1;
        }
        self.jobs.insert(job.id, job);
    }

    /// Forget a job, releasing its sink accounting.
    pub fn unregister(&mut self, job_id: JobId) -> Option<Job> {
        let job = self.jobs.remove(&job_id)?;
        if let Some(ids) = self.by_chunk.get_mut(&job.chunk_id) {
            ids.retain(|id| *id != job_id);
            if ids.is_empty() {
                self.by_chunk.remove(&job.chunk_id);
            }
        }
        for target in &job.targets {
            if let Some(count) = self.incoming_replications.get_mut(target) {
                *count -= 1;
                if *count == 0 {
                    self.incoming_replications.remove(target);
                }
            }
        }
        Some(job)
    }

    /// Look up a job.
    pub fn find(&self, job_id: JobId) -> Option<&Job> {
        self.jobs.get(&job_id)
    }

    /// Jobs touching `chunk_id`.
    pub fn jobs_for_chunk(&self, chunk_id: ChunkId) -> impl Iterator<Item = &Job> + '_ {
        self.by_chunk
            .get(&chunk_id)
            .into_iter()
            .flatten()
            .filter_map(|id| self.jobs.get(id))
    }

    /// Whether any job touches `chunk_id`.
    pub fn has_jobs_for_chunk(&self, chunk_id: ChunkId) -> bool {
        self.by_chunk.contains_key(&chunk_id)
    }

    /// Jobs currently running on `node`.
    pub fn jobs_on_node(&self, node: NodeId) -> impl Iterator<Item = &Job> + '_ {
        self.jobs.values().filter(move |job| job.source == node)
    }

    /// Incoming replication jobs targeting `node`.
    pub fn incoming_replication_count(&self, node: NodeId) -> usize {
        self.incoming_replications.get(&node).copied().unwrap_or(0)
    }

    /// Total outstanding jobs.
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    /// Whether no jobs are outstanding.
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}
