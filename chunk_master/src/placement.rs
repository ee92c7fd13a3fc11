//! Picks storage nodes for new and re-replicated chunk replicas.
//!
//! Two indices over online nodes are maintained: one ordered by fill factor
//! (balancing) and one by load factor (uploads), where
//! `load = fill + k * (active_sessions + hinted_sessions)`. Successful picks
//! hint a session onto the node so that consecutive calls within one
//! scheduling cycle spread load.

use crate::{AllTargetNodesFailedSnafu, ChunkMaster, Result, StorageNode};
use data_types::{ChunkId, ErasureCodec, MediumIndex, NodeId, NodeState, RackId};
use ordered_float::OrderedFloat;
use rand::seq::SliceRandom;
use std::collections::{BTreeMap, HashMap, HashSet};

/// The placement indices and per-cycle session hints.
#[derive(Debug, Default)]
pub struct PlacementState {
    load_index: BTreeMap<(OrderedFloat<f64>, NodeId), NodeId>,
    fill_index: BTreeMap<(OrderedFloat<f64>, NodeId), NodeId>,
    keys: HashMap<NodeId, (OrderedFloat<f64>, OrderedFloat<f64>)>,
    hinted_sessions: HashMap<NodeId, u32>,
}

impl PlacementState {
    /// Sessions hinted onto `node_id` by previous picks.
    pub fn hinted_sessions(&self, node_id: NodeId) -> u32 {
        self.hinted_sessions.get(&node_id).copied().unwrap_or(0)
    }

    pub(crate) fn on_node_registered(&mut self, node: &StorageNode) {
        self.hinted_sessions.insert(node.id(), 0);
        self.upsert(node.id(), node.fill_factor(), node.fill_factor());
    }

    pub(crate) fn on_node_unregistered(&mut self, node_id: NodeId) {
        if let Some((fill, load)) = self.keys.remove(&node_id) {
            self.fill_index.remove(&(fill, node_id));
            self.load_index.remove(&(load, node_id));
        }
        self.hinted_sessions.remove(&node_id);
    }

    pub(crate) fn on_node_updated(&mut self, node: &StorageNode) {
        // The load factor is recomputed by the master, which owns the
        // session penalty coefficient; fall back to fill alone here and let
        // `refresh_load` fix it up.
        self.upsert(node.id(), node.fill_factor(), node.fill_factor());
    }

    pub(crate) fn refresh_load(&mut self, node_id: NodeId, fill: f64, load: f64) {
        self.upsert(node_id, fill, load);
    }

    fn upsert(&mut self, node_id: NodeId, fill: f64, load: f64) {
        if let Some((old_fill, old_load)) = self.keys.remove(&node_id) {
            self.fill_index.remove(&(old_fill, node_id));
            self.load_index.remove(&(old_load, node_id));
        }
        let fill = OrderedFloat(fill);
        let load = OrderedFloat(load);
        self.fill_index.insert((fill, node_id), node_id);
        self.load_index.insert((load, node_id), node_id);
        self.keys.insert(node_id, (fill, load));
    }

    fn hint(&mut self, node_id: NodeId) {
        *self.hinted_sessions.entry(node_id).or_default() += 1;
    }

    fn nodes_by_load(&self) -> impl Iterator<Item = (OrderedFloat<f64>, NodeId)> + '_ {
        self.load_index.keys().copied()
    }

    fn nodes_by_fill(&self) -> impl Iterator<Item = (OrderedFloat<f64>, NodeId)> + '_ {
        self.fill_index.keys().copied()
    }
}

impl ChunkMaster {
    /// The load factor driving upload target order.
    pub(crate) fn load_factor(&self, node: &StorageNode) -> f64 {
        let sessions = node.statistics.session_count
            + self.placement.hinted_sessions(node.id());
        node.fill_factor()
            + self.config.replicator.active_sessions_penalty_coeff * sessions as f64
    }

    /// Record that a session was placed on `node_id` and refresh its rank.
    pub(crate) fn on_session_hinted(&mut self, node_id: NodeId) {
        self.placement.hint(node_id);
        if let Some(node) = self.nodes.get(&node_id) {
            let fill = node.fill_factor();
            let sessions =
                node.statistics.session_count + self.placement.hinted_sessions(node_id);
            let load =
                fill + self.config.replicator.active_sessions_penalty_coeff * sessions as f64;
            self.placement.refresh_load(node_id, fill, load);
        }
    }

    fn is_valid_upload_target(&self, node: &StorageNode, medium: MediumIndex) -> bool {
        node.state == NodeState::Online && !node.statistics.full && node.media.contains(&medium)
    }

    fn rack_cap(&self, medium: MediumIndex, erasure: ErasureCodec) -> usize {
        let medium_cap = self
            .media
            .get(&medium)
            .map(|m| m.max_replicas_per_rack)
            .unwrap_or(1);
        match erasure {
            ErasureCodec::None => medium_cap,
            codec => medium_cap.min(codec.guaranteed_repairable_parts().max(1) as usize),
        }
    }

    /// Pick up to `desired` upload targets on `medium`, honoring load order,
    /// rack awareness (seeded with the racks of existing holders) and the
    /// forbidden set. Fails if fewer than `min_needed` are found.
    #[allow(clippy::too_many_arguments)]
    pub fn allocate_write_targets(
        &mut self,
        medium: MediumIndex,
        desired: usize,
        min_needed: usize,
        forbidden: &HashSet<NodeId>,
        preferred: Option<NodeId>,
        erasure: ErasureCodec,
        existing_racks: &[RackId],
    ) -> Result<Vec<NodeId>> {
        let rack_cap = self.rack_cap(medium, erasure);
        let mut rack_usage: HashMap<RackId, usize> = HashMap::new();
        for rack in existing_racks {
            *rack_usage.entry(*rack).or_default() += 1;
        }

        let mut picked: Vec<NodeId> = Vec::with_capacity(desired);
        let mut picked_set: HashSet<NodeId> = HashSet::new();

        let mut admit = |node: &StorageNode,
                         rack_usage: &mut HashMap<RackId, usize>,
                         enforce_racks: bool|
         -> bool {
            if forbidden.contains(&node.id()) || picked_set.contains(&node.id()) {
                return false;
            }
            if enforce_racks && rack_usage.get(&node.rack).copied().unwrap_or(0) >= rack_cap {
                return false;
            }
            *rack_usage.entry(node.rack).or_default() += 1;
            picked_set.insert(node.id());
            true
        };

        // Preferred host goes first if it qualifies at all.
        if let Some(preferred) = preferred {
            if let Some(node) = self.nodes.get(&preferred) {
                if self.is_valid_upload_target(node, medium)
                    && admit(node, &mut rack_usage, true)
                {
                    picked.push(preferred);
                }
            }
        }

        // Walk the load ranking; shuffle ties so equally loaded nodes share
        // the traffic.
        let ranked: Vec<(OrderedFloat<f64>, NodeId)> = self.placement.nodes_by_load().collect();
        for enforce_racks in [true, false] {
            let mut index = 0;
            while index < ranked.len() && picked.len() < desired {
                let group_load = ranked[index].0;
                let mut group: Vec<NodeId> = Vec::new();
                while index < ranked.len() && ranked[index].0 == group_load {
                    group.push(ranked[index].1);
                    index += 1;
                }
                group.shuffle(&mut rand::thread_rng());

                for node_id in group {
                    if picked.len() == desired {
                        break;
                    }
                    let Some(node) = self.nodes.get(&node_id) else {
                        continue;
                    };
                    if !self.is_valid_upload_target(node, medium) {
                        continue;
                    }
                    if admit(node, &mut rack_usage, enforce_racks) {
                        picked.push(node_id);
                    }
                }
            }
            if picked.len() == desired {
                break;
            }
        }

        if picked.len() < min_needed {
            return AllTargetNodesFailedSnafu {
                found: picked.len(),
                min_needed,
            }
            .fail();
        }
        for node_id in &picked {
            self.on_session_hinted(*node_id);
        }
        Ok(picked)
    }

    /// Targets for replicating `chunk_id` on `medium`: placement with the
    /// current holders (and in-flight replication targets) forbidden.
    pub(crate) fn replication_targets(
        &mut self,
        chunk_id: ChunkId,
        medium: MediumIndex,
        count: usize,
    ) -> Vec<NodeId> {
        let Ok(chunk) = self.forest.chunk(chunk_id) else {
            return vec![];
        };
        let mut forbidden: HashSet<NodeId> =
            chunk.stored_replicas_on(medium).map(|r| r.node_id).collect();
        for job in self.jobs.jobs_for_chunk(chunk_id) {
            if job.job_type == data_types::JobType::Replicate {
                forbidden.extend(job.targets.iter().copied());
            }
        }
        let existing_racks: Vec<RackId> = chunk
            .stored_replicas_on(medium)
            .filter_map(|r| self.nodes.get(&r.node_id).map(|n| n.rack))
            .collect();
        let erasure = chunk.erasure_codec();

        self.allocate_write_targets(medium, count, 0, &forbidden, None, erasure, &existing_racks)
            .unwrap_or_default()
    }

    /// The node a replication job should read from: any current holder,
    /// uniformly sampled.
    pub(crate) fn replication_source(
        &self,
        chunk_id: ChunkId,
        medium: MediumIndex,
    ) -> Option<NodeId> {
        let chunk = self.forest.chunk(chunk_id).ok()?;
        let holders: Vec<NodeId> = chunk.stored_replicas_on(medium).map(|r| r.node_id).collect();
        holders.choose(&mut rand::thread_rng()).copied()
    }

    /// The holders to drop redundant replicas from: descending load factor.
    pub(crate) fn removal_targets(
        &self,
        chunk_id: ChunkId,
        medium: MediumIndex,
        count: usize,
    ) -> Vec<NodeId> {
        let Ok(chunk) = self.forest.chunk(chunk_id) else {
            return vec![];
        };
        let mut candidates: Vec<(f64, NodeId)> = chunk
            .stored_replicas_on(medium)
            .filter_map(|replica| {
                self.nodes
                    .get(&replica.node_id)
                    .map(|node| (self.load_factor(node), replica.node_id))
            })
            .collect();
        candidates.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)));
        candidates.into_iter().take(count).map(|(_, id)| id).collect()
    }

    /// The least-filled valid target under `max_fill_factor` for balancing
    /// `chunk_id` off an overloaded node.
    pub(crate) fn balancing_target(
        &self,
        chunk_id: ChunkId,
        medium: MediumIndex,
        max_fill_factor: f64,
    ) -> Option<NodeId> {
        for (fill, node_id) in self.placement.nodes_by_fill() {
            if fill.0 > max_fill_factor {
                break;
            }
            let Some(node) = self.nodes.get(&node_id) else {
                continue;
            };
            if !self.is_valid_upload_target(node, medium) {
                continue;
            }
            if node.stored_chunks.contains(&chunk_id) {
                continue;
            }
            if self
                .jobs
                .jobs_for_chunk(chunk_id)
                .any(|job| job.source == node_id || job.targets.contains(&node_id))
            {
                continue;
            }
            if self.jobs.incoming_replication_count(node_id)
                >= self.config.replicator.max_replication_fan_in
            {
                continue;
            }
            return Some(node_id);
        }
        None
    }

    /// Whether any balancing target exists below `max_fill_factor`.
    pub(crate) fn has_balancing_targets(&self, medium: MediumIndex, max_fill_factor: f64) -> bool {
        self.placement
            .nodes_by_fill()
            .take_while(|(fill, _)| fill.0 <= max_fill_factor)
            .any(|(_, node_id)| {
                self.nodes
                    .get(&node_id)
                    .map(|node| self.is_valid_upload_target(node, medium))
                    .unwrap_or(false)
            })
    }

    /// Chunks worth moving off `node_id`: stored chunks without outstanding
    /// jobs, up to `count`.
    pub(crate) fn balancing_chunks(&self, node_id: NodeId, count: usize) -> Vec<ChunkId> {
        let Some(node) = self.nodes.get(&node_id) else {
            return vec![];
        };
        node.stored_chunks
            .iter()
            .filter(|chunk_id| !self.jobs.has_jobs_for_chunk(**chunk_id))
            .take(count)
            .copied()
            .collect()
    }
}
