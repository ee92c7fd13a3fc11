//! Per-node liveness leases.
//!
//! Heartbeats renew a node's lease; an expired lease makes the node eligible
//! for a retriable unregister mutation. Leases are transient leader-side
//! state: followers never expire nodes, and an epoch change drops the whole
//! tracker.

use crate::NodeLeaseConfig;
use clock::Time;
use data_types::{NodeId, NodeState};
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
struct NodeLease {
    confirmed: bool,
    deadline: Time,
}

/// Tracks one lease per registered node.
#[derive(Debug)]
pub struct NodeLeaseTracker {
    config: NodeLeaseConfig,
    leases: HashMap<NodeId, NodeLease>,
    online_count: usize,
}

impl NodeLeaseTracker {
    /// Create an empty tracker.
    pub fn new(config: NodeLeaseConfig) -> Self {
        Self {
            config,
            leases: HashMap::new(),
            online_count: 0,
        }
    }

    fn timeout(&self, state: NodeState, confirmed: bool) -> Duration {
        if !confirmed {
            return self.config.unconfirmed_node_timeout;
        }
        match state {
            NodeState::Registered | NodeState::Unregistered => {
                self.config.registered_node_timeout
            }
            NodeState::Online => self.config.online_node_timeout,
        }
    }

    /// Start tracking a freshly registered node.
    pub fn on_node_registered(&mut self, node_id: NodeId, now: Time) {
        let deadline = now.add(self.timeout(NodeState::Registered, false));
        self.leases.insert(
            node_id,
            NodeLease {
                confirmed: false,
                deadline,
            },
        );
    }

    /// Mark a node online after its first full heartbeat.
    pub fn on_node_online(&mut self, node_id: NodeId, now: Time) {
        self.online_count += 1;
        self.renew(node_id, NodeState::Online, now);
    }

    /// Renew a node's lease on any heartbeat.
    pub fn on_heartbeat(&mut self, node_id: NodeId, state: NodeState, now: Time) {
        self.renew(node_id, state, now);
    }

    fn renew(&mut self, node_id: NodeId, state: NodeState, now: Time) {
        let timeout = self.timeout(state, true);
        if let Some(lease) = self.leases.get_mut(&node_id) {
            lease.confirmed = true;
            lease.deadline = now.add(timeout);
        }
    }

    /// Stop tracking an unregistered node.
    pub fn on_node_unregistered(&mut self, node_id: NodeId, was_online: bool) {
        if self.leases.remove(&node_id).is_some() && was_online {
            self.online_count -= 1;
        }
    }

    /// Whether the node has confirmed its registration with a heartbeat.
    pub fn is_confirmed(&self, node_id: NodeId) -> bool {
        self.leases.get(&node_id).map(|l| l.confirmed).unwrap_or(false)
    }

    /// Nodes whose leases have expired as of `now`.
    pub fn collect_expired(&self, now: Time) -> Vec<NodeId> {
        self.leases
            .iter()
            .filter(|(_, lease)| lease.deadline <= now)
            .map(|(node_id, _)| *node_id)
            .collect()
    }

    /// Nodes currently online.
    pub fn online_node_count(&self) -> usize {
        self.online_count
    }

    /// Drop all leases, e.g. when leadership is lost.
    pub fn reset(&mut self) {
        self.leases.clear();
        self.online_count = 0;
    }
}
