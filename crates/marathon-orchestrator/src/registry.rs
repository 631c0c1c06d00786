//! The node registry: every node that has heartbeated recently, its latest
//! self-reported status, and the scoring used to pick a placement target.

use std::sync::Mutex;

use marathon_protocol::ids::NodeId;
use marathon_protocol::messages::NodeStatus;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("node {0} is already registered")]
    AlreadyRegistered(NodeId),

    #[error("node {0} is not registered")]
    NotFound(NodeId),
}

/// Selection weight for a node, in `[0, 1]`. Zero for any disqualifier:
/// unhealthy, draining, or no free slots. Otherwise a blend of free slots,
/// warm standby capacity, and headroom on cpu/memory.
pub fn score(status: &NodeStatus) -> f64 {
    if !status.healthy || status.draining || status.available_slots() == 0 {
        return 0.0;
    }

    let total = status.total_vm_slots as f64;
    let available = status.available_slots() as f64 / total;
    let warm = status.warm_vms as f64 / total.max(1.0);
    let cpu_headroom = 1.0 - f64::from(status.cpu_usage).clamp(0.0, 1.0);
    let mem_headroom = 1.0 - f64::from(status.memory_usage).clamp(0.0, 1.0);

    0.4 * available + 0.3 * warm.min(1.0) + 0.15 * cpu_headroom + 0.15 * mem_headroom
}

struct NodeEntry {
    status: NodeStatus,
    last_seen_ms: u64,
}

/// Thread-safe map of NodeId to status, preserving insertion order so score
/// ties break deterministically toward the longest-registered node. A single
/// mutex is plenty at heartbeat rates.
pub struct NodeRegistry {
    entries: Mutex<Vec<NodeEntry>>,
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Insert a new node. Fails if the NodeId is already present.
    pub fn register(&self, status: NodeStatus, now_ms: u64) -> Result<(), RegistryError> {
        let mut entries = self.entries.lock().unwrap();

        if entries.iter().any(|e| e.status.node_id == status.node_id) {
            return Err(RegistryError::AlreadyRegistered(status.node_id));
        }

        debug!("registered node {} ({})", status.node_id, status.hostname);
        entries.push(NodeEntry {
            status,
            last_seen_ms: now_ms,
        });
        Ok(())
    }

    /// Replace a node's status and refresh its last-seen stamp.
    pub fn update(&self, node_id: &NodeId, status: NodeStatus, now_ms: u64) -> Result<(), RegistryError> {
        let mut entries = self.entries.lock().unwrap();

        let entry = entries
            .iter_mut()
            .find(|e| e.status.node_id == *node_id)
            .ok_or(RegistryError::NotFound(*node_id))?;

        entry.status = status;
        entry.last_seen_ms = now_ms;
        Ok(())
    }

    /// Register-or-update, the shape every heartbeat takes. Returns true when
    /// the node was new.
    pub fn record_heartbeat(&self, status: NodeStatus, now_ms: u64) -> bool {
        let node_id = status.node_id;
        if self.update(&node_id, status.clone(), now_ms).is_ok() {
            return false;
        }

        // Not present; a concurrent register for the same node cannot happen
        // because a node heartbeats on a single connection.
        self.register(status, now_ms).is_ok()
    }

    pub fn get(&self, node_id: &NodeId) -> Option<NodeStatus> {
        let entries = self.entries.lock().unwrap();
        entries
            .iter()
            .find(|e| e.status.node_id == *node_id)
            .map(|e| e.status.clone())
    }

    pub fn list(&self) -> Vec<NodeStatus> {
        let entries = self.entries.lock().unwrap();
        entries.iter().map(|e| e.status.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every node whose last heartbeat is older than `now - timeout`.
    /// Returns the removed statuses.
    pub fn prune(&self, now_ms: u64, timeout_ms: u64) -> Vec<NodeStatus> {
        let mut entries = self.entries.lock().unwrap();
        let cutoff = now_ms.saturating_sub(timeout_ms);

        let mut removed = Vec::new();
        entries.retain(|e| {
            if e.last_seen_ms < cutoff {
                removed.push(e.status.clone());
                false
            } else {
                true
            }
        });
        removed
    }

    /// The node with the highest non-zero score, ties broken by insertion
    /// order.
    pub fn select_node(&self) -> Option<NodeId> {
        let entries = self.entries.lock().unwrap();

        let mut best: Option<(f64, NodeId)> = None;
        for entry in entries.iter() {
            let s = score(&entry.status);
            if s <= 0.0 {
                continue;
            }
            match best {
                Some((best_score, _)) if s <= best_score => (),
                _ => best = Some((s, entry.status.node_id)),
            }
        }

        best.map(|(_, node_id)| node_id)
    }
}

#[cfg(test)]
mod tests {
    use marathon_protocol::ids::TaskId;

    use super::*;

    fn status(id: u8) -> NodeStatus {
        NodeStatus {
            node_id: NodeId::new([id; 16]),
            hostname: format!("node-{id:02}"),
            total_vm_slots: 10,
            active_vms: 3,
            warm_vms: 5,
            cpu_usage: 0.5,
            memory_usage: 0.4,
            disk_available_bytes: 1 << 40,
            healthy: true,
            draining: false,
            uptime_seconds: 1000,
            last_task_at_ms: None,
            active_task_ids: Vec::new(),
        }
    }

    #[test]
    fn score_is_strictly_inside_unit_interval_for_viable_nodes() {
        let s = score(&status(1));
        assert!(s > 0.0 && s < 1.0, "score was {s}");
    }

    #[test]
    fn score_zero_for_each_disqualifier() {
        let mut unhealthy = status(1);
        unhealthy.healthy = false;
        assert_eq!(score(&unhealthy), 0.0);

        let mut draining = status(1);
        draining.draining = true;
        assert_eq!(score(&draining), 0.0);

        let mut full = status(1);
        full.active_vms = full.total_vm_slots;
        assert_eq!(score(&full), 0.0);

        let mut no_slots = status(1);
        no_slots.total_vm_slots = 0;
        no_slots.active_vms = 0;
        assert_eq!(score(&no_slots), 0.0);
    }

    #[test]
    fn score_stays_bounded_with_garbage_gauges() {
        let mut weird = status(1);
        weird.cpu_usage = 7.5;
        weird.memory_usage = -3.0;

        let s = score(&weird);
        assert!((0.0..=1.0).contains(&s), "score was {s}");
    }

    #[test]
    fn idle_empty_node_scores_highest() {
        let mut idle = status(1);
        idle.active_vms = 0;
        idle.warm_vms = 10;
        idle.cpu_usage = 0.0;
        idle.memory_usage = 0.0;

        assert!((score(&idle) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn register_rejects_duplicates() {
        let registry = NodeRegistry::new();
        registry.register(status(1), 0).unwrap();

        match registry.register(status(1), 1) {
            Err(RegistryError::AlreadyRegistered(_)) => (),
            other => panic!("expected AlreadyRegistered, got {other:?}"),
        }
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn update_refreshes_status_and_last_seen() {
        let registry = NodeRegistry::new();
        registry.register(status(1), 0).unwrap();

        let mut newer = status(1);
        newer.active_vms = 9;
        newer.active_task_ids = vec![TaskId::new([9u8; 32])];
        registry.update(&newer.node_id, newer.clone(), 10_000).unwrap();

        let read_back = registry.get(&newer.node_id).unwrap();
        assert_eq!(read_back.active_vms, 9);

        // last_seen was refreshed, so a prune at the old cutoff keeps it
        assert!(registry.prune(10_500, 1_000).is_empty());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn update_unknown_node_fails() {
        let registry = NodeRegistry::new();
        match registry.update(&NodeId::new([1; 16]), status(1), 0) {
            Err(RegistryError::NotFound(_)) => (),
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    #[test]
    fn prune_removes_only_stale_nodes() {
        let registry = NodeRegistry::new();
        registry.register(status(1), 0).unwrap();
        registry.register(status(2), 9_000).unwrap();

        let removed = registry.prune(10_000, 5_000);
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].node_id, NodeId::new([1; 16]));
        assert_eq!(registry.len(), 1);
        assert!(registry.get(&NodeId::new([2; 16])).is_some());
    }

    #[test]
    fn select_prefers_higher_score() {
        let registry = NodeRegistry::new();

        let mut busy = status(1);
        busy.active_vms = 9;
        busy.warm_vms = 1;
        registry.register(busy, 0).unwrap();

        let mut idle = status(2);
        idle.active_vms = 0;
        idle.warm_vms = 10;
        registry.register(idle, 0).unwrap();

        assert_eq!(registry.select_node(), Some(NodeId::new([2; 16])));
    }

    #[test]
    fn select_breaks_ties_by_insertion_order() {
        let registry = NodeRegistry::new();
        registry.register(status(3), 0).unwrap();
        registry.register(status(1), 0).unwrap();
        registry.register(status(2), 0).unwrap();

        assert_eq!(registry.select_node(), Some(NodeId::new([3; 16])));
    }

    #[test]
    fn select_skips_disqualified_nodes() {
        let registry = NodeRegistry::new();

        let mut draining = status(1);
        draining.draining = true;
        registry.register(draining, 0).unwrap();

        assert_eq!(registry.select_node(), None);

        registry.register(status(2), 0).unwrap();
        assert_eq!(registry.select_node(), Some(NodeId::new([2; 16])));
    }
}
