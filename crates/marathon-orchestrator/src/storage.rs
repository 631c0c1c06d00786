//! Persistence seams. The scheduler is authoritative while the process runs;
//! the repositories are a durable mirror for inspection, recovery, and
//! billing. Everything here is a trait so the SQL-backed implementation can
//! live out of tree; the in-memory forms below back tests and single-binary
//! deployments.

use std::collections::HashMap;
use std::sync::Mutex;

use marathon_protocol::ids::{ClientId, NodeId, TaskId};
use marathon_protocol::messages::{NodeStatus, TaskUsage, UsageResponse};
use marathon_protocol::state::TaskState;
use marathon_protocol::usage::UsageMetrics;
use thiserror::Error;

use crate::task::Task;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// Fields of a task record that changed. `None` leaves a column untouched.
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub state: Option<TaskState>,
    pub node_id: Option<NodeId>,
    pub started_at_ms: Option<u64>,
    pub completed_at_ms: Option<u64>,
    pub error_message: Option<String>,
    pub pr_url: Option<String>,
    pub usage: Option<UsageMetrics>,
}

impl TaskPatch {
    /// The patch recording everything `task` currently holds that can change
    /// after creation.
    pub fn from_task(task: &Task) -> Self {
        TaskPatch {
            state: Some(task.state),
            node_id: task.node_id,
            started_at_ms: task.started_at_ms,
            completed_at_ms: task.completed_at_ms,
            error_message: task.error_message.clone(),
            pr_url: task.pr_url.clone(),
            usage: Some(task.usage),
        }
    }
}

/// Durable mirror of the in-memory task table.
pub trait TaskRepository: Send + Sync {
    fn create(&self, task: &Task) -> Result<(), StorageError>;
    fn update(&self, task_id: &TaskId, patch: &TaskPatch) -> Result<(), StorageError>;
    fn get(&self, task_id: &TaskId) -> Result<Option<Task>, StorageError>;
    fn list(
        &self,
        client_id: &ClientId,
        state_filter: Option<TaskState>,
        limit: u32,
        offset: u32,
    ) -> Result<(Vec<Task>, u32), StorageError>;
}

/// Operator-visibility record of known nodes; not on the hot path.
pub trait NodeRepository: Send + Sync {
    fn upsert(&self, status: &NodeStatus) -> Result<(), StorageError>;
    fn list(&self) -> Result<Vec<NodeStatus>, StorageError>;
    fn mark_unhealthy(&self, node_id: &NodeId) -> Result<(), StorageError>;
}

/// Append-only usage ledger for billing.
pub trait UsageRepository: Send + Sync {
    fn append(&self, task_id: &TaskId, metrics: &UsageMetrics, ts_ms: u64) -> Result<(), StorageError>;

    /// Aggregate usage for `client_id` over `[start_ms, end_ms)`, with a
    /// per-task breakdown. Zero bounds leave that side of the window open.
    fn report(
        &self,
        client_id: &ClientId,
        start_ms: u64,
        end_ms: u64,
    ) -> Result<UsageResponse, StorageError>;
}

struct LedgerEntry {
    task_id: TaskId,
    metrics: UsageMetrics,
    ts_ms: u64,
}

#[derive(Default)]
struct StoreState {
    tasks: HashMap<TaskId, Task>,
    task_order: Vec<TaskId>,
    nodes: Vec<NodeStatus>,
    ledger: Vec<LedgerEntry>,
}

/// One in-memory store implementing all three repository contracts, the way
/// a single database would.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TaskRepository for MemoryStore {
    fn create(&self, task: &Task) -> Result<(), StorageError> {
        let mut state = self.state.lock().unwrap();
        if state.tasks.insert(task.id, task.clone()).is_none() {
            state.task_order.push(task.id);
        }
        Ok(())
    }

    fn update(&self, task_id: &TaskId, patch: &TaskPatch) -> Result<(), StorageError> {
        let mut state = self.state.lock().unwrap();
        let Some(task) = state.tasks.get_mut(task_id) else {
            return Err(StorageError::Unavailable(format!("task {task_id} not in store")));
        };

        if let Some(next) = patch.state {
            task.state = next;
        }
        if patch.node_id.is_some() {
            task.node_id = patch.node_id;
        }
        if patch.started_at_ms.is_some() {
            task.started_at_ms = patch.started_at_ms;
        }
        if patch.completed_at_ms.is_some() {
            task.completed_at_ms = patch.completed_at_ms;
        }
        if patch.error_message.is_some() {
            task.error_message = patch.error_message.clone();
        }
        if patch.pr_url.is_some() {
            task.pr_url = patch.pr_url.clone();
        }
        if let Some(usage) = patch.usage {
            task.usage = usage;
        }
        Ok(())
    }

    fn get(&self, task_id: &TaskId) -> Result<Option<Task>, StorageError> {
        let state = self.state.lock().unwrap();
        Ok(state.tasks.get(task_id).cloned())
    }

    fn list(
        &self,
        client_id: &ClientId,
        state_filter: Option<TaskState>,
        limit: u32,
        offset: u32,
    ) -> Result<(Vec<Task>, u32), StorageError> {
        let state = self.state.lock().unwrap();

        let matches: Vec<&Task> = state
            .task_order
            .iter()
            .filter_map(|id| state.tasks.get(id))
            .filter(|t| t.client_id == *client_id)
            .filter(|t| state_filter.is_none_or(|f| t.state == f))
            .collect();

        let total = matches.len() as u32;
        let page = matches
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .cloned()
            .collect();

        Ok((page, total))
    }
}

impl NodeRepository for MemoryStore {
    fn upsert(&self, status: &NodeStatus) -> Result<(), StorageError> {
        let mut state = self.state.lock().unwrap();
        match state.nodes.iter_mut().find(|n| n.node_id == status.node_id) {
            Some(existing) => *existing = status.clone(),
            None => state.nodes.push(status.clone()),
        }
        Ok(())
    }

    fn list(&self) -> Result<Vec<NodeStatus>, StorageError> {
        Ok(self.state.lock().unwrap().nodes.clone())
    }

    fn mark_unhealthy(&self, node_id: &NodeId) -> Result<(), StorageError> {
        let mut state = self.state.lock().unwrap();
        if let Some(node) = state.nodes.iter_mut().find(|n| n.node_id == *node_id) {
            node.healthy = false;
        }
        Ok(())
    }
}

impl UsageRepository for MemoryStore {
    fn append(&self, task_id: &TaskId, metrics: &UsageMetrics, ts_ms: u64) -> Result<(), StorageError> {
        let mut state = self.state.lock().unwrap();
        state.ledger.push(LedgerEntry {
            task_id: *task_id,
            metrics: *metrics,
            ts_ms,
        });
        Ok(())
    }

    fn report(
        &self,
        client_id: &ClientId,
        start_ms: u64,
        end_ms: u64,
    ) -> Result<UsageResponse, StorageError> {
        let state = self.state.lock().unwrap();

        let mut total = UsageMetrics::default();
        let mut per_task: Vec<TaskUsage> = Vec::new();

        for entry in &state.ledger {
            if entry.ts_ms < start_ms || (end_ms > 0 && entry.ts_ms >= end_ms) {
                continue;
            }
            let owned_by_client = state
                .tasks
                .get(&entry.task_id)
                .is_some_and(|t| t.client_id == *client_id);
            if !owned_by_client {
                continue;
            }

            total += entry.metrics;
            match per_task.iter_mut().find(|t| t.task_id == entry.task_id) {
                Some(existing) => existing.metrics += entry.metrics,
                None => per_task.push(TaskUsage {
                    task_id: entry.task_id,
                    metrics: entry.metrics,
                }),
            }
        }

        Ok(UsageResponse { total, per_task })
    }
}

#[cfg(test)]
mod tests {
    use marathon_protocol::messages::SubmitTaskRequest;

    use super::*;

    fn task(id: u8, client: u8) -> Task {
        Task::from_submit(
            TaskId::new([id; 32]),
            ClientId::new([client; 16]),
            SubmitTaskRequest {
                repo_url: "https://github.com/test/repo".to_string(),
                branch: "main".to_string(),
                prompt: "p".to_string(),
                github_token: None,
                create_pr: false,
                pr_title: None,
                pr_body: None,
            },
            u64::from(id) * 100,
        )
    }

    #[test]
    fn create_get_round_trip() {
        let store = MemoryStore::new();
        store.create(&task(1, 1)).unwrap();

        let loaded = store.get(&TaskId::new([1; 32])).unwrap().unwrap();
        assert_eq!(loaded.state, TaskState::Queued);
        assert!(store.get(&TaskId::new([2; 32])).unwrap().is_none());
    }

    #[test]
    fn update_applies_only_patched_fields() {
        let store = MemoryStore::new();
        store.create(&task(1, 1)).unwrap();

        let patch = TaskPatch {
            state: Some(TaskState::Starting),
            started_at_ms: Some(500),
            ..TaskPatch::default()
        };
        store.update(&TaskId::new([1; 32]), &patch).unwrap();

        let loaded = store.get(&TaskId::new([1; 32])).unwrap().unwrap();
        assert_eq!(loaded.state, TaskState::Starting);
        assert_eq!(loaded.started_at_ms, Some(500));
        assert_eq!(loaded.repo_url, "https://github.com/test/repo");
        assert!(loaded.completed_at_ms.is_none());
    }

    #[test]
    fn list_filters_by_client_and_state() {
        let store = MemoryStore::new();
        store.create(&task(1, 1)).unwrap();
        store.create(&task(2, 1)).unwrap();
        store.create(&task(3, 2)).unwrap();

        let (page, total) =
            TaskRepository::list(&store, &ClientId::new([1; 16]), None, 100, 0).unwrap();
        assert_eq!(total, 2);
        assert_eq!(page.len(), 2);

        let (_, total) = TaskRepository::list(
            &store,
            &ClientId::new([1; 16]),
            Some(TaskState::Running),
            100,
            0,
        )
        .unwrap();
        assert_eq!(total, 0);
    }

    #[test]
    fn usage_report_windows_and_joins_to_client() {
        let store = MemoryStore::new();
        store.create(&task(1, 1)).unwrap();
        store.create(&task(2, 2)).unwrap();

        let delta = UsageMetrics {
            input_tokens: 100,
            ..UsageMetrics::default()
        };

        store.append(&TaskId::new([1; 32]), &delta, 1_000).unwrap();
        store.append(&TaskId::new([1; 32]), &delta, 2_000).unwrap();
        store.append(&TaskId::new([2; 32]), &delta, 1_500).unwrap();

        // Open window: everything for client 1
        let report = store.report(&ClientId::new([1; 16]), 0, 0).unwrap();
        assert_eq!(report.total.input_tokens, 200);
        assert_eq!(report.per_task.len(), 1);
        assert_eq!(report.per_task[0].metrics.input_tokens, 200);

        // Half-open window excludes the second append
        let report = store.report(&ClientId::new([1; 16]), 0, 1_500).unwrap();
        assert_eq!(report.total.input_tokens, 100);

        // Client 2 sees only its own task
        let report = store.report(&ClientId::new([2; 16]), 0, 0).unwrap();
        assert_eq!(report.total.input_tokens, 100);
    }

    #[test]
    fn node_upsert_and_mark_unhealthy() {
        let store = MemoryStore::new();
        let status = NodeStatus {
            node_id: NodeId::new([5; 16]),
            hostname: "node-05".to_string(),
            total_vm_slots: 4,
            active_vms: 0,
            warm_vms: 2,
            cpu_usage: 0.1,
            memory_usage: 0.1,
            disk_available_bytes: 0,
            healthy: true,
            draining: false,
            uptime_seconds: 0,
            last_task_at_ms: None,
            active_task_ids: Vec::new(),
        };

        store.upsert(&status).unwrap();
        store.upsert(&status).unwrap();
        assert_eq!(NodeRepository::list(&store).unwrap().len(), 1);

        store.mark_unhealthy(&status.node_id).unwrap();
        assert!(!NodeRepository::list(&store).unwrap()[0].healthy);
    }
}
