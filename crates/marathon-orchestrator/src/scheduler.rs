//! The task scheduler: the authoritative task table, the FIFO placement
//! queue, the lifecycle state machine, and event fan-out to subscribers.
//!
//! One mutex guards the table and the queue together; every operation takes
//! it, and reads hand back owned snapshots so callers never hold references
//! into the locked state. Subscriber callbacks run under the lock and must
//! only push into a bounded queue (the dispatcher's writer threads do the
//! actual socket I/O).

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use marathon_common::Clock;
use marathon_protocol::ids::{ClientId, NodeId, TaskId};
use marathon_protocol::messages::TaskEvent;
use marathon_protocol::state::{EventType, TaskState};
use marathon_protocol::usage::UsageMetrics;
use thiserror::Error;
use tracing::{debug, warn};

use crate::storage::{StorageError, TaskPatch, TaskRepository};
use crate::task::{Task, TaskResult};

/// Hard cap on the page size `list` will return.
pub const LIST_LIMIT_CAP: u32 = 1000;

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("task {0} already exists")]
    DuplicateId(TaskId),

    #[error("task {0} not found")]
    NotFound(TaskId),

    #[error("illegal transition {0} -> {1}")]
    InvalidTransition(TaskState, TaskState),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Where `schedule_next` looks for a placement target. The node registry is
/// the production implementation; tests substitute fixed answers.
pub trait NodeSelector: Send + Sync {
    fn select_node(&self) -> Option<NodeId>;
}

/// An event callback. Returning false detaches the subscription; the
/// scheduler also detaches every subscriber once a task reaches a terminal
/// state.
pub type Subscriber = Box<dyn FnMut(&TaskEvent) -> bool + Send>;

struct TaskContext {
    task: Task,
    subscribers: Vec<Subscriber>,
}

#[derive(Default)]
struct SchedulerState {
    tasks: HashMap<TaskId, TaskContext>,
    queue: VecDeque<TaskId>,
}

pub struct Scheduler {
    state: Mutex<SchedulerState>,
    selector: Arc<dyn NodeSelector>,
    repo: Arc<dyn TaskRepository>,
    clock: Clock,
}

impl Scheduler {
    pub fn new(selector: Arc<dyn NodeSelector>, repo: Arc<dyn TaskRepository>, clock: Clock) -> Self {
        Scheduler {
            state: Mutex::new(SchedulerState::default()),
            selector,
            repo,
            clock,
        }
    }

    /// Admit a task in state `queued`. The durable record is required: a
    /// repository failure fails the submit and the task is withdrawn.
    pub fn submit(&self, task: Task) -> Result<TaskId, SchedulerError> {
        let task_id = task.id;
        let record = task.clone();

        {
            let mut state = self.state.lock().unwrap();

            if state.tasks.contains_key(&task_id) {
                return Err(SchedulerError::DuplicateId(task_id));
            }

            let mut ctx = TaskContext {
                task,
                subscribers: Vec::new(),
            };
            let event = self.event(&ctx.task, EventType::StateChange, Vec::new());
            fan_out(&mut ctx, &event);

            state.tasks.insert(task_id, ctx);
            state.queue.push_back(task_id);
        }

        // The durable record is written outside the lock (no I/O inside a
        // critical section). On failure the task is withdrawn before anything
        // can observe it; ids are server-generated so no competing submit can
        // race this id.
        if let Err(e) = self.repo.create(&record) {
            let mut state = self.state.lock().unwrap();
            state.tasks.remove(&task_id);
            state.queue.retain(|id| id != &task_id);
            return Err(e.into());
        }

        debug!("task {task_id} queued");
        Ok(task_id)
    }

    pub fn get_state(&self, task_id: &TaskId) -> Result<TaskState, SchedulerError> {
        let state = self.state.lock().unwrap();
        state
            .tasks
            .get(task_id)
            .map(|ctx| ctx.task.state)
            .ok_or(SchedulerError::NotFound(*task_id))
    }

    /// An owned deep copy of the task; the lock is released before the
    /// caller looks at it.
    pub fn snapshot(&self, task_id: &TaskId) -> Result<Task, SchedulerError> {
        let state = self.state.lock().unwrap();
        state
            .tasks
            .get(task_id)
            .map(|ctx| ctx.task.clone())
            .ok_or(SchedulerError::NotFound(*task_id))
    }

    /// Dequeue the head of the FIFO and place it on the best-scoring node.
    /// When no node is eligible the task is requeued at the tail (so a later
    /// submission with satisfiable requirements is not stuck behind it) and
    /// `None` is returned.
    pub fn schedule_next(&self) -> Option<(Task, NodeId)> {
        let scheduled = {
            let mut state = self.state.lock().unwrap();

            let task_id = loop {
                let candidate = state.queue.pop_front()?;
                match state.tasks.get(&candidate) {
                    Some(ctx) if ctx.task.state == TaskState::Queued => break candidate,
                    Some(ctx) => {
                        // Cancelled while queued; the queue entry is already
                        // gone from the table's perspective. Drop it and keep
                        // looking.
                        debug!("skipping stale queue entry {candidate} in state {}", ctx.task.state);
                    }
                    None => warn!("queue entry {candidate} has no task record"),
                }
            };

            let Some(node_id) = self.selector.select_node() else {
                state.queue.push_back(task_id);
                return None;
            };

            let now = self.clock.epoch_millis();
            let ctx = state.tasks.get_mut(&task_id).expect("checked above");
            ctx.task.state = TaskState::Starting;
            ctx.task.node_id = Some(node_id);
            ctx.task.started_at_ms = Some(now);

            let event = self.event(&ctx.task, EventType::StateChange, Vec::new());
            fan_out(ctx, &event);

            debug!("task {task_id} starting on node {node_id}");
            (ctx.task.clone(), node_id)
        };

        self.mirror(&scheduled.0);
        Some(scheduled)
    }

    /// Apply a terminal outcome. Idempotent once terminal: re-applying is a
    /// no-op, never a reversal.
    pub fn complete(&self, task_id: &TaskId, result: TaskResult) -> Result<(), SchedulerError> {
        debug_assert!(result.state.is_terminal());

        let mut state = self.state.lock().unwrap();
        let ctx = state
            .tasks
            .get_mut(task_id)
            .ok_or(SchedulerError::NotFound(*task_id))?;

        if ctx.task.state.is_terminal() {
            debug!("task {task_id} already terminal ({}); ignoring", ctx.task.state);
            return Ok(());
        }

        if !ctx.task.state.can_transition(result.state) {
            return Err(SchedulerError::InvalidTransition(ctx.task.state, result.state));
        }

        ctx.task.state = result.state;
        ctx.task.completed_at_ms = Some(self.clock.epoch_millis());
        ctx.task.error_message = result.error_message;
        ctx.task.pr_url = result.pr_url;
        if let Some(usage) = result.usage {
            ctx.task.usage = usage;
        }

        if result.state == TaskState::Failed
            && let Some(message) = ctx.task.error_message.clone()
        {
            let event = self.event(&ctx.task, EventType::TaskError, message.into_bytes());
            fan_out(ctx, &event);
        }

        let data = ctx.task.pr_url.clone().map(String::into_bytes).unwrap_or_default();
        let event = self.event(&ctx.task, EventType::Complete, data);
        fan_out(ctx, &event);
        ctx.subscribers.clear();

        let finished = ctx.task.clone();
        drop(state);

        self.mirror(&finished);
        debug!("task {task_id} finished as {}", finished.state);
        Ok(())
    }

    /// Cancel a task. Returns true if the cancellation took effect, false if
    /// the task was already terminal.
    pub fn cancel(&self, task_id: &TaskId) -> Result<bool, SchedulerError> {
        let mut state = self.state.lock().unwrap();

        let Some(ctx) = state.tasks.get_mut(task_id) else {
            return Err(SchedulerError::NotFound(*task_id));
        };

        if ctx.task.state.is_terminal() {
            return Ok(false);
        }

        ctx.task.state = TaskState::Cancelled;
        ctx.task.completed_at_ms = Some(self.clock.epoch_millis());

        let event = self.event(&ctx.task, EventType::Complete, Vec::new());
        fan_out(ctx, &event);
        ctx.subscribers.clear();
        let cancelled = ctx.task.clone();

        state.queue.retain(|id| id != task_id);
        drop(state);

        self.mirror(&cancelled);
        debug!("task {task_id} cancelled");
        Ok(true)
    }

    /// Record the node's report that the VM accepted the task. Returns true
    /// on the `starting -> running` edge, false when the report is stale
    /// (already running, or terminal after a race with cancel/complete).
    pub fn mark_running(&self, task_id: &TaskId) -> Result<bool, SchedulerError> {
        let mut state = self.state.lock().unwrap();
        let ctx = state
            .tasks
            .get_mut(task_id)
            .ok_or(SchedulerError::NotFound(*task_id))?;

        match ctx.task.state {
            TaskState::Starting => (),
            TaskState::Running => return Ok(false),
            state if state.is_terminal() => return Ok(false),
            state => return Err(SchedulerError::InvalidTransition(state, TaskState::Running)),
        }

        ctx.task.state = TaskState::Running;
        let event = self.event(&ctx.task, EventType::StateChange, Vec::new());
        fan_out(ctx, &event);

        let running = ctx.task.clone();
        drop(state);

        self.mirror(&running);
        Ok(true)
    }

    /// Fan a chunk of agent output to subscribers. Quietly dropped when the
    /// task has already terminated (its subscribers are detached).
    pub fn append_output(&self, task_id: &TaskId, data: Vec<u8>) -> Result<(), SchedulerError> {
        let mut state = self.state.lock().unwrap();
        let ctx = state
            .tasks
            .get_mut(task_id)
            .ok_or(SchedulerError::NotFound(*task_id))?;

        if ctx.task.state.is_terminal() {
            return Ok(());
        }

        let event = self.event(&ctx.task, EventType::Output, data);
        fan_out(ctx, &event);
        Ok(())
    }

    /// Fold a usage delta into the task's accumulator.
    pub fn add_usage(&self, task_id: &TaskId, delta: UsageMetrics) -> Result<(), SchedulerError> {
        let mut state = self.state.lock().unwrap();
        let ctx = state
            .tasks
            .get_mut(task_id)
            .ok_or(SchedulerError::NotFound(*task_id))?;

        ctx.task.usage += delta;
        let usage = ctx.task.usage;
        drop(state);

        let patch = TaskPatch {
            usage: Some(usage),
            ..TaskPatch::default()
        };
        if let Err(e) = self.repo.update(task_id, &patch) {
            warn!("usage mirror for task {task_id} failed: {e}");
        }
        Ok(())
    }

    /// Snapshot tasks owned by `client_id`, optionally filtered by state.
    /// Returns the requested page and the total match count. `limit` is
    /// capped at `LIST_LIMIT_CAP`.
    pub fn list(
        &self,
        client_id: &ClientId,
        state_filter: Option<TaskState>,
        limit: u32,
        offset: u32,
    ) -> (Vec<Task>, u32) {
        let limit = limit.min(LIST_LIMIT_CAP);
        let state = self.state.lock().unwrap();

        let mut matches: Vec<&TaskContext> = state
            .tasks
            .values()
            .filter(|ctx| ctx.task.client_id == *client_id)
            .filter(|ctx| state_filter.is_none_or(|f| ctx.task.state == f))
            .collect();

        matches.sort_by_key(|ctx| (ctx.task.created_at_ms, ctx.task.id));

        let total = matches.len() as u32;
        let page = matches
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .map(|ctx| ctx.task.clone())
            .collect();

        (page, total)
    }

    /// Register an event callback for a task. The current state is replayed
    /// immediately so a subscriber attached right after submit always sees
    /// the `queued` event before any later change.
    pub fn subscribe(&self, task_id: &TaskId, mut subscriber: Subscriber) -> Result<(), SchedulerError> {
        let mut state = self.state.lock().unwrap();
        let ctx = state
            .tasks
            .get_mut(task_id)
            .ok_or(SchedulerError::NotFound(*task_id))?;

        let replay_type = if ctx.task.state.is_terminal() {
            EventType::Complete
        } else {
            EventType::StateChange
        };
        let event = self.event(&ctx.task, replay_type, Vec::new());

        if subscriber(&event) && !ctx.task.state.is_terminal() {
            ctx.subscribers.push(subscriber);
        }
        Ok(())
    }

    /// In-flight tasks assigned to `node_id`; used to report orphans when a
    /// node is pruned.
    pub fn tasks_for_node(&self, node_id: &NodeId) -> Vec<TaskId> {
        let state = self.state.lock().unwrap();
        state
            .tasks
            .values()
            .filter(|ctx| {
                ctx.task.node_id == Some(*node_id)
                    && matches!(ctx.task.state, TaskState::Starting | TaskState::Running)
            })
            .map(|ctx| ctx.task.id)
            .collect()
    }

    pub fn queue_len(&self) -> usize {
        self.state.lock().unwrap().queue.len()
    }

    fn event(&self, task: &Task, event_type: EventType, data: Vec<u8>) -> TaskEvent {
        TaskEvent {
            task_id: task.id,
            state: task.state,
            timestamp_ms: self.clock.epoch_millis(),
            event_type,
            data,
        }
    }

    /// Best-effort mirror to the durable store; failures are logged, never
    /// propagated.
    fn mirror(&self, task: &Task) {
        let patch = TaskPatch::from_task(task);
        if let Err(e) = self.repo.update(&task.id, &patch) {
            warn!("mirror for task {} failed: {e}", task.id);
        }
    }
}

fn fan_out(ctx: &mut TaskContext, event: &TaskEvent) {
    ctx.subscribers.retain_mut(|subscriber| subscriber(event));
}

#[cfg(test)]
mod tests {
    use marathon_protocol::messages::SubmitTaskRequest;

    use super::*;
    use crate::storage::MemoryStore;

    /// Selector that always answers the same thing.
    struct FixedSelector {
        node: Option<NodeId>,
    }

    impl FixedSelector {
        fn none() -> Arc<Self> {
            Arc::new(FixedSelector { node: None })
        }

        fn node(id: u8) -> Arc<Self> {
            Arc::new(FixedSelector {
                node: Some(NodeId::new([id; 16])),
            })
        }
    }

    impl NodeSelector for FixedSelector {
        fn select_node(&self) -> Option<NodeId> {
            self.node
        }
    }

    fn scheduler(selector: Arc<dyn NodeSelector>) -> Scheduler {
        Scheduler::new(selector, Arc::new(MemoryStore::new()), Clock::new_mock(1_000))
    }

    fn task(id: u8, client: u8) -> Task {
        Task::from_submit(
            TaskId::new([id; 32]),
            ClientId::new([client; 16]),
            SubmitTaskRequest {
                repo_url: "https://github.com/test/repo".to_string(),
                branch: "main".to_string(),
                prompt: "Fix the bug".to_string(),
                github_token: None,
                create_pr: false,
                pr_title: None,
                pr_body: None,
            },
            1_000,
        )
    }

    #[test]
    fn submit_enqueues_in_queued_state() {
        let sched = scheduler(FixedSelector::none());
        let id = sched.submit(task(1, 1)).unwrap();

        assert_eq!(sched.get_state(&id).unwrap(), TaskState::Queued);
        assert_eq!(sched.queue_len(), 1);
    }

    #[test]
    fn duplicate_submit_rejected() {
        let sched = scheduler(FixedSelector::none());
        sched.submit(task(1, 1)).unwrap();

        match sched.submit(task(1, 1)) {
            Err(SchedulerError::DuplicateId(_)) => (),
            other => panic!("expected DuplicateId, got {other:?}"),
        }
        assert_eq!(sched.queue_len(), 1);
    }

    #[test]
    fn schedule_next_with_no_node_requeues_at_tail() {
        let sched = scheduler(FixedSelector::none());
        let first = sched.submit(task(1, 1)).unwrap();
        let second = sched.submit(task(2, 1)).unwrap();

        assert!(sched.schedule_next().is_none());
        assert_eq!(sched.queue_len(), 2);
        assert_eq!(sched.get_state(&first).unwrap(), TaskState::Queued);

        // The head cycled to the tail: the untouched task now leads. Both
        // tasks remain queued; this just avoids head-of-line blocking.
        let _ = second;
    }

    #[test]
    fn schedule_next_assigns_node_and_stamps_start() {
        let sched = scheduler(FixedSelector::node(7));
        let id = sched.submit(task(1, 1)).unwrap();

        let (scheduled, node_id) = sched.schedule_next().unwrap();
        assert_eq!(scheduled.id, id);
        assert_eq!(node_id, NodeId::new([7; 16]));
        assert_eq!(scheduled.state, TaskState::Starting);
        assert_eq!(scheduled.node_id, Some(node_id));
        assert!(scheduled.started_at_ms.is_some());

        assert!(sched.schedule_next().is_none());
        assert_eq!(sched.queue_len(), 0);
    }

    #[test]
    fn complete_requires_running_reachable_state() {
        let sched = scheduler(FixedSelector::node(7));
        let id = sched.submit(task(1, 1)).unwrap();

        // queued -> completed is illegal
        match sched.complete(&id, TaskResult::completed(None, None)) {
            Err(SchedulerError::InvalidTransition(TaskState::Queued, TaskState::Completed)) => (),
            other => panic!("expected InvalidTransition, got {other:?}"),
        }

        sched.schedule_next().unwrap();
        sched.mark_running(&id).unwrap();
        sched.complete(&id, TaskResult::completed(Some("https://pr".into()), None)).unwrap();

        let snap = sched.snapshot(&id).unwrap();
        assert_eq!(snap.state, TaskState::Completed);
        assert!(snap.completed_at_ms.is_some());
        assert_eq!(snap.pr_url.as_deref(), Some("https://pr"));
    }

    #[test]
    fn complete_is_idempotent_once_terminal() {
        let sched = scheduler(FixedSelector::node(7));
        let id = sched.submit(task(1, 1)).unwrap();
        sched.schedule_next().unwrap();
        sched.mark_running(&id).unwrap();

        sched.complete(&id, TaskResult::completed(None, None)).unwrap();
        // Re-applying with a different outcome must not revert the terminal
        sched.complete(&id, TaskResult::failed("late", None)).unwrap();

        let snap = sched.snapshot(&id).unwrap();
        assert_eq!(snap.state, TaskState::Completed);
        assert!(snap.error_message.is_none());
    }

    #[test]
    fn cancel_respects_terminality() {
        let sched = scheduler(FixedSelector::none());
        let id = sched.submit(task(1, 1)).unwrap();

        assert!(sched.cancel(&id).unwrap());
        assert!(!sched.cancel(&id).unwrap());
        assert_eq!(sched.get_state(&id).unwrap(), TaskState::Cancelled);

        let snap = sched.snapshot(&id).unwrap();
        assert!(snap.completed_at_ms.is_some());
    }

    #[test]
    fn cancelled_task_never_schedules() {
        let sched = scheduler(FixedSelector::node(7));
        let id = sched.submit(task(1, 1)).unwrap();
        sched.cancel(&id).unwrap();

        assert!(sched.schedule_next().is_none());
        assert_eq!(sched.queue_len(), 0);
    }

    #[test]
    fn list_filters_by_client() {
        let sched = scheduler(FixedSelector::none());
        sched.submit(task(1, 1)).unwrap();
        sched.submit(task(2, 1)).unwrap();
        sched.submit(task(3, 2)).unwrap();

        let (page, total) = sched.list(&ClientId::new([1; 16]), None, 100, 0);
        assert_eq!(total, 2);
        assert_eq!(page.len(), 2);

        let (page, total) = sched.list(&ClientId::new([2; 16]), None, 100, 0);
        assert_eq!(total, 1);
        assert_eq!(page.len(), 1);
    }

    #[test]
    fn list_pagination_and_cap() {
        let sched = scheduler(FixedSelector::none());
        for i in 0..5 {
            sched.submit(task(i + 1, 1)).unwrap();
        }

        let (page, total) = sched.list(&ClientId::new([1; 16]), None, 2, 2);
        assert_eq!(total, 5);
        assert_eq!(page.len(), 2);

        // limit caps at LIST_LIMIT_CAP without error
        let (page, _) = sched.list(&ClientId::new([1; 16]), None, u32::MAX, 0);
        assert_eq!(page.len(), 5);
    }

    #[test]
    fn subscriber_sees_queued_then_changes_in_order() {
        let sched = Arc::new(scheduler(FixedSelector::node(7)));
        let id = sched.submit(task(1, 1)).unwrap();

        let seen: Arc<Mutex<Vec<(TaskState, EventType)>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        sched
            .subscribe(
                &id,
                Box::new(move |event| {
                    sink.lock().unwrap().push((event.state, event.event_type));
                    true
                }),
            )
            .unwrap();

        sched.schedule_next().unwrap();
        sched.mark_running(&id).unwrap();
        sched.append_output(&id, b"building".to_vec()).unwrap();
        sched.complete(&id, TaskResult::completed(None, None)).unwrap();

        let events = seen.lock().unwrap();
        assert_eq!(
            *events,
            vec![
                (TaskState::Queued, EventType::StateChange),
                (TaskState::Starting, EventType::StateChange),
                (TaskState::Running, EventType::StateChange),
                (TaskState::Running, EventType::Output),
                (TaskState::Completed, EventType::Complete),
            ]
        );
    }

    #[test]
    fn subscribers_detach_after_terminal() {
        let sched = scheduler(FixedSelector::none());
        let id = sched.submit(task(1, 1)).unwrap();

        let count = Arc::new(Mutex::new(0usize));
        let sink = Arc::clone(&count);
        sched
            .subscribe(
                &id,
                Box::new(move |_| {
                    *sink.lock().unwrap() += 1;
                    true
                }),
            )
            .unwrap();

        sched.cancel(&id).unwrap();
        let after_cancel = *count.lock().unwrap();

        // No further delivery once terminal
        sched.append_output(&id, b"late".to_vec()).unwrap();
        assert_eq!(*count.lock().unwrap(), after_cancel);
    }

    #[test]
    fn subscriber_returning_false_detaches() {
        let sched = scheduler(FixedSelector::node(7));
        let id = sched.submit(task(1, 1)).unwrap();

        let count = Arc::new(Mutex::new(0usize));
        let sink = Arc::clone(&count);
        sched
            .subscribe(
                &id,
                Box::new(move |_| {
                    *sink.lock().unwrap() += 1;
                    false
                }),
            )
            .unwrap();

        sched.schedule_next().unwrap();
        sched.mark_running(&id).unwrap();

        // Only the replayed queued event was delivered
        assert_eq!(*count.lock().unwrap(), 1);
    }

    #[test]
    fn failure_emits_error_then_complete() {
        let sched = scheduler(FixedSelector::node(7));
        let id = sched.submit(task(1, 1)).unwrap();
        sched.schedule_next().unwrap();

        let seen: Arc<Mutex<Vec<(EventType, Vec<u8>)>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        sched
            .subscribe(
                &id,
                Box::new(move |event| {
                    sink.lock().unwrap().push((event.event_type, event.data.clone()));
                    true
                }),
            )
            .unwrap();

        sched.complete(&id, TaskResult::failed("timeout", None)).unwrap();

        let events = seen.lock().unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[1].0, EventType::TaskError);
        assert_eq!(events[1].1, b"timeout");
        assert_eq!(events[2].0, EventType::Complete);
    }

    #[test]
    fn usage_accumulates_monotonically() {
        let sched = scheduler(FixedSelector::node(7));
        let id = sched.submit(task(1, 1)).unwrap();

        let delta = UsageMetrics {
            input_tokens: 10,
            tool_calls: 1,
            ..UsageMetrics::default()
        };
        sched.add_usage(&id, delta).unwrap();
        sched.add_usage(&id, delta).unwrap();

        let snap = sched.snapshot(&id).unwrap();
        assert_eq!(snap.usage.input_tokens, 20);
        assert_eq!(snap.usage.tool_calls, 2);
    }

    #[test]
    fn tasks_for_node_reports_in_flight_only() {
        let sched = scheduler(FixedSelector::node(7));
        let node = NodeId::new([7; 16]);

        let a = sched.submit(task(1, 1)).unwrap();
        let b = sched.submit(task(2, 1)).unwrap();
        sched.schedule_next().unwrap();
        sched.schedule_next().unwrap();
        sched.mark_running(&a).unwrap();
        sched.complete(&a, TaskResult::completed(None, None)).unwrap();

        let in_flight = sched.tasks_for_node(&node);
        assert_eq!(in_flight, vec![b]);
    }
}
