//! Messages exchanged on the client to orchestrator link.

use std::fmt::{Debug, Formatter};

use crate::cursor::ParseCursor;
use crate::error::Error;
use crate::ids::{NodeId, TaskId};
use crate::state::{EventType, TaskState};
use crate::usage::UsageMetrics;
use crate::wire::{FromWire, ToWire, seq_from_wire, seq_to_wire, seq_wire_size};

/// Submit a new task: clone `repo_url` at `branch`, run the agent with
/// `prompt`, optionally raise a pull request when it finishes.
#[derive(Clone, PartialEq, Eq)]
pub struct SubmitTaskRequest {
    pub repo_url: String,
    pub branch: String,
    pub prompt: String,
    pub github_token: Option<String>,
    pub create_pr: bool,
    pub pr_title: Option<String>,
    pub pr_body: Option<String>,
}

impl ToWire for SubmitTaskRequest {
    fn wire_size(&self) -> usize {
        self.repo_url.wire_size()
            + self.branch.wire_size()
            + self.prompt.wire_size()
            + self.github_token.wire_size()
            + self.create_pr.wire_size()
            + self.pr_title.wire_size()
            + self.pr_body.wire_size()
    }

    fn to_wire(&self, cursor: &mut ParseCursor) -> Result<(), Error> {
        self.repo_url.to_wire(cursor)?;
        self.branch.to_wire(cursor)?;
        self.prompt.to_wire(cursor)?;
        self.github_token.to_wire(cursor)?;
        self.create_pr.to_wire(cursor)?;
        self.pr_title.to_wire(cursor)?;
        self.pr_body.to_wire(cursor)
    }
}

impl FromWire for SubmitTaskRequest {
    fn from_wire(cursor: &mut ParseCursor) -> Result<Self, Error> {
        Ok(SubmitTaskRequest {
            repo_url: String::from_wire(cursor)?,
            branch: String::from_wire(cursor)?,
            prompt: String::from_wire(cursor)?,
            github_token: Option::from_wire(cursor)?,
            create_pr: bool::from_wire(cursor)?,
            pr_title: Option::from_wire(cursor)?,
            pr_body: Option::from_wire(cursor)?,
        })
    }
}

impl Debug for SubmitTaskRequest {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubmitTaskRequest")
            .field("repo_url", &self.repo_url)
            .field("branch", &self.branch)
            .field("prompt_len", &self.prompt.len())
            .field("github_token", &self.github_token.as_ref().map(|_| "<redacted>"))
            .field("create_pr", &self.create_pr)
            .field("pr_title", &self.pr_title)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GetTaskRequest {
    pub task_id: TaskId,
}

impl ToWire for GetTaskRequest {
    fn wire_size(&self) -> usize {
        self.task_id.wire_size()
    }

    fn to_wire(&self, cursor: &mut ParseCursor) -> Result<(), Error> {
        self.task_id.to_wire(cursor)
    }
}

impl FromWire for GetTaskRequest {
    fn from_wire(cursor: &mut ParseCursor) -> Result<Self, Error> {
        Ok(GetTaskRequest {
            task_id: TaskId::from_wire(cursor)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancelTaskRequest {
    pub task_id: TaskId,
}

impl ToWire for CancelTaskRequest {
    fn wire_size(&self) -> usize {
        self.task_id.wire_size()
    }

    fn to_wire(&self, cursor: &mut ParseCursor) -> Result<(), Error> {
        self.task_id.to_wire(cursor)
    }
}

impl FromWire for CancelTaskRequest {
    fn from_wire(cursor: &mut ParseCursor) -> Result<Self, Error> {
        Ok(CancelTaskRequest {
            task_id: TaskId::from_wire(cursor)?,
        })
    }
}

/// Request a usage report for the calling client over `[start_ms, end_ms)`.
/// Zero on either bound leaves that side of the window open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GetUsageRequest {
    pub start_ms: u64,
    pub end_ms: u64,
}

impl ToWire for GetUsageRequest {
    fn wire_size(&self) -> usize {
        16
    }

    fn to_wire(&self, cursor: &mut ParseCursor) -> Result<(), Error> {
        cursor.try_put_u64(self.start_ms)?;
        cursor.try_put_u64(self.end_ms)
    }
}

impl FromWire for GetUsageRequest {
    fn from_wire(cursor: &mut ParseCursor) -> Result<Self, Error> {
        Ok(GetUsageRequest {
            start_ms: cursor.try_get_u64()?,
            end_ms: cursor.try_get_u64()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListTasksRequest {
    pub state_filter: Option<TaskState>,
    pub limit: u32,
    pub offset: u32,
}

impl ToWire for ListTasksRequest {
    fn wire_size(&self) -> usize {
        self.state_filter.wire_size() + 8
    }

    fn to_wire(&self, cursor: &mut ParseCursor) -> Result<(), Error> {
        self.state_filter.to_wire(cursor)?;
        cursor.try_put_u32(self.limit)?;
        cursor.try_put_u32(self.offset)
    }
}

impl FromWire for ListTasksRequest {
    fn from_wire(cursor: &mut ParseCursor) -> Result<Self, Error> {
        Ok(ListTasksRequest {
            state_filter: Option::from_wire(cursor)?,
            limit: cursor.try_get_u32()?,
            offset: cursor.try_get_u32()?,
        })
    }
}

/// One element of a task's event stream. `data` is opaque: output chunks for
/// `Output` events, an error message for `TaskError`, the pull-request URL
/// (when there is one) for `Complete`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskEvent {
    pub task_id: TaskId,
    pub state: TaskState,
    pub timestamp_ms: u64,
    pub event_type: EventType,
    pub data: Vec<u8>,
}

impl ToWire for TaskEvent {
    fn wire_size(&self) -> usize {
        self.task_id.wire_size()
            + self.state.wire_size()
            + 8
            + self.event_type.wire_size()
            + self.data.wire_size()
    }

    fn to_wire(&self, cursor: &mut ParseCursor) -> Result<(), Error> {
        self.task_id.to_wire(cursor)?;
        self.state.to_wire(cursor)?;
        cursor.try_put_u64(self.timestamp_ms)?;
        self.event_type.to_wire(cursor)?;
        self.data.to_wire(cursor)
    }
}

impl FromWire for TaskEvent {
    fn from_wire(cursor: &mut ParseCursor) -> Result<Self, Error> {
        Ok(TaskEvent {
            task_id: TaskId::from_wire(cursor)?,
            state: TaskState::from_wire(cursor)?,
            timestamp_ms: cursor.try_get_u64()?,
            event_type: EventType::from_wire(cursor)?,
            data: Vec::from_wire(cursor)?,
        })
    }
}

/// An owned snapshot of one task, as returned to clients. Secrets held on the
/// server-side record (the github token) never appear here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSummary {
    pub task_id: TaskId,
    pub state: TaskState,
    pub repo_url: String,
    pub branch: String,
    pub node_id: Option<NodeId>,
    pub created_at_ms: u64,
    pub started_at_ms: Option<u64>,
    pub completed_at_ms: Option<u64>,
    pub error_message: Option<String>,
    pub pr_url: Option<String>,
    pub usage: UsageMetrics,
}

impl ToWire for TaskSummary {
    fn wire_size(&self) -> usize {
        self.task_id.wire_size()
            + self.state.wire_size()
            + self.repo_url.wire_size()
            + self.branch.wire_size()
            + self.node_id.wire_size()
            + 8
            + self.started_at_ms.wire_size()
            + self.completed_at_ms.wire_size()
            + self.error_message.wire_size()
            + self.pr_url.wire_size()
            + self.usage.wire_size()
    }

    fn to_wire(&self, cursor: &mut ParseCursor) -> Result<(), Error> {
        self.task_id.to_wire(cursor)?;
        self.state.to_wire(cursor)?;
        self.repo_url.to_wire(cursor)?;
        self.branch.to_wire(cursor)?;
        self.node_id.to_wire(cursor)?;
        cursor.try_put_u64(self.created_at_ms)?;
        self.started_at_ms.to_wire(cursor)?;
        self.completed_at_ms.to_wire(cursor)?;
        self.error_message.to_wire(cursor)?;
        self.pr_url.to_wire(cursor)?;
        self.usage.to_wire(cursor)
    }
}

impl FromWire for TaskSummary {
    fn from_wire(cursor: &mut ParseCursor) -> Result<Self, Error> {
        Ok(TaskSummary {
            task_id: TaskId::from_wire(cursor)?,
            state: TaskState::from_wire(cursor)?,
            repo_url: String::from_wire(cursor)?,
            branch: String::from_wire(cursor)?,
            node_id: Option::from_wire(cursor)?,
            created_at_ms: cursor.try_get_u64()?,
            started_at_ms: Option::from_wire(cursor)?,
            completed_at_ms: Option::from_wire(cursor)?,
            error_message: Option::from_wire(cursor)?,
            pr_url: Option::from_wire(cursor)?,
            usage: UsageMetrics::from_wire(cursor)?,
        })
    }
}

/// Response to submit, get, cancel, and list. Point lookups carry one
/// summary; list carries a page plus the total match count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskResponse {
    pub tasks: Vec<TaskSummary>,
    pub total_count: u32,
}

impl TaskResponse {
    pub fn single(task: TaskSummary) -> Self {
        Self {
            tasks: vec![task],
            total_count: 1,
        }
    }
}

impl ToWire for TaskResponse {
    fn wire_size(&self) -> usize {
        seq_wire_size(&self.tasks) + 4
    }

    fn to_wire(&self, cursor: &mut ParseCursor) -> Result<(), Error> {
        seq_to_wire(&self.tasks, cursor)?;
        cursor.try_put_u32(self.total_count)
    }
}

impl FromWire for TaskResponse {
    fn from_wire(cursor: &mut ParseCursor) -> Result<Self, Error> {
        Ok(TaskResponse {
            tasks: seq_from_wire(cursor)?,
            total_count: cursor.try_get_u32()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskUsage {
    pub task_id: TaskId,
    pub metrics: UsageMetrics,
}

impl ToWire for TaskUsage {
    fn wire_size(&self) -> usize {
        self.task_id.wire_size() + self.metrics.wire_size()
    }

    fn to_wire(&self, cursor: &mut ParseCursor) -> Result<(), Error> {
        self.task_id.to_wire(cursor)?;
        self.metrics.to_wire(cursor)
    }
}

impl FromWire for TaskUsage {
    fn from_wire(cursor: &mut ParseCursor) -> Result<Self, Error> {
        Ok(TaskUsage {
            task_id: TaskId::from_wire(cursor)?,
            metrics: UsageMetrics::from_wire(cursor)?,
        })
    }
}

/// Aggregated usage over the requested window plus a per-task breakdown.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UsageResponse {
    pub total: UsageMetrics,
    pub per_task: Vec<TaskUsage>,
}

impl ToWire for UsageResponse {
    fn wire_size(&self) -> usize {
        self.total.wire_size() + seq_wire_size(&self.per_task)
    }

    fn to_wire(&self, cursor: &mut ParseCursor) -> Result<(), Error> {
        self.total.to_wire(cursor)?;
        seq_to_wire(&self.per_task, cursor)
    }
}

impl FromWire for UsageResponse {
    fn from_wire(cursor: &mut ParseCursor) -> Result<Self, Error> {
        Ok(UsageResponse {
            total: UsageMetrics::from_wire(cursor)?,
            per_task: seq_from_wire(cursor)?,
        })
    }
}

/// Failure report for a single request. The connection stays up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
}

impl ErrorResponse {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl ToWire for ErrorResponse {
    fn wire_size(&self) -> usize {
        self.code.wire_size() + self.message.wire_size()
    }

    fn to_wire(&self, cursor: &mut ParseCursor) -> Result<(), Error> {
        self.code.to_wire(cursor)?;
        self.message.to_wire(cursor)
    }
}

impl FromWire for ErrorResponse {
    fn from_wire(cursor: &mut ParseCursor) -> Result<Self, Error> {
        Ok(ErrorResponse {
            code: String::from_wire(cursor)?,
            message: String::from_wire(cursor)?,
        })
    }
}
