//! The server-side task record and admission validation.

use std::fmt::{Debug, Formatter};

use marathon_common::Secret;
use marathon_protocol::ids::{ClientId, NodeId, TaskId, VmId};
use marathon_protocol::messages::{SubmitTaskRequest, TaskSummary};
use marathon_protocol::state::TaskState;
use marathon_protocol::usage::UsageMetrics;

/// A unit of agent work, created on submit and mutated only under the
/// scheduler lock. All strings are owned copies taken at construction.
#[derive(Clone)]
pub struct Task {
    pub id: TaskId,
    pub client_id: ClientId,
    pub state: TaskState,
    pub repo_url: String,
    pub branch: String,
    pub prompt: String,
    pub node_id: Option<NodeId>,
    pub vm_id: Option<VmId>,
    pub created_at_ms: u64,
    pub started_at_ms: Option<u64>,
    pub completed_at_ms: Option<u64>,
    pub error_message: Option<String>,
    pub pr_url: Option<String>,
    pub usage: UsageMetrics,
    pub create_pr: bool,
    pub pr_title: Option<String>,
    pub pr_body: Option<String>,
    pub github_token: Option<Secret>,
}

impl Task {
    pub fn from_submit(
        id: TaskId,
        client_id: ClientId,
        request: SubmitTaskRequest,
        now_ms: u64,
    ) -> Self {
        Task {
            id,
            client_id,
            state: TaskState::Queued,
            repo_url: request.repo_url,
            branch: request.branch,
            prompt: request.prompt,
            node_id: None,
            vm_id: None,
            created_at_ms: now_ms,
            started_at_ms: None,
            completed_at_ms: None,
            error_message: None,
            pr_url: None,
            usage: UsageMetrics::default(),
            create_pr: request.create_pr,
            pr_title: request.pr_title,
            pr_body: request.pr_body,
            github_token: request.github_token.map(Secret::new),
        }
    }

    /// The client-visible snapshot of this task. The github token stays
    /// server-side.
    pub fn summary(&self) -> TaskSummary {
        TaskSummary {
            task_id: self.id,
            state: self.state,
            repo_url: self.repo_url.clone(),
            branch: self.branch.clone(),
            node_id: self.node_id,
            created_at_ms: self.created_at_ms,
            started_at_ms: self.started_at_ms,
            completed_at_ms: self.completed_at_ms,
            error_message: self.error_message.clone(),
            pr_url: self.pr_url.clone(),
            usage: self.usage,
        }
    }
}

impl Debug for Task {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("client_id", &self.client_id)
            .field("state", &self.state)
            .field("repo_url", &self.repo_url)
            .field("branch", &self.branch)
            .field("node_id", &self.node_id)
            .field("github_token", &self.github_token)
            .finish()
    }
}

/// The terminal outcome applied by `Scheduler::complete`.
#[derive(Debug, Clone)]
pub struct TaskResult {
    pub state: TaskState,
    pub error_message: Option<String>,
    pub pr_url: Option<String>,
    pub usage: Option<UsageMetrics>,
}

impl TaskResult {
    pub fn completed(pr_url: Option<String>, usage: Option<UsageMetrics>) -> Self {
        TaskResult {
            state: TaskState::Completed,
            error_message: None,
            pr_url,
            usage,
        }
    }

    pub fn failed(error_message: impl Into<String>, usage: Option<UsageMetrics>) -> Self {
        TaskResult {
            state: TaskState::Failed,
            error_message: Some(error_message.into()),
            pr_url: None,
            usage,
        }
    }
}

const REPO_URL_MIN_LEN: usize = 10;
const REPO_URL_MAX_LEN: usize = 2048;

/// Repository URLs must look like a hosted git remote: the big three hosts
/// over https or ssh, or any https:// / git@ URL, within sane length bounds.
pub fn validate_repo_url(url: &str) -> bool {
    if url.len() < REPO_URL_MIN_LEN || url.len() > REPO_URL_MAX_LEN {
        return false;
    }

    const PREFIXES: [&str; 9] = [
        "https://github.com/",
        "https://gitlab.com/",
        "https://bitbucket.org/",
        "git@github.com:",
        "git@gitlab.com:",
        "git@bitbucket.org:",
        "ssh://git@github.com/",
        "ssh://git@gitlab.com/",
        "ssh://git@bitbucket.org/",
    ];

    PREFIXES.iter().any(|p| url.starts_with(p))
        || url.starts_with("https://")
        || url.starts_with("git@")
}

const TOKEN_MIN_LEN: usize = 20;
const TOKEN_MAX_LEN: usize = 255;

/// Structural validation of a github token. No network calls; the token is
/// proven (or not) when the agent pushes.
pub fn validate_github_token(token: &str) -> bool {
    if token.len() < TOKEN_MIN_LEN || token.len() > TOKEN_MAX_LEN {
        return false;
    }

    const PREFIXES: [&str; 6] = ["ghp_", "gho_", "ghu_", "ghs_", "ghr_", "github_pat_"];
    if !PREFIXES.iter().any(|p| token.starts_with(p)) {
        return false;
    }

    token.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_')
}
