//! Messages exchanged between a node and the agent inside one of its VMs,
//! over the VM-host datagram socket transport. Framing is identical to the
//! TCP links.

use std::fmt::{Debug, Formatter};

use crate::cursor::ParseCursor;
use crate::error::Error;
use crate::ids::TaskId;
use crate::usage::UsageMetrics;
use crate::wire::{FromWire, ToWire};

/// Sent by the agent once it has connected to the host: this VM is ready to
/// accept a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VsockReady {
    pub agent_version: String,
}

impl ToWire for VsockReady {
    fn wire_size(&self) -> usize {
        self.agent_version.wire_size()
    }

    fn to_wire(&self, cursor: &mut ParseCursor) -> Result<(), Error> {
        self.agent_version.to_wire(cursor)
    }
}

impl FromWire for VsockReady {
    fn from_wire(cursor: &mut ParseCursor) -> Result<Self, Error> {
        Ok(VsockReady {
            agent_version: String::from_wire(cursor)?,
        })
    }
}

/// Which stream a chunk of agent output came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OutputStream {
    Stdout = 0,
    Stderr = 1,
}

impl ToWire for OutputStream {
    fn wire_size(&self) -> usize {
        1
    }

    fn to_wire(&self, cursor: &mut ParseCursor) -> Result<(), Error> {
        cursor.try_put_u8(*self as u8)
    }
}

impl FromWire for OutputStream {
    fn from_wire(cursor: &mut ParseCursor) -> Result<Self, Error> {
        match cursor.try_get_u8()? {
            0 => Ok(OutputStream::Stdout),
            1 => Ok(OutputStream::Stderr),
            other => Err(Error::InvalidStreamTag(other)),
        }
    }
}

/// A chunk of agent output, relayed to subscribed clients as it arrives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VsockOutput {
    pub task_id: TaskId,
    pub stream: OutputStream,
    pub data: Vec<u8>,
}

impl ToWire for VsockOutput {
    fn wire_size(&self) -> usize {
        self.task_id.wire_size() + self.stream.wire_size() + self.data.wire_size()
    }

    fn to_wire(&self, cursor: &mut ParseCursor) -> Result<(), Error> {
        self.task_id.to_wire(cursor)?;
        self.stream.to_wire(cursor)?;
        self.data.to_wire(cursor)
    }
}

impl FromWire for VsockOutput {
    fn from_wire(cursor: &mut ParseCursor) -> Result<Self, Error> {
        Ok(VsockOutput {
            task_id: TaskId::from_wire(cursor)?,
            stream: OutputStream::from_wire(cursor)?,
            data: Vec::from_wire(cursor)?,
        })
    }
}

/// Incremental usage counters. Deltas, folded into the task's accumulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VsockMetrics {
    pub task_id: TaskId,
    pub delta: UsageMetrics,
}

impl ToWire for VsockMetrics {
    fn wire_size(&self) -> usize {
        self.task_id.wire_size() + self.delta.wire_size()
    }

    fn to_wire(&self, cursor: &mut ParseCursor) -> Result<(), Error> {
        self.task_id.to_wire(cursor)?;
        self.delta.to_wire(cursor)
    }
}

impl FromWire for VsockMetrics {
    fn from_wire(cursor: &mut ParseCursor) -> Result<Self, Error> {
        Ok(VsockMetrics {
            task_id: TaskId::from_wire(cursor)?,
            delta: UsageMetrics::from_wire(cursor)?,
        })
    }
}

/// Final report for a task run: success or failure, the pull-request URL if
/// one was opened, and the agent's final usage totals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VsockComplete {
    pub task_id: TaskId,
    pub success: bool,
    pub error_message: Option<String>,
    pub pr_url: Option<String>,
    pub usage: UsageMetrics,
}

impl ToWire for VsockComplete {
    fn wire_size(&self) -> usize {
        self.task_id.wire_size()
            + self.success.wire_size()
            + self.error_message.wire_size()
            + self.pr_url.wire_size()
            + self.usage.wire_size()
    }

    fn to_wire(&self, cursor: &mut ParseCursor) -> Result<(), Error> {
        self.task_id.to_wire(cursor)?;
        self.success.to_wire(cursor)?;
        self.error_message.to_wire(cursor)?;
        self.pr_url.to_wire(cursor)?;
        self.usage.to_wire(cursor)
    }
}

impl FromWire for VsockComplete {
    fn from_wire(cursor: &mut ParseCursor) -> Result<Self, Error> {
        Ok(VsockComplete {
            task_id: TaskId::from_wire(cursor)?,
            success: bool::from_wire(cursor)?,
            error_message: Option::from_wire(cursor)?,
            pr_url: Option::from_wire(cursor)?,
            usage: UsageMetrics::from_wire(cursor)?,
        })
    }
}

/// A fatal error outside the normal completion path: the VM could not start
/// the run, the run timed out, or the agent process died.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VsockError {
    pub task_id: TaskId,
    pub message: String,
}

impl ToWire for VsockError {
    fn wire_size(&self) -> usize {
        self.task_id.wire_size() + self.message.wire_size()
    }

    fn to_wire(&self, cursor: &mut ParseCursor) -> Result<(), Error> {
        self.task_id.to_wire(cursor)?;
        self.message.to_wire(cursor)
    }
}

impl FromWire for VsockError {
    fn from_wire(cursor: &mut ParseCursor) -> Result<Self, Error> {
        Ok(VsockError {
            task_id: TaskId::from_wire(cursor)?,
            message: String::from_wire(cursor)?,
        })
    }
}

/// Start a task inside the VM. The node adds its own execution limits on top
/// of what the orchestrator forwarded.
#[derive(Clone, PartialEq, Eq)]
pub struct VsockStart {
    pub task_id: TaskId,
    pub repo_url: String,
    pub branch: String,
    pub prompt: String,
    pub create_pr: bool,
    pub pr_title: Option<String>,
    pub pr_body: Option<String>,
    pub github_token: Option<String>,
    pub anthropic_api_key: Option<String>,
    pub timeout_ms: u64,
    pub max_tokens: u64,
}

impl ToWire for VsockStart {
    fn wire_size(&self) -> usize {
        self.task_id.wire_size()
            + self.repo_url.wire_size()
            + self.branch.wire_size()
            + self.prompt.wire_size()
            + self.create_pr.wire_size()
            + self.pr_title.wire_size()
            + self.pr_body.wire_size()
            + self.github_token.wire_size()
            + self.anthropic_api_key.wire_size()
            + 16
    }

    fn to_wire(&self, cursor: &mut ParseCursor) -> Result<(), Error> {
        self.task_id.to_wire(cursor)?;
        self.repo_url.to_wire(cursor)?;
        self.branch.to_wire(cursor)?;
        self.prompt.to_wire(cursor)?;
        self.create_pr.to_wire(cursor)?;
        self.pr_title.to_wire(cursor)?;
        self.pr_body.to_wire(cursor)?;
        self.github_token.to_wire(cursor)?;
        self.anthropic_api_key.to_wire(cursor)?;
        cursor.try_put_u64(self.timeout_ms)?;
        cursor.try_put_u64(self.max_tokens)
    }
}

impl FromWire for VsockStart {
    fn from_wire(cursor: &mut ParseCursor) -> Result<Self, Error> {
        Ok(VsockStart {
            task_id: TaskId::from_wire(cursor)?,
            repo_url: String::from_wire(cursor)?,
            branch: String::from_wire(cursor)?,
            prompt: String::from_wire(cursor)?,
            create_pr: bool::from_wire(cursor)?,
            pr_title: Option::from_wire(cursor)?,
            pr_body: Option::from_wire(cursor)?,
            github_token: Option::from_wire(cursor)?,
            anthropic_api_key: Option::from_wire(cursor)?,
            timeout_ms: cursor.try_get_u64()?,
            max_tokens: cursor.try_get_u64()?,
        })
    }
}

impl Debug for VsockStart {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VsockStart")
            .field("task_id", &self.task_id)
            .field("repo_url", &self.repo_url)
            .field("branch", &self.branch)
            .field("create_pr", &self.create_pr)
            .field("timeout_ms", &self.timeout_ms)
            .field("max_tokens", &self.max_tokens)
            .field("github_token", &self.github_token.as_ref().map(|_| "<redacted>"))
            .field("anthropic_api_key", &self.anthropic_api_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Cooperative cancellation: the agent kills its subprocess and exits the
/// run loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VsockCancel {
    pub task_id: TaskId,
}

impl ToWire for VsockCancel {
    fn wire_size(&self) -> usize {
        self.task_id.wire_size()
    }

    fn to_wire(&self, cursor: &mut ParseCursor) -> Result<(), Error> {
        self.task_id.to_wire(cursor)
    }
}

impl FromWire for VsockCancel {
    fn from_wire(cursor: &mut ParseCursor) -> Result<Self, Error> {
        Ok(VsockCancel {
            task_id: TaskId::from_wire(cursor)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::decode_exact;

    fn round_trip<T: ToWire + FromWire + PartialEq + Debug>(value: T) {
        let mut bytes = value.as_bytes().unwrap();
        let decoded = decode_exact::<T>(&mut bytes).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn ready_and_cancel_round_trip() {
        round_trip(VsockReady {
            agent_version: "0.1.0".to_string(),
        });
        round_trip(VsockCancel {
            task_id: TaskId::new([5u8; 32]),
        });
    }

    #[test]
    fn output_round_trip_both_streams() {
        for stream in [OutputStream::Stdout, OutputStream::Stderr] {
            round_trip(VsockOutput {
                task_id: TaskId::new([1u8; 32]),
                stream,
                data: b"$ cargo test\nrunning 12 tests\n".to_vec(),
            });
        }
    }

    #[test]
    fn bad_stream_tag_rejected() {
        let good = VsockOutput {
            task_id: TaskId::new([1u8; 32]),
            stream: OutputStream::Stdout,
            data: vec![],
        };
        let mut bytes = good.as_bytes().unwrap();
        bytes[32] = 9;

        assert!(matches!(
            decode_exact::<VsockOutput>(&mut bytes),
            Err(Error::InvalidStreamTag(9))
        ));
    }

    #[test]
    fn metrics_and_complete_round_trip() {
        let usage = UsageMetrics {
            compute_time_ms: 61_000,
            input_tokens: 1000,
            output_tokens: 2000,
            cache_read_tokens: 300,
            cache_write_tokens: 40,
            tool_calls: 5,
        };

        round_trip(VsockMetrics {
            task_id: TaskId::new([2u8; 32]),
            delta: usage,
        });

        round_trip(VsockComplete {
            task_id: TaskId::new([2u8; 32]),
            success: true,
            error_message: None,
            pr_url: Some("https://github.com/test/repo/pull/3".to_string()),
            usage,
        });

        round_trip(VsockError {
            task_id: TaskId::new([2u8; 32]),
            message: "timeout".to_string(),
        });
    }

    #[test]
    fn start_round_trip_and_redaction() {
        let start = VsockStart {
            task_id: TaskId::new([6u8; 32]),
            repo_url: "https://github.com/test/repo".to_string(),
            branch: "main".to_string(),
            prompt: "Add a test for the scheduler".to_string(),
            create_pr: true,
            pr_title: Some("Add scheduler test".to_string()),
            pr_body: Some("see prompt".to_string()),
            github_token: Some("ghp_secret".to_string()),
            anthropic_api_key: Some("sk-ant-secret".to_string()),
            timeout_ms: 600_000,
            max_tokens: 100_000,
        };

        round_trip(start.clone());

        let debug = format!("{start:?}");
        assert!(!debug.contains("secret"));
    }
}
