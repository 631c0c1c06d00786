//! Messages exchanged on the orchestrator to node link.

use std::fmt::{Debug, Formatter};

use crate::cursor::ParseCursor;
use crate::error::Error;
use crate::ids::{NodeId, TaskId};
use crate::wire::{FromWire, ToWire, seq_from_wire, seq_to_wire, seq_wire_size};

/// A node's self-reported status, carried in every heartbeat and kept in the
/// orchestrator's registry.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeStatus {
    pub node_id: NodeId,
    pub hostname: String,
    pub total_vm_slots: u32,
    pub active_vms: u32,
    pub warm_vms: u32,
    pub cpu_usage: f32,
    pub memory_usage: f32,
    pub disk_available_bytes: u64,
    pub healthy: bool,
    pub draining: bool,
    pub uptime_seconds: u64,
    pub last_task_at_ms: Option<u64>,
    pub active_task_ids: Vec<TaskId>,
}

impl NodeStatus {
    /// Slots not currently occupied by a running VM.
    pub fn available_slots(&self) -> u32 {
        self.total_vm_slots.saturating_sub(self.active_vms)
    }
}

impl ToWire for NodeStatus {
    fn wire_size(&self) -> usize {
        self.node_id.wire_size()
            + self.hostname.wire_size()
            + 4 * 3
            + 4 * 2
            + 8
            + 1
            + 1
            + 8
            + self.last_task_at_ms.wire_size()
            + seq_wire_size(&self.active_task_ids)
    }

    fn to_wire(&self, cursor: &mut ParseCursor) -> Result<(), Error> {
        self.node_id.to_wire(cursor)?;
        self.hostname.to_wire(cursor)?;
        cursor.try_put_u32(self.total_vm_slots)?;
        cursor.try_put_u32(self.active_vms)?;
        cursor.try_put_u32(self.warm_vms)?;
        self.cpu_usage.to_wire(cursor)?;
        self.memory_usage.to_wire(cursor)?;
        cursor.try_put_u64(self.disk_available_bytes)?;
        self.healthy.to_wire(cursor)?;
        self.draining.to_wire(cursor)?;
        cursor.try_put_u64(self.uptime_seconds)?;
        self.last_task_at_ms.to_wire(cursor)?;
        seq_to_wire(&self.active_task_ids, cursor)
    }
}

impl FromWire for NodeStatus {
    fn from_wire(cursor: &mut ParseCursor) -> Result<Self, Error> {
        Ok(NodeStatus {
            node_id: NodeId::from_wire(cursor)?,
            hostname: String::from_wire(cursor)?,
            total_vm_slots: cursor.try_get_u32()?,
            active_vms: cursor.try_get_u32()?,
            warm_vms: cursor.try_get_u32()?,
            cpu_usage: f32::from_wire(cursor)?,
            memory_usage: f32::from_wire(cursor)?,
            disk_available_bytes: cursor.try_get_u64()?,
            healthy: bool::from_wire(cursor)?,
            draining: bool::from_wire(cursor)?,
            uptime_seconds: cursor.try_get_u64()?,
            last_task_at_ms: Option::from_wire(cursor)?,
            active_task_ids: seq_from_wire(cursor)?,
        })
    }
}

/// HMAC-SHA256 tag authenticating a heartbeat.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct AuthTag(pub [u8; 32]);

impl Debug for AuthTag {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "AuthTag(..)")
    }
}

impl ToWire for AuthTag {
    fn wire_size(&self) -> usize {
        32
    }

    fn to_wire(&self, cursor: &mut ParseCursor) -> Result<(), Error> {
        cursor.try_put_fixed(&self.0)
    }
}

impl FromWire for AuthTag {
    fn from_wire(cursor: &mut ParseCursor) -> Result<Self, Error> {
        Ok(AuthTag(cursor.try_get_fixed()?))
    }
}

/// Periodic node report. When the orchestrator is configured with a shared
/// key, `auth` must be the HMAC over `node_id || timestamp_ms` and
/// `timestamp_ms` must be within the accepted skew window.
#[derive(Debug, Clone, PartialEq)]
pub struct HeartbeatRequest {
    pub status: NodeStatus,
    pub timestamp_ms: u64,
    pub auth: Option<AuthTag>,
}

impl ToWire for HeartbeatRequest {
    fn wire_size(&self) -> usize {
        self.status.wire_size() + 8 + self.auth.wire_size()
    }

    fn to_wire(&self, cursor: &mut ParseCursor) -> Result<(), Error> {
        self.status.to_wire(cursor)?;
        cursor.try_put_u64(self.timestamp_ms)?;
        self.auth.to_wire(cursor)
    }
}

impl FromWire for HeartbeatRequest {
    fn from_wire(cursor: &mut ParseCursor) -> Result<Self, Error> {
        Ok(HeartbeatRequest {
            status: NodeStatus::from_wire(cursor)?,
            timestamp_ms: cursor.try_get_u64()?,
            auth: Option::from_wire(cursor)?,
        })
    }
}

/// Work queued for a node, delivered inside its heartbeat response in the
/// order the scheduler produced it.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeCommand {
    Execute(ExecuteTaskRequest),
    Cancel(TaskId),
}

impl NodeCommand {
    const TAG_EXECUTE: u8 = 0x00;
    const TAG_CANCEL: u8 = 0x01;
}

impl ToWire for NodeCommand {
    fn wire_size(&self) -> usize {
        1 + match self {
            NodeCommand::Execute(req) => req.wire_size(),
            NodeCommand::Cancel(task_id) => task_id.wire_size(),
        }
    }

    fn to_wire(&self, cursor: &mut ParseCursor) -> Result<(), Error> {
        match self {
            NodeCommand::Execute(req) => {
                cursor.try_put_u8(Self::TAG_EXECUTE)?;
                req.to_wire(cursor)
            }
            NodeCommand::Cancel(task_id) => {
                cursor.try_put_u8(Self::TAG_CANCEL)?;
                task_id.to_wire(cursor)
            }
        }
    }
}

impl FromWire for NodeCommand {
    fn from_wire(cursor: &mut ParseCursor) -> Result<Self, Error> {
        match cursor.try_get_u8()? {
            Self::TAG_EXECUTE => Ok(NodeCommand::Execute(ExecuteTaskRequest::from_wire(cursor)?)),
            Self::TAG_CANCEL => Ok(NodeCommand::Cancel(TaskId::from_wire(cursor)?)),
            other => Err(Error::InvalidCommandTag(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct HeartbeatResponse {
    pub commands: Vec<NodeCommand>,
}

impl ToWire for HeartbeatResponse {
    fn wire_size(&self) -> usize {
        seq_wire_size(&self.commands)
    }

    fn to_wire(&self, cursor: &mut ParseCursor) -> Result<(), Error> {
        seq_to_wire(&self.commands, cursor)
    }
}

impl FromWire for HeartbeatResponse {
    fn from_wire(cursor: &mut ParseCursor) -> Result<Self, Error> {
        Ok(HeartbeatResponse {
            commands: seq_from_wire(cursor)?,
        })
    }
}

/// Everything a node needs to run one task. The orchestrator injects the
/// anthropic key from its own configuration and the github token from the
/// submit; treat encoded copies as sensitive and zero them after the send.
#[derive(Clone, PartialEq, Eq)]
pub struct ExecuteTaskRequest {
    pub task_id: TaskId,
    pub repo_url: String,
    pub branch: String,
    pub prompt: String,
    pub create_pr: bool,
    pub pr_title: Option<String>,
    pub pr_body: Option<String>,
    pub github_token: Option<String>,
    pub anthropic_api_key: Option<String>,
}

impl ToWire for ExecuteTaskRequest {
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
        self.anthropic_api_key.to_wire(cursor)
    }
}

impl FromWire for ExecuteTaskRequest {
    fn from_wire(cursor: &mut ParseCursor) -> Result<Self, Error> {
        Ok(ExecuteTaskRequest {
            task_id: TaskId::from_wire(cursor)?,
            repo_url: String::from_wire(cursor)?,
            branch: String::from_wire(cursor)?,
            prompt: String::from_wire(cursor)?,
            create_pr: bool::from_wire(cursor)?,
            pr_title: Option::from_wire(cursor)?,
            pr_body: Option::from_wire(cursor)?,
            github_token: Option::from_wire(cursor)?,
            anthropic_api_key: Option::from_wire(cursor)?,
        })
    }
}

impl Debug for ExecuteTaskRequest {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecuteTaskRequest")
            .field("task_id", &self.task_id)
            .field("repo_url", &self.repo_url)
            .field("branch", &self.branch)
            .field("create_pr", &self.create_pr)
            .field("github_token", &self.github_token.as_ref().map(|_| "<redacted>"))
            .field("anthropic_api_key", &self.anthropic_api_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::decode_exact;

    fn sample_status() -> NodeStatus {
        NodeStatus {
            node_id: NodeId::new([0x42; 16]),
            hostname: "node-01".to_string(),
            total_vm_slots: 10,
            active_vms: 3,
            warm_vms: 5,
            cpu_usage: 0.5,
            memory_usage: 0.4,
            disk_available_bytes: 120 * 1024 * 1024 * 1024,
            healthy: true,
            draining: false,
            uptime_seconds: 86_400,
            last_task_at_ms: Some(1_700_000_000_000),
            active_task_ids: vec![TaskId::new([1u8; 32]), TaskId::new([2u8; 32])],
        }
    }

    fn sample_execute() -> ExecuteTaskRequest {
        ExecuteTaskRequest {
            task_id: TaskId::new([7u8; 32]),
            repo_url: "https://github.com/test/repo".to_string(),
            branch: "main".to_string(),
            prompt: "Fix the bug".to_string(),
            create_pr: true,
            pr_title: Some("Fix bug".to_string()),
            pr_body: None,
            github_token: Some("ghp_xxx".to_string()),
            anthropic_api_key: Some("sk-ant-xxx".to_string()),
        }
    }

    #[test]
    fn node_status_round_trip() {
        let status = sample_status();
        let mut bytes = status.as_bytes().unwrap();
        let decoded = decode_exact::<NodeStatus>(&mut bytes).unwrap();
        assert_eq!(decoded, status);
        assert_eq!(decoded.available_slots(), 7);
    }

    #[test]
    fn available_slots_never_underflows() {
        let mut status = sample_status();
        status.total_vm_slots = 2;
        status.active_vms = 5;
        assert_eq!(status.available_slots(), 0);
    }

    #[test]
    fn heartbeat_round_trip() {
        let request = HeartbeatRequest {
            status: sample_status(),
            timestamp_ms: 1_712_000_000_000,
            auth: Some(AuthTag([0xaa; 32])),
        };

        let mut bytes = request.as_bytes().unwrap();
        let decoded = decode_exact::<HeartbeatRequest>(&mut bytes).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn heartbeat_response_preserves_command_order() {
        let response = HeartbeatResponse {
            commands: vec![
                NodeCommand::Execute(sample_execute()),
                NodeCommand::Cancel(TaskId::new([9u8; 32])),
                NodeCommand::Execute(sample_execute()),
            ],
        };

        let mut bytes = response.as_bytes().unwrap();
        let decoded = decode_exact::<HeartbeatResponse>(&mut bytes).unwrap();
        assert_eq!(decoded, response);
        assert!(matches!(decoded.commands[1], NodeCommand::Cancel(_)));
    }

    #[test]
    fn unknown_command_tag_rejected() {
        let mut bytes = vec![0, 0, 0, 1, 0x7f];
        assert!(matches!(
            decode_exact::<HeartbeatResponse>(&mut bytes),
            Err(Error::InvalidCommandTag(0x7f))
        ));
    }

    #[test]
    fn execute_round_trip_and_redaction() {
        let request = sample_execute();
        let mut bytes = request.as_bytes().unwrap();
        let decoded = decode_exact::<ExecuteTaskRequest>(&mut bytes).unwrap();
        assert_eq!(decoded, request);

        let debug = format!("{request:?}");
        assert!(!debug.contains("ghp_xxx"));
        assert!(!debug.contains("sk-ant"));
    }
}
