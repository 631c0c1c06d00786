use std::fmt::{Display, Formatter};

use crate::cursor::ParseCursor;
use crate::error::Error;
use crate::wire::{FromWire, ToWire};

/// Lifecycle states of a task. `Completed`, `Failed`, and `Cancelled` are
/// terminal: no transition leaves them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TaskState {
    Unspecified = 0,
    Queued = 1,
    Starting = 2,
    Running = 3,
    Completed = 4,
    Failed = 5,
    Cancelled = 6,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed | TaskState::Cancelled)
    }

    /// The legal transition table. Terminal states are sinks; everything not
    /// listed here is refused.
    pub fn can_transition(&self, next: TaskState) -> bool {
        use TaskState::*;

        match (self, next) {
            (Unspecified, Queued) => true,
            (Queued, Starting) | (Queued, Cancelled) => true,
            (Starting, Running) | (Starting, Failed) | (Starting, Cancelled) => true,
            (Running, Completed) | (Running, Failed) | (Running, Cancelled) => true,
            _ => false,
        }
    }
}

impl TryFrom<u8> for TaskState {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Error> {
        match value {
            0 => Ok(TaskState::Unspecified),
            1 => Ok(TaskState::Queued),
            2 => Ok(TaskState::Starting),
            3 => Ok(TaskState::Running),
            4 => Ok(TaskState::Completed),
            5 => Ok(TaskState::Failed),
            6 => Ok(TaskState::Cancelled),
            other => Err(Error::InvalidTaskState(other)),
        }
    }
}

impl ToWire for TaskState {
    fn wire_size(&self) -> usize {
        1
    }

    fn to_wire(&self, cursor: &mut ParseCursor) -> Result<(), Error> {
        cursor.try_put_u8(*self as u8)
    }
}

impl FromWire for TaskState {
    fn from_wire(cursor: &mut ParseCursor) -> Result<Self, Error> {
        TaskState::try_from(cursor.try_get_u8()?)
    }
}

impl Display for TaskState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TaskState::Unspecified => "unspecified",
            TaskState::Queued => "queued",
            TaskState::Starting => "starting",
            TaskState::Running => "running",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// What a task event is reporting: a lifecycle change, a chunk of agent
/// output, a non-fatal error, or the final (terminal) notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EventType {
    StateChange = 0,
    Output = 1,
    TaskError = 2,
    Complete = 3,
}

impl TryFrom<u8> for EventType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Error> {
        match value {
            0 => Ok(EventType::StateChange),
            1 => Ok(EventType::Output),
            2 => Ok(EventType::TaskError),
            3 => Ok(EventType::Complete),
            other => Err(Error::InvalidEventType(other)),
        }
    }
}

impl ToWire for EventType {
    fn wire_size(&self) -> usize {
        1
    }

    fn to_wire(&self, cursor: &mut ParseCursor) -> Result<(), Error> {
        cursor.try_put_u8(*self as u8)
    }
}

impl FromWire for EventType {
    fn from_wire(cursor: &mut ParseCursor) -> Result<Self, Error> {
        EventType::try_from(cursor.try_get_u8()?)
    }
}
