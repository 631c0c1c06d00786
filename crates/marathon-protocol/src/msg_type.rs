use std::fmt::{Display, Formatter};

use crate::cursor::ParseCursor;
use crate::error::Error;
use crate::wire::{FromWire, ToWire};

/// Every message type Marathon puts on the wire, client-facing, node-facing,
/// and the in-VM transport set. One byte each, carried in the frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MsgType {
    SubmitTask = 0x01,
    GetTask = 0x02,
    CancelTask = 0x03,
    GetUsage = 0x04,
    ListTasks = 0x05,

    TaskEvent = 0x10,
    TaskResponse = 0x11,
    UsageResponse = 0x12,
    ErrorResponse = 0x1f,

    ExecuteTask = 0x20,
    HeartbeatRequest = 0x21,
    HeartbeatResponse = 0x22,
    NodeStatus = 0x23,
    NodeCommand = 0x24,

    VsockReady = 0x30,
    VsockOutput = 0x31,
    VsockMetrics = 0x32,
    VsockComplete = 0x33,
    VsockError = 0x34,
    VsockStart = 0x35,
    VsockCancel = 0x36,
}

impl TryFrom<u8> for MsgType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Error> {
        match value {
            0x01 => Ok(MsgType::SubmitTask),
            0x02 => Ok(MsgType::GetTask),
            0x03 => Ok(MsgType::CancelTask),
            0x04 => Ok(MsgType::GetUsage),
            0x05 => Ok(MsgType::ListTasks),
            0x10 => Ok(MsgType::TaskEvent),
            0x11 => Ok(MsgType::TaskResponse),
            0x12 => Ok(MsgType::UsageResponse),
            0x1f => Ok(MsgType::ErrorResponse),
            0x20 => Ok(MsgType::ExecuteTask),
            0x21 => Ok(MsgType::HeartbeatRequest),
            0x22 => Ok(MsgType::HeartbeatResponse),
            0x23 => Ok(MsgType::NodeStatus),
            0x24 => Ok(MsgType::NodeCommand),
            0x30 => Ok(MsgType::VsockReady),
            0x31 => Ok(MsgType::VsockOutput),
            0x32 => Ok(MsgType::VsockMetrics),
            0x33 => Ok(MsgType::VsockComplete),
            0x34 => Ok(MsgType::VsockError),
            0x35 => Ok(MsgType::VsockStart),
            0x36 => Ok(MsgType::VsockCancel),
            other => Err(Error::InvalidMessageType(other)),
        }
    }
}

impl ToWire for MsgType {
    fn wire_size(&self) -> usize {
        1
    }

    fn to_wire(&self, cursor: &mut ParseCursor) -> Result<(), Error> {
        cursor.try_put_u8(*self as u8)
    }
}

impl FromWire for MsgType {
    fn from_wire(cursor: &mut ParseCursor) -> Result<Self, Error> {
        MsgType::try_from(cursor.try_get_u8()?)
    }
}

impl Display for MsgType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn values_match_the_registry() {
        assert_eq!(MsgType::SubmitTask as u8, 0x01);
        assert_eq!(MsgType::ListTasks as u8, 0x05);
        assert_eq!(MsgType::TaskEvent as u8, 0x10);
        assert_eq!(MsgType::ErrorResponse as u8, 0x1f);
        assert_eq!(MsgType::ExecuteTask as u8, 0x20);
        assert_eq!(MsgType::NodeCommand as u8, 0x24);
        assert_eq!(MsgType::VsockReady as u8, 0x30);
        assert_eq!(MsgType::VsockCancel as u8, 0x36);
    }

    #[test]
    fn try_from_rejects_unknown_types() {
        for value in [0x00u8, 0x06, 0x0f, 0x13, 0x25, 0x2f, 0x37, 0xff] {
            assert!(MsgType::try_from(value).is_err(), "{value:#04x} should be rejected");
        }
    }

    #[test]
    fn try_from_round_trips_known_types() {
        for value in [0x01u8, 0x02, 0x03, 0x04, 0x05, 0x10, 0x11, 0x12, 0x1f, 0x20, 0x21, 0x22,
            0x23, 0x24, 0x30, 0x31, 0x32, 0x33, 0x34, 0x35, 0x36]
        {
            let msg_type = MsgType::try_from(value).unwrap();
            assert_eq!(msg_type as u8, value);
        }
    }
}
