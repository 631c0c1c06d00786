// The protocol crate uses only safe Rust.
#![forbid(unsafe_code)]

pub mod cursor;
pub mod error;
pub mod frame;
pub mod ids;
pub mod messages;
pub mod msg_type;
pub mod state;
pub mod usage;
pub mod wire;

// Re-export commonly used types
pub use error::Error;
pub use frame::{Frame, FrameHeader};
pub use ids::{ClientId, NodeId, TaskId, VmId};
pub use msg_type::MsgType;
pub use state::{EventType, TaskState};
pub use usage::UsageMetrics;
pub use wire::{FromWire, ToWire, decode_exact};
