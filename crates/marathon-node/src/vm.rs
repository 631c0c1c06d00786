//! Micro-VM records: identifiers, guest CIDs, and the socket paths a VM's
//! host-side endpoints live at.

use std::path::{Path, PathBuf};

use marathon_common::crypto::random_bytes;
use marathon_protocol::ids::VmId;

use crate::firecracker::VmProcess;

/// Guest context ids live in `[3, 0xFFFF_FFFC]`: 0-2 are reserved by the
/// vsock addressing scheme and the top values by the hypervisor.
pub const CID_MIN: u32 = 3;
pub const CID_MAX: u32 = 0xFFFF_FFFC;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    Creating,
    Ready,
    Running,
    Stopping,
    Stopped,
    Failed,
}

/// One micro-VM under this node's control. The record owns the hypervisor
/// process; dropping a `Vm` tears the process down.
pub struct Vm {
    pub id: VmId,
    pub cid: u32,
    pub state: VmState,
    pub api_sock_path: PathBuf,
    pub vsock_uds_path: PathBuf,
    pub process: Option<VmProcess>,
}

impl Vm {
    /// Allocate identifiers and paths for a VM that is about to boot.
    /// Socket paths are derived from the VmId's hex form so concurrent VMs
    /// never collide.
    pub fn allocate(runtime_dir: &Path) -> Vm {
        let id = VmId::new(random_bytes());
        let cid = fastrand::u32(CID_MIN..=CID_MAX);

        Vm {
            id,
            cid,
            state: VmState::Creating,
            api_sock_path: runtime_dir.join(format!("vm-{id}.api.sock")),
            vsock_uds_path: runtime_dir.join(format!("vm-{id}.vsock")),
            process: None,
        }
    }

    /// Lightweight copy handed to task runners; the pool keeps the owning
    /// record in its active table.
    pub fn handle(&self) -> VmHandle {
        VmHandle { id: self.id, cid: self.cid }
    }

    /// Kill the hypervisor and remove the socket files.
    pub fn teardown(&mut self) {
        self.state = VmState::Stopping;
        if let Some(process) = self.process.take() {
            process.shutdown();
        }
        std::fs::remove_file(&self.api_sock_path).ok();
        std::fs::remove_file(&self.vsock_uds_path).ok();
        self.state = VmState::Stopped;
    }
}

impl Drop for Vm {
    fn drop(&mut self) {
        if !matches!(self.state, VmState::Stopped) {
            self.teardown();
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct VmHandle {
    pub id: VmId,
    pub cid: u32,
}
