//! The warm-VM pool: pre-booted VMs waiting for work, plus the active set.
//!
//! One mutex guards both collections. Booting a VM takes real time, so the
//! refill path boots outside the lock and only re-checks slot accounting
//! when inserting the finished VM.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use marathon_protocol::ids::VmId;
use tracing::{debug, info, warn};

use crate::firecracker::VmProcess;
use crate::vm::{Vm, VmHandle, VmState};

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub total_vm_slots: u32,
    pub firecracker_bin: String,
    pub kernel_path: String,
    pub rootfs_path: String,
    pub snapshot_path: String,
    pub runtime_dir: PathBuf,
}

/// Boots VMs for the pool. A trait seam so pool tests run without a
/// hypervisor on the machine.
pub trait VmBooter: Send + Sync {
    fn boot(&self, vm: &mut Vm) -> Result<(), String>;
}

/// The production booter: restore from the base snapshot, fall back to a
/// cold boot when the restore fails.
pub struct FirecrackerBooter {
    config: PoolConfig,
}

impl FirecrackerBooter {
    pub fn new(config: PoolConfig) -> Self {
        Self { config }
    }
}

impl VmBooter for FirecrackerBooter {
    fn boot(&self, vm: &mut Vm) -> Result<(), String> {
        let process = VmProcess::launch(&self.config.firecracker_bin, &vm.api_sock_path)
            .map_err(|e| e.to_string())?;

        match process.restore_snapshot(&self.config.snapshot_path) {
            Ok(()) => {
                vm.process = Some(process);
                return Ok(());
            }
            Err(e) => {
                debug!("snapshot restore for vm {} failed: {e}; cold booting", vm.id);
            }
        }

        process
            .configure_cold_boot(
                &self.config.kernel_path,
                &self.config.rootfs_path,
                vm.cid,
                &vm.vsock_uds_path,
            )
            .and_then(|()| process.start_instance())
            .map_err(|e| e.to_string())?;

        vm.process = Some(process);
        Ok(())
    }
}

struct PoolState {
    warm: VecDeque<Vm>,
    active: HashMap<VmId, Vm>,
}

pub struct WarmVmPool {
    state: Mutex<PoolState>,
    booter: Box<dyn VmBooter>,
    config: PoolConfig,
}

impl WarmVmPool {
    pub fn new(config: PoolConfig, booter: Box<dyn VmBooter>) -> Self {
        WarmVmPool {
            state: Mutex::new(PoolState {
                warm: VecDeque::new(),
                active: HashMap::new(),
            }),
            booter,
            config,
        }
    }

    /// Top the warm list up to `target`, bounded by the node's slot count.
    /// A VM that fails both the restore and the cold boot stops the refill
    /// for this tick; the next tick retries.
    pub fn refill_to(&self, target: u32) {
        loop {
            {
                let state = self.state.lock().unwrap();
                let in_use = (state.warm.len() + state.active.len()) as u32;
                if state.warm.len() as u32 >= target || in_use >= self.config.total_vm_slots {
                    return;
                }
            }

            // Boot outside the lock; restores take tens of milliseconds and
            // cold boots far longer.
            let mut vm = Vm::allocate(&self.config.runtime_dir);
            match self.booter.boot(&mut vm) {
                Ok(()) => vm.state = VmState::Ready,
                Err(e) => {
                    warn!("warm refill stopped: vm {} failed to boot: {e}", vm.id);
                    vm.state = VmState::Failed;
                    vm.teardown();
                    return;
                }
            }

            let mut state = self.state.lock().unwrap();
            let in_use = (state.warm.len() + state.active.len()) as u32;
            if in_use >= self.config.total_vm_slots {
                // An acquire/release race filled the slots while we booted.
                drop(state);
                info!("discarding freshly warmed vm {}: slots filled meanwhile", vm.id);
                vm.teardown();
                return;
            }

            debug!("vm {} warmed (cid {})", vm.id, vm.cid);
            state.warm.push_back(vm);
        }
    }

    /// Take a warm VM for a task. Returns None when the warm list is empty.
    pub fn acquire(&self) -> Option<VmHandle> {
        let mut state = self.state.lock().unwrap();
        let mut vm = state.warm.pop_front()?;

        vm.state = VmState::Running;
        let handle = vm.handle();
        state.active.insert(vm.id, vm);

        debug!("vm {} acquired", handle.id);
        Some(handle)
    }

    /// Return a VM after its task. The instance is torn down rather than
    /// reused; re-warming from the base snapshot is cheap and leaves no
    /// state behind from the previous task.
    pub fn release(&self, vm_id: &VmId) {
        let vm = {
            let mut state = self.state.lock().unwrap();
            state.active.remove(vm_id)
        };

        match vm {
            Some(mut vm) => {
                vm.teardown();
                debug!("vm {vm_id} released and torn down");
            }
            None => warn!("release of unknown vm {vm_id}"),
        }
    }

    pub fn warm_count(&self) -> u32 {
        self.state.lock().unwrap().warm.len() as u32
    }

    pub fn active_count(&self) -> u32 {
        self.state.lock().unwrap().active.len() as u32
    }

    pub fn total_count(&self) -> u32 {
        let state = self.state.lock().unwrap();
        (state.warm.len() + state.active.len()) as u32
    }

    pub fn total_slots(&self) -> u32 {
        self.config.total_vm_slots
    }

    pub fn active_cid(&self, vm_id: &VmId) -> Option<u32> {
        let state = self.state.lock().unwrap();
        state.active.get(vm_id).map(|vm| vm.cid)
    }

    /// Tear down everything; used on shutdown.
    pub fn drain(&self) {
        let mut state = self.state.lock().unwrap();
        for mut vm in state.warm.drain(..) {
            vm.teardown();
        }
        for (_, mut vm) in state.active.drain() {
            vm.teardown();
        }
    }
}

/// Periodic refill driver; returns when `keep_running` goes false.
pub fn run_refill_loop(
    pool: &WarmVmPool,
    target: u32,
    interval: Duration,
    keep_running: &std::sync::atomic::AtomicBool,
) {
    use std::sync::atomic::Ordering::Relaxed;

    while keep_running.load(Relaxed) {
        pool.refill_to(target);
        std::thread::sleep(interval);
    }
}
