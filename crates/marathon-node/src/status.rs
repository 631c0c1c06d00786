//! Gathering the NodeStatus a heartbeat carries: pool counts from the warm
//! pool, cpu/memory from /proc, disk headroom via statvfs.

use std::path::Path;
use std::sync::Mutex;
use std::time::Instant;

use marathon_protocol::ids::{NodeId, TaskId};
use marathon_protocol::messages::NodeStatus;

use crate::pool::WarmVmPool;

pub struct StatusSampler {
    node_id: NodeId,
    hostname: String,
    started: Instant,
    draining: bool,
    prev_cpu: Mutex<Option<(u64, u64)>>,
}

impl StatusSampler {
    pub fn new(node_id: NodeId, draining: bool) -> Self {
        StatusSampler {
            node_id,
            hostname: read_hostname(),
            started: Instant::now(),
            draining,
            prev_cpu: Mutex::new(None),
        }
    }

    pub fn sample(
        &self,
        pool: &WarmVmPool,
        active_task_ids: Vec<TaskId>,
        last_task_at_ms: Option<u64>,
    ) -> NodeStatus {
        NodeStatus {
            node_id: self.node_id,
            hostname: self.hostname.clone(),
            total_vm_slots: pool.total_slots(),
            active_vms: pool.active_count(),
            warm_vms: pool.warm_count(),
            cpu_usage: self.cpu_usage(),
            memory_usage: memory_usage(),
            disk_available_bytes: disk_available(Path::new("/")),
            healthy: true,
            draining: self.draining,
            uptime_seconds: self.started.elapsed().as_secs(),
            last_task_at_ms,
            active_task_ids,
        }
    }

    /// Busy fraction of all cores since the previous sample. The first call
    /// has no baseline and reports 0.
    fn cpu_usage(&self) -> f32 {
        let Some((busy, total)) = read_proc_stat() else {
            return 0.0;
        };

        let mut prev = self.prev_cpu.lock().unwrap();
        let usage = match *prev {
            Some((prev_busy, prev_total)) if total > prev_total => {
                (busy - prev_busy) as f32 / (total - prev_total) as f32
            }
            _ => 0.0,
        };
        *prev = Some((busy, total));
        usage.clamp(0.0, 1.0)
    }
}

/// First line of /proc/stat: cpu user nice system idle iowait irq softirq ...
/// Everything but idle+iowait counts as busy.
fn read_proc_stat() -> Option<(u64, u64)> {
    let stat = std::fs::read_to_string("/proc/stat").ok()?;
    let line = stat.lines().next()?;

    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .filter_map(|f| f.parse().ok())
        .collect();
    if fields.len() < 5 {
        return None;
    }

    let total: u64 = fields.iter().sum();
    let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
    Some((total - idle, total))
}

/// `1 - MemAvailable/MemTotal` from /proc/meminfo.
fn memory_usage() -> f32 {
    let Ok(meminfo) = std::fs::read_to_string("/proc/meminfo") else {
        return 0.0;
    };

    let read_kb = |key: &str| -> Option<u64> {
        meminfo
            .lines()
            .find(|l| l.starts_with(key))?
            .split_whitespace()
            .nth(1)?
            .parse()
            .ok()
    };

    match (read_kb("MemTotal:"), read_kb("MemAvailable:")) {
        (Some(total), Some(available)) if total > 0 => {
            (1.0 - available as f32 / total as f32).clamp(0.0, 1.0)
        }
        _ => 0.0,
    }
}

fn disk_available(path: &Path) -> u64 {
    use std::os::unix::ffi::OsStrExt;

    let Ok(c_path) = std::ffi::CString::new(path.as_os_str().as_bytes()) else {
        return 0;
    };

    let mut stats: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stats) };
    if rc != 0 {
        return 0;
    }

    stats.f_bavail as u64 * stats.f_frsize as u64
}

fn read_hostname() -> String {
    std::fs::read_to_string("/proc/sys/kernel/hostname")
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{PoolConfig, VmBooter, WarmVmPool};
    use crate::vm::Vm;

    struct NoopBooter;

    impl VmBooter for NoopBooter {
        fn boot(&self, _vm: &mut Vm) -> Result<(), String> {
            Ok(())
        }
    }

    fn pool() -> WarmVmPool {
        WarmVmPool::new(
            PoolConfig {
                total_vm_slots: 8,
                firecracker_bin: String::new(),
                kernel_path: String::new(),
                rootfs_path: String::new(),
                snapshot_path: String::new(),
                runtime_dir: std::env::temp_dir(),
            },
            Box::new(NoopBooter),
        )
    }

    #[test]
    fn sample_reflects_pool_counts() {
        let pool = pool();
        pool.refill_to(3);
        let _held = pool.acquire().unwrap();

        let sampler = StatusSampler::new(NodeId::new([1; 16]), false);
        let status = sampler.sample(&pool, vec![TaskId::new([2; 32])], Some(123));

        assert_eq!(status.total_vm_slots, 8);
        assert_eq!(status.warm_vms, 2);
        assert_eq!(status.active_vms, 1);
        assert_eq!(status.active_task_ids.len(), 1);
        assert_eq!(status.last_task_at_ms, Some(123));
        assert!(status.healthy);
        assert!(!status.draining);
    }

    #[test]
    fn gauges_stay_in_unit_range() {
        let sampler = StatusSampler::new(NodeId::new([1; 16]), false);
        let pool = pool();

        for _ in 0..3 {
            let status = sampler.sample(&pool, Vec::new(), None);
            assert!((0.0..=1.0).contains(&status.cpu_usage));
            assert!((0.0..=1.0).contains(&status.memory_usage));
        }
    }

    #[test]
    fn draining_flag_is_reported() {
        let sampler = StatusSampler::new(NodeId::new([1; 16]), true);
        let status = sampler.sample(&pool(), Vec::new(), None);
        assert!(status.draining);
    }
}
