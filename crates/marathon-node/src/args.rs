use std::path::PathBuf;

use clap::Parser;
use marathon_common::Secret;

#[derive(Parser, Debug, Clone)]
#[command(version = "0.1.0", about = "Marathon execution node")]
pub struct Args {
    /// Orchestrator host
    #[clap(
        short = 'o',
        long,
        env = "MARATHON_ORCHESTRATOR_ADDRESS",
        default_value = "127.0.0.1"
    )]
    pub orchestrator_address: String,

    /// Orchestrator port
    #[clap(long, env = "MARATHON_ORCHESTRATOR_PORT", default_value = "8080")]
    pub orchestrator_port: u16,

    /// Total micro-VM slots on this node
    #[clap(long, value_name = "N", env = "MARATHON_TOTAL_VM_SLOTS", default_value = "10")]
    pub total_vm_slots: u32,

    /// How many pre-booted VMs to keep standing by
    #[clap(long, value_name = "N", env = "MARATHON_WARM_POOL_TARGET", default_value = "5")]
    pub warm_pool_target: u32,

    /// Path to the firecracker binary
    #[clap(
        long,
        value_name = "PATH",
        env = "MARATHON_FIRECRACKER_BIN",
        default_value = "/usr/bin/firecracker"
    )]
    pub firecracker_bin: String,

    /// Base memory snapshot VMs are restored from
    #[clap(
        long,
        value_name = "PATH",
        env = "MARATHON_SNAPSHOT_PATH",
        default_value = "/var/lib/marathon/base.snap"
    )]
    pub snapshot_path: String,

    /// Root filesystem image for cold boots
    #[clap(
        long,
        value_name = "PATH",
        env = "MARATHON_ROOTFS_PATH",
        default_value = "/var/lib/marathon/rootfs.ext4"
    )]
    pub rootfs_path: String,

    /// Kernel image for cold boots
    #[clap(
        long,
        value_name = "PATH",
        env = "MARATHON_KERNEL_PATH",
        default_value = "/var/lib/marathon/vmlinux"
    )]
    pub kernel_path: String,

    /// Directory for per-VM sockets
    #[clap(
        long,
        value_name = "PATH",
        env = "MARATHON_RUNTIME_DIR",
        default_value = "/run/marathon"
    )]
    pub runtime_dir: PathBuf,

    /// Well-known guest port the in-VM agent connects on
    #[clap(long, env = "MARATHON_VSOCK_PORT", default_value = "9999")]
    pub vsock_port: u32,

    /// Per-task wall-clock limit
    #[clap(
        long,
        value_name = "MS",
        env = "MARATHON_TASK_TIMEOUT_MS",
        default_value = "600000"
    )]
    pub task_timeout_ms: u64,

    /// Token ceiling handed to the in-VM agent
    #[clap(
        long,
        value_name = "N",
        env = "MARATHON_MAX_TOKENS_PER_TASK",
        default_value = "100000"
    )]
    pub max_tokens_per_task: u64,

    /// How often to heartbeat the orchestrator
    #[clap(
        long,
        value_name = "MS",
        env = "MARATHON_HEARTBEAT_INTERVAL_MS",
        default_value = "5000"
    )]
    pub heartbeat_interval_ms: u64,

    /// How often the warm pool refill ticks
    #[clap(
        long,
        value_name = "MS",
        env = "MARATHON_REFILL_INTERVAL_MS",
        default_value = "2000"
    )]
    pub refill_interval_ms: u64,

    /// Shared key for heartbeat authentication; empty disables auth
    #[clap(long, env = "MARATHON_SHARED_KEY", default_value = "")]
    pub shared_key: String,

    /// CA bundle for TLS to the orchestrator; absent means plaintext TCP
    #[clap(long, value_name = "PATH", env = "MARATHON_TLS_CA_PATH")]
    pub tls_ca_path: Option<String>,

    /// Expected server name on the orchestrator's certificate; defaults to
    /// the orchestrator address
    #[clap(long, value_name = "NAME", env = "MARATHON_TLS_HOSTNAME")]
    pub tls_hostname: Option<String>,

    /// Report this node as draining: finish current work, accept no more
    #[clap(long, env = "MARATHON_NODE_DRAINING", default_value_t = false)]
    pub draining: bool,

    /// Keep quiet and only log errors
    #[clap(short, long, conflicts_with = "verbose", default_value_t = false)]
    pub quiet: bool,

    #[clap(
        short = 'v',
        long,
        conflicts_with = "quiet",
        action = clap::ArgAction::Count,
        help = "Output details about VM and task activity; specify multiple times for more detail"
    )]
    pub verbose: u8,
}

impl Args {
    pub fn shared_key(&self) -> Option<Secret> {
        if self.shared_key.is_empty() {
            None
        } else {
            Some(Secret::new(self.shared_key.clone()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_keys() {
        let args = Args::parse_from(["node"]);

        assert_eq!(args.orchestrator_port, 8080);
        assert_eq!(args.total_vm_slots, 10);
        assert_eq!(args.warm_pool_target, 5);
        assert_eq!(args.vsock_port, 9999);
        assert_eq!(args.task_timeout_ms, 600_000);
        assert_eq!(args.max_tokens_per_task, 100_000);
        assert!(!args.draining);
        assert!(args.shared_key().is_none());
    }
}
