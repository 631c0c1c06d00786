//!
//! # Node Operating Model
//!
//! - **Pull-based**: The node never listens for the orchestrator. It
//!   heartbeats on an interval and receives execute/cancel commands in the
//!   responses.
//!
//! - **Warm pool**: A background ticker keeps `warm_pool_target` VMs
//!   restored from the base snapshot and ready; a task only ever waits for
//!   the guest agent to pick up its connection.
//!
//! - **One thread per task**: Each execute command gets its own thread that
//!   owns the VM for the duration and relays its vsock traffic upstream.
//!
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::Release;
use std::time::Duration;

use clap::Parser;
use marathon_common::Clock;
use marathon_common::crypto::random_bytes;
use marathon_node::args::Args;
use marathon_node::dispatch::NodeRuntime;
use marathon_node::pool::{FirecrackerBooter, PoolConfig, WarmVmPool, run_refill_loop};
use marathon_node::vsock::VsockHost;
use marathon_protocol::ids::NodeId;
use tracing::{debug, error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{Layer, filter};

/// Global flag that will be set to `false` when all threads should exit.
static KEEP_RUNNING: AtomicBool = AtomicBool::new(true);

fn main() {
    set_ctrlc_handler();

    let args = Args::parse();
    enable_logging(&args);
    debug!("{args:?}");

    if let Err(e) = std::fs::create_dir_all(&args.runtime_dir) {
        error!("creating runtime dir {}: {e}", args.runtime_dir.display());
        std::process::exit(1);
    }

    let node_id = NodeId::new(random_bytes());
    info!("node {node_id} starting");

    let pool_config = PoolConfig {
        total_vm_slots: args.total_vm_slots,
        firecracker_bin: args.firecracker_bin.clone(),
        kernel_path: args.kernel_path.clone(),
        rootfs_path: args.rootfs_path.clone(),
        snapshot_path: args.snapshot_path.clone(),
        runtime_dir: args.runtime_dir.clone(),
    };
    let booter = FirecrackerBooter::new(pool_config.clone());
    let pool = Arc::new(WarmVmPool::new(pool_config, Box::new(booter)));

    let vsock = VsockHost::new();
    let vsock_thread = Arc::clone(&vsock)
        .start(args.vsock_port, &KEEP_RUNNING)
        .unwrap_or_else(|e| {
            error!("binding vsock port {}: {e}", args.vsock_port);
            std::process::exit(1);
        });

    let refill_pool = Arc::clone(&pool);
    let refill_target = args.warm_pool_target;
    let refill_interval = Duration::from_millis(args.refill_interval_ms);
    let refill_thread = std::thread::Builder::new()
        .name("warm-refill".to_string())
        .spawn(move || run_refill_loop(&refill_pool, refill_target, refill_interval, &KEEP_RUNNING))
        .expect("Failed to spawn refill thread");

    let runtime = NodeRuntime::new(node_id, args, Arc::clone(&pool), vsock, Clock::System);
    runtime.run(&KEEP_RUNNING);

    refill_thread.join().unwrap();
    vsock_thread.join().unwrap();
    pool.drain();

    info!("Node finished");
}

fn set_ctrlc_handler() {
    ctrlc::set_handler(|| {
        info!("Received Ctrl-C, exiting...");
        KEEP_RUNNING.store(false, Release);
    })
    .expect("Error setting Ctrl-C handler");
}

fn enable_logging(args: &Args) {
    let library_verbosity = match args.verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2.. => tracing::Level::DEBUG,
    };

    let verbosity = if args.quiet {
        tracing::Level::ERROR
    } else {
        match args.verbose {
            0 => tracing::Level::INFO,
            1 => tracing::Level::DEBUG,
            2.. => tracing::Level::TRACE,
        }
    };

    let filters = filter::Targets::new()
        .with_target("rustls", library_verbosity)
        .with_target("aws_lc_rs", library_verbosity)
        .with_default(verbosity);

    let fmt_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_filter(filters);

    tracing_subscriber::registry().with(fmt_layer).init();
}
