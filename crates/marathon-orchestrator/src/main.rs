//!
//! # Orchestrator Operating Model
//!
//! - **Thread-per-connection**: A non-blocking accept loop hands each client
//!   or node connection to its own reader thread, paired with a writer
//!   thread draining that connection's bounded outbound queue.
//!
//! - **One scheduler lock**: The task table and FIFO live behind a single
//!   mutex; the node registry behind another. Critical sections are bounded
//!   and do no I/O.
//!
//! - **Pull-based dispatch**: Nodes receive work only inside heartbeat
//!   responses. The scheduler never opens connections to nodes.
//!
use std::net::TcpListener;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::{Relaxed, Release};
use std::time::Duration;

use clap::Parser;
use marathon_common::Clock;
use marathon_common::tls::load_server_config;
use marathon_orchestrator::args::Args;
use marathon_orchestrator::dispatch::Dispatcher;
use marathon_orchestrator::registry::NodeRegistry;
use marathon_orchestrator::scheduler::{NodeSelector, Scheduler};
use marathon_orchestrator::storage::MemoryStore;
use socket2::{Domain, Socket, Type};
use tracing::{debug, error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{Layer, filter};

/// Global flag that will be set to `false` when all threads should exit.
static KEEP_RUNNING: AtomicBool = AtomicBool::new(true);

struct RegistrySelector(Arc<NodeRegistry>);

impl NodeSelector for RegistrySelector {
    fn select_node(&self) -> Option<marathon_protocol::ids::NodeId> {
        self.0.select_node()
    }
}

fn main() {
    set_ctrlc_handler();

    let args = Args::parse();
    enable_logging(&args);
    debug!("{args:?}");

    let clock = Clock::System;
    let store = Arc::new(MemoryStore::new());
    let registry = Arc::new(NodeRegistry::new());

    let scheduler = Arc::new(Scheduler::new(
        Arc::new(RegistrySelector(Arc::clone(&registry))),
        store.clone(),
        clock.clone(),
    ));

    let dispatcher = Arc::new(Dispatcher::new(
        scheduler,
        registry,
        store.clone(),
        store,
        clock,
        args.anthropic_api_key(),
        args.shared_key(),
    ));

    if args.shared_key().is_none() {
        info!("heartbeat authentication is disabled (no shared key configured)");
    }

    let tls = args.tls_paths().map(|(cert, key)| {
        load_server_config(cert, key).unwrap_or_else(|e| {
            error!("loading TLS material: {e}");
            std::process::exit(1);
        })
    });

    if tls.is_some() {
        info!("TLS enabled on the client link");
    }

    let listener = bind_listener(&args).unwrap_or_else(|e| {
        error!("binding {}: {e}", args.listen_socket_addr());
        std::process::exit(1);
    });
    info!("listening on {}", args.listen_socket_addr());

    let mut threads = Vec::new();
    threads.push(start_prune_thread(&args, Arc::clone(&dispatcher)));
    threads.push(start_metrics_thread(&args, Arc::clone(&dispatcher)));

    if let Err(e) = dispatcher.serve(listener, tls, &KEEP_RUNNING) {
        error!("accept loop failed: {e}");
    }

    for thread in threads {
        thread.join().unwrap();
    }

    info!("Orchestrator finished");
}

fn bind_listener(args: &Args) -> std::io::Result<TcpListener> {
    let sock_addr = args.listen_socket_addr();
    let socket = Socket::new(Domain::for_address(sock_addr), Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    socket.bind(&sock_addr.into())?;
    socket.listen(128)?;
    Ok(socket.into())
}

fn start_prune_thread(args: &Args, dispatcher: Arc<Dispatcher>) -> std::thread::JoinHandle<()> {
    let interval = Duration::from_millis(args.heartbeat_interval_ms.max(1000));
    let timeout_ms = args.node_timeout_ms;

    std::thread::Builder::new()
        .name("node-prune".to_string())
        .spawn(move || {
            while KEEP_RUNNING.load(Relaxed) {
                std::thread::sleep(interval);
                dispatcher.prune_dead_nodes(timeout_ms);
            }
        })
        .expect("Failed to spawn prune thread")
}

fn start_metrics_thread(args: &Args, dispatcher: Arc<Dispatcher>) -> std::thread::JoinHandle<()> {
    let interval = Duration::from_secs(args.metrics_interval.max(1));

    std::thread::Builder::new()
        .name("metrics-report".to_string())
        .spawn(move || {
            while KEEP_RUNNING.load(Relaxed) {
                std::thread::sleep(interval);
                let snapshot = dispatcher.metrics.snapshot();
                match serde_json::to_string(&snapshot) {
                    Ok(json) => info!("metrics {json}"),
                    Err(e) => debug!("serializing metrics: {e}"),
                }
            }
        })
        .expect("Failed to spawn metrics thread")
}

fn set_ctrlc_handler() {
    ctrlc::set_handler(|| {
        info!("Received Ctrl-C, exiting...");
        KEEP_RUNNING.store(false, Release);
    })
    .expect("Error setting Ctrl-C handler");
}

fn enable_logging(args: &Args) {
    // The TLS and crypto crates are chatty; "normal" level for them is WARN
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
