//! The in-VM agent: waits for work from the host, runs it, streams results.
//!
//! Lifecycle per VM: connect to the host over vsock, announce `vsock_ready`,
//! then serve `vsock_start` commands until the VM is torn down. Cancellation
//! arrives as `vsock_cancel` and kills the running subprocess.

mod args;
mod runner;
mod transport;

use std::sync::Arc;
use std::sync::atomic::AtomicI32;
use std::time::Duration;

use clap::Parser;
use marathon_protocol::messages::{VsockCancel, VsockStart};
use marathon_protocol::wire::decode_exact;
use marathon_protocol::MsgType;
use tracing::{debug, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{Layer, filter};
use zeroize::Zeroize;

use crate::args::Args;
use crate::runner::{ChildPid, kill_child};
use crate::transport::HostConn;

fn main() {
    let args = Args::parse();
    enable_logging(&args);

    info!("marathon agent {} starting", env!("CARGO_PKG_VERSION"));

    // The host may not be listening yet when the VM resumes; retry forever.
    let mut backoff = Duration::from_millis(200);
    loop {
        match transport::connect(args.vsock_port) {
            Ok(conn) => {
                info!("announced to host on port {}", args.vsock_port);
                serve(conn, &args);
                info!("host connection lost; reconnecting");
                backoff = Duration::from_millis(200);
            }
            Err(e) => {
                debug!("host not reachable: {e}");
                std::thread::sleep(backoff);
                backoff = (backoff * 2).min(Duration::from_secs(5));
            }
        }
    }
}

/// Serve one host connection until it drops.
fn serve(mut conn: HostConn, args: &Args) {
    let child_pid: ChildPid = Arc::new(AtomicI32::new(0));

    loop {
        let frame = match conn.read_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => return,
            Err(e) => {
                warn!("host read failed: {e}");
                return;
            }
        };

        match frame.header.msg_type {
            MsgType::VsockStart => {
                let mut payload = frame.payload;
                let start = match decode_exact::<VsockStart>(&mut payload) {
                    Ok(start) => start,
                    Err(e) => {
                        warn!("malformed start command: {e}");
                        continue;
                    }
                };
                // The raw bytes carry the tokens
                payload.zeroize();

                info!("starting task {}", start.task_id);
                let writer = conn.writer.clone();
                let work_dir = args.work_dir.clone();
                let agent_cmd = args.agent_cmd.clone();
                let pid_slot = Arc::clone(&child_pid);

                std::thread::Builder::new()
                    .name("task-runner".to_string())
                    .spawn(move || {
                        let report =
                            runner::run_task(&start, &work_dir, &agent_cmd, &writer, &pid_slot);
                        info!(
                            "task {} finished: success={}",
                            report.task_id, report.success
                        );
                        if let Err(e) = writer.send(MsgType::VsockComplete, &report) {
                            warn!("completion report failed: {e}");
                        }
                    })
                    .expect("spawning task runner");
            }
            MsgType::VsockCancel => {
                let mut payload = frame.payload;
                match decode_exact::<VsockCancel>(&mut payload) {
                    Ok(cancel) => {
                        info!("cancel for task {}", cancel.task_id);
                        kill_child(&child_pid);
                    }
                    Err(e) => warn!("malformed cancel: {e}"),
                }
            }
            other => debug!("ignoring {other} from host"),
        }
    }
}

fn enable_logging(args: &Args) {
    let verbosity = match args.verbose {
        0 => tracing::Level::INFO,
        1 => tracing::Level::DEBUG,
        2.. => tracing::Level::TRACE,
    };

    let filters = filter::Targets::new().with_default(verbosity);
    let fmt_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_filter(filters);

    tracing_subscriber::registry().with(fmt_layer).init();
}
