//! The request dispatcher: TCP accept loop, per-connection reader/writer
//! threads, heartbeat handling, and the per-node pending-command queues that
//! carry scheduler decisions to nodes.
//!
//! Every connection gets a reader thread (this module's handler) and a
//! writer thread draining a bounded outbound queue. Scheduler subscribers
//! push into that queue and never touch a socket, so event fan-out stays
//! O(1) under the scheduler lock.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use marathon_common::tls::Link;
use marathon_common::{Clock, Secret, crypto};
use marathon_protocol::frame::{FLAG_STREAMING, Frame};
use marathon_protocol::ids::{ClientId, NodeId, TaskId};
use marathon_protocol::messages::codes;
use marathon_protocol::messages::{
    CancelTaskRequest, ErrorResponse, ExecuteTaskRequest, GetTaskRequest, GetUsageRequest,
    HeartbeatRequest, HeartbeatResponse, ListTasksRequest, NodeCommand, NodeStatus,
    SubmitTaskRequest, TaskEvent, TaskResponse, VsockComplete, VsockError, VsockMetrics,
};
use marathon_protocol::state::{EventType, TaskState};
use marathon_protocol::wire::decode_exact;
use marathon_protocol::{FromWire, MsgType, ToWire};
use rustls::ServerConfig;
use tracing::{debug, info, warn};
use zeroize::Zeroize;

use crate::metrics::DispatcherMetrics;
use crate::registry::NodeRegistry;
use crate::scheduler::{Scheduler, SchedulerError};
use crate::storage::{NodeRepository, UsageRepository};
use crate::task::{Task, TaskResult, validate_github_token, validate_repo_url};

/// Depth of each connection's outbound frame queue. Responses block on a
/// full queue (backpressure on the reader); task events are dropped instead,
/// so a slow subscriber can never stall the scheduler.
pub const OUTBOUND_QUEUE_DEPTH: usize = 256;

struct OutboundFrame {
    bytes: Vec<u8>,
    sensitive: bool,
}

/// Sending side of a connection's outbound queue.
#[derive(Clone)]
struct Outbound {
    tx: Sender<OutboundFrame>,
    metrics: Arc<DispatcherMetrics>,
}

impl Outbound {
    /// Queue a response frame, blocking if the writer is behind.
    fn send_response<T: ToWire>(&self, msg_type: MsgType, request_id: u32, payload: &T) {
        self.send_frame(msg_type, 0, request_id, payload, false);
    }

    /// Queue a frame whose encoded bytes hold secrets; the writer zeroes the
    /// buffer after the socket write.
    fn send_sensitive<T: ToWire>(&self, msg_type: MsgType, request_id: u32, payload: &T) {
        self.send_frame(msg_type, 0, request_id, payload, true);
    }

    fn send_error(&self, request_id: u32, code: &str, message: impl Into<String>) {
        let response = ErrorResponse::new(code, message);
        self.send_response(MsgType::ErrorResponse, request_id, &response);
    }

    fn send_frame<T: ToWire>(
        &self,
        msg_type: MsgType,
        flags: u8,
        request_id: u32,
        payload: &T,
        sensitive: bool,
    ) {
        match marathon_protocol::frame::encode(msg_type, flags, request_id, payload) {
            Ok(bytes) => {
                // A closed channel means the connection is gone; the reader
                // will notice on its next read.
                let _ = self.tx.send(OutboundFrame { bytes, sensitive });
            }
            Err(e) => warn!("encoding {msg_type} response: {e}"),
        }
    }
}

pub struct Dispatcher {
    scheduler: Arc<Scheduler>,
    registry: Arc<NodeRegistry>,
    node_repo: Arc<dyn NodeRepository>,
    usage_repo: Arc<dyn UsageRepository>,
    clock: Clock,
    pub metrics: Arc<DispatcherMetrics>,

    /// Per-node FIFO of commands awaiting the node's next heartbeat.
    pending: Mutex<HashMap<NodeId, VecDeque<NodeCommand>>>,

    /// Injected into every execute command leaving this orchestrator.
    anthropic_api_key: Option<Secret>,

    /// When set, heartbeats must carry a valid HMAC.
    shared_key: Option<Secret>,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        scheduler: Arc<Scheduler>,
        registry: Arc<NodeRegistry>,
        node_repo: Arc<dyn NodeRepository>,
        usage_repo: Arc<dyn UsageRepository>,
        clock: Clock,
        anthropic_api_key: Option<Secret>,
        shared_key: Option<Secret>,
    ) -> Self {
        Dispatcher {
            scheduler,
            registry,
            node_repo,
            usage_repo,
            clock,
            metrics: Arc::new(DispatcherMetrics::default()),
            pending: Mutex::new(HashMap::new()),
            anthropic_api_key,
            shared_key,
        }
    }

    /// Accept loop. Spawns one handler thread per connection; runs until
    /// `keep_running` goes false.
    pub fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        tls: Option<Arc<ServerConfig>>,
        keep_running: &'static AtomicBool,
    ) -> io::Result<()> {
        listener.set_nonblocking(true)?;
        let mut conn_seq: u64 = 0;

        while keep_running.load(Relaxed) {
            match listener.accept() {
                Ok((stream, peer)) => {
                    conn_seq += 1;
                    let id = conn_seq;
                    let dispatcher = Arc::clone(&self);
                    let tls = tls.clone();

                    std::thread::Builder::new()
                        .name(format!("conn-{id}"))
                        .spawn(move || dispatcher.handle_connection(id, stream, peer, tls))
                        .expect("spawning connection thread");
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(50));
                }
                Err(e) => {
                    warn!("accept failed: {e}");
                    std::thread::sleep(Duration::from_millis(50));
                }
            }
        }

        info!("accept loop stopped");
        Ok(())
    }

    fn handle_connection(
        self: Arc<Self>,
        conn_id: u64,
        stream: TcpStream,
        peer: SocketAddr,
        tls: Option<Arc<ServerConfig>>,
    ) {
        self.metrics.connections_accepted.fetch_add(1, Relaxed);
        debug!("connection {conn_id} from {peer}");

        if let Err(e) = stream.set_nodelay(true) {
            debug!("set_nodelay on {peer}: {e}");
        }
        // Children of the non-blocking listener may inherit non-blocking mode
        // on some platforms; connection handlers use blocking reads.
        if let Err(e) = stream.set_nonblocking(false) {
            warn!("restoring blocking mode for {peer}: {e}");
            return;
        }

        let link = match tls {
            Some(config) => match Link::tls_server(stream, config) {
                Ok(link) => link,
                Err(e) => {
                    warn!("TLS handshake with {peer} failed: {e}");
                    return;
                }
            },
            None => Link::plain(stream),
        };

        let (mut reader, mut writer) = match link.split() {
            Ok(halves) => halves,
            Err(e) => {
                warn!("splitting connection {conn_id}: {e}");
                return;
            }
        };

        let (tx, rx): (Sender<OutboundFrame>, Receiver<OutboundFrame>) =
            bounded(OUTBOUND_QUEUE_DEPTH);

        let writer_thread = std::thread::Builder::new()
            .name(format!("conn-{conn_id}-writer"))
            .spawn(move || {
                use std::io::Write;
                for mut frame in rx {
                    let result = writer.write_all(&frame.bytes).and_then(|()| writer.flush());
                    if frame.sensitive {
                        frame.bytes.zeroize();
                    }
                    if let Err(e) = result {
                        debug!("writer for conn-{conn_id} exiting: {e}");
                        break;
                    }
                }
            })
            .expect("spawning writer thread");

        let out = Outbound {
            tx,
            metrics: Arc::clone(&self.metrics),
        };
        let client_id = crypto::client_id_for_addr(&peer);

        loop {
            match Frame::read_from(&mut reader) {
                Ok(Some(frame)) => {
                    self.metrics.frames_ok.fetch_add(1, Relaxed);
                    self.dispatch_frame(frame, client_id, &out);
                }
                Ok(None) => {
                    debug!("connection {conn_id} closed by peer");
                    break;
                }
                Err(e) => {
                    // Header-level corruption desynchronizes the stream;
                    // nothing to do but drop the connection.
                    self.metrics.frames_bad.fetch_add(1, Relaxed);
                    warn!("connection {conn_id}: framing error: {e}");
                    break;
                }
            }
        }

        drop(out);
        let _ = writer_thread.join();
        debug!("connection {conn_id} done");
    }

    fn dispatch_frame(&self, frame: Frame, client_id: ClientId, out: &Outbound) {
        let request_id = frame.header.request_id;
        let mut payload = frame.payload;

        match frame.header.msg_type {
            MsgType::SubmitTask => {
                if let Some(request) = decode_or_report::<SubmitTaskRequest>(&mut payload, out, request_id) {
                    self.handle_submit(request, client_id, request_id, out);
                }
            }
            MsgType::GetTask => {
                if let Some(request) = decode_or_report::<GetTaskRequest>(&mut payload, out, request_id) {
                    self.handle_get_task(request.task_id, request_id, out);
                }
            }
            MsgType::CancelTask => {
                if let Some(request) = decode_or_report::<CancelTaskRequest>(&mut payload, out, request_id) {
                    self.handle_cancel(request.task_id, request_id, out);
                }
            }
            MsgType::ListTasks => {
                if let Some(request) = decode_or_report::<ListTasksRequest>(&mut payload, out, request_id) {
                    let (tasks, total_count) = self.scheduler.list(
                        &client_id,
                        request.state_filter,
                        request.limit,
                        request.offset,
                    );
                    let response = TaskResponse {
                        tasks: tasks.iter().map(Task::summary).collect(),
                        total_count,
                    };
                    out.send_response(MsgType::TaskResponse, request_id, &response);
                }
            }
            MsgType::GetUsage => {
                if let Some(request) = decode_or_report::<GetUsageRequest>(&mut payload, out, request_id) {
                    match self.usage_repo.report(&client_id, request.start_ms, request.end_ms) {
                        Ok(report) => out.send_response(MsgType::UsageResponse, request_id, &report),
                        Err(e) => out.send_error(request_id, codes::DB_ERROR, e.to_string()),
                    }
                }
            }
            MsgType::HeartbeatRequest => {
                if let Some(request) = decode_or_report::<HeartbeatRequest>(&mut payload, out, request_id) {
                    self.handle_heartbeat(request, request_id, out);
                }
            }
            MsgType::NodeStatus => {
                if let Some(status) = decode_or_report::<NodeStatus>(&mut payload, out, request_id) {
                    self.registry.record_heartbeat(status, self.clock.epoch_millis());
                }
            }
            MsgType::TaskEvent => {
                if let Some(event) = decode_or_report::<TaskEvent>(&mut payload, out, request_id) {
                    self.handle_relayed_event(event);
                }
            }
            MsgType::VsockMetrics => {
                if let Some(report) = decode_or_report::<VsockMetrics>(&mut payload, out, request_id) {
                    self.handle_usage_delta(report);
                }
            }
            MsgType::VsockComplete => {
                if let Some(report) = decode_or_report::<VsockComplete>(&mut payload, out, request_id) {
                    self.handle_task_complete(report);
                }
            }
            MsgType::VsockError => {
                if let Some(report) = decode_or_report::<VsockError>(&mut payload, out, request_id) {
                    self.handle_task_error(report);
                }
            }
            other => {
                debug!("unsupported message {other} on orchestrator endpoint");
                out.send_error(
                    request_id,
                    codes::UNSUPPORTED_MESSAGE,
                    format!("{other} is not handled on this endpoint"),
                );
            }
        }
    }

    fn handle_submit(
        &self,
        request: SubmitTaskRequest,
        client_id: ClientId,
        request_id: u32,
        out: &Outbound,
    ) {
        if !validate_repo_url(&request.repo_url) {
            out.send_error(request_id, codes::INVALID_REPO_URL, "repository URL not allowed");
            return;
        }

        if let Some(token) = &request.github_token
            && !validate_github_token(token)
        {
            out.send_error(request_id, codes::INVALID_GITHUB_TOKEN, "github token is malformed");
            return;
        }

        let task_id = TaskId::new(crypto::random_bytes());
        let task = Task::from_submit(task_id, client_id, request, self.clock.epoch_millis());
        let summary = task.summary();

        match self.scheduler.submit(task) {
            Ok(_) => (),
            Err(SchedulerError::Storage(e)) => {
                warn!("submit {task_id} lost to storage: {e}");
                out.send_error(request_id, codes::DB_ERROR, "could not persist task");
                return;
            }
            Err(e) => {
                warn!("submit {task_id}: {e}");
                out.send_error(request_id, codes::INTERNAL_ERROR, e.to_string());
                return;
            }
        }

        out.send_response(MsgType::TaskResponse, request_id, &TaskResponse::single(summary));

        // Stream this task's events back on the same request id until it
        // terminates. Queue-full drops the event; a dead connection detaches.
        let event_tx = out.tx.clone();
        let event_metrics = Arc::clone(&out.metrics);
        let subscribe_result = self.scheduler.subscribe(
            &task_id,
            Box::new(move |event| {
                let bytes = match marathon_protocol::frame::encode(
                    MsgType::TaskEvent,
                    FLAG_STREAMING,
                    request_id,
                    event,
                ) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        warn!("encoding task event: {e}");
                        return true;
                    }
                };

                match event_tx.try_send(OutboundFrame { bytes, sensitive: false }) {
                    Ok(()) => {
                        event_metrics.events_sent.fetch_add(1, Relaxed);
                        true
                    }
                    Err(TrySendError::Full(_)) => {
                        event_metrics.events_dropped.fetch_add(1, Relaxed);
                        true
                    }
                    Err(TrySendError::Disconnected(_)) => false,
                }
            }),
        );

        if let Err(e) = subscribe_result {
            warn!("subscribing to {task_id}: {e}");
        }
    }

    fn handle_get_task(&self, task_id: TaskId, request_id: u32, out: &Outbound) {
        match self.scheduler.snapshot(&task_id) {
            Ok(task) => {
                out.send_response(MsgType::TaskResponse, request_id, &TaskResponse::single(task.summary()));
            }
            Err(SchedulerError::NotFound(_)) => {
                out.send_error(request_id, codes::NOT_FOUND, format!("task {task_id} not found"));
            }
            Err(e) => out.send_error(request_id, codes::INTERNAL_ERROR, e.to_string()),
        }
    }

    fn handle_cancel(&self, task_id: TaskId, request_id: u32, out: &Outbound) {
        // Snapshot first so the owning node (if any) can be told to stop.
        let assigned_node = match self.scheduler.snapshot(&task_id) {
            Ok(task) => task.node_id,
            Err(SchedulerError::NotFound(_)) => {
                out.send_error(request_id, codes::NOT_FOUND, format!("task {task_id} not found"));
                return;
            }
            Err(e) => {
                out.send_error(request_id, codes::INTERNAL_ERROR, e.to_string());
                return;
            }
        };

        match self.scheduler.cancel(&task_id) {
            Ok(took_effect) => {
                if took_effect && let Some(node_id) = assigned_node {
                    self.enqueue_command(node_id, NodeCommand::Cancel(task_id));
                }
                // Terminal cancels are no-ops; either way report the record.
                self.handle_get_task(task_id, request_id, out);
            }
            Err(e) => out.send_error(request_id, codes::INTERNAL_ERROR, e.to_string()),
        }
    }

    fn handle_heartbeat(&self, request: HeartbeatRequest, request_id: u32, out: &Outbound) {
        self.metrics.heartbeats.fetch_add(1, Relaxed);
        let node_id = request.status.node_id;
        let now = self.clock.epoch_millis();

        if let Some(key) = &self.shared_key {
            let authentic = request.auth.as_ref().is_some_and(|tag| {
                crypto::verify_heartbeat(
                    key.expose().as_bytes(),
                    &node_id,
                    request.timestamp_ms,
                    tag,
                    now,
                )
            });

            if !authentic {
                warn!("heartbeat from {node_id} failed authentication");
                out.send_error(request_id, codes::AUTH_FAILED, "heartbeat authentication failed");
                return;
            }
        }

        let status = request.status;
        let has_capacity =
            status.healthy && !status.draining && status.available_slots() > 0;

        self.registry.record_heartbeat(status.clone(), now);
        if let Err(e) = self.node_repo.upsert(&status) {
            debug!("node mirror for {node_id} failed: {e}");
        }

        // A node with open slots is a reason to place work; the scheduler
        // picks targets registry-wide, so drained commands may be bound for
        // other nodes' queues too.
        if has_capacity {
            self.fill_pending_commands();
        }

        let commands = self.drain_pending(&node_id);
        self.metrics.commands_delivered.fetch_add(commands.len() as u64, Relaxed);

        let response = HeartbeatResponse { commands };
        if response.commands.is_empty() {
            out.send_response(MsgType::HeartbeatResponse, request_id, &response);
        } else {
            // Execute commands carry injected tokens
            out.send_sensitive(MsgType::HeartbeatResponse, request_id, &response);
        }
    }

    /// Drain the scheduler's queue into per-node pending FIFOs, in the order
    /// `schedule_next` produces placements.
    fn fill_pending_commands(&self) {
        while let Some((task, node_id)) = self.scheduler.schedule_next() {
            let command = NodeCommand::Execute(self.execute_request(&task));
            self.enqueue_command(node_id, command);
        }
    }

    pub fn enqueue_command(&self, node_id: NodeId, command: NodeCommand) {
        let mut pending = self.pending.lock().unwrap();
        pending.entry(node_id).or_default().push_back(command);
    }

    fn drain_pending(&self, node_id: &NodeId) -> Vec<NodeCommand> {
        let mut pending = self.pending.lock().unwrap();
        pending
            .remove(node_id)
            .map(Vec::from)
            .unwrap_or_default()
    }

    fn execute_request(&self, task: &Task) -> ExecuteTaskRequest {
        ExecuteTaskRequest {
            task_id: task.id,
            repo_url: task.repo_url.clone(),
            branch: task.branch.clone(),
            prompt: task.prompt.clone(),
            create_pr: task.create_pr,
            pr_title: task.pr_title.clone(),
            pr_body: task.pr_body.clone(),
            github_token: task.github_token.as_ref().map(|t| t.expose().to_string()),
            anthropic_api_key: self.anthropic_api_key.as_ref().map(|k| k.expose().to_string()),
        }
    }

    fn handle_relayed_event(&self, event: TaskEvent) {
        let task_id = event.task_id;
        let outcome = match event.event_type {
            EventType::StateChange if event.state == TaskState::Running => {
                self.scheduler.mark_running(&task_id).map(|_| ())
            }
            EventType::Output => self.scheduler.append_output(&task_id, event.data),
            other => {
                debug!("ignoring relayed {other:?} event for {task_id}");
                Ok(())
            }
        };

        if let Err(e) = outcome {
            debug!("relayed event for {task_id}: {e}");
        }
    }

    fn handle_usage_delta(&self, report: VsockMetrics) {
        if let Err(e) = self.scheduler.add_usage(&report.task_id, report.delta) {
            debug!("usage delta for unknown task {}: {e}", report.task_id);
            return;
        }

        if let Err(e) = self.usage_repo.append(&report.task_id, &report.delta, self.clock.epoch_millis()) {
            warn!("usage ledger append for {} failed: {e}", report.task_id);
        }
    }

    fn handle_task_complete(&self, report: VsockComplete) {
        let result = if report.success {
            TaskResult::completed(report.pr_url, Some(report.usage))
        } else {
            TaskResult {
                state: TaskState::Failed,
                error_message: report.error_message.or_else(|| Some("task failed".to_string())),
                pr_url: report.pr_url,
                usage: Some(report.usage),
            }
        };

        if let Err(e) = self.scheduler.complete(&report.task_id, result) {
            warn!("completion for {}: {e}", report.task_id);
        }
    }

    fn handle_task_error(&self, report: VsockError) {
        let result = TaskResult::failed(report.message, None);
        if let Err(e) = self.scheduler.complete(&report.task_id, result) {
            warn!("error report for {}: {e}", report.task_id);
        }
    }

    /// Drop nodes that have stopped heartbeating. In-flight tasks on a
    /// pruned node are reported but deliberately not reassigned; operators
    /// cancel them or the node returns.
    pub fn prune_dead_nodes(&self, timeout_ms: u64) {
        let now = self.clock.epoch_millis();
        let removed = self.registry.prune(now, timeout_ms);

        for status in removed {
            warn!(
                "node {} ({}) timed out and was removed from the registry",
                status.node_id, status.hostname
            );
            if let Err(e) = self.node_repo.mark_unhealthy(&status.node_id) {
                debug!("marking {} unhealthy: {e}", status.node_id);
            }

            for task_id in self.scheduler.tasks_for_node(&status.node_id) {
                warn!(
                    "task {task_id} is assigned to lost node {} and will not be reassigned",
                    status.node_id
                );
            }
        }
    }
}

fn decode_or_report<T: FromWire>(payload: &mut [u8], out: &Outbound, request_id: u32) -> Option<T> {
    match decode_exact::<T>(payload) {
        Ok(value) => Some(value),
        Err(e) => {
            debug!("payload decode failed: {e}");
            out.metrics.frames_bad.fetch_add(1, Relaxed);
            out.send_error(request_id, codes::INTERNAL_ERROR, format!("malformed payload: {e}"));
            None
        }
    }
}
