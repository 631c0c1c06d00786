//! The node's main loop: heartbeat the orchestrator, execute the commands
//! that come back, and relay each task's VM traffic upstream.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use marathon_common::{Clock, Secret, crypto};
use marathon_protocol::ids::{NodeId, TaskId};
use marathon_protocol::messages::{
    ExecuteTaskRequest, HeartbeatRequest, NodeCommand, TaskEvent, VsockCancel, VsockError,
    VsockStart,
};
use marathon_protocol::state::{EventType, TaskState};
use marathon_protocol::MsgType;
use tracing::{debug, info, warn};
use zeroize::Zeroize;

use crate::args::Args;
use crate::link::OrchestratorLink;
use crate::pool::WarmVmPool;
use crate::vsock::{GuestConn, VsockHost};

/// How long to wait for a warm VM's guest agent to claim its vsock
/// connection after acquisition.
const GUEST_CLAIM_TIMEOUT: Duration = Duration::from_secs(30);

/// Read cadence on the guest connection; bounds how quickly cancellation and
/// wall-clock timeouts are noticed.
const GUEST_POLL_INTERVAL: Duration = Duration::from_secs(1);

struct RunningTask {
    cancel: Arc<AtomicBool>,
}

pub struct NodeRuntime {
    node_id: NodeId,
    args: Args,
    pool: Arc<WarmVmPool>,
    vsock: Arc<VsockHost>,
    sampler: crate::status::StatusSampler,
    clock: Clock,
    shared_key: Option<Secret>,
    running: Mutex<HashMap<TaskId, RunningTask>>,
    last_task_at: Mutex<Option<u64>>,
}

impl NodeRuntime {
    pub fn new(
        node_id: NodeId,
        args: Args,
        pool: Arc<WarmVmPool>,
        vsock: Arc<VsockHost>,
        clock: Clock,
    ) -> Arc<Self> {
        let shared_key = args.shared_key();
        let sampler = crate::status::StatusSampler::new(node_id, args.draining);

        Arc::new(NodeRuntime {
            node_id,
            args,
            pool,
            vsock,
            sampler,
            clock,
            shared_key,
            running: Mutex::new(HashMap::new()),
            last_task_at: Mutex::new(None),
        })
    }

    /// Heartbeat loop with reconnect. Runs until `keep_running` goes false.
    pub fn run(self: Arc<Self>, keep_running: &'static AtomicBool) {
        let interval = Duration::from_millis(self.args.heartbeat_interval_ms);
        let mut backoff = Duration::from_secs(1);

        while keep_running.load(Relaxed) {
            let link = match self.connect() {
                Ok(link) => {
                    info!(
                        "connected to orchestrator {}:{}",
                        self.args.orchestrator_address, self.args.orchestrator_port
                    );
                    backoff = Duration::from_secs(1);
                    Arc::new(link)
                }
                Err(e) => {
                    warn!("orchestrator connection failed: {e}; retrying in {backoff:?}");
                    std::thread::sleep(backoff);
                    backoff = (backoff * 2).min(Duration::from_secs(30));
                    continue;
                }
            };

            while keep_running.load(Relaxed) && link.is_alive() {
                match Self::beat(&self, &link) {
                    Ok(()) => std::thread::sleep(interval),
                    Err(e) => {
                        warn!("heartbeat failed: {e}");
                        break;
                    }
                }
            }
        }
    }

    fn connect(&self) -> Result<OrchestratorLink, crate::link::LinkError> {
        let tls = match self.args.tls_ca_path.as_deref() {
            Some(ca) => {
                let config = marathon_common::tls::load_client_config(ca)?;
                let hostname = self
                    .args
                    .tls_hostname
                    .clone()
                    .unwrap_or_else(|| self.args.orchestrator_address.clone());
                Some((config, hostname))
            }
            None => None,
        };

        OrchestratorLink::connect(&self.args.orchestrator_address, self.args.orchestrator_port, tls)
    }

    /// One heartbeat exchange: report status, receive commands, act on them.
    fn beat(this: &Arc<Self>, link: &Arc<OrchestratorLink>) -> Result<(), crate::link::LinkError> {
        let active_task_ids: Vec<TaskId> = this.running.lock().unwrap().keys().copied().collect();
        let last_task_at_ms = *this.last_task_at.lock().unwrap();

        let status = this.sampler.sample(&this.pool, active_task_ids, last_task_at_ms);
        let timestamp_ms = this.clock.epoch_millis();

        let auth = this.shared_key.as_ref().map(|key| {
            crypto::heartbeat_mac(key.expose().as_bytes(), &this.node_id, timestamp_ms)
        });

        let request = HeartbeatRequest {
            status,
            timestamp_ms,
            auth,
        };

        let response = link.heartbeat(&request, Duration::from_secs(10))?;

        for command in response.commands {
            match command {
                NodeCommand::Execute(execute) => Self::spawn_task(this, link, execute),
                NodeCommand::Cancel(task_id) => this.cancel_task(&task_id),
            }
        }
        Ok(())
    }

    fn cancel_task(&self, task_id: &TaskId) {
        let running = self.running.lock().unwrap();
        match running.get(task_id) {
            Some(task) => {
                info!("cancelling task {task_id}");
                task.cancel.store(true, Relaxed);
            }
            None => debug!("cancel for task {task_id} which is not running here"),
        }
    }

    fn spawn_task(this: &Arc<Self>, link: &Arc<OrchestratorLink>, execute: ExecuteTaskRequest) {
        let task_id = execute.task_id;
        let cancel = Arc::new(AtomicBool::new(false));

        {
            let mut running = this.running.lock().unwrap();
            if running.contains_key(&task_id) {
                warn!("duplicate execute command for task {task_id}; ignoring");
                return;
            }
            running.insert(task_id, RunningTask { cancel: Arc::clone(&cancel) });
        }

        let runtime = Arc::clone(this);
        let link = Arc::clone(link);

        std::thread::Builder::new()
            .name(format!("task-{}", &task_id.to_string()[..8]))
            .spawn(move || {
                runtime.run_task(&link, execute, &cancel);
                runtime.running.lock().unwrap().remove(&task_id);
                *runtime.last_task_at.lock().unwrap() = Some(runtime.clock.epoch_millis());
            })
            .expect("spawning task thread");
    }

    /// Drive one task: acquire a warm VM, start the agent, relay its traffic
    /// until completion, cancellation, or timeout.
    fn run_task(&self, link: &OrchestratorLink, execute: ExecuteTaskRequest, cancel: &AtomicBool) {
        let task_id = execute.task_id;

        let Some(handle) = self.pool.acquire() else {
            warn!("no warm vm for task {task_id}");
            self.report_error(link, task_id, "no warm vm available");
            return;
        };

        let mut guest = match self.vsock.claim(handle.cid, GUEST_CLAIM_TIMEOUT) {
            Ok(guest) => guest,
            Err(e) => {
                warn!("task {task_id}: vm {} never announced: {e}", handle.id);
                self.report_error(link, task_id, "vm did not come up");
                self.pool.release(&handle.id);
                return;
            }
        };
        debug!(
            "task {task_id} on vm {} (cid {}, agent {})",
            handle.id, guest.cid, guest.agent_version
        );

        if let Err(e) = self.send_start(&mut guest, execute) {
            warn!("task {task_id}: start failed: {e}");
            self.report_error(link, task_id, "could not start task in vm");
            self.pool.release(&handle.id);
            return;
        }

        // The VM accepted the task; report the running transition.
        let event = TaskEvent {
            task_id,
            state: TaskState::Running,
            timestamp_ms: self.clock.epoch_millis(),
            event_type: EventType::StateChange,
            data: Vec::new(),
        };
        let _ = link.send(MsgType::TaskEvent, link.next_request_id(), &event);

        self.relay_until_done(link, &mut guest, task_id, cancel);

        self.vsock.forget(handle.cid);
        self.pool.release(&handle.id);
    }

    fn send_start(&self, guest: &mut GuestConn, execute: ExecuteTaskRequest) -> Result<(), String> {
        let start = VsockStart {
            task_id: execute.task_id,
            repo_url: execute.repo_url,
            branch: execute.branch,
            prompt: execute.prompt,
            create_pr: execute.create_pr,
            pr_title: execute.pr_title,
            pr_body: execute.pr_body,
            github_token: execute.github_token,
            anthropic_api_key: execute.anthropic_api_key,
            timeout_ms: self.args.task_timeout_ms,
            max_tokens: self.args.max_tokens_per_task,
        };

        let mut bytes = marathon_protocol::frame::encode(
            MsgType::VsockStart,
            0,
            1,
            &start,
        )
        .map_err(|e| e.to_string())?;

        let result = guest.write_frame(&bytes).map_err(|e| e.to_string());
        // The encoded frame carries both tokens
        bytes.zeroize();
        result
    }

    /// Forward VM frames upstream until the run finishes. The read timeout
    /// doubles as the poll point for cancellation and the wall clock.
    fn relay_until_done(
        &self,
        link: &OrchestratorLink,
        guest: &mut GuestConn,
        task_id: TaskId,
        cancel: &AtomicBool,
    ) {
        let deadline = Instant::now() + Duration::from_millis(self.args.task_timeout_ms);
        if let Err(e) = guest.set_read_timeout(Some(GUEST_POLL_INTERVAL)) {
            warn!("task {task_id}: read timeout: {e}");
        }

        loop {
            match guest.read_frame() {
                Ok(Some(frame)) => {
                    let msg_type = frame.header.msg_type;
                    match msg_type {
                        MsgType::VsockOutput => self.relay_output(link, frame.payload),
                        MsgType::VsockMetrics => {
                            let _ = link.send_raw(MsgType::VsockMetrics, frame.payload);
                        }
                        MsgType::VsockComplete => {
                            let _ = link.send_raw(MsgType::VsockComplete, frame.payload);
                            return;
                        }
                        MsgType::VsockError => {
                            let _ = link.send_raw(MsgType::VsockError, frame.payload);
                            return;
                        }
                        other => debug!("task {task_id}: ignoring {other} from guest"),
                    }
                }
                Ok(None) => {
                    warn!("task {task_id}: vm closed the connection");
                    self.report_error(link, task_id, "vm connection lost");
                    return;
                }
                Err(marathon_protocol::Error::IoError(e))
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                    ) =>
                {
                    if cancel.load(Relaxed) {
                        info!("task {task_id}: sending cancel to vm");
                        self.send_guest_cancel(guest, task_id);
                        return;
                    }
                    if Instant::now() >= deadline {
                        warn!("task {task_id}: wall-clock timeout");
                        self.send_guest_cancel(guest, task_id);
                        self.report_error(link, task_id, "timeout");
                        return;
                    }
                }
                Err(e) => {
                    warn!("task {task_id}: guest read failed: {e}");
                    self.report_error(link, task_id, "vm connection lost");
                    return;
                }
            }
        }
    }

    /// Output frames are re-shaped into task events for the orchestrator's
    /// subscriber fan-out.
    fn relay_output(&self, link: &OrchestratorLink, mut payload: Vec<u8>) {
        use marathon_protocol::messages::VsockOutput;
        use marathon_protocol::wire::decode_exact;

        match decode_exact::<VsockOutput>(&mut payload) {
            Ok(output) => {
                let event = TaskEvent {
                    task_id: output.task_id,
                    state: TaskState::Running,
                    timestamp_ms: self.clock.epoch_millis(),
                    event_type: EventType::Output,
                    data: output.data,
                };
                let _ = link.send(MsgType::TaskEvent, link.next_request_id(), &event);
            }
            Err(e) => debug!("malformed output frame from guest: {e}"),
        }
    }

    fn send_guest_cancel(&self, guest: &mut GuestConn, task_id: TaskId) {
        let cancel = VsockCancel { task_id };
        match marathon_protocol::frame::encode(MsgType::VsockCancel, 0, 1, &cancel) {
            Ok(bytes) => {
                if let Err(e) = guest.write_frame(&bytes) {
                    debug!("task {task_id}: cancel write failed: {e}");
                }
            }
            Err(e) => debug!("encoding cancel: {e}"),
        }
    }

    fn report_error(&self, link: &OrchestratorLink, task_id: TaskId, message: &str) {
        let report = VsockError {
            task_id,
            message: message.to_string(),
        };
        let _ = link.send(MsgType::VsockError, link.next_request_id(), &report);
    }
}
