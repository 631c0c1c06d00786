// Drives the dispatcher over real sockets: a client submits a task and a
// fake node heartbeats, picks the work up, and reports it done, while the
// client watches the event stream. Everything runs in-process against the
// in-memory store.

use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::Relaxed;

use marathon_common::Clock;
use marathon_common::Secret;
use marathon_orchestrator::dispatch::Dispatcher;
use marathon_orchestrator::registry::NodeRegistry;
use marathon_orchestrator::scheduler::{NodeSelector, Scheduler};
use marathon_orchestrator::storage::MemoryStore;
use marathon_protocol::frame::Frame;
use marathon_protocol::ids::{NodeId, TaskId};
use marathon_protocol::messages::{
    HeartbeatRequest, HeartbeatResponse, NodeCommand, NodeStatus, SubmitTaskRequest, TaskEvent,
    TaskResponse, VsockComplete,
};
use marathon_protocol::state::{EventType, TaskState};
use marathon_protocol::usage::UsageMetrics;
use marathon_protocol::wire::decode_exact;
use marathon_protocol::{MsgType, ToWire};

static KEEP_RUNNING: AtomicBool = AtomicBool::new(true);

struct RegistrySelector(Arc<NodeRegistry>);

impl NodeSelector for RegistrySelector {
    fn select_node(&self) -> Option<NodeId> {
        self.0.select_node()
    }
}

struct Peer {
    stream: TcpStream,
    next_request_id: u32,
}

impl Peer {
    fn connect(addr: std::net::SocketAddr) -> Peer {
        Peer {
            stream: TcpStream::connect(addr).unwrap(),
            next_request_id: 1,
        }
    }

    fn send<T: ToWire>(&mut self, msg_type: MsgType, payload: &T) -> u32 {
        let request_id = self.next_request_id;
        self.next_request_id += 1;
        Frame::write_to(&mut self.stream, msg_type, 0, request_id, payload).unwrap();
        request_id
    }

    fn read(&mut self) -> Frame {
        Frame::read_from(&mut self.stream).unwrap().unwrap()
    }

    fn read_payload<T: marathon_protocol::FromWire>(&mut self, expect: MsgType) -> T {
        let frame = self.read();
        assert_eq!(frame.header.msg_type, expect, "unexpected frame type");
        let mut payload = frame.payload;
        decode_exact::<T>(&mut payload).unwrap()
    }
}

fn node_status() -> NodeStatus {
    NodeStatus {
        node_id: NodeId::new([7; 16]),
        hostname: "node-07".to_string(),
        total_vm_slots: 4,
        active_vms: 0,
        warm_vms: 4,
        cpu_usage: 0.2,
        memory_usage: 0.3,
        disk_available_bytes: 1 << 40,
        healthy: true,
        draining: false,
        uptime_seconds: 60,
        last_task_at_ms: None,
        active_task_ids: Vec::new(),
    }
}

#[test]
fn full_task_lifecycle_over_tcp() {
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
        clock.clone(),
        Some(Secret::new("sk-ant-integration")),
        None,
    ));

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let serve_dispatcher = Arc::clone(&dispatcher);
    let serve_thread =
        std::thread::spawn(move || serve_dispatcher.serve(listener, None, &KEEP_RUNNING));

    // Client submits a task
    let mut client = Peer::connect(addr);
    let submit_request_id = client.send(
        MsgType::SubmitTask,
        &SubmitTaskRequest {
            repo_url: "https://github.com/test/repo".to_string(),
            branch: "main".to_string(),
            prompt: "Fix the bug".to_string(),
            github_token: Some("ghp_0123456789abcdef0123".to_string()),
            create_pr: false,
            pr_title: None,
            pr_body: None,
        },
    );

    let response: TaskResponse = client.read_payload(MsgType::TaskResponse);
    let task_id: TaskId = response.tasks[0].task_id;
    assert_eq!(response.tasks[0].state, TaskState::Queued);

    // The queued event streams back on the submit's request id
    let queued_frame = client.read();
    assert_eq!(queued_frame.header.msg_type, MsgType::TaskEvent);
    assert_eq!(queued_frame.header.request_id, submit_request_id);
    assert!(queued_frame.header.is_streaming());

    // A node heartbeats and receives the execute command, tokens injected
    let mut node = Peer::connect(addr);
    node.send(
        MsgType::HeartbeatRequest,
        &HeartbeatRequest {
            status: node_status(),
            timestamp_ms: clock.epoch_millis(),
            auth: None,
        },
    );

    let heartbeat: HeartbeatResponse = node.read_payload(MsgType::HeartbeatResponse);
    let execute = match &heartbeat.commands[..] {
        [NodeCommand::Execute(execute)] => execute.clone(),
        other => panic!("expected one execute command, got {other:?}"),
    };
    assert_eq!(execute.task_id, task_id);
    assert_eq!(execute.anthropic_api_key.as_deref(), Some("sk-ant-integration"));
    assert_eq!(execute.github_token.as_deref(), Some("ghp_0123456789abcdef0123"));

    // Client sees the starting transition
    let starting: TaskEvent = client.read_payload(MsgType::TaskEvent);
    assert_eq!(starting.state, TaskState::Starting);

    // Node reports running, some output, then completion
    node.send(
        MsgType::TaskEvent,
        &TaskEvent {
            task_id,
            state: TaskState::Running,
            timestamp_ms: clock.epoch_millis(),
            event_type: EventType::StateChange,
            data: Vec::new(),
        },
    );
    node.send(
        MsgType::TaskEvent,
        &TaskEvent {
            task_id,
            state: TaskState::Running,
            timestamp_ms: clock.epoch_millis(),
            event_type: EventType::Output,
            data: b"$ cargo test: ok\n".to_vec(),
        },
    );
    node.send(
        MsgType::VsockComplete,
        &VsockComplete {
            task_id,
            success: true,
            error_message: None,
            pr_url: None,
            usage: UsageMetrics {
                input_tokens: 11,
                output_tokens: 22,
                ..UsageMetrics::default()
            },
        },
    );

    let running: TaskEvent = client.read_payload(MsgType::TaskEvent);
    assert_eq!(running.state, TaskState::Running);
    assert_eq!(running.event_type, EventType::StateChange);

    let output: TaskEvent = client.read_payload(MsgType::TaskEvent);
    assert_eq!(output.event_type, EventType::Output);
    assert_eq!(output.data, b"$ cargo test: ok\n");

    let complete: TaskEvent = client.read_payload(MsgType::TaskEvent);
    assert_eq!(complete.event_type, EventType::Complete);
    assert_eq!(complete.state, TaskState::Completed);

    // The final record is queryable with the accumulated usage
    let mut checker = Peer::connect(addr);
    checker.send(
        MsgType::GetTask,
        &marathon_protocol::messages::GetTaskRequest { task_id },
    );
    let response: TaskResponse = checker.read_payload(MsgType::TaskResponse);
    assert_eq!(response.tasks[0].state, TaskState::Completed);
    assert_eq!(response.tasks[0].usage.output_tokens, 22);

    KEEP_RUNNING.store(false, Relaxed);
    serve_thread.join().unwrap().unwrap();
}
