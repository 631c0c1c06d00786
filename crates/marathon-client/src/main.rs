//! The Marathon CLI.
//!
//! Exit codes: 0 success, 1 protocol/network error, 2 task failed,
//! 3 invalid arguments.

mod args;
mod transport;

use std::io::Write;

use clap::Parser;
use marathon_protocol::ids::TaskId;
use marathon_protocol::messages::{
    CancelTaskRequest, GetTaskRequest, GetUsageRequest, ListTasksRequest, SubmitTaskRequest,
    TaskEvent, TaskSummary, UsageResponse,
};
use marathon_protocol::state::{EventType, TaskState};
use marathon_protocol::usage::UsageMetrics;
use marathon_protocol::wire::decode_exact;
use marathon_protocol::MsgType;
use tracing::debug;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{Layer, filter};

use crate::args::{Args, CliCommand};
use crate::transport::{ClientError, Connection};

const EXIT_OK: i32 = 0;
const EXIT_PROTOCOL: i32 = 1;
const EXIT_TASK_FAILED: i32 = 2;
const EXIT_BAD_ARGS: i32 = 3;

fn main() {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            std::process::exit(EXIT_BAD_ARGS);
        }
    };

    enable_logging(&args);
    debug!("command line: {args:?}");

    match run(&args) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(EXIT_PROTOCOL);
        }
    }
}

fn run(args: &Args) -> Result<i32, ClientError> {
    let mut conn = Connection::connect(
        &args.host,
        args.port,
        args.tls_ca_path.as_deref(),
        args.tls_hostname.as_deref(),
    )?;

    match &args.command {
        CliCommand::Submit {
            repo,
            branch,
            prompt,
            github_token,
            create_pr,
            pr_title,
            pr_body,
            no_follow,
        } => {
            let request = SubmitTaskRequest {
                repo_url: repo.clone(),
                branch: branch.clone(),
                prompt: prompt.clone(),
                github_token: github_token.clone(),
                create_pr: *create_pr,
                pr_title: pr_title.clone(),
                pr_body: pr_body.clone(),
            };

            let response = conn.round_trip_task(MsgType::SubmitTask, &request)?;
            let task = response.tasks.first().ok_or(ClientError::EmptyResponse)?;
            println!("task {}", task.task_id);

            if *no_follow {
                return Ok(EXIT_OK);
            }
            follow_events(&mut conn)
        }

        CliCommand::Status { task_id } => {
            let task_id = parse_task_id(task_id)?;
            let response = conn.round_trip_task(MsgType::GetTask, &GetTaskRequest { task_id })?;
            print_task(response.tasks.first().ok_or(ClientError::EmptyResponse)?);
            Ok(EXIT_OK)
        }

        CliCommand::Cancel { task_id } => {
            let task_id = parse_task_id(task_id)?;
            let response =
                conn.round_trip_task(MsgType::CancelTask, &CancelTaskRequest { task_id })?;
            let task = response.tasks.first().ok_or(ClientError::EmptyResponse)?;
            println!("task {} is {}", task.task_id, task.state);
            Ok(EXIT_OK)
        }

        CliCommand::List { state, limit, offset } => {
            let request = ListTasksRequest {
                state_filter: *state,
                limit: *limit,
                offset: *offset,
            };
            let response = conn.round_trip_task(MsgType::ListTasks, &request)?;

            for task in &response.tasks {
                println!(
                    "{}  {:<10} {:<19} {}",
                    short_id(&task.task_id),
                    task.state.to_string(),
                    format_time(task.created_at_ms),
                    task.repo_url,
                );
            }
            println!("{} of {} task(s)", response.tasks.len(), response.total_count);
            Ok(EXIT_OK)
        }

        CliCommand::Usage { start_ms, end_ms } => {
            let request = GetUsageRequest {
                start_ms: *start_ms,
                end_ms: *end_ms,
            };
            let report = conn.round_trip_usage(MsgType::GetUsage, &request)?;
            print_usage(&report);
            Ok(EXIT_OK)
        }
    }
}

/// Consume the event stream after a submit until the task terminates.
/// Output chunks go to stdout as they arrive; lifecycle changes to stderr.
fn follow_events(conn: &mut Connection) -> Result<i32, ClientError> {
    loop {
        let frame = conn.read_frame()?;
        if frame.header.msg_type != MsgType::TaskEvent {
            debug!("ignoring {} while following", frame.header.msg_type);
            continue;
        }

        let mut payload = frame.payload;
        let event = decode_exact::<TaskEvent>(&mut payload)?;

        match event.event_type {
            EventType::Output => {
                std::io::stdout().write_all(&event.data)?;
                std::io::stdout().flush()?;
            }
            EventType::StateChange => {
                eprintln!("-- {}", event.state);
            }
            EventType::TaskError => {
                eprintln!("-- error: {}", String::from_utf8_lossy(&event.data));
            }
            EventType::Complete => {
                eprintln!("-- {}", event.state);
                if event.state == TaskState::Completed {
                    if !event.data.is_empty() {
                        println!("{}", String::from_utf8_lossy(&event.data));
                    }
                    return Ok(EXIT_OK);
                }
                return Ok(EXIT_TASK_FAILED);
            }
        }
    }
}

fn print_task(task: &TaskSummary) {
    println!("task:      {}", task.task_id);
    println!("state:     {}", task.state);
    println!("repo:      {} ({})", task.repo_url, task.branch);
    if let Some(node_id) = &task.node_id {
        println!("node:      {node_id}");
    }
    println!("created:   {}", format_time(task.created_at_ms));
    if let Some(started) = task.started_at_ms {
        println!("started:   {}", format_time(started));
    }
    if let Some(completed) = task.completed_at_ms {
        println!("completed: {}", format_time(completed));
    }
    if let Some(error) = &task.error_message {
        println!("error:     {error}");
    }
    if let Some(pr_url) = &task.pr_url {
        println!("pr:        {pr_url}");
    }
    print_metrics("usage:     ", &task.usage);
}

fn print_usage(report: &UsageResponse) {
    print_metrics("total: ", &report.total);
    for task in &report.per_task {
        print!("  {}  ", short_id(&task.task_id));
        print_metrics("", &task.metrics);
    }
}

fn print_metrics(prefix: &str, usage: &UsageMetrics) {
    println!(
        "{prefix}in={} out={} cache_r={} cache_w={} tools={} compute={}s",
        usage.input_tokens,
        usage.output_tokens,
        usage.cache_read_tokens,
        usage.cache_write_tokens,
        usage.tool_calls,
        usage.compute_time_ms / 1000,
    );
}

fn parse_task_id(hex: &str) -> Result<TaskId, ClientError> {
    TaskId::from_hex(hex).ok_or_else(|| {
        // Malformed arguments exit 3, matching clap's own validation
        eprintln!("error: '{hex}' is not a task id (expected 64 hex characters)");
        std::process::exit(EXIT_BAD_ARGS);
    })
}

fn short_id(task_id: &TaskId) -> String {
    task_id.to_string()[..16].to_string()
}

fn format_time(ms: u64) -> String {
    match jiff::Timestamp::from_millisecond(ms as i64) {
        Ok(ts) => ts.strftime("%Y-%m-%d %H:%M:%S").to_string(),
        Err(_) => ms.to_string(),
    }
}

fn enable_logging(args: &Args) {
    let verbosity = match args.verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        3.. => tracing::Level::TRACE,
    };

    let filters = filter::Targets::new()
        .with_target("rustls", tracing::Level::WARN)
        .with_default(verbosity);

    let fmt_layer = tracing_subscriber::fmt::layer()
        .compact()
        .without_time()
        .with_writer(std::io::stderr)
        .with_filter(filters);

    tracing_subscriber::registry().with(fmt_layer).init();
}
