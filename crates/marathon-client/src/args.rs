use clap::{Parser, Subcommand};
use marathon_protocol::state::TaskState;

#[derive(Parser, Debug, Clone)]
#[command(version = "0.1.0", about = "Marathon client")]
pub struct Args {
    /// Orchestrator host
    #[clap(
        short = 'H',
        long,
        env = "MARATHON_ORCHESTRATOR_ADDRESS",
        default_value = "127.0.0.1",
        global = true
    )]
    pub host: String,

    /// Orchestrator port
    #[clap(
        short = 'p',
        long,
        env = "MARATHON_ORCHESTRATOR_PORT",
        default_value = "8080",
        global = true
    )]
    pub port: u16,

    /// CA bundle for TLS; absent means plaintext TCP
    #[clap(long, value_name = "PATH", env = "MARATHON_TLS_CA_PATH", global = true)]
    pub tls_ca_path: Option<String>,

    /// Expected server name on the orchestrator's certificate; defaults to
    /// the host
    #[clap(long, value_name = "NAME", env = "MARATHON_TLS_HOSTNAME", global = true)]
    pub tls_hostname: Option<String>,

    #[clap(
        short = 'v',
        long,
        action = clap::ArgAction::Count,
        global = true,
        help = "Output protocol details; specify multiple times for more detail"
    )]
    pub verbose: u8,

    #[clap(subcommand)]
    pub command: CliCommand,
}

#[derive(Subcommand, Debug, Clone)]
pub enum CliCommand {
    /// Submit a task and stream its output until it finishes
    Submit {
        /// Repository to work on
        #[clap(long)]
        repo: String,

        /// Branch to check out
        #[clap(long, default_value = "main")]
        branch: String,

        /// Instruction for the coding agent
        #[clap(long)]
        prompt: String,

        /// Github token for private repositories and pull requests
        #[clap(long, env = "MARATHON_GITHUB_TOKEN")]
        github_token: Option<String>,

        /// Open a pull request with the result
        #[clap(long, default_value_t = false)]
        create_pr: bool,

        /// Title for the pull request
        #[clap(long, requires = "create_pr")]
        pr_title: Option<String>,

        /// Body for the pull request
        #[clap(long, requires = "create_pr")]
        pr_body: Option<String>,

        /// Print the task id and exit instead of streaming events
        #[clap(long, default_value_t = false)]
        no_follow: bool,
    },

    /// Show one task
    Status {
        /// Task id (64 hex characters)
        task_id: String,
    },

    /// Cancel a task
    Cancel {
        /// Task id (64 hex characters)
        task_id: String,
    },

    /// List this client's tasks
    List {
        /// Only tasks in this state (queued, starting, running, completed,
        /// failed, cancelled)
        #[clap(long, value_parser = parse_state)]
        state: Option<TaskState>,

        #[clap(long, default_value = "50")]
        limit: u32,

        #[clap(long, default_value = "0")]
        offset: u32,
    },

    /// Usage report for this client
    Usage {
        /// Window start, milliseconds since epoch (0 = open)
        #[clap(long, default_value = "0")]
        start_ms: u64,

        /// Window end, milliseconds since epoch (0 = open)
        #[clap(long, default_value = "0")]
        end_ms: u64,
    },
}

fn parse_state(value: &str) -> Result<TaskState, String> {
    match value.to_ascii_lowercase().as_str() {
        "queued" => Ok(TaskState::Queued),
        "starting" => Ok(TaskState::Starting),
        "running" => Ok(TaskState::Running),
        "completed" => Ok(TaskState::Completed),
        "failed" => Ok(TaskState::Failed),
        "cancelled" => Ok(TaskState::Cancelled),
        other => Err(format!("unknown state '{other}'")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submit_parses() {
        let args = Args::parse_from([
            "marathon", "submit",
            "--repo", "https://github.com/test/repo",
            "--prompt", "Fix the bug",
            "--create-pr",
            "--pr-title", "Fix bug",
        ]);

        match args.command {
            CliCommand::Submit { repo, branch, create_pr, pr_title, .. } => {
                assert_eq!(repo, "https://github.com/test/repo");
                assert_eq!(branch, "main");
                assert!(create_pr);
                assert_eq!(pr_title.as_deref(), Some("Fix bug"));
            }
            other => panic!("expected submit, got {other:?}"),
        }
    }

    #[test]
    fn state_filter_parses() {
        let args = Args::parse_from(["marathon", "list", "--state", "running"]);
        match args.command {
            CliCommand::List { state, .. } => assert_eq!(state, Some(TaskState::Running)),
            other => panic!("expected list, got {other:?}"),
        }
    }

    #[test]
    fn bad_state_is_rejected() {
        assert!(Args::try_parse_from(["marathon", "list", "--state", "paused"]).is_err());
    }

    #[test]
    fn pr_title_requires_create_pr() {
        let result = Args::try_parse_from([
            "marathon", "submit",
            "--repo", "https://github.com/test/repo",
            "--prompt", "p",
            "--pr-title", "oops",
        ]);
        assert!(result.is_err());
    }
}
