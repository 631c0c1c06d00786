use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(version = "0.1.0", about = "Marathon in-VM agent")]
pub struct Args {
    /// Host port to connect to over vsock
    #[clap(long, env = "MARATHON_VSOCK_PORT", default_value = "9999")]
    pub vsock_port: u32,

    /// Where task checkouts live
    #[clap(long, value_name = "PATH", env = "MARATHON_WORK_DIR", default_value = "/workspace")]
    pub work_dir: PathBuf,

    /// The coding-agent executable to run for each task
    #[clap(long, env = "MARATHON_AGENT_CMD", default_value = "claude")]
    pub agent_cmd: String,

    #[clap(
        short = 'v',
        long,
        action = clap::ArgAction::Count,
        help = "Output details about task execution; specify multiple times for more detail"
    )]
    pub verbose: u8,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_keys() {
        let args = Args::parse_from(["agent"]);
        assert_eq!(args.vsock_port, 9999);
        assert_eq!(args.work_dir, PathBuf::from("/workspace"));
        assert_eq!(args.agent_cmd, "claude");
    }
}
