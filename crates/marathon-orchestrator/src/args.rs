use std::net::SocketAddr;

use clap::Parser;
use marathon_common::Secret;

#[derive(Parser, Debug, Clone)]
#[command(version = "0.1.0", about = "Marathon orchestrator")]
pub struct Args {
    /// IP address to listen on
    #[clap(
        short = 'i',
        long,
        env = "MARATHON_LISTEN_ADDRESS",
        default_value = "0.0.0.0"
    )]
    pub listen_address: String,

    /// Port to listen on
    #[clap(short = 'p', long, env = "MARATHON_LISTEN_PORT", default_value = "8080")]
    pub listen_port: u16,

    /// Remove a node after this long without a heartbeat
    #[clap(
        long,
        value_name = "MS",
        env = "MARATHON_NODE_TIMEOUT_MS",
        default_value = "30000"
    )]
    pub node_timeout_ms: u64,

    /// Expected node heartbeat cadence; also drives the prune ticker
    #[clap(
        long,
        value_name = "MS",
        env = "MARATHON_HEARTBEAT_INTERVAL_MS",
        default_value = "5000"
    )]
    pub heartbeat_interval_ms: u64,

    /// Anthropic API key injected into execute commands
    #[clap(long, env = "MARATHON_ANTHROPIC_API_KEY", default_value = "")]
    pub anthropic_api_key: String,

    /// Shared key for heartbeat authentication; empty disables auth
    #[clap(long, env = "MARATHON_SHARED_KEY", default_value = "")]
    pub shared_key: String,

    /// PEM certificate chain; enables TLS together with --tls-key-path
    #[clap(long, value_name = "PATH", env = "MARATHON_TLS_CERT_PATH")]
    pub tls_cert_path: Option<String>,

    /// PEM private key; enables TLS together with --tls-cert-path
    #[clap(long, value_name = "PATH", env = "MARATHON_TLS_KEY_PATH")]
    pub tls_key_path: Option<String>,

    /// How often (in seconds) to log operational counters
    #[clap(
        long,
        value_name = "SECONDS",
        env = "MARATHON_METRICS_INTERVAL",
        default_value = "60"
    )]
    pub metrics_interval: u64,

    /// Keep quiet and only log errors
    #[clap(short, long, conflicts_with = "verbose", default_value_t = false)]
    pub quiet: bool,

    #[clap(
        short = 'v',
        long,
        conflicts_with = "quiet",
        action = clap::ArgAction::Count,
        help = "Output details about requests and scheduling; specify multiple times for more detail"
    )]
    pub verbose: u8,
}

impl Args {
    pub fn listen_socket_addr(&self) -> SocketAddr {
        let addr = self
            .listen_address
            .parse()
            .expect("invalid listen IP address");

        SocketAddr::new(addr, self.listen_port)
    }

    pub fn anthropic_api_key(&self) -> Option<Secret> {
        if self.anthropic_api_key.is_empty() {
            None
        } else {
            Some(Secret::new(self.anthropic_api_key.clone()))
        }
    }

    pub fn shared_key(&self) -> Option<Secret> {
        if self.shared_key.is_empty() {
            None
        } else {
            Some(Secret::new(self.shared_key.clone()))
        }
    }

    pub fn tls_paths(&self) -> Option<(&str, &str)> {
        match (&self.tls_cert_path, &self.tls_key_path) {
            (Some(cert), Some(key)) => Some((cert, key)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_keys() {
        let args = Args::parse_from(["orchestrator"]);

        assert_eq!(args.listen_address, "0.0.0.0");
        assert_eq!(args.listen_port, 8080);
        assert_eq!(args.node_timeout_ms, 30_000);
        assert_eq!(args.heartbeat_interval_ms, 5_000);
        assert!(args.anthropic_api_key().is_none());
        assert!(args.shared_key().is_none());
        assert!(args.tls_paths().is_none());
    }

    #[test]
    fn tls_requires_both_paths() {
        let args = Args::parse_from(["orchestrator", "--tls-cert-path", "/tmp/cert.pem"]);
        assert!(args.tls_paths().is_none());

        let args = Args::parse_from([
            "orchestrator",
            "--tls-cert-path",
            "/tmp/cert.pem",
            "--tls-key-path",
            "/tmp/key.pem",
        ]);
        assert_eq!(args.tls_paths(), Some(("/tmp/cert.pem", "/tmp/key.pem")));
    }
}
