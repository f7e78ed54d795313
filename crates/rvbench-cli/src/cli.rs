//! Command-line interface definitions and parsing

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "rvbench", author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Configuration file path
    #[arg(short, long, global = true)]
    pub config: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Locate a server and measure direct request/response throughput
    Client(ClientArgs),
    /// Locate a server and measure throughput over a virtual circuit
    VcClient(ClientArgs),
    /// Answer locate requests and echo sums until idle
    Server(ServerArgs),
    /// Run the routing daemon clients and servers connect to
    Daemon {
        /// Address to listen on
        #[arg(long, value_name = "ADDR")]
        listen: Option<String>,
    },
}

/// Transport addressing shared by clients and servers
#[derive(Args, Debug, Clone, Default)]
pub struct TransportArgs {
    /// Service port, optionally `<port>:<direct-port>`
    #[arg(long)]
    pub service: Option<String>,

    /// Network interface to join the bus on
    #[arg(long)]
    pub network: Option<String>,

    /// Routing daemon address
    #[arg(long)]
    pub daemon: Option<String>,
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    #[command(flatten)]
    pub transport: TransportArgs,

    /// Seconds between requests; 0 sends back-to-back
    #[arg(long, value_name = "SECONDS")]
    pub interval: Option<f64>,

    /// Print progress every N requests and responses
    #[arg(long, value_name = "N")]
    pub status: Option<u32>,

    /// Print the final report as JSON
    #[arg(long)]
    pub json: bool,

    /// Number of requests to send
    #[arg(value_name = "REQUEST-COUNT")]
    pub count: Option<u32>,
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    #[command(flatten)]
    pub transport: TransportArgs,

    /// Print progress every N requests
    #[arg(long, value_name = "N")]
    pub status: Option<u32>,

    /// Exit after this many seconds without traffic
    #[arg(long, value_name = "SECONDS")]
    pub idle_timeout: Option<f64>,

    /// Answer in the updated request instead of a fresh message
    #[arg(long)]
    pub reuse_request: bool,

    /// Print the final statistics as JSON
    #[arg(long)]
    pub json: bool,
}

/// Rewrite single-dash long flags (`-service 7500`) as `--service 7500`
///
/// Short flags, negative numbers and everything after `--` pass through.
pub fn normalize_legacy_flags<I>(args: I) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    let mut passthrough = false;
    args.into_iter()
        .enumerate()
        .map(|(index, arg)| {
            if index == 0 || passthrough {
                return arg;
            }
            if arg == "--" {
                passthrough = true;
                return arg;
            }
            match arg.strip_prefix('-') {
                Some(rest)
                    if rest.len() > 1
                        && !rest.starts_with('-')
                        && rest.starts_with(|c: char| c.is_ascii_alphabetic()) =>
                {
                    format!("--{}", rest)
                }
                _ => arg,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(line: &str) -> Vec<String> {
        line.split_whitespace().map(str::to_string).collect()
    }

    #[test]
    fn test_legacy_flags_are_normalized() {
        let normalized = normalize_legacy_flags(args(
            "rvbench client -service 7522 -daemon host:7500 -interval 0.5 -v 100",
        ));
        assert_eq!(
            normalized,
            args("rvbench client --service 7522 --daemon host:7500 --interval 0.5 -v 100")
        );
    }

    #[test]
    fn test_passthrough_after_double_dash() {
        let normalized = normalize_legacy_flags(args("rvbench client --status 10 -- -5"));
        assert_eq!(normalized, args("rvbench client --status 10 -- -5"));
    }

    #[test]
    fn test_parse_client() {
        let cli = Cli::parse_from(normalize_legacy_flags(args(
            "rvbench vc-client -status 100 -network eth0 2500",
        )));
        match cli.command {
            Commands::VcClient(client) => {
                assert_eq!(client.count, Some(2500));
                assert_eq!(client.status, Some(100));
                assert_eq!(client.transport.network.as_deref(), Some("eth0"));
                assert!(client.interval.is_none());
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_parse_server_with_global_flags() {
        let cli = Cli::parse_from(args("rvbench server --reuse-request -v -c bench.toml"));
        assert!(cli.verbose);
        assert_eq!(cli.config.as_deref(), Some("bench.toml"));
        assert!(matches!(
            cli.command,
            Commands::Server(ServerArgs { reuse_request: true, .. })
        ));
    }
}
