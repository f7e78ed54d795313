//! Command handlers for the rvbench CLI

use std::sync::Arc;

use tracing::{error, info, warn};

use rvbench_core::{Bus, Daemon, TcpBus, TransportParams};
use rvbench_runtime::{ClientRun, EchoServer, SessionMode};

use crate::cli::{ClientArgs, Cli, Commands, ServerArgs};
use crate::config::{AppConfig, DEFAULT_CLIENT_SERVICE, DEFAULT_SERVER_SERVICE};
use crate::error::Result;

/// Command dispatcher for handling CLI commands
pub struct CommandDispatcher;

impl CommandDispatcher {
    /// Execute a CLI command and return the process exit code
    pub async fn execute(cli: Cli, config: AppConfig) -> Result<i32> {
        match cli.command {
            Commands::Client(args) => {
                Self::handle_client_command(&config, SessionMode::Direct, args).await
            }
            Commands::VcClient(args) => {
                Self::handle_client_command(&config, SessionMode::Circuit, args).await
            }
            Commands::Server(args) => Self::handle_server_command(&config, args).await,
            Commands::Daemon { .. } => Self::handle_daemon_command(&config).await,
        }
    }

    /// Handle the client and vc-client commands
    async fn handle_client_command(
        config: &AppConfig,
        mode: SessionMode,
        args: ClientArgs,
    ) -> Result<i32> {
        let client = config.client_config(mode)?;
        let bus = connect(config.transport_params(DEFAULT_CLIENT_SERVICE), "rvbench client").await?;

        let result = ClientRun::new(Arc::clone(&bus) as Arc<dyn Bus>, client).run().await;
        // the circuit disconnect notice is queued behind the last requests
        close(&bus).await;
        let report = result?;
        if let Some(failure) = report.failure() {
            warn!("{}", failure);
        }

        if args.json {
            println!("{}", serde_json::to_string_pretty(&report)?);
        } else {
            println!("{}", report);
        }
        Ok(report.exit_code())
    }

    /// Handle the server command
    async fn handle_server_command(config: &AppConfig, args: ServerArgs) -> Result<i32> {
        let server = config.server_config()?;
        let bus = connect(config.transport_params(DEFAULT_SERVER_SERVICE), "rvbench server").await?;

        let result = EchoServer::new(Arc::clone(&bus) as Arc<dyn Bus>, server)
            .run_until(shutdown_signal())
            .await;
        close(&bus).await;
        let stats = result?;
        if args.json {
            println!("{}", serde_json::to_string_pretty(&stats)?);
        } else {
            println!(
                "Answered {} requests ({} malformed, {} checksum mismatches) over {} circuits.",
                stats.requests, stats.malformed, stats.checksum_mismatches, stats.circuits_accepted
            );
        }
        Ok(0)
    }

    /// Handle the daemon command
    async fn handle_daemon_command(config: &AppConfig) -> Result<i32> {
        let daemon = Daemon::bind(&config.daemon.listen).await?;
        daemon.run_until(shutdown_signal()).await?;
        info!("Routing daemon stopped");
        Ok(0)
    }
}

async fn connect(params: TransportParams, description: &str) -> Result<Arc<TcpBus>> {
    info!(
        "Connecting to daemon {} on domain {}",
        params.daemon,
        params.domain()
    );
    let bus = TcpBus::connect(params, description).await?;
    Ok(Arc::new(bus))
}

/// Write out everything still queued before the process exits
async fn close(bus: &TcpBus) {
    if let Err(e) = bus.close().await {
        warn!("Bus connection did not flush cleanly: {}", e);
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for interrupt: {}", e);
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_client_and_server_share_default_domain() {
        let config = AppConfig::default();
        let client = config.transport_params(DEFAULT_CLIENT_SERVICE);
        let server = config.transport_params(DEFAULT_SERVER_SERVICE);
        assert_eq!(client.domain(), server.domain());
    }

    #[tokio::test]
    async fn test_unreachable_daemon_fails_client_command() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let cli = Cli::parse_from(["rvbench", "client", "--daemon", &addr.to_string(), "10"]);
        let mut config = AppConfig::default();
        config.transport.daemon = addr.to_string();
        assert!(CommandDispatcher::execute(cli, config).await.is_err());
    }
}
