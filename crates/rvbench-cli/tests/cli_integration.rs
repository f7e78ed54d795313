//! Configuration files and full client runs through the command dispatcher

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::oneshot;

use rvbench_cli::{normalize_legacy_flags, AppConfig, Cli, CliError, CommandDispatcher};
use rvbench_core::{Bus, Daemon, TcpBus, TransportParams};
use rvbench_runtime::{EchoServer, ServerConfig, SessionMode};

fn cli(line: &str) -> Cli {
    Cli::parse_from(normalize_legacy_flags(
        line.split_whitespace().map(str::to_string),
    ))
}

/// Parse a command line and layer its flags over the defaults
fn configured(line: &str) -> (Cli, AppConfig) {
    let cli = cli(line);
    let config = AppConfig::load_with_overrides(None, &cli.command).unwrap();
    (cli, config)
}

#[test]
fn test_load_config_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
        [transport]
        service = "7600"
        daemon = "10.1.1.1:7500"

        [client]
        requests = 250
        checksum = false

        [server]
        new_message = false
        "#
    )
    .unwrap();

    let config = AppConfig::load_from_file(file.path()).unwrap();
    assert_eq!(config.transport.service.as_deref(), Some("7600"));

    let client = config.client_config(SessionMode::Circuit).unwrap();
    assert_eq!(client.requests, 250);
    assert!(!client.checksum);
    assert!(!config.server_config().unwrap().new_message);
}

#[test]
fn test_invalid_config_file_is_rejected() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "[server]\nidle_timeout_secs = 0").unwrap();
    assert!(AppConfig::load_from_file(file.path()).is_err());

    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "[client\nrequests = ").unwrap();
    assert!(matches!(
        AppConfig::load_from_file(file.path()),
        Err(CliError::Loading(_))
    ));
}

#[tokio::test]
async fn test_client_command_against_daemon() {
    let daemon = Daemon::bind("127.0.0.1:0").await.unwrap();
    let addr = daemon.local_addr().unwrap().to_string();
    let (stop_daemon, daemon_stopped) = oneshot::channel::<()>();
    let daemon_task = tokio::spawn(daemon.run_until(async {
        let _ = daemon_stopped.await;
    }));

    let params = TransportParams::new("7522:7523", "", &addr);
    let server_bus: Arc<dyn Bus> = Arc::new(TcpBus::connect(params, "test server").await.unwrap());
    let (stop_server, server_stopped) = oneshot::channel::<()>();
    let server_task = tokio::spawn(async move {
        let config = ServerConfig {
            idle_timeout: Duration::from_secs(30),
            ..ServerConfig::default()
        };
        EchoServer::new(server_bus, config)
            .run_until(async {
                let _ = server_stopped.await;
            })
            .await
    });

    // the server subscribes asynchronously; give it a moment before locating
    tokio::time::sleep(Duration::from_millis(250)).await;

    let (direct, config) = configured(&format!("rvbench client -daemon {} -status 50 200", addr));
    assert_eq!(config.client.requests, 200);
    let code = CommandDispatcher::execute(direct, config).await.unwrap();
    assert_eq!(code, 0);

    let (circuit, config) = configured(&format!("rvbench vc-client --daemon {} --json 100", addr));
    let code = CommandDispatcher::execute(circuit, config).await.unwrap();
    assert_eq!(code, 0);

    stop_server.send(()).unwrap();
    let stats = server_task.await.unwrap().unwrap();
    assert_eq!(stats.requests, 300);
    assert_eq!(stats.circuits_accepted, 1);
    assert_eq!(stats.circuits_closed, 1);

    stop_daemon.send(()).unwrap();
    daemon_task.await.unwrap().unwrap();
}
