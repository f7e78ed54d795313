//! rvbench CLI configuration
//!
//! Settings come from an optional TOML file with one table per concern:
//!
//! ```toml
//! [transport]
//! daemon = "127.0.0.1:7500"
//!
//! [client]
//! requests = 50000
//! interval_secs = 0.01
//!
//! [server]
//! idle_timeout_secs = 300
//! ```
//!
//! Every key is optional. Layers are merged with figment, later ones winning:
//! built-in defaults, the TOML file (`-c <path>` or `rvbench.toml` in the
//! working directory), `RVBENCH_*` environment variables such as
//! `RVBENCH_CLIENT__REQUESTS=500`, then command line flags.

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use rvbench_core::net::DEFAULT_DAEMON;
use rvbench_core::TransportParams;
use rvbench_runtime::config::{
    DEFAULT_IDLE_GRACE, DEFAULT_REQUESTS, DEFAULT_REQUEST_TIMEOUT, DEFAULT_SERVER_IDLE_TIMEOUT,
    DEFAULT_VC_CONNECT_TIMEOUT,
};
use rvbench_runtime::{ClientConfig, PayloadMode, ServerConfig, SessionMode};

use crate::cli::{Commands, TransportArgs};
use crate::error::{CliError, Result};

/// File read when no `-c` path is given; missing is fine
pub const DEFAULT_CONFIG_FILE: &str = "rvbench.toml";
/// Environment variables with this prefix override file values
pub const ENV_PREFIX: &str = "RVBENCH_";

/// Service clients bind when none is configured
pub const DEFAULT_CLIENT_SERVICE: &str = "7522:7524";
/// Service servers bind when none is configured
pub const DEFAULT_SERVER_SERVICE: &str = "7522:7523";

// ----------------------------------------------------------------------------
// Application Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub transport: TransportSection,
    pub client: ClientSection,
    pub server: ServerSection,
    pub daemon: DaemonSection,
}

/// Where the bus daemon lives and which routing domain to join
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSection {
    /// Falls back to the per-role default service when unset
    pub service: Option<String>,
    pub network: String,
    pub daemon: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSection {
    pub requests: u32,
    /// Seconds between requests; zero sends back-to-back
    pub interval_secs: f64,
    pub status_every: u32,
    /// Defaults to 30 s for direct runs and 60 s for circuit runs
    pub search_timeout_secs: Option<f64>,
    pub vc_connect_timeout_secs: f64,
    pub request_timeout_secs: f64,
    pub idle_grace_secs: f64,
    pub payload: PayloadMode,
    pub checksum: Option<bool>,
    pub reuse_message: Option<bool>,
    pub dedicated_dispatcher: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub status_every: u32,
    pub idle_timeout_secs: f64,
    pub new_message: bool,
    pub serve_direct: bool,
    pub serve_circuits: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonSection {
    pub listen: String,
}

// ----------------------------------------------------------------------------
// Default Implementations
// ----------------------------------------------------------------------------

impl Default for TransportSection {
    fn default() -> Self {
        Self {
            service: None,
            network: String::new(),
            daemon: DEFAULT_DAEMON.to_string(),
        }
    }
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            requests: DEFAULT_REQUESTS,
            interval_secs: 0.0,
            status_every: 0,
            search_timeout_secs: None,
            vc_connect_timeout_secs: DEFAULT_VC_CONNECT_TIMEOUT.as_secs_f64(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT.as_secs_f64(),
            idle_grace_secs: DEFAULT_IDLE_GRACE.as_secs_f64(),
            payload: PayloadMode::Random,
            checksum: None,
            reuse_message: None,
            dedicated_dispatcher: true,
        }
    }
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            status_every: 0,
            idle_timeout_secs: DEFAULT_SERVER_IDLE_TIMEOUT.as_secs_f64(),
            new_message: true,
            serve_direct: true,
            serve_circuits: true,
        }
    }
}

impl Default for DaemonSection {
    fn default() -> Self {
        Self {
            listen: DEFAULT_DAEMON.to_string(),
        }
    }
}

// ----------------------------------------------------------------------------
// Loading and Conversion
// ----------------------------------------------------------------------------

/// Convert a seconds value from the file or the command line
pub fn seconds(name: &str, value: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(value)
        .map_err(|_| CliError::config(format!("{} must be a non-negative number of seconds", name)))
}

impl AppConfig {
    /// Load configuration from a specific file path
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = existing_file(path.as_ref())?;
        let figment = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(path));
        Self::extract(figment)
    }

    /// Load every layer, with the flags of `command` on top
    pub fn load_with_overrides(path: Option<&Path>, command: &Commands) -> Result<Self> {
        let file = match path {
            Some(path) => existing_file(path)?,
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };
        let figment = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(file))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));
        Self::extract(command_overrides(figment, command))
    }

    fn extract(figment: Figment) -> Result<Self> {
        let config: AppConfig = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values no run could start with
    pub fn validate(&self) -> Result<()> {
        self.client_config(SessionMode::Direct)?;
        self.client_config(SessionMode::Circuit)?;
        self.server_config()?.validate()?;
        if self.transport.daemon.is_empty() {
            return Err(CliError::config("transport.daemon must not be empty"));
        }
        if self.daemon.listen.is_empty() {
            return Err(CliError::config("daemon.listen must not be empty"));
        }
        Ok(())
    }

    /// Transport parameters for a role, falling back to its default service
    pub fn transport_params(&self, default_service: &str) -> TransportParams {
        let service = self
            .transport
            .service
            .as_deref()
            .unwrap_or(default_service);
        TransportParams::new(service, &self.transport.network, &self.transport.daemon)
    }

    /// Client settings for one session mode, mode defaults filled in
    pub fn client_config(&self, mode: SessionMode) -> Result<ClientConfig> {
        let section = &self.client;
        let mut config = ClientConfig::for_mode(mode)
            .with_requests(section.requests)
            .with_interval(seconds("client.interval_secs", section.interval_secs)?)
            .with_status_every(section.status_every)
            .with_vc_connect_timeout(seconds(
                "client.vc_connect_timeout_secs",
                section.vc_connect_timeout_secs,
            )?)
            .with_request_timeout(seconds(
                "client.request_timeout_secs",
                section.request_timeout_secs,
            )?)
            .with_idle_grace(seconds("client.idle_grace_secs", section.idle_grace_secs)?)
            .with_payload(section.payload)
            .with_dedicated_dispatcher(section.dedicated_dispatcher);

        if let Some(timeout) = section.search_timeout_secs {
            config = config.with_search_timeout(seconds("client.search_timeout_secs", timeout)?);
        }
        if let Some(checksum) = section.checksum {
            config = config.with_checksum(checksum);
        }
        if let Some(reuse) = section.reuse_message {
            config = config.with_reuse_message(reuse);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn server_config(&self) -> Result<ServerConfig> {
        let section = &self.server;
        Ok(ServerConfig {
            status_every: section.status_every,
            idle_timeout: seconds("server.idle_timeout_secs", section.idle_timeout_secs)?,
            new_message: section.new_message,
            serve_direct: section.serve_direct,
            serve_circuits: section.serve_circuits,
        })
    }
}

fn existing_file(path: &Path) -> Result<PathBuf> {
    if path.is_file() {
        Ok(path.to_path_buf())
    } else {
        Err(CliError::config(format!(
            "configuration file {} not found",
            path.display()
        )))
    }
}

fn command_overrides(figment: Figment, command: &Commands) -> Figment {
    match command {
        Commands::Client(args) | Commands::VcClient(args) => {
            let mut figment = transport_overrides(figment, &args.transport);
            if let Some(count) = args.count {
                figment = figment.merge(("client.requests", count));
            }
            if let Some(interval) = args.interval {
                figment = figment.merge(("client.interval_secs", interval));
            }
            if let Some(status) = args.status {
                figment = figment.merge(("client.status_every", status));
            }
            figment
        }
        Commands::Server(args) => {
            let mut figment = transport_overrides(figment, &args.transport);
            if let Some(status) = args.status {
                figment = figment.merge(("server.status_every", status));
            }
            if let Some(idle) = args.idle_timeout {
                figment = figment.merge(("server.idle_timeout_secs", idle));
            }
            if args.reuse_request {
                figment = figment.merge(("server.new_message", false));
            }
            figment
        }
        Commands::Daemon { listen: Some(listen) } => figment.merge(("daemon.listen", listen)),
        Commands::Daemon { listen: None } => figment,
    }
}

fn transport_overrides(mut figment: Figment, args: &TransportArgs) -> Figment {
    if let Some(service) = &args.service {
        figment = figment.merge(("transport.service", service));
    }
    if let Some(network) = &args.network {
        figment = figment.merge(("transport.network", network));
    }
    if let Some(daemon) = &args.daemon {
        figment = figment.merge(("transport.daemon", daemon));
    }
    figment
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::Cli;
    use clap::Parser;
    use figment::Jail;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());

        let direct = config.client_config(SessionMode::Direct).unwrap();
        assert_eq!(direct.requests, 10_000);
        assert_eq!(direct.search_timeout, Duration::from_secs(30));
        assert_eq!(direct.request_timeout, Duration::from_secs(10));

        let circuit = config.client_config(SessionMode::Circuit).unwrap();
        assert_eq!(circuit.search_timeout, Duration::from_secs(60));
        assert_eq!(circuit.vc_connect_timeout, Duration::from_secs(20));

        let server = config.server_config().unwrap();
        assert_eq!(server.idle_timeout, Duration::from_secs(120));
    }

    fn command(line: &str) -> Commands {
        Cli::parse_from(line.split_whitespace()).command
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        Jail::expect_with(|jail| {
            jail.create_file(
                DEFAULT_CONFIG_FILE,
                r#"
                [client]
                requests = 500
                interval_secs = 0.25
                payload = "counting"
                "#,
            )?;

            let config = AppConfig::load_with_overrides(None, &command("rvbench client"))
                .map_err(|e| e.to_string())?;
            let client = config
                .client_config(SessionMode::Direct)
                .map_err(|e| e.to_string())?;
            assert_eq!(client.requests, 500);
            assert_eq!(client.interval, Duration::from_millis(250));
            assert_eq!(client.payload, PayloadMode::Counting);
            assert_eq!(config.transport.daemon, DEFAULT_DAEMON);
            Ok(())
        });
    }

    #[test]
    fn test_layer_priority() {
        Jail::expect_with(|jail| {
            jail.create_file(
                DEFAULT_CONFIG_FILE,
                r#"
                [transport]
                network = "lan"
                daemon = "10.0.0.2:7500"

                [client]
                requests = 500
                status_every = 10
                "#,
            )?;
            jail.set_env("RVBENCH_CLIENT__REQUESTS", "700");
            jail.set_env("RVBENCH_TRANSPORT__DAEMON", "10.0.0.3:7500");

            let config = AppConfig::load_with_overrides(
                None,
                &command("rvbench client --daemon 10.0.0.1:7500 --service 7600:7601"),
            )
            .map_err(|e| e.to_string())?;
            let params = config.transport_params(DEFAULT_CLIENT_SERVICE);
            assert_eq!(params.service, "7600:7601");
            assert_eq!(params.network, "lan");
            assert_eq!(params.daemon, "10.0.0.1:7500");
            assert_eq!(config.client.requests, 700);
            assert_eq!(config.client.status_every, 10);

            let config = AppConfig::load_with_overrides(None, &command("rvbench client 25"))
                .map_err(|e| e.to_string())?;
            assert_eq!(config.client.requests, 25);
            assert_eq!(config.transport.daemon, "10.0.0.3:7500");
            Ok(())
        });
    }

    #[test]
    fn test_server_and_daemon_flags() {
        Jail::expect_with(|_| {
            let config = AppConfig::load_with_overrides(
                None,
                &command("rvbench server --reuse-request --idle-timeout 30 --status 5"),
            )
            .map_err(|e| e.to_string())?;
            let server = config.server_config().map_err(|e| e.to_string())?;
            assert!(!server.new_message);
            assert_eq!(server.idle_timeout, Duration::from_secs(30));
            assert_eq!(server.status_every, 5);

            let config = AppConfig::load_with_overrides(
                None,
                &command("rvbench daemon --listen 0.0.0.0:7600"),
            )
            .map_err(|e| e.to_string())?;
            assert_eq!(config.daemon.listen, "0.0.0.0:7600");
            Ok(())
        });
    }

    #[test]
    fn test_negative_interval_flag_is_rejected() {
        Jail::expect_with(|_| {
            let result = AppConfig::load_with_overrides(
                None,
                &command("rvbench client --interval=-1"),
            );
            assert!(matches!(result, Err(CliError::Config(_))));
            Ok(())
        });
    }

    #[test]
    fn test_missing_explicit_file_is_rejected() {
        let result = AppConfig::load_from_file("/nonexistent/rvbench.toml");
        assert!(matches!(result, Err(CliError::Config(_))));
    }

    #[test]
    fn test_rejects_negative_durations() {
        let mut config = AppConfig::default();
        config.client.interval_secs = -1.0;
        assert!(matches!(config.validate(), Err(CliError::Config(_))));
    }

    #[test]
    fn test_role_default_service() {
        let mut config = AppConfig::default();
        assert_eq!(
            config.transport_params(DEFAULT_SERVER_SERVICE).service,
            DEFAULT_SERVER_SERVICE
        );

        config.transport.service = Some("7600".to_string());
        assert_eq!(config.transport_params(DEFAULT_CLIENT_SERVICE).service, "7600");
    }
}
