use serde::Deserialize;
use std::fs;
use std::net::Ipv4Addr;
use std::path::Path;

use tcredir_common::{RedirectConfig, DEFAULT_SENTINEL};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("sentinel address must not be 0.0.0.0")]
    UnspecifiedSentinel,
    #[error("service_port and api_port must differ (both {0})")]
    PortClash(u16),
}

/// Which kernel channel carries observed packets to userspace.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TelemetryBackend {
    /// Ring buffer when the kernel supports it, perf event array otherwise.
    #[default]
    Auto,
    Ring,
    Perf,
}

/// Application configuration, loadable from CLI or YAML file.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Network interface to attach the XDP and TC programs on.
    #[serde(default = "default_interface")]
    pub interface: String,

    /// Local address inbound TCP traffic is redirected to.
    #[serde(default = "default_sentinel")]
    pub sentinel: Ipv4Addr,

    /// Telemetry channel backend.
    #[serde(default)]
    pub telemetry: TelemetryBackend,

    /// Port of the local service redirected connections land on.
    #[serde(default = "default_service_port")]
    pub service_port: u16,

    /// Admin API port.
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Seconds after which an idle observed flow is forgotten.
    #[serde(default = "default_flow_timeout")]
    pub flow_timeout: u64,

    /// Quiet mode (suppress non-error logs).
    #[serde(default)]
    pub quiet: bool,

    /// List of CIDRs allowed to access the admin API (empty = allow all).
    #[serde(default)]
    pub allowed_ips: Vec<String>,
}

fn default_interface() -> String {
    "eth0".to_string()
}

fn default_sentinel() -> Ipv4Addr {
    Ipv4Addr::from(DEFAULT_SENTINEL)
}

fn default_service_port() -> u16 {
    80
}

fn default_api_port() -> u16 {
    3000
}

fn default_flow_timeout() -> u64 {
    60
}

impl Default for Config {
    fn default() -> Self {
        Self {
            interface: default_interface(),
            sentinel: default_sentinel(),
            telemetry: TelemetryBackend::default(),
            service_port: default_service_port(),
            api_port: default_api_port(),
            flow_timeout: default_flow_timeout(),
            quiet: false,
            allowed_ips: Vec::new(),
        }
    }
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Merge CLI args into config (CLI takes precedence).
    pub fn merge_cli(&mut self, cli: &CliArgs) {
        if let Some(interface) = &cli.interface {
            self.interface = interface.clone();
        }
        if let Some(sentinel) = cli.sentinel {
            self.sentinel = sentinel;
        }
        if let Some(telemetry) = cli.telemetry {
            self.telemetry = telemetry;
        }
        if let Some(port) = cli.service_port {
            self.service_port = port;
        }
        if let Some(port) = cli.api_port {
            self.api_port = port;
        }
        if let Some(timeout) = cli.flow_timeout {
            self.flow_timeout = timeout;
        }
        if cli.quiet {
            self.quiet = true;
        }
        if !cli.allowed_ips.is_empty() {
            self.allowed_ips = cli.allowed_ips.clone();
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sentinel.is_unspecified() {
            return Err(ConfigError::UnspecifiedSentinel);
        }
        if self.service_port == self.api_port {
            return Err(ConfigError::PortClash(self.api_port));
        }
        Ok(())
    }

    /// Hook settings derived from this config.
    pub fn redirect(&self) -> RedirectConfig {
        RedirectConfig::new(u32::from(self.sentinel))
    }
}

use clap::Parser;

/// tcredir: transparent TCP redirect with packet telemetry
#[derive(Parser, Debug, Clone, Default)]
#[command(version, about, long_about = None)]
pub struct CliArgs {
    /// Network interface to attach the programs to (e.g., eth0).
    #[arg(short, long)]
    pub interface: Option<String>,

    /// Local IPv4 address inbound TCP traffic is redirected to.
    #[arg(short, long)]
    pub sentinel: Option<Ipv4Addr>,

    /// Telemetry channel backend.
    #[arg(short, long, value_enum)]
    pub telemetry: Option<TelemetryBackend>,

    /// Port of the local service redirected connections land on.
    #[arg(long)]
    pub service_port: Option<u16>,

    /// Port to serve the admin API on.
    #[arg(short = 'p', long)]
    pub api_port: Option<u16>,

    /// Path to YAML config file.
    #[arg(short, long)]
    pub config: Option<String>,

    /// Seconds after which an idle observed flow is forgotten.
    #[arg(long)]
    pub flow_timeout: Option<u64>,

    /// Quiet mode (suppress non-error logs).
    #[arg(short = 'q', long)]
    pub quiet: bool,

    /// IP CIDRs allowed to access the admin API (e.g., 10.0.0.0/8). Repeat for multiple.
    #[arg(long)]
    pub allowed_ips: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.interface, "eth0");
        assert_eq!(config.sentinel, Ipv4Addr::new(10, 0, 1, 1));
        assert_eq!(config.telemetry, TelemetryBackend::Auto);
        assert_eq!(config.service_port, 80);
        assert_eq!(config.api_port, 3000);
        assert!(config.validate().is_ok());
        assert_eq!(config.redirect().sentinel, DEFAULT_SENTINEL);
        assert_eq!(config.redirect().dscp_marker, 0x1c);
    }

    #[test]
    fn yaml_fills_missing_keys() {
        let config = Config::from_yaml("sentinel: 192.168.50.1\ntelemetry: perf\n").unwrap();
        assert_eq!(config.sentinel, Ipv4Addr::new(192, 168, 50, 1));
        assert_eq!(config.telemetry, TelemetryBackend::Perf);
        assert_eq!(config.interface, "eth0");
        assert_eq!(config.flow_timeout, 60);
    }

    #[test]
    fn cli_overrides_file() {
        let mut config = Config::from_yaml("interface: ens3\napi_port: 9000\n").unwrap();
        let cli = CliArgs::parse_from(["tcredir", "-i", "lo", "--telemetry", "ring", "-q"]);
        config.merge_cli(&cli);
        assert_eq!(config.interface, "lo");
        assert_eq!(config.api_port, 9000);
        assert_eq!(config.telemetry, TelemetryBackend::Ring);
        assert!(config.quiet);
    }

    #[test]
    fn rejects_bad_values() {
        let mut config = Config {
            sentinel: Ipv4Addr::UNSPECIFIED,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::UnspecifiedSentinel)));

        config.sentinel = Ipv4Addr::LOCALHOST;
        config.api_port = config.service_port;
        assert!(matches!(config.validate(), Err(ConfigError::PortClash(80))));
    }

    #[test]
    fn unknown_backend_fails_to_parse() {
        assert!(matches!(
            Config::from_yaml("telemetry: carrier-pigeon\n"),
            Err(ConfigError::Yaml(_))
        ));
    }
}
