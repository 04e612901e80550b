//! CLI configuration.
//!
//! Loaded from the first `huddle.toml` found in the search paths, or from an
//! explicit `--config` path. Identity fields default to `HUDDLE_*`
//! environment variables.

use anyhow::{Context, Result};
use huddle_core::client::Credentials;
use huddle_core::ClientConfig;
use huddle_protocol::HubProtocol;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// CLI configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Negotiation server address or site name.
    #[serde(default = "default_server")]
    pub server: String,

    #[serde(default = "default_user_name")]
    pub user_name: String,

    #[serde(default = "default_device_id")]
    pub device_id: String,

    #[serde(default = "default_company_name")]
    pub company_name: String,

    #[serde(default = "default_team_name")]
    pub team_name: String,

    #[serde(default = "default_auth_service_name")]
    pub auth_service_name: String,

    /// Token from the authentication service.
    #[serde(default = "default_auth_service_token")]
    pub auth_service_token: String,

    /// Client tuning.
    #[serde(default)]
    pub client: ClientSection,

    /// Metrics export.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Client tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSection {
    /// Status timeout announced to peers, in seconds.
    #[serde(default = "default_status_timeout")]
    pub status_timeout_secs: u64,

    /// Maximum elastic sends in flight.
    #[serde(default = "default_max_concurrent_sends")]
    pub max_concurrent_sends: usize,

    /// Hub wire protocol, `json` or `messagepack`.
    #[serde(default)]
    pub hub_protocol: HubProtocol,

    /// Attempts for presence protocol messages.
    #[serde(default = "default_important_tries")]
    pub important_message_tries: u32,

    /// Time allowed for the goodbye message, in milliseconds.
    #[serde(default = "default_quit_timeout")]
    pub quit_timeout_ms: u64,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Serve Prometheus metrics.
    #[serde(default)]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

fn env_or(name: &str, fallback: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| fallback.to_string())
}

fn default_server() -> String {
    env_or("HUDDLE_SERVER", "http://localhost:7071")
}

fn default_user_name() -> String {
    std::env::var("HUDDLE_USER_NAME")
        .or_else(|_| std::env::var("USER"))
        .unwrap_or_else(|_| "anonymous".to_string())
}

fn default_device_id() -> String {
    env_or("HUDDLE_DEVICE_ID", "cli")
}

fn default_company_name() -> String {
    env_or("HUDDLE_COMPANY_NAME", "")
}

fn default_team_name() -> String {
    env_or("HUDDLE_TEAM_NAME", "")
}

fn default_auth_service_name() -> String {
    env_or("HUDDLE_AUTH_SERVICE_NAME", "github.com")
}

fn default_auth_service_token() -> String {
    env_or("HUDDLE_AUTH_SERVICE_TOKEN", "")
}

fn default_status_timeout() -> u64 {
    15
}

fn default_max_concurrent_sends() -> usize {
    4
}

fn default_important_tries() -> u32 {
    3
}

fn default_quit_timeout() -> u64 {
    1_000
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: default_server(),
            user_name: default_user_name(),
            device_id: default_device_id(),
            company_name: default_company_name(),
            team_name: default_team_name(),
            auth_service_name: default_auth_service_name(),
            auth_service_token: default_auth_service_token(),
            client: ClientSection::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            status_timeout_secs: default_status_timeout(),
            max_concurrent_sends: default_max_concurrent_sends(),
            hub_protocol: HubProtocol::default(),
            important_message_tries: default_important_tries(),
            quit_timeout_ms: default_quit_timeout(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load configuration from `path`, the search paths, or defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed.
    pub fn load(path: Option<&str>) -> Result<Self> {
        if let Some(path) = path {
            return Self::from_file(shellexpand::tilde(path).as_ref());
        }

        let config_paths = [
            "huddle.toml",
            "/etc/huddle/huddle.toml",
            "~/.config/huddle/huddle.toml",
        ];

        for path in &config_paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::from_file(expanded.as_ref());
            }
        }

        Ok(Self::default())
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Runtime configuration for the signaling client.
    #[must_use]
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            status_timeout: Duration::from_secs(self.client.status_timeout_secs),
            max_concurrent_sends: self.client.max_concurrent_sends,
            hub_protocol: self.client.hub_protocol,
            important_message_tries: self.client.important_message_tries,
            quit_timeout: Duration::from_millis(self.client.quit_timeout_ms),
            ..ClientConfig::new(self.server.as_str())
        }
    }

    /// Credentials presented at negotiation.
    #[must_use]
    pub fn credentials(&self) -> Credentials {
        Credentials {
            user_name: self.user_name.clone(),
            device_id: self.device_id.clone(),
            company_name: self.company_name.clone(),
            team_name: self.team_name.clone(),
            auth_service_token: self.auth_service_token.clone(),
            auth_service_name: self.auth_service_name.clone(),
        }
    }
}
