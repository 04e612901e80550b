//! Runtime configuration for the signaling client.

use huddle_protocol::HubProtocol;
use huddle_transport::PoolConfig;
use std::time::Duration;

/// Shortest status timeout a client may announce.
pub const MIN_STATUS_TIMEOUT: Duration = Duration::from_secs(15);

/// Own heartbeat is sent this long before the announced timeout runs out.
pub const SELF_STATUS_MARGIN: Duration = Duration::from_secs(5);

/// Message tokens are refreshed this long before their `exp`.
pub const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Negotiation server: a full url, or a bare site name.
    pub server: String,
    /// How long peers should consider us online without a heartbeat.
    pub status_timeout: Duration,
    /// Maximum elastic sends in flight at once.
    pub max_concurrent_sends: usize,
    /// Hub wire protocol.
    pub hub_protocol: HubProtocol,
    /// Period of the presence and token sweep.
    pub presence_interval: Duration,
    /// Transport pool recycling.
    pub pool: PoolConfig,
    /// Attempts for announce, quit and handshake messages.
    pub important_message_tries: u32,
    /// Upper bound on the goodbye message during disconnect.
    pub quit_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: String::new(),
            status_timeout: MIN_STATUS_TIMEOUT,
            max_concurrent_sends: 4,
            hub_protocol: HubProtocol::Json,
            presence_interval: Duration::from_secs(5),
            pool: PoolConfig::default(),
            important_message_tries: 3,
            quit_timeout: Duration::from_secs(1),
        }
    }
}

impl ClientConfig {
    /// Create a configuration for `server` with defaults.
    #[must_use]
    pub fn new(server: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            ..Default::default()
        }
    }

    /// Apply clamps and normalize the server address.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        self.server = normalize_server_address(&self.server);
        self.status_timeout = self.status_timeout.max(MIN_STATUS_TIMEOUT);
        self.max_concurrent_sends = self.max_concurrent_sends.max(1);
        self.important_message_tries = self.important_message_tries.max(1);
        self
    }
}

/// Resolve a server setting to a base url.
///
/// Anything containing `://` is used as given without a trailing `/`; a bare
/// name is an Azure Functions site.
#[must_use]
pub fn normalize_server_address(server: &str) -> String {
    let server = server.trim();
    if server.contains("://") {
        server.trim_end_matches('/').to_string()
    } else {
        format!("https://{server}.azurewebsites.net")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_server_address() {
        assert_eq!(
            normalize_server_address("http://localhost:7071/"),
            "http://localhost:7071"
        );
        assert_eq!(
            normalize_server_address("https://signal.example.com"),
            "https://signal.example.com"
        );
        assert_eq!(
            normalize_server_address("mysignal"),
            "https://mysignal.azurewebsites.net"
        );
    }

    #[test]
    fn test_normalized_clamps() {
        let config = ClientConfig {
            status_timeout: Duration::from_secs(3),
            max_concurrent_sends: 0,
            important_message_tries: 0,
            ..ClientConfig::new("signal")
        }
        .normalized();

        assert_eq!(config.status_timeout, MIN_STATUS_TIMEOUT);
        assert_eq!(config.max_concurrent_sends, 1);
        assert_eq!(config.important_message_tries, 1);
        assert_eq!(config.server, "https://signal.azurewebsites.net");

        let config = ClientConfig {
            status_timeout: Duration::from_secs(120),
            ..ClientConfig::new("http://x")
        }
        .normalized();
        assert_eq!(config.status_timeout, Duration::from_secs(120));
        assert_eq!(config.max_concurrent_sends, 4);
    }
}
