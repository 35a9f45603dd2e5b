//! Server configuration from environment variables

use std::time::Duration;

use party_core::{HostLeavePolicy, LobbyConfig};
use tracing::warn;

pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 8000;

/// How often admission entries are pruned and track titles refreshed
pub const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub port: u16,
    /// Media server used to resolve track titles for the lobby
    pub catalog_url: Option<String>,
    pub lobby: LobbyConfig,
}

impl ServerConfig {
    /// Read `BIND_ADDR`, `PORT`, `CATALOG_URL` and `HOST_LEAVE_POLICY`
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let bind_addr = lookup("BIND_ADDR").unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string());
        let port = lookup("PORT")
            .and_then(|p| p.parse().ok())
            .unwrap_or(DEFAULT_PORT);
        let catalog_url = lookup("CATALOG_URL").filter(|url| !url.trim().is_empty());

        let host_leave_policy = match lookup("HOST_LEAVE_POLICY") {
            Some(value) => HostLeavePolicy::parse(&value).unwrap_or_else(|| {
                warn!("Unknown HOST_LEAVE_POLICY {:?}, using default", value);
                HostLeavePolicy::default()
            }),
            None => HostLeavePolicy::default(),
        };

        Self {
            bind_addr,
            port,
            catalog_url,
            lobby: LobbyConfig {
                host_leave_policy,
                ..LobbyConfig::default()
            },
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_addr, self.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.listen_addr(), "0.0.0.0:8000");
        assert!(config.catalog_url.is_none());
        assert_eq!(config.lobby.host_leave_policy, HostLeavePolicy::Dissolve);
    }

    #[test]
    fn test_from_lookup() {
        let vars: HashMap<&str, &str> = [
            ("BIND_ADDR", "127.0.0.1"),
            ("PORT", "9100"),
            ("CATALOG_URL", "http://media:8000"),
            ("HOST_LEAVE_POLICY", "promote"),
        ]
        .into_iter()
        .collect();

        let config = ServerConfig::from_lookup(|key| vars.get(key).map(|v| v.to_string()));
        assert_eq!(config.listen_addr(), "127.0.0.1:9100");
        assert_eq!(config.catalog_url.as_deref(), Some("http://media:8000"));
        assert_eq!(config.lobby.host_leave_policy, HostLeavePolicy::PromoteNextJoined);
    }

    #[test]
    fn test_bad_values_fall_back() {
        let config = ServerConfig::from_lookup(|key| match key {
            "PORT" => Some("not-a-port".into()),
            "HOST_LEAVE_POLICY" => Some("whatever".into()),
            "CATALOG_URL" => Some("  ".into()),
            _ => None,
        });
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.lobby.host_leave_policy, HostLeavePolicy::Dissolve);
        assert!(config.catalog_url.is_none());
    }
}
