//! Startup configuration for the proxy.
//!
//! Values come from [`ProxyConfig::default`], optionally overlaid by a JSON
//! file, and finally by command-line flags in `main.rs`.

use crate::error::ProxyError;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Address the client-facing UDP socket binds to
    pub bind_address: SocketAddr,
    /// Downstream server that established sessions are relayed to
    pub backend_address: SocketAddr,
    /// Maximum number of live sessions
    pub max_sessions: usize,
    /// Registry tick cadence in milliseconds
    pub tick_interval_ms: u64,
    /// Sessions silent for this long are dropped
    pub session_timeout_secs: u64,
    /// Interval between keepalive pings to connected clients
    pub keepalive_interval_secs: u64,
    pub motd: MotdConfig,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from(([0, 0, 0, 0], 19132)),
            backend_address: SocketAddr::from(([127, 0, 0, 1], 19133)),
            max_sessions: 100,
            tick_interval_ms: 50,
            session_timeout_secs: 10,
            keepalive_interval_secs: 5,
            motd: MotdConfig::default(),
        }
    }
}

impl ProxyConfig {
    /// Reads a JSON config file; missing fields keep their defaults.
    pub fn load(path: &Path) -> Result<Self, ProxyError> {
        let text = std::fs::read_to_string(path).map_err(|source| ProxyError::ConfigRead {
            path: path.display().to_string(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ProxyError::ConfigParse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }
}

/// Fields advertised in the discovery (unconnected pong) status line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MotdConfig {
    pub edition: String,
    pub name: String,
    pub protocol_version: u32,
    pub game_version: String,
    pub sub_motd: String,
    pub game_mode: String,
}

impl Default for MotdConfig {
    fn default() -> Self {
        Self {
            edition: "MCPE".to_string(),
            name: "Proxy".to_string(),
            protocol_version: 589,
            game_version: "1.20.0".to_string(),
            sub_motd: "Second line".to_string(),
            game_mode: "Creative".to_string(),
        }
    }
}

impl MotdConfig {
    /// Builds the `;`-joined status line, trailing `;` included.
    pub fn status_line(&self, session_count: usize, max_sessions: usize, server_id: u64) -> String {
        let fields = [
            self.edition.clone(),
            self.name.clone(),
            self.protocol_version.to_string(),
            self.game_version.clone(),
            session_count.to_string(),
            max_sessions.to_string(),
            server_id.to_string(),
            self.sub_motd.clone(),
            self.game_mode.clone(),
        ];
        format!("{};", fields.join(";"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ProxyConfig::default();
        assert_eq!(config.bind_address, "0.0.0.0:19132".parse().unwrap());
        assert_eq!(config.max_sessions, 100);
        assert_eq!(config.tick_interval(), Duration::from_millis(50));
    }

    #[test]
    fn test_status_line_field_order() {
        let motd = MotdConfig::default();
        let line = motd.status_line(3, 100, 987654321);
        assert_eq!(
            line,
            "MCPE;Proxy;589;1.20.0;3;100;987654321;Second line;Creative;"
        );
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config: ProxyConfig =
            serde_json::from_str(r#"{ "max_sessions": 8, "motd": { "name": "Lobby" } }"#).unwrap();
        assert_eq!(config.max_sessions, 8);
        assert_eq!(config.motd.name, "Lobby");
        assert_eq!(config.motd.edition, "MCPE");
        assert_eq!(config.tick_interval_ms, 50);
    }

    #[test]
    fn test_load_missing_file() {
        let result = ProxyConfig::load(Path::new("/definitely/not/here.json"));
        assert!(matches!(result, Err(ProxyError::ConfigRead { .. })));
    }

    #[test]
    fn test_zero_tick_interval_is_clamped() {
        let config = ProxyConfig {
            tick_interval_ms: 0,
            ..ProxyConfig::default()
        };
        assert_eq!(config.tick_interval(), Duration::from_millis(1));
    }
}
