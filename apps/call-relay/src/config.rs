use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub port: u16,
    /// HMAC secret for join tokens. Joins are unauthenticated without one.
    pub secret: Option<String>,
    pub heartbeat_timeout_secs: u64,
}

impl RelayConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            port: env::var("CALL_RELAY_PORT")
                .ok()
                .and_then(|port| port.parse().ok())
                .unwrap_or(defaults.port),
            secret: env::var("CALL_RELAY_SECRET")
                .ok()
                .filter(|secret| !secret.trim().is_empty()),
            heartbeat_timeout_secs: env::var("CALL_RELAY_HEARTBEAT_TIMEOUT")
                .ok()
                .and_then(|secs| secs.parse().ok())
                .filter(|secs| *secs > 0)
                .unwrap_or(defaults.heartbeat_timeout_secs),
        }
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: 8088,
            secret: None,
            heartbeat_timeout_secs: 90,
        }
    }
}
