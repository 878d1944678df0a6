use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

use crate::error::CallError;

/// Client-side settings, read from `CALL__*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CallSettings {
    #[serde(default = "default_relay_url")]
    pub relay_url: String,
    /// Comma-separated STUN/TURN urls.
    #[serde(default)]
    pub ice_servers: Option<String>,
    /// Unanswered calls expire after this many seconds. Off when unset.
    #[serde(default)]
    pub unanswered_timeout_secs: Option<u64>,
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    #[serde(default = "default_join_timeout_secs")]
    pub join_timeout_secs: u64,
}

impl Default for CallSettings {
    fn default() -> Self {
        Self {
            relay_url: default_relay_url(),
            ice_servers: None,
            unanswered_timeout_secs: None,
            heartbeat_secs: default_heartbeat_secs(),
            join_timeout_secs: default_join_timeout_secs(),
        }
    }
}

impl CallSettings {
    /// Falls back to defaults when the environment cannot be parsed.
    pub fn from_env() -> Self {
        Self::load(None).unwrap_or_else(|err| {
            tracing::warn!(error = %err, "ignoring malformed CALL__ settings");
            Self::default()
        })
    }

    /// Reads settings from an explicit variable map instead of the process
    /// environment.
    pub fn from_vars(vars: HashMap<String, String>) -> Result<Self, CallError> {
        Self::load(Some(vars))
    }

    fn load(vars: Option<HashMap<String, String>>) -> Result<Self, CallError> {
        let settings: CallSettings = config::Config::builder()
            .add_source(
                config::Environment::with_prefix("CALL")
                    .separator("__")
                    .try_parsing(true)
                    .source(vars),
            )
            .build()?
            .try_deserialize()?;
        Ok(settings.normalize())
    }

    fn normalize(mut self) -> Self {
        self.ice_servers = self
            .ice_servers
            .take()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        self.unanswered_timeout_secs = self.unanswered_timeout_secs.filter(|secs| *secs > 0);
        self
    }

    pub fn ice_server_urls(&self) -> Vec<String> {
        self.ice_servers
            .as_deref()
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn unanswered_timeout(&self) -> Option<Duration> {
        self.unanswered_timeout_secs.map(Duration::from_secs)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_secs(self.join_timeout_secs)
    }
}

fn default_relay_url() -> String {
    "http://127.0.0.1:8088".to_string()
}

fn default_heartbeat_secs() -> u64 {
    30
}

fn default_join_timeout_secs() -> u64 {
    10
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        let settings = CallSettings::from_vars(HashMap::new()).expect("settings");
        assert_eq!(settings, CallSettings::default());
        assert!(settings.unanswered_timeout().is_none());
        assert!(settings.ice_server_urls().is_empty());
    }

    #[test]
    fn reads_prefixed_keys() {
        let settings = CallSettings::from_vars(vars(&[
            ("CALL__RELAY_URL", "https://relay.example"),
            ("CALL__ICE_SERVERS", " stun:a:3478 , ,stun:b:3478"),
            ("CALL__UNANSWERED_TIMEOUT_SECS", "45"),
        ]))
        .expect("settings");
        assert_eq!(settings.relay_url, "https://relay.example");
        assert_eq!(
            settings.ice_server_urls(),
            vec!["stun:a:3478".to_string(), "stun:b:3478".to_string()]
        );
        assert_eq!(settings.unanswered_timeout(), Some(Duration::from_secs(45)));
    }

    #[test]
    fn zero_timeout_means_off() {
        let settings =
            CallSettings::from_vars(vars(&[("CALL__UNANSWERED_TIMEOUT_SECS", "0")])).expect("settings");
        assert!(settings.unanswered_timeout().is_none());
    }
}
