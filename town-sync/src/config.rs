//! Environment configuration boundary.
//!
//! Two values select the remote backend: the endpoint URL and an access
//! credential. Absence of either forces the session into local-broadcast
//! mode before any remote call is attempted.

use std::env;
use std::time::Duration;

/// Environment variable naming the town server WebSocket endpoint.
pub const ENDPOINT_ENV: &str = "TOWN_SYNC_ENDPOINT";
/// Environment variable naming the access credential.
pub const ACCESS_KEY_ENV: &str = "TOWN_SYNC_ACCESS_KEY";

/// Remote backend location and credential.
#[derive(Debug, Clone)]
pub struct RemoteConfig {
    /// WebSocket endpoint, e.g. `ws://127.0.0.1:9090`.
    pub endpoint: String,
    pub access_key: String,
}

impl RemoteConfig {
    pub fn new(endpoint: impl Into<String>, access_key: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            access_key: access_key.into(),
        }
    }

    /// Read from the environment; `None` when either value is missing or
    /// empty, which callers must treat as "run local-broadcast".
    pub fn from_env() -> Option<Self> {
        let endpoint = env::var(ENDPOINT_ENV).ok().filter(|v| !v.is_empty())?;
        let access_key = env::var(ACCESS_KEY_ENV).ok().filter(|v| !v.is_empty())?;
        Some(Self { endpoint, access_key })
    }
}

/// Per-session tuning knobs.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Stable player identifier, unique per browser-tab-equivalent.
    pub player_id: String,
    /// Remote backend, when configured.
    pub remote: Option<RemoteConfig>,
    /// Presence gossip period on the local-broadcast path.
    pub heartbeat_interval: Duration,
    /// Delay between items when answering a peer's sync request.
    pub sync_response_stagger: Duration,
    /// Optional periodic full-refetch repair pass (Remote mode only).
    pub reconcile_interval: Option<Duration>,
}

impl SessionConfig {
    /// Local-broadcast-only session (no remote configuration).
    pub fn local(player_id: impl Into<String>) -> Self {
        Self {
            player_id: player_id.into(),
            remote: None,
            heartbeat_interval: Duration::from_millis(500),
            sync_response_stagger: Duration::from_millis(30),
            reconcile_interval: None,
        }
    }

    /// Session configured from the environment; degrades to local when the
    /// endpoint or credential is absent.
    pub fn from_env(player_id: impl Into<String>) -> Self {
        let mut config = Self::local(player_id);
        config.remote = RemoteConfig::from_env();
        config
    }

    pub fn with_remote(mut self, remote: RemoteConfig) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_reconcile_interval(mut self, interval: Duration) -> Self {
        self.reconcile_interval = Some(interval);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_config_has_no_remote() {
        let config = SessionConfig::local("player-1");
        assert!(config.remote.is_none());
        assert_eq!(config.player_id, "player-1");
        assert_eq!(config.heartbeat_interval, Duration::from_millis(500));
        assert_eq!(config.sync_response_stagger, Duration::from_millis(30));
        assert!(config.reconcile_interval.is_none());
    }

    #[test]
    fn test_with_remote() {
        let config = SessionConfig::local("player-1")
            .with_remote(RemoteConfig::new("ws://127.0.0.1:9090", "anon"));
        let remote = config.remote.unwrap();
        assert_eq!(remote.endpoint, "ws://127.0.0.1:9090");
        assert_eq!(remote.access_key, "anon");
    }

    #[test]
    fn test_builder_overrides() {
        let config = SessionConfig::local("p")
            .with_heartbeat_interval(Duration::from_millis(100))
            .with_reconcile_interval(Duration::from_secs(30));
        assert_eq!(config.heartbeat_interval, Duration::from_millis(100));
        assert_eq!(config.reconcile_interval, Some(Duration::from_secs(30)));
    }
}
