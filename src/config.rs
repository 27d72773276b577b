//! Presence tuning loaded at startup: grace periods, anomaly thresholds and cache lifetimes.

use std::{env, fs, io::ErrorKind, path::PathBuf, time::Duration};

use serde::Deserialize;
use tracing::{info, warn};

use crate::dao::models::ContextType;

/// Default location on disk where the server looks for the JSON configuration.
const DEFAULT_CONFIG_PATH: &str = "config/presence.json";
/// Environment variable that overrides [`DEFAULT_CONFIG_PATH`].
const CONFIG_PATH_ENV: &str = "PRESENCE_KEEPER_CONFIG_PATH";

/// Immutable presence configuration shared across the application.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PresenceConfig {
    /// Grace period granted to subjects dropping out of a waiting room.
    pub room_grace_period_seconds: u64,
    /// Grace period granted during an active debate; shorter than the room one.
    pub debate_grace_period_seconds: u64,
    /// Grace period granted on admin consoles.
    pub admin_grace_period_seconds: u64,
    /// Disconnections inside the analysis window that count as "frequent".
    pub disconnection_threshold: usize,
    /// A reconnection faster than this is "rapid".
    pub rapid_reconnection_window_seconds: u64,
    /// Rapid reconnections inside the analysis window that raise an anomaly.
    pub rapid_reconnection_threshold: usize,
    /// Rolling window the analyzer looks at.
    pub analysis_window_hours: u64,
    /// Lifetime of a cached quality report.
    pub analyzer_cache_ttl_seconds: u64,
    /// A reconnection recorded within this window suppresses another one.
    pub duplicate_reconnection_window_seconds: u64,
    /// Interval at which clients are expected to send heartbeats.
    pub heartbeat_interval_seconds: u64,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            room_grace_period_seconds: 60,
            debate_grace_period_seconds: 20,
            admin_grace_period_seconds: 60,
            disconnection_threshold: 5,
            rapid_reconnection_window_seconds: 30,
            rapid_reconnection_threshold: 3,
            analysis_window_hours: 1,
            analyzer_cache_ttl_seconds: 300,
            duplicate_reconnection_window_seconds: 30,
            heartbeat_interval_seconds: 30,
        }
    }
}

impl PresenceConfig {
    /// Load the configuration from disk, falling back to built-in defaults.
    pub fn load() -> Self {
        let path = resolve_config_path();
        match fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str::<Self>(&contents) {
                Ok(config) => {
                    info!(
                        path = %path.display(),
                        room_grace = config.room_grace_period_seconds,
                        debate_grace = config.debate_grace_period_seconds,
                        "loaded presence config"
                    );
                    config
                }
                Err(err) => {
                    warn!(
                        path = %path.display(),
                        error = %err,
                        "failed to parse config; falling back to defaults"
                    );
                    Self::default()
                }
            },
            Err(err) if err.kind() == ErrorKind::NotFound => {
                info!(
                    path = %path.display(),
                    "config file not found; using built-in defaults"
                );
                Self::default()
            }
            Err(err) => {
                warn!(
                    path = %path.display(),
                    error = %err,
                    "failed to read config; falling back to defaults"
                );
                Self::default()
            }
        }
    }

    /// Grace period for the given context kind.
    pub fn grace_period(&self, kind: ContextType) -> Duration {
        let seconds = match kind {
            ContextType::Room => self.room_grace_period_seconds,
            ContextType::Debate => self.debate_grace_period_seconds,
            ContextType::Admin => self.admin_grace_period_seconds,
        };
        Duration::from_secs(seconds)
    }

    /// Rolling window the analyzer considers.
    pub fn analysis_window(&self) -> Duration {
        Duration::from_secs(self.analysis_window_hours * 3_600)
    }

    /// Reconnections faster than this are rapid.
    pub fn rapid_reconnection_window(&self) -> Duration {
        Duration::from_secs(self.rapid_reconnection_window_seconds)
    }

    /// Lifetime of a cached quality report.
    pub fn analyzer_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.analyzer_cache_ttl_seconds)
    }

    /// Window in which a second reconnection is suppressed.
    pub fn duplicate_reconnection_window(&self) -> Duration {
        Duration::from_secs(self.duplicate_reconnection_window_seconds)
    }
}

/// Resolve the configuration path taking the environment override into account.
fn resolve_config_path() -> PathBuf {
    env::var_os(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .filter(|path| !path.as_os_str().is_empty())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debate_grace_is_shorter_than_room_grace() {
        let config = PresenceConfig::default();
        assert!(
            config.grace_period(ContextType::Debate) < config.grace_period(ContextType::Room)
        );
    }

    #[test]
    fn partial_json_keeps_defaults_for_missing_fields() {
        let config: PresenceConfig =
            serde_json::from_str(r#"{"debate_grace_period_seconds": 10}"#).unwrap();
        assert_eq!(config.debate_grace_period_seconds, 10);
        assert_eq!(config.room_grace_period_seconds, 60);
        assert_eq!(config.rapid_reconnection_threshold, 3);
    }
}
