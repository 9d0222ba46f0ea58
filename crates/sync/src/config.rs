//! Engine configuration
//!
//! Resolution order: CLI overrides > `CHATSYNC_*` environment >
//! `<data_dir>/config.toml` > defaults. The lower three layers are merged
//! with figment; every field can be set from the environment, e.g.
//! `CHATSYNC_SESSION_CACHE_CAPACITY=3` or `CHATSYNC_HIDDEN_AGENTS=[title]`.

use std::path::Path;
use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::error::SyncError;
use crate::paths::DataDir;

pub const ENV_PREFIX: &str = "CHATSYNC_";

pub const DEFAULT_SERVER_URL: &str = "http://127.0.0.1:40960";

/// Internal agents that never show up in the picker.
pub const DEFAULT_HIDDEN_AGENTS: [&str; 3] = ["compaction", "title", "summary"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub server_url: String,
    pub workspace: Option<String>,
    pub event_batch_ms: u64,
    pub connection_timeout_ms: u64,
    pub session_cache_ttl_ms: u64,
    pub session_cache_capacity: usize,
    pub context_limit_tokens: u64,
    pub reconnect_initial_backoff_ms: u64,
    pub reconnect_max_backoff_ms: u64,
    pub request_timeout_ms: u64,
    pub hidden_agents: Vec<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            workspace: None,
            event_batch_ms: 30,
            connection_timeout_ms: 10_000,
            session_cache_ttl_ms: 60_000,
            session_cache_capacity: 10,
            context_limit_tokens: 200_000,
            reconnect_initial_backoff_ms: 500,
            reconnect_max_backoff_ms: 10_000,
            request_timeout_ms: 30_000,
            hidden_agents: DEFAULT_HIDDEN_AGENTS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Values given on the command line
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub server_url: Option<String>,
    pub workspace: Option<String>,
}

impl SyncConfig {
    /// Full resolution against the process environment.
    pub fn load(data_dir: &DataDir, overrides: &ConfigOverrides) -> Result<Self, SyncError> {
        let mut config = Self::extract(Self::figment(&data_dir.config_path()))?;
        config.apply_overrides(overrides);
        Ok(config)
    }

    /// Defaults, then the config file (missing is fine), then `CHATSYNC_*`.
    pub fn figment(config_path: &Path) -> Figment {
        Figment::new()
            .merge(Serialized::defaults(SyncConfig::default()))
            .merge(Toml::file(config_path))
            .merge(Env::prefixed(ENV_PREFIX))
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, SyncError> {
        Self::extract(
            Figment::new()
                .merge(Serialized::defaults(SyncConfig::default()))
                .merge(Toml::string(contents)),
        )
    }

    fn extract(figment: Figment) -> Result<Self, SyncError> {
        figment
            .extract()
            .map_err(|err| SyncError::Config(err.to_string()))
    }

    pub fn apply_overrides(&mut self, overrides: &ConfigOverrides) {
        if let Some(url) = &overrides.server_url {
            self.server_url = url.clone();
        }
        if let Some(dir) = &overrides.workspace {
            self.workspace = Some(dir.clone());
        }
    }

    pub fn event_batch(&self) -> Duration {
        Duration::from_millis(self.event_batch_ms)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn session_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.session_cache_ttl_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn toml_fills_missing_fields_with_defaults() {
        let config = SyncConfig::from_toml_str(
            r#"
            server_url = "http://10.0.0.2:4096"
            event_batch_ms = 50
            "#,
        )
        .unwrap();
        assert_eq!(config.server_url, "http://10.0.0.2:4096");
        assert_eq!(config.event_batch_ms, 50);
        assert_eq!(config.connection_timeout_ms, 10_000);
        assert_eq!(config.hidden_agents, ["compaction", "title", "summary"]);
    }

    #[test]
    fn env_beats_file_and_overrides_beat_env() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "config.toml",
                r#"
                workspace = "/from/file"
                session_cache_capacity = 5
                "#,
            )?;
            jail.set_env("CHATSYNC_WORKSPACE", "/from/env");
            jail.set_env("CHATSYNC_SESSION_CACHE_CAPACITY", 3);
            jail.set_env("CHATSYNC_RECONNECT_MAX_BACKOFF_MS", 2500);

            let dir = DataDir::resolve(Some(jail.directory())).unwrap();
            let config = SyncConfig::load(&dir, &ConfigOverrides::default()).unwrap();
            assert_eq!(config.workspace.as_deref(), Some("/from/env"));
            assert_eq!(config.session_cache_capacity, 3);
            assert_eq!(config.reconnect_max_backoff_ms, 2500);
            assert_eq!(config.event_batch(), Duration::from_millis(30));

            let config = SyncConfig::load(
                &dir,
                &ConfigOverrides {
                    server_url: None,
                    workspace: Some("/from/cli".into()),
                },
            )
            .unwrap();
            assert_eq!(config.workspace.as_deref(), Some("/from/cli"));
            Ok(())
        });
    }

    #[test]
    fn list_fields_come_from_env_too() {
        Jail::expect_with(|jail| {
            jail.set_env("CHATSYNC_HIDDEN_AGENTS", "[title, summary]");
            let config = SyncConfig::extract(SyncConfig::figment(
                &jail.directory().join("config.toml"),
            ))
            .unwrap();
            assert_eq!(config.hidden_agents, ["title", "summary"]);
            Ok(())
        });
    }

    #[test]
    fn bad_numbers_are_config_errors() {
        Jail::expect_with(|jail| {
            jail.set_env("CHATSYNC_REQUEST_TIMEOUT_MS", "soon");
            let err = SyncConfig::extract(SyncConfig::figment(
                &jail.directory().join("config.toml"),
            ))
            .unwrap_err();
            assert!(matches!(err, SyncError::Config(ref msg) if msg.contains("request_timeout_ms")));
            Ok(())
        });
    }

    #[test]
    fn missing_file_means_defaults() {
        Jail::expect_with(|jail| {
            let dir = DataDir::resolve(Some(jail.directory())).unwrap();
            let config = SyncConfig::load(
                &dir,
                &ConfigOverrides {
                    server_url: Some("http://localhost:1".into()),
                    workspace: None,
                },
            )
            .unwrap();
            assert_eq!(config.server_url, "http://localhost:1");
            assert_eq!(config.session_cache_capacity, 10);
            Ok(())
        });
    }
}
