//! Configuration: a JSON file with `LOCALSYNC_*` environment overrides.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::adapter::{AdapterOptions, DEFAULT_OPEN_ATTEMPTS};
use crate::error::DbError;
use crate::logging::LogConfig;
use crate::rpc::WireCodec;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: String, value: String },
    #[error("logging setup failed: {0}")]
    Logging(String),
}

impl From<ConfigError> for DbError {
    fn from(err: ConfigError) -> Self {
        DbError::Config(err.to_string())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdapterConfig {
    pub open_attempts: u32,
    pub open_retry_delay_ms: u64,
    pub lock_timeout_ms: Option<u64>,
    pub reopen_on_connection_closed: bool,
    pub debug_mode: bool,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            open_attempts: DEFAULT_OPEN_ATTEMPTS,
            open_retry_delay_ms: 100,
            lock_timeout_ms: None,
            reopen_on_connection_closed: false,
            debug_mode: false,
        }
    }
}

impl AdapterConfig {
    pub fn options(&self, name: impl Into<String>) -> AdapterOptions {
        let mut options = AdapterOptions::new(name);
        options.open_attempts = self.open_attempts.max(1);
        options.open_retry_delay = Duration::from_millis(self.open_retry_delay_ms);
        options.lock_timeout = self.lock_timeout_ms.map(Duration::from_millis);
        options.reopen_on_connection_closed = self.reopen_on_connection_closed;
        options.debug_mode = self.debug_mode;
        options
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Fail-safe limit for one attempt at obtaining a database channel from
    /// a client.
    pub open_timeout_ms: u64,
    pub open_retry_interval_ms: u64,
    /// Clients may live in other processes, so the lock namespace has to span
    /// processes.
    pub cross_process_clients: bool,
    /// Accept an in-process lock namespace anyway. Exclusion then only holds
    /// between clients of this process.
    pub allow_process_scope_locks: bool,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            open_timeout_ms: 10_000,
            open_retry_interval_ms: 1_000,
            cross_process_clients: true,
            allow_process_scope_locks: false,
        }
    }
}

impl CoordinatorConfig {
    /// All clients are tasks of the current process.
    pub fn in_process() -> Self {
        Self {
            cross_process_clients: false,
            ..Self::default()
        }
    }

    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }

    pub fn open_retry_interval(&self) -> Duration {
        Duration::from_millis(self.open_retry_interval_ms)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub codec: WireCodec,
    /// Path to the `localsync-worker` binary for process transports.
    pub program: Option<PathBuf>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalSyncConfig {
    /// Directory for cross-process lock files. Unset means in-process locks.
    pub lock_dir: Option<PathBuf>,
    pub adapter: AdapterConfig,
    pub coordinator: CoordinatorConfig,
    pub worker: WorkerConfig,
    pub log: LogConfig,
}

impl LocalSyncConfig {
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Loads `path` when given, then applies the process environment.
    pub fn resolve(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        config.apply_env_from(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup("LOCALSYNC_LOCK_DIR").filter(|dir| !dir.is_empty()) {
            self.lock_dir = Some(PathBuf::from(dir));
        }
        if let Some(value) = lookup("LOCALSYNC_OPEN_ATTEMPTS") {
            self.adapter.open_attempts = parse_env("LOCALSYNC_OPEN_ATTEMPTS", &value)?;
        }
        if let Some(value) = lookup("LOCALSYNC_LOCK_TIMEOUT_MS") {
            let ms: u64 = parse_env("LOCALSYNC_LOCK_TIMEOUT_MS", &value)?;
            self.adapter.lock_timeout_ms = (ms > 0).then_some(ms);
        }
        if let Some(value) = lookup("LOCALSYNC_CODEC") {
            self.worker.codec = value.parse().map_err(|_| ConfigError::Invalid {
                key: "LOCALSYNC_CODEC".to_string(),
                value,
            })?;
        }
        if let Some(value) = lookup("LOCALSYNC_LOG") {
            self.log.level = value.parse()?;
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Invalid {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::{ConfigError, LocalSyncConfig};
    use crate::logging::LogLevel;
    use crate::rpc::WireCodec;
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::time::Duration;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn file_values_fill_defaults() {
        let config = LocalSyncConfig::from_json(
            r#"{"lock_dir":"/run/localsync","adapter":{"open_attempts":5},"worker":{"codec":"json"}}"#,
        )
        .expect("config");
        assert_eq!(config.lock_dir, Some(PathBuf::from("/run/localsync")));
        assert_eq!(config.adapter.open_attempts, 5);
        assert_eq!(config.adapter.open_retry_delay_ms, 100);
        assert_eq!(config.worker.codec, WireCodec::Json);
        assert_eq!(config.coordinator.open_timeout(), Duration::from_secs(10));
        assert!(config.coordinator.cross_process_clients);
    }

    #[test]
    fn env_overrides_file() {
        let mut config = LocalSyncConfig::default();
        config
            .apply_env_from(env(&[
                ("LOCALSYNC_LOCK_DIR", "/tmp/locks"),
                ("LOCALSYNC_OPEN_ATTEMPTS", "7"),
                ("LOCALSYNC_LOCK_TIMEOUT_MS", "250"),
                ("LOCALSYNC_CODEC", "json"),
                ("LOCALSYNC_LOG", "debug"),
            ]))
            .expect("env");
        assert_eq!(config.lock_dir, Some(PathBuf::from("/tmp/locks")));
        assert_eq!(config.adapter.open_attempts, 7);
        assert_eq!(config.log.level, LogLevel::Debug);
        let options = config.adapter.options("app");
        assert_eq!(options.lock_timeout, Some(Duration::from_millis(250)));
        assert_eq!(options.open_attempts, 7);
        assert_eq!(config.worker.codec, WireCodec::Json);
    }

    #[test]
    fn bad_env_values_are_rejected() {
        let mut config = LocalSyncConfig::default();
        let err = config
            .apply_env_from(env(&[("LOCALSYNC_OPEN_ATTEMPTS", "many")]))
            .expect_err("invalid");
        assert!(matches!(err, ConfigError::Invalid { key, .. } if key == "LOCALSYNC_OPEN_ATTEMPTS"));
        let err = config
            .apply_env_from(env(&[("LOCALSYNC_CODEC", "cbor")]))
            .expect_err("invalid");
        assert!(err.to_string().contains("cbor"));
    }

    #[test]
    fn missing_file_reports_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("absent.json");
        let err = LocalSyncConfig::load(&path).expect_err("missing");
        assert!(err.to_string().contains("absent.json"));
        std::fs::write(&path, "{not json").expect("write");
        assert!(matches!(
            LocalSyncConfig::load(&path),
            Err(ConfigError::Parse { .. })
        ));
    }
}
