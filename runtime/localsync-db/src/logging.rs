//! Process-wide `tracing` setup with a level that can change at runtime.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::{Layer, Layered, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{Registry, fmt as tfmt, reload};

use crate::config::ConfigError;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
    Off,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
            LogLevel::Off => "off",
        }
    }

    pub fn filter(self) -> LevelFilter {
        match self {
            LogLevel::Trace => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Off => LevelFilter::OFF,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            "off" | "none" => Ok(LogLevel::Off),
            other => Err(ConfigError::Invalid {
                key: "log.level".to_string(),
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

impl FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "compact" | "text" => Ok(LogFormat::Compact),
            "json" => Ok(LogFormat::Json),
            other => Err(ConfigError::Invalid {
                key: "log.format".to_string(),
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: LogLevel,
    pub format: LogFormat,
}

type Base = Layered<reload::Layer<LevelFilter, Registry>, Registry>;

/// Handle for changing the log level after start-up.
#[derive(Clone)]
pub struct LogControl {
    handle: Option<reload::Handle<LevelFilter, Registry>>,
    level: Arc<Mutex<LogLevel>>,
}

impl LogControl {
    /// Tracks a level without a subscriber behind it.
    pub fn detached(level: LogLevel) -> Self {
        Self {
            handle: None,
            level: Arc::new(Mutex::new(level)),
        }
    }

    pub fn level(&self) -> LogLevel {
        *self.level.lock()
    }

    pub fn set_level(&self, level: LogLevel) {
        *self.level.lock() = level;
        if let Some(handle) = &self.handle {
            if let Err(err) = handle.reload(level.filter()) {
                warn!(error = %err, "failed to change log level");
            }
        }
    }
}

impl fmt::Debug for LogControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogControl")
            .field("level", &self.level())
            .field("attached", &self.handle.is_some())
            .finish()
    }
}

/// Installs the global subscriber writing to stderr.
pub fn init(config: &LogConfig) -> Result<LogControl, ConfigError> {
    let (filter, handle) = reload::Layer::new(config.level.filter());
    let output: Box<dyn Layer<Base> + Send + Sync> = match config.format {
        LogFormat::Compact => Box::new(
            tfmt::layer()
                .compact()
                .with_target(true)
                .with_writer(std::io::stderr),
        ),
        LogFormat::Json => Box::new(tfmt::layer().json().with_writer(std::io::stderr)),
    };
    Registry::default()
        .with(filter)
        .with(output)
        .try_init()
        .map_err(|err| ConfigError::Logging(err.to_string()))?;
    Ok(LogControl {
        handle: Some(handle),
        level: Arc::new(Mutex::new(config.level)),
    })
}

#[cfg(test)]
mod tests {
    use super::{LogControl, LogFormat, LogLevel};

    #[test]
    fn levels_parse_leniently() {
        assert_eq!("WARNING".parse::<LogLevel>().ok(), Some(LogLevel::Warn));
        assert_eq!(" debug ".parse::<LogLevel>().ok(), Some(LogLevel::Debug));
        assert!("loud".parse::<LogLevel>().is_err());
        assert_eq!("json".parse::<LogFormat>().ok(), Some(LogFormat::Json));
        assert!(LogLevel::Trace < LogLevel::Off);
    }

    #[test]
    fn detached_control_tracks_level() {
        let control = LogControl::detached(LogLevel::Info);
        let clone = control.clone();
        clone.set_level(LogLevel::Error);
        assert_eq!(control.level(), LogLevel::Error);
        assert_eq!(control.level().to_string(), "error");
    }
}
