//! Subscriber setup for binaries and test harnesses.
//!
//! The library only emits `tracing` events. Each [`MessageHandler`] decides
//! for itself whether to emit its debug trail (`DispatchConfig::verbose`);
//! this module decides where events go. Every handler event carries a
//! `handler` field, and schedule/fire events add `message`, `what` and
//! `pending`, so a JSON sink can be filtered per handler.
//!
//! ```ignore
//! let config = holdback_core::Config::load("holdback.toml")?;
//! holdback_core::logging::init_logging(&config.logging)?;
//! ```
//!
//! [`MessageHandler`]: crate::controller::MessageHandler

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::fmt::time::SystemTime;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

/// Format of the subscriber that won installation, if any.
static INSTALLED: OnceLock<LogFormat> = OnceLock::new();

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Colored, one event per line, with thread names so dispatch threads
    /// stand out.
    #[default]
    Pretty,
    /// Flattened JSON objects.
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Pretty => "pretty",
            Self::Json => "json",
        })
    }
}

/// `[logging]` section of the config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default filter level. `RUST_LOG` wins when set.
    pub level: String,
    pub format: LogFormat,
    /// Also append events to this file, without ANSI colors.
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            file: None,
        }
    }
}

impl LogConfig {
    pub fn validate(&self) -> crate::Result<()> {
        self.level
            .parse::<LogLevel>()
            .map(|_| ())
            .map_err(crate::Error::Config)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("logging already initialized ({0})")]
    AlreadyInitialized(LogFormat),

    #[error("invalid log level: {0}")]
    InvalidLevel(String),

    #[error("failed to open log file: {0}")]
    FileCreate(#[from] io::Error),

    #[error("failed to set global subscriber: {0}")]
    SetSubscriber(#[from] tracing::subscriber::SetGlobalDefaultError),
}

fn open_log_file(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

/// One layer per sink: stderr always, the file when configured.
fn layers(format: LogFormat, file: Option<File>) -> Vec<BoxedLayer> {
    let mut layers: Vec<BoxedLayer> = Vec::with_capacity(2);
    match format {
        LogFormat::Pretty => {
            layers.push(
                fmt::layer()
                    .with_writer(io::stderr)
                    .with_thread_names(true)
                    .boxed(),
            );
            if let Some(file) = file {
                layers.push(fmt::layer().with_writer(file).with_ansi(false).boxed());
            }
        }
        LogFormat::Json => {
            layers.push(
                fmt::layer()
                    .json()
                    .flatten_event(true)
                    .with_timer(SystemTime)
                    .with_thread_names(true)
                    .with_writer(io::stderr)
                    .boxed(),
            );
            if let Some(file) = file {
                layers.push(
                    fmt::layer()
                        .json()
                        .flatten_event(true)
                        .with_timer(SystemTime)
                        .with_writer(file)
                        .boxed(),
                );
            }
        }
    }
    layers
}

/// Install the global subscriber described by `config`.
///
/// Only the first successful call installs anything; later calls report
/// which format is already active. `RUST_LOG` overrides `config.level`, e.g.
/// `RUST_LOG=holdback_core=debug,looper=trace`.
pub fn init_logging(config: &LogConfig) -> Result<(), LogError> {
    if let Some(&format) = INSTALLED.get() {
        return Err(LogError::AlreadyInitialized(format));
    }

    let level: LogLevel = config.level.parse().map_err(LogError::InvalidLevel)?;
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from(level).into())
        .from_env_lossy();
    let file = config.file.as_deref().map(open_log_file).transpose()?;

    let subscriber = tracing_subscriber::registry()
        .with(layers(config.format, file))
        .with(filter);
    tracing::subscriber::set_global_default(subscriber)?;
    let _ = INSTALLED.set(config.format);

    tracing::info!(
        level = %config.level,
        format = %config.format,
        file = ?config.file,
        "logging initialized"
    );
    Ok(())
}

/// The installed format, or `None` before [`init_logging`] succeeds.
pub fn installed_format() -> Option<LogFormat> {
    INSTALLED.get().copied()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Self::TRACE,
            LogLevel::Debug => Self::DEBUG,
            LogLevel::Info => Self::INFO,
            LogLevel::Warn => Self::WARN,
            LogLevel::Error => Self::ERROR,
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "trace" => Ok(Self::Trace),
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            _ => Err(format!(
                "unknown log level {s:?} (expected trace, debug, info, warn or error)"
            )),
        }
    }
}
