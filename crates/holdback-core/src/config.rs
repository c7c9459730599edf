//! Configuration for holdback.
//!
//! All sections are optional in TOML; missing fields take their defaults.
//!
//! ```toml
//! [dispatch]
//! name = "player-events"
//! verbose = true
//!
//! [looper]
//! thread_name = "player-looper"
//!
//! [logging]
//! level = "debug"
//! format = "json"
//! ```

use std::path::Path;

use looper::LooperConfig;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::logging::LogConfig;

/// Per-handler settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Recorded as the `handler` field of every log event.
    pub name: String,
    /// Emit debug events for registry changes and state transitions.
    pub verbose: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            name: "message-handler".to_string(),
            verbose: false,
        }
    }
}

impl DispatchConfig {
    /// Named config with logging off.
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Config("dispatch.name must not be empty".to_string()));
        }
        Ok(())
    }

    /// Parse a bare `DispatchConfig` table.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }
}

/// Full configuration file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub dispatch: DispatchConfig,
    pub looper: LooperConfig,
    pub logging: LogConfig,
}

impl Config {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<()> {
        self.dispatch.validate()?;
        self.looper.validate()?;
        self.logging.validate()?;
        Ok(())
    }
}
