//! Bridge configuration.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{ChannelPreference, PresentationPolicy, live_view::DEFAULT_HISTORY_BYTES};

/// Environment variable naming a JSON config file.
pub const CONFIG_PATH_ENV: &str = "REPL_BRIDGE_CONFIG";

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid value for {var}: {value}")]
    InvalidEnv { var: &'static str, value: String },
}

/// Timeouts, channel selection and presentation policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Per-request completion deadline.
    pub submit_timeout_ms: u64,
    /// Total budget for the setup handshake.
    pub setup_timeout_ms: u64,
    /// Number of times the setup script is injected before giving up.
    pub setup_attempts: u32,
    /// Side-log polling interval.
    pub poll_interval_ms: u64,
    pub channel: ChannelPreference,
    pub policy: PresentationPolicy,
    pub cols: u16,
    pub rows: u16,
    /// Live-view replay history, in bytes.
    pub history_bytes: usize,
    /// Explicit interpreter executable.
    pub interpreter: Option<PathBuf>,
    /// Extra interpreter arguments as a shell-style line, e.g. `--vanilla`.
    pub interpreter_args: Option<String>,
    /// Root for per-session artifacts. Defaults to the platform cache dir.
    pub state_root: Option<PathBuf>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            submit_timeout_ms: 60_000,
            setup_timeout_ms: 15_000,
            setup_attempts: 3,
            poll_interval_ms: 100,
            channel: ChannelPreference::Auto,
            policy: PresentationPolicy::default(),
            cols: 120,
            rows: 40,
            history_bytes: DEFAULT_HISTORY_BYTES,
            interpreter: None,
            interpreter_args: None,
            state_root: None,
        }
    }
}

impl BridgeConfig {
    #[must_use]
    pub const fn submit_timeout(&self) -> Duration {
        Duration::from_millis(self.submit_timeout_ms)
    }

    #[must_use]
    pub const fn setup_timeout(&self) -> Duration {
        Duration::from_millis(self.setup_timeout_ms)
    }

    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Wait per setup attempt.
    #[must_use]
    pub fn setup_attempt_timeout(&self) -> Duration {
        self.setup_timeout() / self.setup_attempts.max(1)
    }

    /// Resolved artifact root.
    #[must_use]
    pub fn state_root(&self) -> PathBuf {
        self.state_root.clone().unwrap_or_else(|| {
            dirs::cache_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("repl-bridge")
        })
    }

    /// Parse a JSON config file.
    ///
    /// # Errors
    /// Returns error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Load from `$REPL_BRIDGE_CONFIG` (if set), then apply
    /// `REPL_BRIDGE_*` overrides.
    ///
    /// # Errors
    /// Returns error if the file or an override is invalid.
    pub fn load() -> Result<Self, ConfigError> {
        let base = match std::env::var_os(CONFIG_PATH_ENV) {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        base.with_overrides(|var| std::env::var(var).ok())
    }

    /// Apply overrides from a variable lookup.
    ///
    /// # Errors
    /// Returns error if an override does not parse.
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn number<T: std::str::FromStr>(var: &'static str, value: String) -> Result<T, ConfigError> {
            value
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidEnv { var, value })
        }

        if let Some(v) = lookup("REPL_BRIDGE_SUBMIT_TIMEOUT_MS") {
            self.submit_timeout_ms = number("REPL_BRIDGE_SUBMIT_TIMEOUT_MS", v)?;
        }
        if let Some(v) = lookup("REPL_BRIDGE_SETUP_TIMEOUT_MS") {
            self.setup_timeout_ms = number("REPL_BRIDGE_SETUP_TIMEOUT_MS", v)?;
        }
        if let Some(v) = lookup("REPL_BRIDGE_POLL_INTERVAL_MS") {
            self.poll_interval_ms = number("REPL_BRIDGE_POLL_INTERVAL_MS", v)?;
        }
        if let Some(v) = lookup("REPL_BRIDGE_CHANNEL") {
            self.channel = match v.trim().to_ascii_lowercase().as_str() {
                "auto" => ChannelPreference::Auto,
                "side_log" | "sidelog" => ChannelPreference::SideLog,
                "scrape" => ChannelPreference::Scrape,
                _ => {
                    return Err(ConfigError::InvalidEnv {
                        var: "REPL_BRIDGE_CHANNEL",
                        value: v,
                    });
                }
            };
        }
        if let Some(v) = lookup("REPL_BRIDGE_INTERPRETER") {
            self.interpreter = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("REPL_BRIDGE_INTERPRETER_ARGS") {
            self.interpreter_args = Some(v);
        }
        if let Some(v) = lookup("REPL_BRIDGE_STATE_ROOT") {
            self.state_root = Some(PathBuf::from(v));
        }
        Ok(self)
    }
}
