//! Broker configuration
//!
//! Budgets are deployment parameters, so every duration and bound here is
//! configurable. Values load from an optional TOML file and are then
//! overridden by command line flags in the binary.

use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{BrokerError, Result};
use crate::types::TerminalSize;

/// Default auth budget for new and reattaching connections (10 seconds)
pub const DEFAULT_AUTH_TIMEOUT_SECS: u64 = 10;

/// Default idle budget (5 minutes)
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 300;

/// Default absolute session lifetime (4 hours)
pub const DEFAULT_MAX_LIFETIME_SECS: u64 = 4 * 60 * 60;

/// Default sweeper period
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 30;

/// Default sweeper grace for sessions with a pending reattachment
pub const DEFAULT_ATTACH_GRACE_SECS: u64 = 10;

/// Default replay buffer bound (64 KiB)
pub const DEFAULT_REPLAY_BUFFER_BYTES: usize = 64 * 1024;

/// Default registry capacity
pub const DEFAULT_MAX_SESSIONS: usize = 64;

/// Environment variables that must never reach the spawned shell
///
/// These variables can affect how the subprocess loads and executes code.
pub const DANGEROUS_ENV_VARS: &[&str] = &[
    "LD_PRELOAD",
    "LD_LIBRARY_PATH",
    "DYLD_INSERT_LIBRARIES",
    "DYLD_LIBRARY_PATH",
    "NODE_OPTIONS",
    "PYTHONPATH",
    "PERL5LIB",
    "RUBYLIB",
];

/// Shell command spawned for every authenticated session
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ShellConfig {
    /// Program to run
    pub program: PathBuf,
    /// Arguments
    pub args: Vec<String>,
    /// Working directory
    pub cwd: Option<PathBuf>,
    /// Extra environment
    pub env: HashMap<String, String>,
    /// Export the session API key to the shell under this name
    pub api_key_env: Option<String>,
    /// Export the session access token to the shell under this name
    pub access_token_env: Option<String>,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("/bin/sh"),
            args: Vec::new(),
            cwd: None,
            env: HashMap::new(),
            api_key_env: None,
            access_token_env: None,
        }
    }
}

/// Broker configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// WebSocket listen address
    pub listen: SocketAddr,
    /// Credentials budget in seconds
    pub auth_timeout_secs: u64,
    /// Idle budget in seconds
    pub idle_timeout_secs: u64,
    /// Absolute lifetime in seconds
    pub max_lifetime_secs: u64,
    /// Sweeper period in seconds
    pub sweep_interval_secs: u64,
    /// Sweeper grace for attaching sessions in seconds
    pub attach_grace_secs: u64,
    /// Detached output buffer bound in bytes
    pub replay_buffer_bytes: usize,
    /// Maximum concurrent sessions
    pub max_sessions: usize,
    /// Initial terminal columns
    pub default_cols: u16,
    /// Initial terminal rows
    pub default_rows: u16,
    /// Shell command
    pub shell: ShellConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 8080)),
            auth_timeout_secs: DEFAULT_AUTH_TIMEOUT_SECS,
            idle_timeout_secs: DEFAULT_IDLE_TIMEOUT_SECS,
            max_lifetime_secs: DEFAULT_MAX_LIFETIME_SECS,
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
            attach_grace_secs: DEFAULT_ATTACH_GRACE_SECS,
            replay_buffer_bytes: DEFAULT_REPLAY_BUFFER_BYTES,
            max_sessions: DEFAULT_MAX_SESSIONS,
            default_cols: 80,
            default_rows: 24,
            shell: ShellConfig::default(),
        }
    }
}

impl BrokerConfig {
    /// Load configuration from a TOML file, or defaults when `path` is `None`
    ///
    /// # Errors
    /// Returns error if the file cannot be read, parsed, or fails validation
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path)?;
                Self::from_toml(&text)?
            }
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from TOML text (not validated)
    ///
    /// # Errors
    /// Returns error if the text is not valid TOML for this schema
    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Check budgets and bounds
    ///
    /// # Errors
    /// Returns `InvalidConfig` naming the first offending key
    pub fn validate(&self) -> Result<()> {
        let non_zero = [
            ("auth_timeout_secs", self.auth_timeout_secs),
            ("idle_timeout_secs", self.idle_timeout_secs),
            ("max_lifetime_secs", self.max_lifetime_secs),
            ("sweep_interval_secs", self.sweep_interval_secs),
        ];
        for (key, value) in non_zero {
            if value == 0 {
                return Err(BrokerError::invalid_config(format!("{key} must be > 0")));
            }
        }
        if self.replay_buffer_bytes == 0 {
            return Err(BrokerError::invalid_config("replay_buffer_bytes must be > 0"));
        }
        if self.max_sessions == 0 {
            return Err(BrokerError::invalid_config("max_sessions must be > 0"));
        }
        if self.attach_grace_secs > self.idle_timeout_secs {
            return Err(BrokerError::invalid_config(
                "attach_grace_secs must not exceed idle_timeout_secs",
            ));
        }
        if self.default_cols == 0 || self.default_rows == 0 {
            return Err(BrokerError::invalid_config("terminal size must be non-zero"));
        }
        Ok(())
    }

    /// Credentials budget
    #[must_use]
    pub fn auth_timeout(&self) -> Duration {
        Duration::from_secs(self.auth_timeout_secs)
    }

    /// Idle budget
    #[must_use]
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// Absolute lifetime
    #[must_use]
    pub fn max_lifetime(&self) -> Duration {
        Duration::from_secs(self.max_lifetime_secs)
    }

    /// Sweeper period
    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// Sweeper grace for attaching sessions
    #[must_use]
    pub fn attach_grace(&self) -> Duration {
        Duration::from_secs(self.attach_grace_secs)
    }

    /// Terminal size before the first resize
    #[must_use]
    pub fn default_size(&self) -> TerminalSize {
        TerminalSize::new(self.default_cols, self.default_rows)
    }
}
