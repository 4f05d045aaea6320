use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::{flog_debug, Error, Result};

const CONFIG_FILE: &str = "foreman.toml";

fn default_max_workers() -> usize {
    4
}

fn default_lock_timeout_secs() -> u64 {
    900
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    500
}

fn default_backoff_cap_ms() -> u64 {
    60_000
}

fn default_stall_timeout_secs() -> u64 {
    300
}

fn default_gate_pass_threshold() -> f64 {
    70.0
}

fn default_strict_gate_threshold() -> f64 {
    85.0
}

/// Orchestrator tuning knobs, loaded from `~/.foreman/foreman.toml`.
///
/// Every field has a default so a missing config file is not an error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Size of the worker slot pool. Fixed for the run.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// How long a file lease is valid before any acquisition attempt may reclaim it.
    #[serde(default = "default_lock_timeout_secs")]
    pub lock_timeout_secs: u64,
    /// Recoverable-fault retry budget before escalating as repeated_failure.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Exponential backoff base for retries.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// Upper bound on a single backoff delay.
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,
    /// Time without progress before a busy worker slot is presumed dead.
    #[serde(default = "default_stall_timeout_secs")]
    pub stall_timeout_secs: u64,
    /// Minimum gate score for a ticket to complete.
    #[serde(default = "default_gate_pass_threshold")]
    pub gate_pass_threshold: f64,
    /// Stricter score required for the second gate pass on large tickets.
    #[serde(default = "default_strict_gate_threshold")]
    pub strict_gate_threshold: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            lock_timeout_secs: default_lock_timeout_secs(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            stall_timeout_secs: default_stall_timeout_secs(),
            gate_pass_threshold: default_gate_pass_threshold(),
            strict_gate_threshold: default_strict_gate_threshold(),
        }
    }
}

impl Config {
    /// Directory holding the config and log files, `~/.foreman`.
    pub fn foreman_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".foreman"))
    }

    pub fn load() -> Result<Self> {
        Self::load_from(&Self::foreman_dir()?)
    }

    /// Load from `base/foreman.toml`. A missing file yields defaults; a
    /// present file must parse and validate.
    pub fn load_from(base: &Path) -> Result<Self> {
        let path = base.join(CONFIG_FILE);
        if !path.exists() {
            flog_debug!("no config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(&path)?)?;
        config.validate()?;
        flog_debug!(
            "config loaded from {}: max_workers={}, max_attempts={}, lock_timeout_secs={}",
            path.display(),
            config.max_workers,
            config.max_attempts,
            config.lock_timeout_secs
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::foreman_dir()?)
    }

    /// Write to `base/foreman.toml`, creating `base` if needed.
    pub fn save_to(&self, base: &Path) -> Result<()> {
        fs::create_dir_all(base)?;
        let path = base.join(CONFIG_FILE);
        fs::write(&path, toml::to_string_pretty(self)?)?;
        flog_debug!("config saved to {}", path.display());
        Ok(())
    }

    pub fn ensure_dirs() -> Result<()> {
        fs::create_dir_all(Self::foreman_dir()?)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_workers == 0 {
            return Err(Error::Validation("max_workers must be at least 1".into()));
        }
        if self.max_attempts == 0 {
            return Err(Error::Validation("max_attempts must be at least 1".into()));
        }
        if self.gate_pass_threshold > self.strict_gate_threshold {
            return Err(Error::Validation(
                "strict_gate_threshold must be >= gate_pass_threshold".into(),
            ));
        }
        Ok(())
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::seconds(self.lock_timeout_secs as i64)
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::seconds(self.stall_timeout_secs as i64)
    }

    /// Backoff delay before retry attempt `attempt`: `base * 2^attempt`, capped.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.min(20);
        let ms = self
            .backoff_base_ms
            .saturating_mul(1u64 << exp)
            .min(self.backoff_cap_ms);
        Duration::milliseconds(ms as i64)
    }
}
