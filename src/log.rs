//! Append-only run log for the scheduler.
//!
//! Every line carries the module it came from, so a run's log can be
//! narrowed to the store, the lock manager, or the orchestrator after
//! the fact. Verbosity comes from `FOREMAN_LOG`: a bare level sets the
//! default (`FOREMAN_LOG=debug`), and `name=level` pairs raise it for
//! matching targets (`FOREMAN_LOG=info,locks=trace,store=debug`).
//! `--debug` and `FOREMAN_DEBUG=1` are shorthand for a debug default.
//! Output goes to `~/.foreman/foreman.log`, truncated per run.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::str::FromStr;
use std::sync::{Mutex, OnceLock};

const LOG_FILE: &str = "foreman.log";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
            LogLevel::Trace => "TRACE",
        }
    }
}

impl FromStr for LogLevel {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        match s.to_ascii_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            _ => Err(()),
        }
    }
}

/// Default level plus per-target overrides, parsed from `FOREMAN_LOG`.
///
/// An override matches any target containing its name, so `locks=trace`
/// covers `foreman::orchestration::locks`. The last matching override
/// wins; unparseable fragments are ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filter {
    default: LogLevel,
    overrides: Vec<(String, LogLevel)>,
}

impl Filter {
    pub fn new(default: LogLevel) -> Self {
        Self {
            default,
            overrides: Vec::new(),
        }
    }

    /// Parse a spec like `info,locks=trace,store=debug`.
    pub fn parse(spec: &str, fallback: LogLevel) -> Self {
        let mut filter = Self::new(fallback);
        for part in spec.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            match part.split_once('=') {
                None => {
                    if let Ok(level) = part.parse() {
                        filter.default = level;
                    }
                }
                Some(("", _)) => {}
                Some((name, level)) => {
                    if let Ok(level) = level.parse() {
                        filter.overrides.push((name.to_string(), level));
                    }
                }
            }
        }
        filter
    }

    pub fn level_for(&self, target: &str) -> LogLevel {
        self.overrides
            .iter()
            .rev()
            .find(|(name, _)| target.contains(name.as_str()))
            .map(|(_, level)| *level)
            .unwrap_or(self.default)
    }
}

struct Logger {
    filter: Filter,
    file: Mutex<File>,
}

static LOGGER: OnceLock<Logger> = OnceLock::new();

/// Open `~/.foreman/foreman.log` and install the filter. Logging stays
/// disabled if the home directory or the file is unavailable.
pub fn init_with_debug(debug: bool) {
    let env_debug = std::env::var("FOREMAN_DEBUG")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);
    let fallback = if debug || env_debug {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };
    let filter = match std::env::var("FOREMAN_LOG") {
        Ok(spec) => Filter::parse(&spec, fallback),
        Err(_) => Filter::new(fallback),
    };

    let Some(home) = dirs::home_dir() else {
        return;
    };
    let dir = home.join(".foreman");
    if std::fs::create_dir_all(&dir).is_err() {
        return;
    }
    let file = match OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(dir.join(LOG_FILE))
    {
        Ok(file) => file,
        Err(_) => return,
    };
    let _ = LOGGER.set(Logger {
        filter,
        file: Mutex::new(file),
    });
}

/// Whether a line at `level` from `target` would be written. The `flog*`
/// macros check this before formatting; false until `init_with_debug`.
pub fn enabled(level: LogLevel, target: &str) -> bool {
    LOGGER
        .get()
        .map(|logger| level <= logger.filter.level_for(target))
        .unwrap_or(false)
}

/// Append one line. Callers gate with [`enabled`]; a no-op before init.
pub fn write(level: LogLevel, target: &str, msg: &str) {
    let Some(logger) = LOGGER.get() else {
        return;
    };
    let target = target.strip_prefix("foreman::").unwrap_or(target);
    if let Ok(mut file) = logger.file.lock() {
        let timestamp = chrono::Local::now().format("%H:%M:%S%.3f");
        let _ = writeln!(file, "{} {:5} [{}] {}", timestamp, level.as_str(), target, msg);
    }
}

#[macro_export]
macro_rules! flog {
    ($($arg:tt)*) => {
        if $crate::log::enabled($crate::log::LogLevel::Info, module_path!()) {
            $crate::log::write($crate::log::LogLevel::Info, module_path!(), &format!($($arg)*));
        }
    };
}

#[macro_export]
macro_rules! flog_error {
    ($($arg:tt)*) => {
        if $crate::log::enabled($crate::log::LogLevel::Error, module_path!()) {
            $crate::log::write($crate::log::LogLevel::Error, module_path!(), &format!($($arg)*));
        }
    };
}

#[macro_export]
macro_rules! flog_warn {
    ($($arg:tt)*) => {
        if $crate::log::enabled($crate::log::LogLevel::Warn, module_path!()) {
            $crate::log::write($crate::log::LogLevel::Warn, module_path!(), &format!($($arg)*));
        }
    };
}

#[macro_export]
macro_rules! flog_debug {
    ($($arg:tt)*) => {
        if $crate::log::enabled($crate::log::LogLevel::Debug, module_path!()) {
            $crate::log::write($crate::log::LogLevel::Debug, module_path!(), &format!($($arg)*));
        }
    };
}

#[macro_export]
macro_rules! flog_trace {
    ($($arg:tt)*) => {
        if $crate::log::enabled($crate::log::LogLevel::Trace, module_path!()) {
            $crate::log::write($crate::log::LogLevel::Trace, module_path!(), &format!($($arg)*));
        }
    };
}
