//! Runtime configuration.
//!
//! Read once when the runtime is initialized:
//! - `POOLGUARD_STOP_ON_ERROR`: abort on the first fault (`1|true|yes|on`).
//! - `POOLGUARD_ERROR_BUDGET`: faults tolerated before aborting (default 20).
//! - `POOLGUARD_RETAIN_FREED`: `off` removes freed records at once, `on`
//!   keeps the default number of them, a number keeps that many.
//! - `POOLGUARD_LOGFILE`: append reports to this file instead of stderr.
//! - `POOLGUARD_LOG_FORMAT`: `text` (default) or `jsonl`.

use std::path::PathBuf;

use crate::error::ConfigError;

pub const ENV_STOP_ON_ERROR: &str = "POOLGUARD_STOP_ON_ERROR";
pub const ENV_ERROR_BUDGET: &str = "POOLGUARD_ERROR_BUDGET";
pub const ENV_RETAIN_FREED: &str = "POOLGUARD_RETAIN_FREED";
pub const ENV_LOGFILE: &str = "POOLGUARD_LOGFILE";
pub const ENV_LOG_FORMAT: &str = "POOLGUARD_LOG_FORMAT";

/// Faults reported before the process is terminated.
pub const DEFAULT_ERROR_BUDGET: u32 = 20;

/// Freed records kept for use-after-free detection.
pub const DEFAULT_RETAINED_FREES: usize = 65_536;

/// What happens to an object record when its memory is freed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetentionPolicy {
    /// Keep up to `max_entries` freed records, evicting the oldest first.
    /// Enables dangling-pointer and double-free detection.
    Retain { max_entries: usize },
    /// Drop the record immediately. A second free then looks like a free of
    /// untracked memory.
    Immediate,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self::Retain {
            max_entries: DEFAULT_RETAINED_FREES,
        }
    }
}

impl RetentionPolicy {
    #[must_use]
    pub const fn retains(self) -> bool {
        matches!(self, Self::Retain { max_entries } if max_entries > 0)
    }
}

/// Output encoding of the report sink.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Text,
    /// One JSON object per violation, one per line.
    Jsonl,
}

impl LogFormat {
    /// Parse from string (case-insensitive).
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "text" | "plain" | "" => Some(Self::Text),
            "jsonl" | "json" => Some(Self::Jsonl),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub stop_on_error: bool,
    pub error_budget: u32,
    pub retention: RetentionPolicy,
    pub log_path: Option<PathBuf>,
    pub log_format: LogFormat,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            stop_on_error: false,
            error_budget: DEFAULT_ERROR_BUDGET,
            retention: RetentionPolicy::default(),
            log_path: None,
            log_format: LogFormat::Text,
        }
    }
}

/// Loose boolean parser shared by env vars and the C entry points.
#[must_use]
pub fn parse_bool_loose(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" | "enable" | "enabled" => Some(true),
        "0" | "false" | "no" | "off" | "disable" | "disabled" => Some(false),
        _ => None,
    }
}

impl RuntimeConfig {
    /// Read configuration from the process environment.
    ///
    /// An unparsable variable is reported on stderr and the defaults are used.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|var| std::env::var(var).ok()).unwrap_or_else(|err| {
            eprintln!("poolguard: {err}; using default configuration");
            Self::default()
        })
    }

    /// Build a configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut cfg = Self::default();

        if let Some(raw) = lookup(ENV_STOP_ON_ERROR) {
            cfg.stop_on_error = parse_bool_loose(&raw).ok_or_else(|| invalid(ENV_STOP_ON_ERROR, &raw))?;
        }
        if let Some(raw) = lookup(ENV_ERROR_BUDGET) {
            cfg.error_budget = raw
                .trim()
                .parse::<u32>()
                .ok()
                .filter(|&n| n > 0)
                .ok_or_else(|| invalid(ENV_ERROR_BUDGET, &raw))?;
        }
        if let Some(raw) = lookup(ENV_RETAIN_FREED) {
            cfg.retention = parse_retention(&raw).ok_or_else(|| invalid(ENV_RETAIN_FREED, &raw))?;
        }
        if let Some(raw) = lookup(ENV_LOGFILE) {
            if !raw.is_empty() {
                cfg.log_path = Some(PathBuf::from(raw));
            }
        }
        if let Some(raw) = lookup(ENV_LOG_FORMAT) {
            cfg.log_format = LogFormat::parse(&raw).ok_or_else(|| invalid(ENV_LOG_FORMAT, &raw))?;
        }
        Ok(cfg)
    }
}

fn parse_retention(raw: &str) -> Option<RetentionPolicy> {
    if let Ok(max_entries) = raw.trim().parse::<usize>() {
        return Some(if max_entries == 0 {
            RetentionPolicy::Immediate
        } else {
            RetentionPolicy::Retain { max_entries }
        });
    }
    parse_bool_loose(raw).map(|on| {
        if on {
            RetentionPolicy::default()
        } else {
            RetentionPolicy::Immediate
        }
    })
}

fn invalid(var: &'static str, raw: &str) -> ConfigError {
    ConfigError::InvalidValue {
        var,
        value: raw.to_owned(),
    }
}
