//! Runtime configuration for the receiving engine.
//!
//! Read from the environment with defaults; malformed values are logged and
//! replaced by the default rather than aborting startup.

use std::time::Duration;

use tracing::warn;

use procura_observability::LogFormat;

pub const ENV_MAX_BATCH_LINES: &str = "PROCURA_MAX_BATCH_LINES";
pub const ENV_LOG_FORMAT: &str = "PROCURA_LOG_FORMAT";
pub const ENV_EFFECTS_POLL_MS: &str = "PROCURA_EFFECTS_POLL_MS";

const DEFAULT_MAX_BATCH_LINES: usize = 1000;
const DEFAULT_EFFECTS_POLL_MS: u64 = 250;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivingConfig {
    max_batch_lines: usize,
    log_format: LogFormat,
    effects_poll: Duration,
}

impl Default for ReceivingConfig {
    fn default() -> Self {
        Self {
            max_batch_lines: DEFAULT_MAX_BATCH_LINES,
            log_format: LogFormat::default(),
            effects_poll: Duration::from_millis(DEFAULT_EFFECTS_POLL_MS),
        }
    }
}

impl ReceivingConfig {
    /// Load from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup (tests pass a map here).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        let max_batch_lines = parse_or(
            ENV_MAX_BATCH_LINES,
            lookup(ENV_MAX_BATCH_LINES),
            defaults.max_batch_lines,
            |raw| raw.parse::<usize>().ok().filter(|n| *n > 0),
        );
        let log_format = parse_or(
            ENV_LOG_FORMAT,
            lookup(ENV_LOG_FORMAT),
            defaults.log_format,
            |raw| raw.parse::<LogFormat>().ok(),
        );
        let poll_ms = parse_or(
            ENV_EFFECTS_POLL_MS,
            lookup(ENV_EFFECTS_POLL_MS),
            DEFAULT_EFFECTS_POLL_MS,
            |raw| raw.parse::<u64>().ok().filter(|n| *n > 0),
        );

        Self {
            max_batch_lines,
            log_format,
            effects_poll: Duration::from_millis(poll_ms),
        }
    }

    pub fn max_batch_lines(&self) -> usize {
        self.max_batch_lines
    }

    pub fn log_format(&self) -> LogFormat {
        self.log_format
    }

    pub fn effects_poll(&self) -> Duration {
        self.effects_poll
    }

    /// Install the process-wide tracing subscriber in the configured format.
    pub fn init_logging(&self) {
        procura_observability::init(self.log_format);
    }

    pub fn with_max_batch_lines(mut self, max: usize) -> Self {
        self.max_batch_lines = max;
        self
    }

    pub fn with_log_format(mut self, format: LogFormat) -> Self {
        self.log_format = format;
        self
    }

    pub fn with_effects_poll(mut self, poll: Duration) -> Self {
        self.effects_poll = poll;
        self
    }
}

fn parse_or<T: core::fmt::Debug>(
    key: &str,
    raw: Option<String>,
    default: T,
    parse: impl FnOnce(&str) -> Option<T>,
) -> T {
    let Some(raw) = raw else {
        return default;
    };
    match parse(raw.trim()) {
        Some(value) => value,
        None => {
            warn!(key, value = %raw, ?default, "ignoring malformed configuration value");
            default
        }
    }
}
