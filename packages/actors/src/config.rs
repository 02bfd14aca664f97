//! Runtime configuration.

use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid runtime config: {0}")]
    Invalid(String),
}

/// Tunables for the job and event runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Minimum delay before re-polling a job that found no input.
    /// Also the interval at which relaxed event appends are flushed.
    pub idle_poll_interval: Duration,
    /// How long `graceful_shutdown` waits for each handler to catch up.
    pub drain_timeout: Duration,
    /// Create the global error queue on start.
    pub error_queue: bool,
    pub error_queue_name: String,
    /// Create the queue that announces every newly started job.
    pub new_job_queue: bool,
    pub new_job_queue_name: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            idle_poll_interval: Duration::from_millis(50),
            drain_timeout: Duration::from_millis(5000),
            error_queue: true,
            error_queue_name: "global_error_queue".to_string(),
            new_job_queue: true,
            new_job_queue_name: "new_job_queue".to_string(),
        }
    }
}

impl RuntimeConfig {
    /// Build a config from environment variables.
    ///
    /// - `RELAY_IDLE_POLL_MS` (default: 50)
    /// - `RELAY_DRAIN_TIMEOUT_MS` (default: 5000)
    /// - `RELAY_ERROR_QUEUE` (`true`/`false`, default: true)
    /// - `RELAY_ERROR_QUEUE_NAME` (default: `global_error_queue`)
    /// - `RELAY_NEW_JOB_QUEUE` (`true`/`false`, default: true)
    /// - `RELAY_NEW_JOB_QUEUE_NAME` (default: `new_job_queue`)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).and_then(non_empty);

        let idle_poll_interval = match get("RELAY_IDLE_POLL_MS") {
            Some(v) => parse_millis("RELAY_IDLE_POLL_MS", &v)?,
            None => defaults.idle_poll_interval,
        };
        let drain_timeout = match get("RELAY_DRAIN_TIMEOUT_MS") {
            Some(v) => parse_millis("RELAY_DRAIN_TIMEOUT_MS", &v)?,
            None => defaults.drain_timeout,
        };
        let error_queue = match get("RELAY_ERROR_QUEUE") {
            Some(v) => parse_bool("RELAY_ERROR_QUEUE", &v)?,
            None => defaults.error_queue,
        };
        let error_queue_name = get("RELAY_ERROR_QUEUE_NAME").unwrap_or(defaults.error_queue_name);
        let new_job_queue = match get("RELAY_NEW_JOB_QUEUE") {
            Some(v) => parse_bool("RELAY_NEW_JOB_QUEUE", &v)?,
            None => defaults.new_job_queue,
        };
        let new_job_queue_name =
            get("RELAY_NEW_JOB_QUEUE_NAME").unwrap_or(defaults.new_job_queue_name);

        Ok(Self {
            idle_poll_interval,
            drain_timeout,
            error_queue,
            error_queue_name,
            new_job_queue,
            new_job_queue_name,
        })
    }

    pub fn with_idle_poll_interval(mut self, interval: Duration) -> Self {
        self.idle_poll_interval = interval;
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn with_error_queue(mut self, enabled: bool) -> Self {
        self.error_queue = enabled;
        self
    }

    pub fn with_error_queue_name(mut self, name: impl Into<String>) -> Self {
        self.error_queue_name = name.into();
        self
    }

    pub fn with_new_job_queue(mut self, enabled: bool) -> Self {
        self.new_job_queue = enabled;
        self
    }
}

fn non_empty(s: String) -> Option<String> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn parse_millis(var_name: &str, v: &str) -> Result<Duration, ConfigError> {
    v.parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|e| ConfigError::Invalid(format!("{var_name}={v}: {e}")))
}

fn parse_bool(var_name: &str, v: &str) -> Result<bool, ConfigError> {
    match v.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "y" => Ok(true),
        "0" | "false" | "no" | "n" => Ok(false),
        _ => Err(ConfigError::Invalid(format!(
            "invalid boolean for {var_name}={v} (expected true/false)"
        ))),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::disallowed_methods)]

    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn empty_environment_gives_defaults() {
        let cfg = RuntimeConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(cfg, RuntimeConfig::default());
    }

    #[test]
    fn values_are_read() {
        let cfg = RuntimeConfig::from_lookup(lookup(&[
            ("RELAY_IDLE_POLL_MS", "10"),
            ("RELAY_DRAIN_TIMEOUT_MS", " 250 "),
            ("RELAY_ERROR_QUEUE", "no"),
            ("RELAY_ERROR_QUEUE_NAME", "errors"),
            ("RELAY_NEW_JOB_QUEUE", "false"),
            ("RELAY_NEW_JOB_QUEUE_NAME", "announcements"),
        ]))
        .unwrap();
        assert_eq!(cfg.idle_poll_interval, Duration::from_millis(10));
        assert_eq!(cfg.drain_timeout, Duration::from_millis(250));
        assert!(!cfg.error_queue);
        assert_eq!(cfg.error_queue_name, "errors");
        assert!(!cfg.new_job_queue);
        assert_eq!(cfg.new_job_queue_name, "announcements");
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(RuntimeConfig::from_lookup(lookup(&[("RELAY_IDLE_POLL_MS", "soon")])).is_err());
        assert!(RuntimeConfig::from_lookup(lookup(&[("RELAY_ERROR_QUEUE", "maybe")])).is_err());
    }
}
