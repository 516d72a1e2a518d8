//! Configuration types.

use std::time::Duration;

use crate::error::ValidationError;
use crate::recurring::DEFAULT_RECURRING_POLLING_DELAY;
use crate::server::BackgroundProcessingServerOptions;
use crate::server::delayed::DEFAULT_POLLING_DELAY;
use crate::server::heartbeat::{
    DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_SERVER_CHECK_INTERVAL, DEFAULT_SERVER_TIMEOUT,
};
use crate::server::processing_server::DEFAULT_SHUTDOWN_TIMEOUT;
use crate::states::DEFAULT_QUEUE;
use crate::states::state::validate_queue_name;

/// Upper bound of the default worker count.
const MAX_DEFAULT_WORKER_COUNT: usize = 20;

/// Background job server configuration.
#[derive(Debug, Clone)]
pub struct BackgroundJobServerOptions {
    /// Prefix of the server id. Falls back to `HOSTNAME`.
    pub server_name: Option<String>,
    /// Number of worker processes.
    pub worker_count: usize,
    /// Queues to fetch from, highest priority first.
    pub queues: Vec<String>,
    /// How long shutdown waits for processes before giving up on them.
    pub shutdown_timeout: Duration,
    /// Delay between checks of the schedule.
    pub schedule_polling_interval: Duration,
    /// Delay between heartbeats.
    pub heartbeat_interval: Duration,
    /// Servers silent for longer than this are evicted.
    pub server_timeout: Duration,
    /// Delay between watchdog sweeps.
    pub server_check_interval: Duration,
    /// Delay between recurring job checks.
    pub recurring_polling_interval: Duration,
}

impl Default for BackgroundJobServerOptions {
    fn default() -> Self {
        Self {
            server_name: None,
            worker_count: default_worker_count(),
            queues: vec![DEFAULT_QUEUE.to_string()],
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            schedule_polling_interval: DEFAULT_POLLING_DELAY,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            server_timeout: DEFAULT_SERVER_TIMEOUT,
            server_check_interval: DEFAULT_SERVER_CHECK_INTERVAL,
            recurring_polling_interval: DEFAULT_RECURRING_POLLING_DELAY,
        }
    }
}

impl BackgroundJobServerOptions {
    /// Defaults overridden by `TASKHIVE_*` environment variables.
    ///
    /// Durations are given in whole seconds; queues as a comma-separated list.
    pub fn from_env() -> Result<Self, ValidationError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ValidationError> {
        let mut options = Self::default();

        if let Some(name) = lookup("TASKHIVE_SERVER_NAME") {
            options.server_name = Some(name);
        }
        if let Some(count) = lookup("TASKHIVE_WORKER_COUNT") {
            options.worker_count = count
                .trim()
                .parse()
                .map_err(|e| ValidationError::option("TASKHIVE_WORKER_COUNT", format!("{e}")))?;
        }
        if let Some(queues) = lookup("TASKHIVE_QUEUES") {
            options.queues = queues
                .split(',')
                .map(|q| q.trim().to_string())
                .filter(|q| !q.is_empty())
                .collect();
        }

        let seconds = |key: &str, target: &mut Duration| -> Result<(), ValidationError> {
            if let Some(raw) = lookup(key) {
                let secs: u64 = raw
                    .trim()
                    .parse()
                    .map_err(|e| ValidationError::option(key, format!("{e}")))?;
                *target = Duration::from_secs(secs);
            }
            Ok(())
        };
        seconds("TASKHIVE_SHUTDOWN_TIMEOUT_SECS", &mut options.shutdown_timeout)?;
        seconds("TASKHIVE_SCHEDULE_POLLING_SECS", &mut options.schedule_polling_interval)?;
        seconds("TASKHIVE_HEARTBEAT_INTERVAL_SECS", &mut options.heartbeat_interval)?;
        seconds("TASKHIVE_SERVER_TIMEOUT_SECS", &mut options.server_timeout)?;
        seconds("TASKHIVE_SERVER_CHECK_INTERVAL_SECS", &mut options.server_check_interval)?;
        seconds("TASKHIVE_RECURRING_POLLING_SECS", &mut options.recurring_polling_interval)?;

        Ok(options)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.worker_count == 0 {
            return Err(ValidationError::option(
                "worker_count",
                "must be greater than zero",
            ));
        }
        if self.queues.is_empty() {
            return Err(ValidationError::option("queues", "at least one queue is required"));
        }
        for queue in &self.queues {
            validate_queue_name(queue)?;
        }
        for (key, value) in [
            ("heartbeat_interval", self.heartbeat_interval),
            ("server_check_interval", self.server_check_interval),
            ("server_timeout", self.server_timeout),
        ] {
            if value.is_zero() {
                return Err(ValidationError::option(key, "must be greater than zero"));
            }
        }
        if self.server_timeout <= self.heartbeat_interval {
            return Err(ValidationError::option(
                "server_timeout",
                "must be longer than heartbeat_interval",
            ));
        }
        Ok(())
    }

    pub(crate) fn processing_options(&self) -> BackgroundProcessingServerOptions {
        BackgroundProcessingServerOptions {
            server_name: self.server_name.clone(),
            shutdown_timeout: self.shutdown_timeout,
            heartbeat_interval: self.heartbeat_interval,
            server_check_interval: self.server_check_interval,
            server_timeout: self.server_timeout,
            ..BackgroundProcessingServerOptions::default()
        }
    }
}

/// `min(cpus * 5, 20)`.
fn default_worker_count() -> usize {
    let cpus = std::thread::available_parallelism().map_or(1, |n| n.get());
    (cpus * 5).min(MAX_DEFAULT_WORKER_COUNT)
}
