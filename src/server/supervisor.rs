//! Restart loop around a background process.
//!
//! The supervisor keeps calling [`BackgroundProcess::execute`] until
//! shutdown is requested. Errors and panics never escape: they are logged
//! and the process is restarted after a backoff delay.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use rand::Rng;
use tracing::{debug, error, info, warn};

use crate::error::ProcessError;
use crate::server::process::{BackgroundProcess, BackgroundProcessContext};

/// Upper bound for the exponential backoff.
pub const MAX_RESTART_DELAY: Duration = Duration::from_secs(5 * 60);

/// Delay before a faulted process is started again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Random delay in `[n², (n+1)²]` seconds after the n-th consecutive
    /// failure, capped at `max`.
    Exponential { max: Duration },
    Fixed(Duration),
}

impl Backoff {
    pub fn delay(&self, consecutive_failures: u32) -> Duration {
        match *self {
            Self::Fixed(delay) => delay,
            Self::Exponential { max } => {
                let n = u64::from(consecutive_failures);
                let low = n.saturating_mul(n);
                let high = (n + 1).saturating_mul(n + 1);
                let secs = rand::thread_rng().gen_range(low..=high);
                Duration::from_secs(secs).min(max)
            }
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::Exponential {
            max: MAX_RESTART_DELAY,
        }
    }
}

/// Run `process` until the context's shutdown token fires.
pub async fn run_supervised(
    process: Arc<dyn BackgroundProcess>,
    context: BackgroundProcessContext,
    backoff: Backoff,
) {
    let name = process.name();
    let mut failures: u32 = 0;
    debug!(process = %name, server_id = context.server_id(), "Background process started");

    while !context.is_shutdown_requested() {
        let outcome = AssertUnwindSafe(process.execute(&context))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(ProcessError::Panicked(panic_message(panic.as_ref()))));

        match outcome {
            Ok(()) => failures = 0,
            Err(e) if e.is_cancellation() && context.is_shutdown_requested() => {
                debug!(process = %name, "Background process stopped due to shutdown");
                break;
            }
            Err(e) => {
                failures = failures.saturating_add(1);
                let delay = backoff.delay(failures);
                if e.is_cancellation() {
                    warn!(
                        process = %name,
                        error = %e,
                        "Background process was cancelled without a shutdown request, restarting"
                    );
                } else {
                    error!(
                        process = %name,
                        error = %e,
                        failures,
                        "Error occurred during execution of background process"
                    );
                }
                info!(process = %name, delay_ms = delay.as_millis() as u64, "Restarting background process after delay");
                if context.wait(delay).await {
                    break;
                }
            }
        }
    }

    debug!(process = %name, "Background process finished");
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use tokio_util::sync::CancellationToken;

    use crate::storage::MemoryStorage;

    /// Fails or panics on its first runs, then requests shutdown.
    struct Flaky {
        runs: AtomicU32,
        shutdown: CancellationToken,
    }

    #[async_trait]
    impl BackgroundProcess for Flaky {
        fn name(&self) -> String {
            "Flaky".into()
        }

        async fn execute(&self, _context: &BackgroundProcessContext) -> Result<(), ProcessError> {
            match self.runs.fetch_add(1, Ordering::SeqCst) {
                0 => Err(ProcessError::Other(anyhow::anyhow!("boom"))),
                1 => panic!("kaboom"),
                2 => Err(ProcessError::Cancelled),
                _ => {
                    self.shutdown.cancel();
                    Ok(())
                }
            }
        }
    }

    /// Returns a cancellation once shutdown is requested.
    struct Waiting;

    #[async_trait]
    impl BackgroundProcess for Waiting {
        fn name(&self) -> String {
            "Waiting".into()
        }

        async fn execute(&self, context: &BackgroundProcessContext) -> Result<(), ProcessError> {
            context.shutdown_token().cancelled().await;
            Err(ProcessError::Cancelled)
        }
    }

    #[tokio::test]
    async fn restarts_after_errors_and_panics() {
        let shutdown = CancellationToken::new();
        let process = Arc::new(Flaky {
            runs: AtomicU32::new(0),
            shutdown: shutdown.clone(),
        });
        let context = BackgroundProcessContext::new("s1", Arc::new(MemoryStorage::new()), shutdown);

        tokio::time::timeout(
            Duration::from_secs(5),
            run_supervised(process.clone(), context, Backoff::Fixed(Duration::from_millis(1))),
        )
        .await
        .unwrap();

        assert_eq!(process.runs.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn cancellation_during_shutdown_ends_the_loop() {
        let shutdown = CancellationToken::new();
        let context =
            BackgroundProcessContext::new("s1", Arc::new(MemoryStorage::new()), shutdown.clone());
        let handle = tokio::spawn(run_supervised(Arc::new(Waiting), context, Backoff::default()));

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn exponential_backoff_is_bounded() {
        let backoff = Backoff::default();
        for _ in 0..50 {
            let third = backoff.delay(3);
            assert!(third >= Duration::from_secs(9) && third <= Duration::from_secs(16));
            assert_eq!(backoff.delay(100), MAX_RESTART_DELAY);
        }
    }

    #[test]
    fn panic_payloads_are_readable() {
        let payload: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(payload.as_ref()), "static");
        let payload: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(payload.as_ref()), "owned");
    }
}
