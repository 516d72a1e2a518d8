//! Long-running background processes and the context they run in.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::ProcessError;
use crate::storage::JobStorage;

/// What a background process gets to work with.
#[derive(Clone)]
pub struct BackgroundProcessContext {
    server_id: String,
    storage: Arc<dyn JobStorage>,
    shutdown: CancellationToken,
}

impl BackgroundProcessContext {
    pub fn new(
        server_id: impl Into<String>,
        storage: Arc<dyn JobStorage>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            server_id: server_id.into(),
            storage,
            shutdown,
        }
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn storage(&self) -> &Arc<dyn JobStorage> {
        &self.storage
    }

    /// Fires when the server is asked to stop.
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Sleep for `timeout` or until shutdown. Returns `true` if shutdown
    /// was requested.
    pub async fn wait(&self, timeout: Duration) -> bool {
        tokio::select! {
            _ = self.shutdown.cancelled() => true,
            _ = tokio::time::sleep(timeout) => self.shutdown.is_cancelled(),
        }
    }
}

impl std::fmt::Debug for BackgroundProcessContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundProcessContext")
            .field("server_id", &self.server_id)
            .field("shutdown_requested", &self.is_shutdown_requested())
            .finish()
    }
}

/// One iteration of a long-running loop. The supervisor calls `execute`
/// again and again until shutdown, so implementations do a unit of work
/// (and possibly wait) and return.
#[async_trait]
pub trait BackgroundProcess: Send + Sync {
    fn name(&self) -> String;

    async fn execute(&self, context: &BackgroundProcessContext) -> Result<(), ProcessError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    #[tokio::test]
    async fn wait_returns_early_on_shutdown() {
        let token = CancellationToken::new();
        let context = BackgroundProcessContext::new("s1", Arc::new(MemoryStorage::new()), token.clone());

        assert!(!context.wait(Duration::from_millis(5)).await);

        token.cancel();
        let started = std::time::Instant::now();
        assert!(context.wait(Duration::from_secs(60)).await);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(context.is_shutdown_requested());
    }
}
