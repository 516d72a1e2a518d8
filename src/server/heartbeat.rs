//! Server liveness: heartbeats out, dead servers evicted.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::error::{ProcessError, StorageError};
use crate::server::process::{BackgroundProcess, BackgroundProcessContext};
use crate::storage::ServerContext;

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_SERVER_TIMEOUT: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_SERVER_CHECK_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Refreshes this server's heartbeat. A server that was evicted while it
/// was unresponsive announces itself again.
pub struct ServerHeartbeat {
    interval: Duration,
    server_context: ServerContext,
}

impl ServerHeartbeat {
    pub fn new(interval: Duration, server_context: ServerContext) -> Self {
        Self {
            interval,
            server_context,
        }
    }
}

#[async_trait]
impl BackgroundProcess for ServerHeartbeat {
    fn name(&self) -> String {
        "ServerHeartbeat".to_string()
    }

    async fn execute(&self, context: &BackgroundProcessContext) -> Result<(), ProcessError> {
        let connection = context.storage().connection().await?;
        match connection.heartbeat(context.server_id()).await {
            Ok(()) => {}
            Err(StorageError::NotFound { .. }) => {
                warn!(
                    server_id = context.server_id(),
                    "Server record was evicted, announcing again"
                );
                connection
                    .announce_server(context.server_id(), &self.server_context)
                    .await?;
            }
            Err(e) => return Err(e.into()),
        }
        context.wait(self.interval).await;
        Ok(())
    }
}

/// Removes servers that stopped sending heartbeats.
pub struct ServerWatchdog {
    check_interval: Duration,
    server_timeout: Duration,
}

impl ServerWatchdog {
    pub fn new(check_interval: Duration, server_timeout: Duration) -> Self {
        Self {
            check_interval,
            server_timeout,
        }
    }
}

#[async_trait]
impl BackgroundProcess for ServerWatchdog {
    fn name(&self) -> String {
        "ServerWatchdog".to_string()
    }

    async fn execute(&self, context: &BackgroundProcessContext) -> Result<(), ProcessError> {
        let connection = context.storage().connection().await?;
        let removed = connection
            .remove_timed_out_servers(self.server_timeout)
            .await?;
        if removed > 0 {
            info!(removed, "Removed timed out servers");
        }
        context.wait(self.check_interval).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::Utc;
    use tokio_util::sync::CancellationToken;

    use crate::common::{Clock, ManualClock};
    use crate::storage::{JobStorage, MemoryStorage, MemoryStorageOptions};

    fn server_context() -> ServerContext {
        ServerContext {
            queues: vec!["default".into()],
            worker_count: 2,
        }
    }

    #[tokio::test]
    async fn heartbeat_refreshes_and_reannounces() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let storage = MemoryStorage::with_options(MemoryStorageOptions::default(), clock.clone());
        let connection = storage.connection().await.unwrap();
        connection.announce_server("s1", &server_context()).await.unwrap();

        let token = CancellationToken::new();
        token.cancel();
        let context = BackgroundProcessContext::new("s1", Arc::new(storage.clone()), token);
        let heartbeat = ServerHeartbeat::new(Duration::from_secs(30), server_context());

        clock.advance(chrono::Duration::seconds(45));
        heartbeat.execute(&context).await.unwrap();
        let servers = connection.get_servers().await.unwrap();
        assert_eq!(servers[0].heartbeat, clock.now());

        connection.remove_server("s1").await.unwrap();
        heartbeat.execute(&context).await.unwrap();
        assert_eq!(connection.get_servers().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn watchdog_evicts_silent_servers() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let storage = MemoryStorage::with_options(MemoryStorageOptions::default(), clock.clone());
        let connection = storage.connection().await.unwrap();
        connection.announce_server("silent", &server_context()).await.unwrap();
        clock.advance(chrono::Duration::minutes(6));

        let token = CancellationToken::new();
        token.cancel();
        let context = BackgroundProcessContext::new("s2", Arc::new(storage.clone()), token);
        ServerWatchdog::new(DEFAULT_SERVER_CHECK_INTERVAL, DEFAULT_SERVER_TIMEOUT)
            .execute(&context)
            .await
            .unwrap();

        assert!(connection.get_servers().await.unwrap().is_empty());
    }
}
