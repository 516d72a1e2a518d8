//! Hosts a set of background processes under one server identity.
//!
//! Each process gets a dedicated, named OS thread running a current-thread
//! tokio runtime, so a process that blocks cannot starve the others. The
//! server announces itself to storage on start and removes its record on
//! shutdown, even when some processes refuse to stop in time.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::Error;
use crate::server::heartbeat::{
    DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_SERVER_CHECK_INTERVAL, DEFAULT_SERVER_TIMEOUT,
    ServerHeartbeat, ServerWatchdog,
};
use crate::server::process::{BackgroundProcess, BackgroundProcessContext};
use crate::server::supervisor::{Backoff, run_supervised};
use crate::storage::{JobStorage, ServerContext};

pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(15);

/// Options of [`BackgroundProcessingServer`].
#[derive(Debug, Clone)]
pub struct BackgroundProcessingServerOptions {
    pub server_name: Option<String>,
    pub shutdown_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub server_check_interval: Duration,
    pub server_timeout: Duration,
    /// Restart delay of faulted processes.
    pub backoff: Backoff,
}

impl Default for BackgroundProcessingServerOptions {
    fn default() -> Self {
        Self {
            server_name: None,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            server_check_interval: DEFAULT_SERVER_CHECK_INTERVAL,
            server_timeout: DEFAULT_SERVER_TIMEOUT,
            backoff: Backoff::default(),
        }
    }
}

struct RunningProcess {
    name: String,
    finished: oneshot::Receiver<()>,
    thread: JoinHandle<()>,
}

/// A running set of supervised processes.
pub struct BackgroundProcessingServer {
    server_id: String,
    storage: Arc<dyn JobStorage>,
    shutdown: CancellationToken,
    running: Vec<RunningProcess>,
    shutdown_timeout: Duration,
    stopped: bool,
}

impl BackgroundProcessingServer {
    /// Announce the server and start every process, plus the heartbeat, the
    /// watchdog and the storage's own components.
    pub async fn start(
        storage: Arc<dyn JobStorage>,
        processes: Vec<Arc<dyn BackgroundProcess>>,
        server_context: ServerContext,
        options: BackgroundProcessingServerOptions,
    ) -> Result<Self, Error> {
        let server_id = generate_server_id(options.server_name.as_deref());

        let connection = storage.connection().await?;
        connection.announce_server(&server_id, &server_context).await?;
        drop(connection);

        let mut all: Vec<Arc<dyn BackgroundProcess>> = vec![
            Arc::new(ServerHeartbeat::new(options.heartbeat_interval, server_context)),
            Arc::new(ServerWatchdog::new(
                options.server_check_interval,
                options.server_timeout,
            )),
        ];
        all.extend(storage.components());
        all.extend(processes);

        let mut server = Self {
            server_id,
            storage,
            shutdown: CancellationToken::new(),
            running: Vec::with_capacity(all.len()),
            shutdown_timeout: options.shutdown_timeout,
            stopped: false,
        };

        for process in all {
            let context = BackgroundProcessContext::new(
                server.server_id.clone(),
                Arc::clone(&server.storage),
                server.shutdown.clone(),
            );
            match spawn_process(process, context, options.backoff) {
                Ok(running) => server.running.push(running),
                Err(e) => {
                    error!(server_id = %server.server_id, error = %e, "Failed to start background process");
                    server.shutdown().await;
                    return Err(e.into());
                }
            }
        }

        info!(
            server_id = %server.server_id,
            processes = server.running.len(),
            storage = %server.storage.describe(),
            "Background processing server started"
        );
        Ok(server)
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    /// Ask every process to stop, without waiting.
    pub fn send_stop(&self) {
        if !self.shutdown.is_cancelled() {
            info!(server_id = %self.server_id, "Sending stop signal to background processes");
            self.shutdown.cancel();
        }
    }

    /// Stop, wait up to the shutdown timeout, then remove the server record.
    pub async fn shutdown(mut self) {
        self.send_stop();

        let mut running = std::mem::take(&mut self.running);
        let all_finished =
            futures::future::join_all(running.iter_mut().map(|process| &mut process.finished));
        if tokio::time::timeout(self.shutdown_timeout, all_finished)
            .await
            .is_err()
        {
            let stuck: Vec<&str> = running
                .iter()
                .filter(|process| !process.thread.is_finished())
                .map(|process| process.name.as_str())
                .collect();
            warn!(
                server_id = %self.server_id,
                timeout_ms = self.shutdown_timeout.as_millis() as u64,
                ?stuck,
                "Processing server takes too long to shutdown. Performing ungraceful shutdown."
            );
        }

        match self.storage.connection().await {
            Ok(connection) => {
                if let Err(e) = connection.remove_server(&self.server_id).await {
                    warn!(server_id = %self.server_id, error = %e, "Failed to remove server record");
                }
            }
            Err(e) => {
                warn!(server_id = %self.server_id, error = %e, "Failed to remove server record");
            }
        }

        self.stopped = true;
        info!(server_id = %self.server_id, "Background processing server stopped");
    }
}

impl Drop for BackgroundProcessingServer {
    fn drop(&mut self) {
        if !self.stopped {
            warn!(
                server_id = %self.server_id,
                "Processing server dropped without shutdown; its record is left to the watchdog"
            );
            self.shutdown.cancel();
        }
    }
}

impl std::fmt::Debug for BackgroundProcessingServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundProcessingServer")
            .field("server_id", &self.server_id)
            .field("processes", &self.running.len())
            .finish()
    }
}

fn spawn_process(
    process: Arc<dyn BackgroundProcess>,
    context: BackgroundProcessContext,
    backoff: Backoff,
) -> std::io::Result<RunningProcess> {
    let name = process.name();
    let (finished_tx, finished) = oneshot::channel();

    let thread = std::thread::Builder::new()
        .name(name.clone())
        .spawn(move || {
            match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime.block_on(run_supervised(process, context, backoff)),
                Err(e) => error!(error = %e, "Failed to build runtime for background process"),
            }
            let _ = finished_tx.send(());
        })?;

    Ok(RunningProcess {
        name,
        finished,
        thread,
    })
}

/// `"{name}:{pid}:{uuid}"` lower-cased, or a bare uuid when no name is known.
fn generate_server_id(server_name: Option<&str>) -> String {
    let uuid = Uuid::new_v4();
    let name = server_name
        .map(str::to_string)
        .or_else(|| std::env::var("HOSTNAME").ok())
        .filter(|name| !name.trim().is_empty());
    match name {
        Some(name) => format!("{}:{}:{}", name.trim(), std::process::id(), uuid).to_lowercase(),
        None => uuid.to_string(),
    }
}
