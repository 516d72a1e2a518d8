//! The background job server: workers plus the schedulers they rely on.

use std::sync::Arc;

use tracing::info;

use crate::client::BackgroundJobFactory;
use crate::common::JobRegistry;
use crate::config::BackgroundJobServerOptions;
use crate::error::Error;
use crate::filters::FilterCollection;
use crate::recurring::RecurringJobScheduler;
use crate::server::delayed::DelayedJobScheduler;
use crate::server::process::BackgroundProcess;
use crate::server::processing_server::BackgroundProcessingServer;
use crate::server::worker::Worker;
use crate::states::BackgroundJobStateChanger;
use crate::storage::{JobStorage, ServerContext};

/// Runs `worker_count` workers, the delayed job scheduler and the recurring
/// job scheduler on top of a [`BackgroundProcessingServer`].
#[derive(Debug)]
pub struct BackgroundJobServer {
    inner: BackgroundProcessingServer,
}

impl BackgroundJobServer {
    pub async fn start(
        options: BackgroundJobServerOptions,
        storage: Arc<dyn JobStorage>,
        registry: Arc<JobRegistry>,
        filters: Arc<FilterCollection>,
    ) -> Result<Self, Error> {
        Self::start_with(options, storage, registry, filters, Vec::new()).await
    }

    /// Like [`start`](Self::start), also running `additional` processes.
    pub async fn start_with(
        options: BackgroundJobServerOptions,
        storage: Arc<dyn JobStorage>,
        registry: Arc<JobRegistry>,
        filters: Arc<FilterCollection>,
        additional: Vec<Arc<dyn BackgroundProcess>>,
    ) -> Result<Self, Error> {
        options.validate()?;

        info!("Starting background job server");
        info!(
            worker_count = options.worker_count,
            queues = ?options.queues,
            shutdown_timeout_ms = options.shutdown_timeout.as_millis() as u64,
            schedule_polling_ms = options.schedule_polling_interval.as_millis() as u64,
            recurring_polling_ms = options.recurring_polling_interval.as_millis() as u64,
            "Using the following options"
        );

        let state_changer = Arc::new(BackgroundJobStateChanger::new(registry, filters));
        let factory = BackgroundJobFactory::new(Arc::clone(&state_changer));

        let mut processes: Vec<Arc<dyn BackgroundProcess>> =
            Vec::with_capacity(options.worker_count + 2 + additional.len());
        for _ in 0..options.worker_count {
            processes.push(Arc::new(Worker::new(
                options.queues.clone(),
                Arc::clone(&state_changer),
            )));
        }
        processes.push(Arc::new(DelayedJobScheduler::new(
            options.schedule_polling_interval,
            Arc::clone(&state_changer),
        )));
        processes.push(Arc::new(RecurringJobScheduler::new(
            options.recurring_polling_interval,
            factory,
        )));
        processes.extend(additional);

        let server_context = ServerContext {
            queues: options.queues.clone(),
            worker_count: options.worker_count,
        };
        let inner = BackgroundProcessingServer::start(
            storage,
            processes,
            server_context,
            options.processing_options(),
        )
        .await?;
        Ok(Self { inner })
    }

    pub fn server_id(&self) -> &str {
        self.inner.server_id()
    }

    /// Signal every process to stop without waiting for them.
    pub fn send_stop(&self) {
        self.inner.send_stop();
    }

    /// Stop and wait up to the shutdown timeout.
    pub async fn shutdown(self) {
        self.inner.shutdown().await;
    }
}
