use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use taskhive::client::BackgroundJobFactory;
use taskhive::common::{JobRegistry, MethodInfo, TypeInfo};
use taskhive::filters::{AutomaticRetry, FilterCollection};
use taskhive::states::{BackgroundJobStateChanger, ContinuationOptions};
use taskhive::{
    BackgroundJobClient, BackgroundJobServer, BackgroundJobServerOptions, MemoryStorage,
    RecurringJobManager, RecurringJobOptions,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let options = BackgroundJobServerOptions::from_env()?;
    eprintln!("taskhive v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Workers: {}", options.worker_count);
    eprintln!("   Queues: {}", options.queues.join(", "));
    eprintln!("   Press Ctrl+C to stop.\n");

    let registry = Arc::new(demo_registry());
    let filters = Arc::new(FilterCollection::default());
    let storage = Arc::new(MemoryStorage::new());

    let client = BackgroundJobClient::new(storage.clone(), registry.clone(), filters.clone());

    // ── Demo jobs ────────────────────────────────────────────────────────
    let greet = registry.job("Greeter", "greet", vec![json!("world")])?;
    let parent = client.enqueue(greet.clone()).await?;
    if let Some(parent) = &parent {
        let follow_up = registry.job("Greeter", "greet", vec![json!("continuation")])?;
        client
            .continue_with(parent, follow_up, ContinuationOptions::OnlyOnSucceededState)
            .await?;
    }
    client
        .schedule(
            registry.job("Greeter", "greet", vec![json!("later")])?,
            Duration::from_secs(20),
        )
        .await?;
    client.enqueue(registry.job("Flaky", "run", vec![])?).await?;

    let changer = Arc::new(BackgroundJobStateChanger::new(registry.clone(), filters.clone()));
    let recurring = RecurringJobManager::new(storage.clone(), BackgroundJobFactory::new(changer));
    recurring
        .add_or_update("greet-every-minute", &greet, "* * * * *", RecurringJobOptions::default())
        .await?;

    // ── Server ───────────────────────────────────────────────────────────
    let server = BackgroundJobServer::start(options, storage, registry, filters).await?;

    tokio::signal::ctrl_c().await?;
    eprintln!("\nShutting down...");
    server.shutdown().await;
    Ok(())
}

fn demo_registry() -> JobRegistry {
    let mut registry = JobRegistry::new();

    registry.register(
        TypeInfo::new("Greeter"),
        MethodInfo::new("Greeter", "greet").param("name", "string"),
        |ctx| async move {
            let name: String = ctx.arg(0)?;
            tracing::info!(job_id = %ctx.job_id, "Hello, {name}!");
            Ok(json!(format!("greeted {name}")))
        },
    );

    registry
        .register(
            TypeInfo::new("Flaky"),
            MethodInfo::new("Flaky", "run"),
            |_| async { Err(anyhow::anyhow!("the flaky job failed, as usual")) },
        )
        .with_filter(AutomaticRetry::new(2));

    registry
}
