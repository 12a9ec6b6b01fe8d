//! ListRust - Mailing list server entry point

use anyhow::Result;
use listrust_common::config::{Config, LoggingConfig};
use listrust_core::runner::{slices, stale_after};
use listrust_core::{
    ChainRegistry, Context, Dispatch, Dispatcher, ListManager, Maintenance, Metrics, Runner,
    SystemClock, WorkflowEngine,
};
use listrust_storage::{ListSettings, Repositories};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = match std::env::args().nth(1) {
        Some(path) => Config::from_file(&PathBuf::from(path))?,
        None => Config::load()?,
    };

    // Initialize logging
    init_logging(&config.logging);

    info!("Starting ListRust mailing list server...");

    // Initialize storage
    let repos = Repositories::open(&config.database).await?;
    info!(backend = %config.database.backend, "Storage ready");

    let ctx = Context::new(repos, Arc::new(SystemClock), &config);
    let metrics = Metrics::new()?;

    // Chains and pipelines must resolve before any list uses them
    let registry = Arc::new(ChainRegistry::from_config(&config.chains, &config.pipelines)?);
    info!(
        chains = config.chains.len(),
        pipelines = config.pipelines.len(),
        "Chain registry loaded"
    );

    bootstrap_lists(&ctx, &registry, &config).await?;

    // Jobs left in processing by a previous run go back to their queues
    let recovered = ctx
        .queue
        .recover_stale(ctx.clock.now() - stale_after(&config.runner))
        .await?;
    if recovered > 0 {
        warn!(recovered, "Recovered jobs from a previous run");
    }

    let engine = WorkflowEngine::new(ctx.clone(), metrics.clone());
    let dispatcher: Arc<dyn Dispatch> = Arc::new(Dispatcher::new(
        ctx.clone(),
        registry.clone(),
        engine,
        metrics.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handles = Vec::new();

    // Start queue runners
    for queue in &config.runner.queues {
        for slice in slices(config.runner.slices) {
            let runner = Runner::new(
                queue,
                slice,
                &ctx,
                dispatcher.clone(),
                config.runner.clone(),
                metrics.clone(),
            );
            handles.push(tokio::spawn(runner.run(shutdown_rx.clone())));
        }
    }
    info!(
        queues = config.runner.queues.len(),
        slices = config.runner.slices,
        "Queue runners started"
    );

    // Start maintenance
    let maintenance = Maintenance::new(ctx.clone(), stale_after(&config.runner));
    handles.push(tokio::spawn(maintenance.run(
        Duration::from_secs(config.pending.eviction_interval_secs.max(1)),
        shutdown_rx.clone(),
    )));

    info!("ListRust server started successfully");

    wait_for_signal().await?;

    info!("Shutting down...");
    let _ = shutdown_tx.send(true);

    for handle in handles {
        if let Err(e) = handle.await {
            error!("Task failed during shutdown: {}", e);
        }
    }

    match metrics.render() {
        Ok(text) => info!(metrics = %text, "Final metrics"),
        Err(e) => warn!("Failed to render metrics: {}", e),
    }

    info!("ListRust server stopped");
    Ok(())
}

/// Create or update the lists named in the configuration, then check that
/// every stored list refers to known chains and pipelines
async fn bootstrap_lists(ctx: &Context, registry: &Arc<ChainRegistry>, config: &Config) -> Result<()> {
    let manager = ListManager::new(ctx.clone(), registry.clone());

    for list in &config.lists {
        manager.ensure(&list.address, ListSettings::from(list)).await?;
    }

    for list in manager.lists().await? {
        registry.check_list(&list).map_err(|e| {
            error!(list_id = %list.list_id, "List configuration is invalid: {}", e);
            e
        })?;
    }

    Ok(())
}

async fn wait_for_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result?,
            _ = terminate.recv() => {}
        }
    }

    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await?;

    Ok(())
}

fn init_logging(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},listrust=debug", logging.level)));

    let registry = tracing_subscriber::registry().with(filter);
    if logging.format == "json" {
        registry
            .with(fmt::layer().json().with_target(true).with_level(true))
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_level(true))
            .init();
    }
}
