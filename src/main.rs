//! # Tickwork node
//!
//! Entry point of one timer node in a Tickwork cluster.
//!
//! ## Startup
//!
//! 1. **Configuration** - defaults, `--config` file, `TICKWORK_*` variables
//! 2. **Store** - connect to SurrealDB and apply the schema
//! 3. **Engine** - wire coordinator, executor, dispatcher and timer service
//! 4. **Dispatcher** - release claims left by a previous run, then fire
//!    due jobs until shutdown
//!
//! ## Shutdown
//!
//! SIGTERM/SIGINT stop the dispatcher from claiming; in-flight fires finish
//! within the shutdown window.

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::panic)]
#![deny(clippy::expect_used)]

mod cli;

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use orchestrator::audit::TracingAuditSink;
use orchestrator::config::EngineConfig;
use orchestrator::process::InMemoryProcessGraph;
use orchestrator::shutdown::{ShutdownCoordinator, install_signal_handlers};
use orchestrator::store::SurrealStore;
use orchestrator::timers::TimerDefinition;
use orchestrator::TimerEngine;
use tickwork_core::{Error, ResultExt};

use crate::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = EngineConfig::load(cli.config.as_deref())
        .context("Configuration could not be loaded")?;
    if let Some(node_id) = cli.node_id {
        config.cluster.node_id = node_id;
    }

    init_tracing(&config);

    match cli.command {
        Commands::CheckConfig => check_config(&config),
        Commands::Run => run(config).await,
        Commands::EnableStart {
            definition,
            node,
            cycle,
        } => enable_start(config, &definition, &node, cycle).await,
        Commands::DisableStart { definition } => disable_start(config, &definition).await,
        Commands::Prune { retention_hours } => prune(config, retention_hours).await,
    }
}

/// Initialize tracing with `RUST_LOG`, falling back to the configured level.
fn init_tracing(config: &EngineConfig) {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str())),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn check_config(config: &EngineConfig) -> Result<()> {
    config.validate().context("Configuration is invalid")?;
    println!("{config:#?}");
    Ok(())
}

async fn build_engine(config: &EngineConfig) -> Result<TimerEngine> {
    let url = &config.store.url;
    let store = SurrealStore::connect(config.store_config())
        .await
        .map_err(|err| Error::store_unavailable(format!("{url}: {err}")))?;
    store
        .connection()
        .health_check()
        .await
        .map_err(|err| Error::store_unavailable(format!("{url}: health check: {err}")))?;
    info!(url = %config.store.url, "Store connected and healthy");

    Ok(
        TimerEngine::builder(Arc::new(store), Arc::new(InMemoryProcessGraph::new()))
            .with_config(config)
            .audit_sink(Arc::new(TracingAuditSink))
            .build(),
    )
}

async fn run(config: EngineConfig) -> Result<()> {
    let start_time = Instant::now();
    info!(node_id = %config.cluster.node_id, "Tickwork node starting...");

    let engine = build_engine(&config).await?;
    let shutdown = Arc::new(ShutdownCoordinator::new());
    let signals = install_signal_handlers(Arc::clone(&shutdown))
        .await
        .into_option_logged();
    if signals.is_none() {
        warn!("Running without OS signal handlers");
    }

    let dispatcher = engine.spawn(&shutdown);
    info!(
        node_id = %engine.node_id(),
        startup = ?start_time.elapsed(),
        "Tickwork node running. Press Ctrl+C to stop."
    );

    let stats = shutdown
        .wait_for_signal_and_drain(1)
        .await
        .context("Graceful shutdown failed")?;
    let joined = dispatcher
        .await
        .map_err(|err| Error::dispatcher_failed(err.to_string()))
        .into_option_logged();
    if joined.is_none() {
        warn!("Dispatcher task ended abnormally");
    }

    info!(
        jobs_drained = stats.jobs_drained,
        duration_ms = stats.total_duration_ms,
        "Tickwork node stopped gracefully"
    );
    Ok(())
}

async fn enable_start(
    config: EngineConfig,
    definition: &str,
    node: &str,
    expression: String,
) -> Result<()> {
    let engine = build_engine(&config).await?;
    let timer = engine
        .service()
        .enable_start_event(definition, node, &TimerDefinition::Cycle { expression })
        .await
        .context("Could not enable start event")?;
    println!(
        "enabled {definition}/{node}: job {} first fires at {}",
        timer.job_id, timer.next_fire_at
    );
    Ok(())
}

async fn disable_start(config: EngineConfig, definition: &str) -> Result<()> {
    let engine = build_engine(&config).await?;
    let canceled = engine
        .service()
        .disable_start_events(definition)
        .await
        .context("Could not disable start events")?;
    println!("disabled {canceled} start timer(s) of {definition}");
    Ok(())
}

async fn prune(config: EngineConfig, retention_hours: i64) -> Result<()> {
    let retention = chrono::Duration::try_hours(retention_hours)
        .context("Retention window out of range")?;
    let engine = build_engine(&config).await?;
    let pruned = engine
        .service()
        .prune_canceled(retention)
        .await
        .context("Could not prune canceled jobs")?;
    println!("pruned {pruned} canceled job(s)");
    Ok(())
}
