//! aimq worker process
//!
//! Entry point for running queue workers and submitting or inspecting jobs
//! from the command line.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context};
use clap::Parser;

use aimq_jobs::{queue_for_job, registry_for_queue};
use aimq_queue::{ConnectionState, JobOptionsOverride, QueueService, WorkerOptions};

mod cli;
mod config_helpers;
mod tracing_setup;

use cli::{Cli, Commands};
use config_helpers::queue_service_from_config;
use tracing_setup::install_tracing_from_config;

/// How long one-shot commands wait for Redis before giving up.
const READY_TIMEOUT: Duration = Duration::from_secs(15);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();
    if let Err(e) = args.validate() {
        e.exit();
    }

    eprintln!("[STARTUP] Loading config from: {:?}", args.config);
    let config = load_config(args.config.as_ref())?;
    eprintln!("[STARTUP] Config loaded successfully");

    install_tracing_from_config(&config.logging);
    tracing::debug!(
        config = %serde_json::to_string(&config).context("failed to serialize configuration")?,
        "effective configuration"
    );

    let service = queue_service_from_config(&config, args.memory);
    tracing::info!(
        prefix = %config.queue.prefix,
        backend = if args.memory { "memory" } else { "redis" },
        "queue service configured"
    );

    let outcome = match args.command {
        Commands::Run {
            queues,
            concurrency,
        } => {
            let queues = if queues.is_empty() {
                config.workers.queues.clone()
            } else {
                queues
            };
            run_workers(&service, &queues, concurrency).await
        }
        Commands::Enqueue {
            queue,
            name,
            data,
            attempts,
            delay_ms,
        } => {
            let queue = queue
                .or_else(|| queue_for_job(&name).map(str::to_string))
                .ok_or_else(|| anyhow!("no queue given and `{name}` is not a built-in job"))?;
            let data: serde_json::Value =
                serde_json::from_str(&data).context("--data is not valid JSON")?;
            let mut overrides = JobOptionsOverride::default();
            if let Some(attempts) = attempts {
                overrides = overrides.attempts(attempts);
            }
            if let Some(delay) = delay_ms {
                overrides = overrides.delay_ms(delay);
            }
            enqueue(&service, &queue, &name, data, overrides).await
        }
        Commands::Counts { queue } => counts(&service, &queue).await,
    };

    let shutdown = service.shutdown().await;
    match &shutdown {
        Ok(report) => tracing::info!(closed = report.closed.len(), "shutdown complete"),
        Err(e) => tracing::error!(error = %e, "shutdown failed"),
    }
    outcome?;
    shutdown?;
    Ok(())
}

/// Load configuration from file or defaults.
fn load_config(path: Option<&PathBuf>) -> anyhow::Result<aimq_config::Config> {
    aimq_config::load_config(path).map_err(|e| {
        eprintln!("failed to load configuration: {e}");
        anyhow!(e.to_string())
    })
}

async fn run_workers(
    service: &QueueService,
    queues: &[String],
    concurrency: Option<usize>,
) -> anyhow::Result<()> {
    let mut started = 0usize;
    for queue in queues {
        let registry = registry_for_queue(queue);
        if registry.is_empty() {
            tracing::warn!(queue = %queue, "no built-in processors for queue, skipping");
            continue;
        }
        let options = WorkerOptions {
            concurrency,
            ..WorkerOptions::default()
        };
        service
            .create_worker(queue, registry, Some(options))
            .await
            .with_context(|| format!("failed to start worker for `{queue}`"))?;
        started += 1;
    }
    if started == 0 {
        return Err(anyhow!("no workers started for queues {queues:?}"));
    }

    eprintln!("[STARTUP] ✓ {started} worker(s) running, press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    tracing::info!("received Ctrl-C, shutting down");
    Ok(())
}

async fn enqueue(
    service: &QueueService,
    queue: &str,
    name: &str,
    data: serde_json::Value,
    overrides: JobOptionsOverride,
) -> anyhow::Result<()> {
    wait_until_ready(service).await?;
    let job = service
        .add_job(queue, name, data, Some(overrides))
        .await
        .with_context(|| format!("failed to enqueue `{name}` on `{queue}`"))?;
    println!("{}", serde_json::to_string_pretty(&job)?);
    Ok(())
}

async fn counts(service: &QueueService, queue: &str) -> anyhow::Result<()> {
    wait_until_ready(service).await?;
    let counts = service
        .get_job_counts(queue)
        .await
        .with_context(|| format!("failed to read counts for `{queue}`"))?;
    println!("{}", serde_json::to_string_pretty(&counts)?);
    Ok(())
}

/// One-shot commands need a live connection; workers tolerate a late one.
async fn wait_until_ready(service: &QueueService) -> anyhow::Result<()> {
    let mut changes = service.state_changes();
    let result = match tokio::time::timeout(
        READY_TIMEOUT,
        changes.wait_for(|s| *s == ConnectionState::Connected),
    )
    .await
    {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(_)) | Err(_) => Err(anyhow!(
            "queue backend unavailable (state: {})",
            service.connection_state()
        )),
    };
    result
}
