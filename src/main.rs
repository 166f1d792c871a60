//! benchmark-worker - queue-driven benchmark execution worker.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use benchmark_worker::config::Settings;
use benchmark_worker::gate::IdempotencyGate;
use benchmark_worker::ingest::Ingestor;
use benchmark_worker::mock_sidecar::MockSidecarRegistry;
use benchmark_worker::otel_collector::OtlpCollector;
use benchmark_worker::repository::Repository;
use benchmark_worker::repository::postgres::PostgresRepository;
use benchmark_worker::runner::CaseRunner;
use benchmark_worker::sandbox::DockerSandboxManager;
use benchmark_worker::scheduler::Scheduler;
use benchmark_worker::scorer::ScorerPool;
use benchmark_worker::trajectory::TrajectoryResolver;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if let Err(e) = run().await {
        tracing::error!(error = %e, "worker exited with error");
        std::process::exit(1);
    }
    Ok(())
}

async fn run() -> Result<()> {
    let settings = Arc::new(Settings::from_env().context("loading configuration")?);

    let repository: Arc<dyn Repository> = Arc::new(
        PostgresRepository::connect(&settings.postgres)
            .await
            .context("connecting to postgres")?,
    );

    let gate = Arc::new(IdempotencyGate::from_settings(&settings.redis).context("connecting to redis")?);

    let sandbox_manager: Arc<dyn benchmark_worker::sandbox::SandboxManager> =
        Arc::new(DockerSandboxManager::connect().context("connecting to docker")?);

    let sidecars = MockSidecarRegistry::new();

    let collector = OtlpCollector::new(settings.otel.clone(), repository.clone());
    let collector_handle = collector.clone().start().await;
    if collector_handle.is_none() && settings.otel.collector_enabled {
        tracing::warn!("otlp collector did not start, falling back to database-only trajectory resolution");
    }

    let trajectory_resolver = Arc::new(TrajectoryResolver::new(Some(collector.clone()), repository.clone()));

    let scorer_pool = Arc::new(
        ScorerPool::new(settings.evaluator.clone(), settings.scorer_concurrent_cases).context("building scorer pool")?,
    );

    let runner = Arc::new(CaseRunner::new(
        settings.clone(),
        sandbox_manager,
        sidecars,
        collector.clone(),
        trajectory_resolver,
        scorer_pool,
    ));

    let scheduler = Arc::new(Scheduler::new(settings.clone(), repository.clone(), runner));
    let ingestor = Ingestor::new(settings.clone(), gate, scheduler);

    tracing::info!(queue = %settings.rabbitmq.experiment_queue, "benchmark-worker starting");

    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
            tokio::select! {
                _ = ctrl_c => {}
                _ = terminate.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }
        tracing::info!("shutdown signal received");
    };

    ingestor.run(shutdown).await?;

    if let Some(handle) = collector_handle {
        handle.abort();
    }

    Ok(())
}
