use anyhow::Context;
use clap::{Parser, Subcommand};
use conveyor_core::pg::PgJobStore;
use conveyor_core::redis::{RedisJobQueue, RedisStateStore};
use conveyor_core::{JobQueue, JobStore, StateStore};
use conveyor_engine::events::EventPublisher;
use conveyor_engine::limiter::Limiter;
use conveyor_engine::orchestrator::Orchestrator;
use conveyor_engine::reconciler;
use conveyor_engine::step_client::StepClient;
use conveyor_engine::worker::Worker;
use conveyor_server::api::{self, AppState};
use conveyor_server::config::ServerConfig;
use conveyor_server::migrate;
use conveyor_server::priority::PriorityClient;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "conveyor-server")]
#[command(about = "Multi-tenant pipeline orchestrator", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP API and WebSocket relay.
    Api,

    /// Run a queue worker.
    Worker,

    /// Run the periodic reconcilers (lease reaper, stuck-job detector,
    /// priority promoter).
    Reconciler,

    /// Run DB migrations.
    Migrate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let cfg = ServerConfig::from_env().context("load server config")?;

    match cli.command {
        Command::Api => run_api(&cfg).await,
        Command::Worker => run_worker(&cfg).await,
        Command::Reconciler => run_reconciler(&cfg).await,
        Command::Migrate => migrate::run(&cfg).await,
    }
}

struct Backends {
    store: Arc<dyn JobStore>,
    state: Arc<dyn StateStore>,
    queue: Arc<dyn JobQueue>,
}

async fn connect_backends(cfg: &ServerConfig) -> anyhow::Result<Backends> {
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&cfg.database_url)
        .await
        .context("connect job db")?;

    let redis = RedisStateStore::connect(&cfg.redis_url)
        .await
        .context("connect redis")?;
    let queue = RedisJobQueue::new(redis.connection());

    Ok(Backends {
        store: Arc::new(PgJobStore::new(pool)),
        state: Arc::new(redis),
        queue: Arc::new(queue),
    })
}

/// Flip to `true` on ctrl-c.
fn shutdown_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        let _ = tx.send(true);
    });
    rx
}

async fn run_api(cfg: &ServerConfig) -> anyhow::Result<()> {
    let backends = connect_backends(cfg).await?;
    let priority = PriorityClient::new(
        cfg.priority_api_url.clone(),
        cfg.connect_timeout(),
        cfg.read_timeout_cap(),
    )?;
    let probe = reqwest::Client::builder()
        .connect_timeout(cfg.connect_timeout())
        .build()
        .context("build health probe client")?;

    let state = Arc::new(AppState {
        store: backends.store,
        state: backends.state,
        queue: backends.queue,
        services: Arc::new(cfg.service_catalog()),
        features: Arc::new(cfg.feature_catalog()),
        priority,
        probe,
        monitor_base: cfg.public_ws_url.clone(),
    });
    let app = api::router(state);

    let listener = tokio::net::TcpListener::bind(&cfg.api_bind)
        .await
        .with_context(|| format!("bind api to {}", cfg.api_bind))?;
    tracing::info!(
        event = "conveyor.api.started",
        bind = %cfg.api_bind,
        "api listening"
    );

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("api serve")?;
    Ok(())
}

async fn run_worker(cfg: &ServerConfig) -> anyhow::Result<()> {
    let backends = connect_backends(cfg).await?;
    let services = Arc::new(cfg.service_catalog());
    let features = Arc::new(cfg.feature_catalog());
    let events = EventPublisher::new(backends.state.clone());

    let orchestrator = Orchestrator::new(
        backends.store.clone(),
        Limiter::new(backends.state.clone()),
        StepClient::new(services.clone(), cfg.step_client_config())?,
        events.clone(),
        services,
        features.clone(),
    );
    let worker = Worker::new(
        orchestrator,
        backends.store,
        backends.queue,
        features,
        events,
        cfg.worker_config(),
    );

    worker.run(shutdown_signal()).await
}

async fn run_reconciler(cfg: &ServerConfig) -> anyhow::Result<()> {
    let backends = connect_backends(cfg).await?;
    let services = Arc::new(cfg.service_catalog());
    let events = EventPublisher::new(backends.state.clone());
    let rcfg = cfg.reconciler_config();
    let shutdown = shutdown_signal();

    tracing::info!(event = "conveyor.reconciler.started", "reconcilers running");

    let reaper = tokio::spawn(reconciler::reaper_loop(
        backends.state.clone(),
        services,
        rcfg.reap_interval,
        shutdown.clone(),
    ));
    let stuck = tokio::spawn(reconciler::stuck_job_loop(
        backends.store.clone(),
        events.clone(),
        rcfg.clone(),
        shutdown.clone(),
    ));
    let promoter = tokio::spawn(reconciler::promoter_loop(
        backends.store,
        backends.queue,
        events,
        rcfg,
        shutdown,
    ));

    for handle in [reaper, stuck, promoter] {
        handle.await.context("join reconciler task")??;
    }
    Ok(())
}
