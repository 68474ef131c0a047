use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use gate_worker::{FlowJobHandler, FlowWorker, JobHandler, WorkerConfig, FLOW_JOBS_STREAM, INVOCATION_JOBS_STREAM};
use nha_gateway::config::WorkerSettings;
use nha_gateway::invocations::InvocationJobHandler;
use nha_gateway::{router, AppState, GatewayConfig, Persistence, Stores};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry().with(filter)
                                  .with(tracing_subscriber::fmt::layer())
                                  .init();
}

fn worker_config(settings: &WorkerSettings, stream: &str) -> WorkerConfig {
    let mut cfg = WorkerConfig::new(stream, settings.group.clone(), settings.consumer.clone());
    cfg.batch = settings.batch;
    cfg.block = settings.block;
    cfg.max_deliveries = settings.max_deliveries;
    cfg
}

fn spawn_worker(state: &AppState,
                stream: &str,
                handler: Arc<dyn JobHandler>,
                shutdown: watch::Receiver<bool>)
                -> JoinHandle<()> {
    let worker = FlowWorker::new(worker_config(&state.config.worker, stream), state.stream.clone(), handler);
    tokio::spawn(async move {
        if let Err(e) = worker.run(shutdown).await {
            tracing::error!("worker stopped with error: {e}");
        }
    })
}

fn spawn_audit_pruner(state: Arc<AppState>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(3600));
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tick.tick() => {
                    let pruned = state.audit.prune_expired(state.config.audit_retention);
                    if pruned > 0 {
                        tracing::info!(pruned, "audit events pruned");
                    }
                }
            }
        }
    })
}

fn spawn_session_sweeper(state: Arc<AppState>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
    let period = (state.config.chat_session_ttl / 2).max(Duration::from_secs(1));
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tick.tick() => {
                    let evicted = state.chat.evict_idle();
                    if evicted > 0 {
                        tracing::debug!(evicted, "idle chat sessions evicted");
                    }
                }
            }
        }
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!("SIGTERM handler unavailable: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let config = GatewayConfig::from_env().context("invalid gateway configuration")?;
    let stores = match config.persistence {
        Persistence::Memory => Stores::in_memory(),
        Persistence::Postgres => {
            let pool = gate_persistence::build_pool_from_env().context("postgres pool")?;
            Stores::postgres(pool)
        }
    };
    let bind = config.bind;
    let state = Arc::new(AppState::new(config, stores));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut tasks = vec![spawn_audit_pruner(state.clone(), shutdown_rx.clone()),
                         spawn_session_sweeper(state.clone(), shutdown_rx.clone())];
    if state.config.inline_worker {
        let flows = Arc::new(FlowJobHandler::new(state.engine.clone()));
        let invocations = Arc::new(InvocationJobHandler::new(state.invocations.clone()));
        tasks.push(spawn_worker(&state, FLOW_JOBS_STREAM, flows, shutdown_rx.clone()));
        tasks.push(spawn_worker(&state, INVOCATION_JOBS_STREAM, invocations, shutdown_rx.clone()));
    }

    let listener = tokio::net::TcpListener::bind(bind).await
                                                      .with_context(|| format!("bind {bind}"))?;
    tracing::info!(%bind, persistence = ?state.config.persistence, "nha-gateway listening");
    axum::serve(listener, router(state.clone())).with_graceful_shutdown(shutdown_signal())
                                                .await
                                                .context("http server")?;

    let _ = shutdown_tx.send(true);
    for task in tasks {
        let _ = task.await;
    }
    tracing::info!("nha-gateway stopped");
    Ok(())
}
