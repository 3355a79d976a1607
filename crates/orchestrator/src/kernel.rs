use crate::config::Config;
use crate::persistence::DbClient;
use crate::routes::build_router;
use crate::services::{pruner, ScheduleWorker};
use crate::state::AppState;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, instrument};

/// Composition root (§3 Ownership, §5 Cancellation): connects the
/// database, assembles `AppState` in dependency order, runs startup
/// reconciliation before the listener opens, spawns background daemons,
/// then serves HTTP/WS until a shutdown signal drains every component.
pub struct OrchestratorKernel {
    config: Arc<Config>,
    state: AppState,
    shutdown_tx: watch::Sender<bool>,
}

impl OrchestratorKernel {
    #[instrument(skip(config))]
    pub async fn ignite(config: Config) -> anyhow::Result<Self> {
        let db = DbClient::connect(&config.database_url, config.database_auth_token.clone()).await?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let state = AppState::new(config.clone(), db, shutdown_rx);

        info!("reconciling durable command log before accepting connections");
        pruner::reconcile_on_startup(&state).await;

        Ok(Self { config: Arc::new(config), state, shutdown_tx })
    }

    pub async fn serve(self) -> anyhow::Result<()> {
        pruner::spawn(self.state.clone());
        if self.config.schedule_worker_enabled {
            let worker = Arc::new(ScheduleWorker::new(self.state.schedules.clone(), self.state.router.clone(), self.config.schedule_batch_size));
            worker.spawn(self.config.schedule_poll_interval);
        }

        let router = build_router(self.state.clone());
        let address = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), self.config.port);
        let listener = tokio::net::TcpListener::bind(address).await?;
        info!(%address, "orchestrator listening");

        let shutdown_tx = self.shutdown_tx.clone();
        let inflight = self.state.inflight.clone();
        axum::serve(listener, router.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(shutdown_signal(shutdown_tx, inflight))
            .await?;
        Ok(())
    }
}

/// Waits for SIGINT/SIGTERM, then fails every inflight waiter and notifies
/// every live WebSocket handler to close with the shutdown codes (§5).
async fn shutdown_signal(shutdown_tx: watch::Sender<bool>, inflight: Arc<crate::state::InflightTable>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received, draining connections");
    inflight.fail_all();
    let _ = shutdown_tx.send(true);
}
