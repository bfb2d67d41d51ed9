use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::Context;
use places_grid_collector::pacing::SleepPacer;
use places_grid_collector::{db, init_tracing, router, AppConfig, AppState};
use tokio::signal;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let config = AppConfig::from_env();
    let bind_addr = config.bind_addr.clone();

    let db = db::bootstrap(&config.database_path)
        .with_context(|| format!("opening database at {}", config.database_path))?
        .into_shared();
    let pacer = Arc::new(SleepPacer::new(config.pacing.clone()));
    let state = AppState::new(config, db, pacer)?;
    let cancel_flag = state.cancel_flag();

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding {bind_addr}"))?;
    info!(addr = %bind_addr, version = env!("CARGO_PKG_VERSION"), "grid collector listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            cancel_flag.store(true, Ordering::SeqCst);
        })
        .await?;

    info!("server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!(?err, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                error!(?err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C, draining"),
        _ = terminate => info!("received SIGTERM, draining"),
    }
}
