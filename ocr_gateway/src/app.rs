use crate::config::Config;
use crate::detector::{Detector, StaticDetector};
use crate::server::{HttpServer, SharedState};

use std::sync::Arc;
use tokio::{signal, sync::broadcast};

pub async fn start_app(config: Config) -> anyhow::Result<()> {
    let detector: Arc<dyn Detector> = Arc::new(StaticDetector::new(&config.detector));

    let state = match SharedState::new(&config, detector) {
        Ok(state) => state,
        Err(e) => {
            tracing::error!("Failed to initialize gateway state: {:?}", e);
            return Err(e);
        }
    };
    let sessions = state.sessions.clone();

    let server = HttpServer::new(state, &config).await?;

    let (shutdown_tx, _) = broadcast::channel(1);
    let server_shutdown_rx = shutdown_tx.subscribe();

    let server_handle = server.run(server_shutdown_rx).await?;

    shutdown_signal().await;
    tracing::info!("Shutdown signal received, starting graceful shutdown.");

    sessions.shutdown();
    let _ = shutdown_tx.send(());

    match server_handle.await {
        Ok(result) => result?,
        Err(e) => tracing::error!("server task failed: {}", e),
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
