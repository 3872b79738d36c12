//! Server entry point

use tokio::net::TcpListener;

use crate::config::BootConfig;
use crate::error::{Error, Result};
use crate::state::AppState;

/// Boot every subsystem and serve until SIGINT/SIGTERM.
pub async fn serve(config: BootConfig) -> Result<()> {
    let state = AppState::boot(config).await?;
    let router = crate::http::build(state.clone());

    let listener = TcpListener::bind(&state.config.listen)
        .await
        .map_err(|e| Error::Internal(format!("bind {} failed: {e}", state.config.listen)))?;
    tracing::info!(listen = %state.config.listen, root = %state.config.root_domain, "serving");

    let shutdown_state = state.clone();
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown_signal().await;
        shutdown_state.stop().await;
    })
    .await
    .map_err(|e| Error::Internal(format!("server error: {e}")))?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
    tracing::info!("shutdown signal received");
}
