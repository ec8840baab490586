use std::sync::Arc;

use anyhow::anyhow;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod config;
mod inference;

use api::AppState;
use config::ServerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------
    // Environment / logging
    // -----------------------------
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cfg = ServerConfig::from_env()?;

    println!("🚀 Starting chat inference server...");

    // -----------------------------
    // Model: loaded before we accept traffic
    // -----------------------------
    let model_cfg = cfg.model.clone();
    let infer = tokio::task::spawn_blocking(move || inference::llama::load(&model_cfg))
        .await
        .map_err(|e| anyhow!("model loading task failed: {e}"))??;

    info!(
        model = infer.model_id(),
        max_new_tokens = infer.params().max_new_tokens,
        "model ready"
    );

    let state = AppState {
        infer: Arc::new(infer),
    };

    // -----------------------------
    // Router
    // -----------------------------
    let app = api::app(state, cfg.allowed_origin.clone());

    let listener = TcpListener::bind(&cfg.bind_addr).await?;
    let addr = listener.local_addr()?;

    println!("🌐 HTTP listening on http://{addr}");
    println!("💬 Chat at http://{addr}/chat");
    info!(origin = ?cfg.allowed_origin, "CORS origin");

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("received termination signal, shutting down");
}
