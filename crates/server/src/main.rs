use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_bunyan_formatter::{BunyanFormattingLayer, JsonStorageLayer};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use tally_ocr::{OcrBackend, PipelineConfig, PipelineContext};
use tally_server::{router, AppState};

const DEFAULT_BIND: &str = "0.0.0.0:8080";
const SWEEP_INTERVAL: Duration = Duration::from_secs(6 * 60 * 60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(JsonStorageLayer)
        .with(BunyanFormattingLayer::new("tally-server".into(), std::io::stdout))
        .init();

    let config_path = std::env::var_os("TALLY_CONFIG").map(PathBuf::from);
    let config =
        PipelineConfig::load(config_path.as_deref()).context("loading pipeline configuration")?;
    let worker = config.worker.as_ref().map(|w| w.program.display().to_string());
    info!(
        cache_dir = %config.cache_dir.display(),
        worker = worker.as_deref().unwrap_or("none"),
        "Configuration loaded"
    );

    let backend = backend(&config);
    let ctx = PipelineContext::new(config, backend).context("building pipeline")?;
    let state = AppState::new(ctx);
    spawn_cache_sweeper(state.clone());

    let bind = std::env::var("TALLY_BIND").unwrap_or_else(|_| DEFAULT_BIND.to_string());
    let listener = TcpListener::bind(&bind).await.with_context(|| format!("binding {bind}"))?;
    info!(addr = %bind, "Listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving HTTP")?;
    info!("Server shut down");
    Ok(())
}

#[cfg(feature = "tesseract")]
fn backend(config: &PipelineConfig) -> Arc<dyn OcrBackend> {
    Arc::new(tally_ocr::recognizer::tesseract_backend::TesseractRecognizer::new(
        std::env::var("TESSDATA_PREFIX").ok(),
        config.language.clone(),
    ))
}

#[cfg(not(feature = "tesseract"))]
fn backend(_config: &PipelineConfig) -> Arc<dyn OcrBackend> {
    warn!("Built without the tesseract feature; only the isolated worker can recognize text");
    Arc::new(tally_ocr::UnavailableRecognizer)
}

/// Periodically drop cache entries past the retention window.
fn spawn_cache_sweeper(state: AppState) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            ticker.tick().await;
            let ctx = state.pipeline.context();
            match ctx.cache.sweep(ctx.config.cache_retention()).await {
                Ok(removed) => info!(removed, "Scheduled cache sweep finished"),
                Err(e) => warn!("Scheduled cache sweep failed: {e}"),
            }
        }
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {e}");
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
    info!("Shutdown signal received");
}
