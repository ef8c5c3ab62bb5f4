//! Builds every component and runs the scan loop until cancellation.
use crate::config::ConfigWatcher;
use crate::log_sink::UiLog;
use crate::pacs::PacsClient;
use crate::scanner::{ScanContext, scan_loop};
use crate::uploader::UploadOrchestrator;
use camino::Utf8PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Configuration file location, overridable for side-by-side installs.
const CONFIG_ENV: &str = "DENTSYNC_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "dentsync.toml";

/// Run the service with configuration from `DENTSYNC_CONFIG` (or
/// `dentsync.toml` next to the working directory). Ctrl-C cancels.
pub async fn run_service_from_env() -> anyhow::Result<()> {
    let config_path = std::env::var(CONFIG_ENV)
        .map(Utf8PathBuf::from)
        .unwrap_or_else(|_| Utf8PathBuf::from(DEFAULT_CONFIG_PATH));
    let config = ConfigWatcher::open(&config_path)?;

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown requested");
            signal_cancel.cancel();
        }
    });

    run_service(config, cancel).await
}

/// Wire the UI log sink, the PACS client and the upload orchestrator
/// together, then drive scans until the token is cancelled.
pub async fn run_service(
    config: Arc<ConfigWatcher>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let settings = config.get();
    tracing::info!(
        root = settings.root_path.as_str(),
        staging = settings.staging_path.as_str(),
        "starting"
    );

    let ui = UiLog::spawn(Arc::clone(&config));
    let pacs = Arc::new(PacsClient::new(Arc::clone(&config), ui.clone())?);
    let uploader = Arc::new(UploadOrchestrator::new(
        Arc::clone(&pacs),
        ui.clone(),
        cancel.clone(),
    ));

    let ctx = ScanContext {
        config,
        ui,
        pacs,
        uploader,
    };
    scan_loop(ctx, cancel).await;
    Ok(())
}
