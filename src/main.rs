use std::str::FromStr;
use std::sync::Arc;

use adpulse::ads::AdsClient;
use adpulse::config::AppConfig;
use adpulse::fx::FxProvider;
use adpulse::http::{SyncRouteState, sync_routes};
use adpulse::llm::create_provider;
use adpulse::store::{LibSqlBackend, MetricsStore};
use adpulse::sync::SyncEngine;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    let config = AppConfig::from_env().unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        std::process::exit(1);
    });

    let _log_guard = init_tracing(config.log_dir.as_deref());

    eprintln!("📈 AdPulse v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", config.db_path);
    eprintln!("   Sync API: http://0.0.0.0:{}/sync/run", config.http_port);
    eprintln!(
        "   Model: {}",
        config
            .model
            .as_ref()
            .map(|m| m.model.as_str())
            .unwrap_or("rule-based only")
    );
    eprintln!(
        "   Schedule: {}",
        config.sync_cron.as_deref().unwrap_or("on trigger only")
    );

    // ── Database ─────────────────────────────────────────────────────
    let db_path = std::path::Path::new(&config.db_path);
    let store: Arc<dyn MetricsStore> =
        Arc::new(LibSqlBackend::new_local(db_path).await.unwrap_or_else(|e| {
            eprintln!("Error: Failed to open database at {}: {}", config.db_path, e);
            std::process::exit(1);
        }));

    // ── Clients & engine ─────────────────────────────────────────────
    let ads = Arc::new(AdsClient::new(&config.ads)?);
    let fx = FxProvider::new(&config.fx)?;
    let provider = match &config.model {
        Some(model_config) => Some(create_provider(model_config)?),
        None => None,
    };
    let engine = Arc::new(SyncEngine::new(&config, store, ads, fx, provider));

    // ── Scheduler ────────────────────────────────────────────────────
    if let Some(expr) = &config.sync_cron {
        let schedule = cron::Schedule::from_str(expr)?;
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            loop {
                let Some(next) = schedule.upcoming(chrono::Utc).next() else {
                    tracing::warn!("cron schedule has no upcoming fire times, scheduler stopping");
                    break;
                };
                let wait = (next - chrono::Utc::now()).to_std().unwrap_or_default();
                tokio::time::sleep(wait).await;
                tracing::info!("scheduled batch sync firing");
                if let Err(e) = engine.run_batch().await {
                    tracing::error!(error = %e, "scheduled batch sync failed");
                }
            }
        });
    }

    // ── HTTP server ──────────────────────────────────────────────────
    let app = sync_routes(SyncRouteState {
        engine,
        sync_secret: config.sync_secret.clone(),
    });
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.http_port)).await?;
    tracing::info!(port = config.http_port, "sync trigger server started");
    axum::serve(listener, app).await?;

    Ok(())
}

/// Stderr logging by default; daily-rotated files when a log directory
/// is configured. The returned guard must outlive the runtime so the
/// non-blocking writer flushes on shutdown.
fn init_tracing(log_dir: Option<&str>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "adpulse.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .with_ansi(false)
                .with_writer(writer)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .init();
            None
        }
    }
}
