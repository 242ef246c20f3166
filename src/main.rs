use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use roombook::audit::TracingAuditSink;
use roombook::catalog::StaticCatalog;
use roombook::clock::{Clock, SystemClock};
use roombook::config::Config;
use roombook::engine::{Engine, Services};
use roombook::horizon::{HorizonSupervisor, run_compactor};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env();
    roombook::observability::init(config.metrics_port)?;

    std::fs::create_dir_all(&config.data_dir)?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    // Rooms and resources come from the surrounding service; the daemon
    // starts with an empty catalog and only keeps existing series topped up.
    let services = Services {
        clock: clock.clone(),
        catalog: Arc::new(StaticCatalog::new()),
        audit: Arc::new(TracingAuditSink),
        rules: config.rules,
    };
    let engine = Arc::new(Engine::new(config.wal_path(), services)?);

    info!("roombook started");
    info!("  data_dir: {}", config.data_dir.display());
    info!(
        "  booking window: {}..={} days, horizon {} days",
        config.rules.min_lead_days, config.rules.max_lead_days, config.rules.horizon_days
    );
    info!("  materialize every {:?}", config.materialize_interval);
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    let shutdown_token = CancellationToken::new();
    let supervisor = HorizonSupervisor::new(engine.clone(), clock, config.materialize_interval)
        .spawn(shutdown_token.clone());
    let compactor = tokio::spawn(run_compactor(
        engine.clone(),
        config.compact_threshold,
        shutdown_token.clone(),
    ));

    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = ctrl_c => {}
                        _ = sigterm.recv() => {}
                    }
                }
                Err(e) => {
                    tracing::warn!("SIGTERM handler unavailable: {e}");
                    ctrl_c.await.ok();
                }
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
        }
    };
    shutdown.await;

    info!("shutdown signal received, waiting for in-flight sweep");
    shutdown_token.cancel();
    if let Err(e) = supervisor.await {
        tracing::error!("horizon supervisor panicked: {e}");
    }
    if let Err(e) = compactor.await {
        tracing::error!("compactor panicked: {e}");
    }

    info!("roombook stopped");
    Ok(())
}
