use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::engine::Engine;

/// Outcome of one pass over every active series.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub series_scanned: usize,
    pub occurrences_created: usize,
    pub conflicts: usize,
    pub failures: usize,
}

/// Keeps every approved recurring series materialized up to `now + horizon_days`.
pub struct HorizonSupervisor {
    engine: Arc<Engine>,
    clock: Arc<dyn Clock>,
    period: Duration,
}

impl HorizonSupervisor {
    pub fn new(engine: Arc<Engine>, clock: Arc<dyn Clock>, period: Duration) -> Self {
        Self {
            engine,
            clock,
            period,
        }
    }

    /// One sweep. A series that fails is logged and counted; the rest still run.
    pub async fn run_once(&self) -> SweepReport {
        let started = Instant::now();
        let mut report = SweepReport::default();
        let horizon = match self.engine.horizon_end(self.clock.now()) {
            Ok(horizon) => horizon,
            Err(e) => {
                report.failures += 1;
                error!("horizon sweep skipped: {e}");
                return report;
            }
        };

        for latest in self.engine.latest_per_series().await {
            report.series_scanned += 1;
            match self.engine.materialize_until(&latest, horizon, false).await {
                Ok(created) => {
                    report.occurrences_created += created;
                    if created > 0 {
                        debug!(series = latest.series_id, created, "topped up series");
                    }
                }
                Err(e) if e.is_conflict() => {
                    report.conflicts += 1;
                    metrics::counter!(crate::observability::SWEEP_SKIPPED_TOTAL, "reason" => "conflict")
                        .increment(1);
                    warn!(series = latest.series_id, "series can't be extended: {e}");
                }
                Err(e) => {
                    report.failures += 1;
                    metrics::counter!(crate::observability::SWEEP_SKIPPED_TOTAL, "reason" => "error")
                        .increment(1);
                    warn!(series = latest.series_id, "series materialization failed: {e}");
                }
            }
        }

        metrics::histogram!(crate::observability::SWEEP_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());
        info!(
            scanned = report.series_scanned,
            created = report.occurrences_created,
            conflicts = report.conflicts,
            failures = report.failures,
            "horizon sweep finished"
        );
        report
    }

    /// Sweep immediately, then once per period until `shutdown` fires. A sweep
    /// in progress when the token fires runs to completion.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        self.run_once().await;
                    }
                }
            }
            info!("horizon supervisor stopped");
        })
    }
}

/// Compact the WAL whenever it has grown past `threshold` appends.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(Duration::from_secs(30));
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }
        if engine.wal_appends_since_compact().await < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => {
                metrics::counter!(crate::observability::WAL_COMPACTIONS_TOTAL).increment(1);
            }
            Err(e) => warn!("WAL compaction failed: {e}"),
        }
    }
}
