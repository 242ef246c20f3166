use std::net::SocketAddr;

// ── Booking flow ────────────────────────────────────────────────

/// Counter: bookings created through `create_booking`. Labels: kind.
pub const BOOKINGS_CREATED_TOTAL: &str = "roombook_bookings_created_total";

/// Counter: writes refused because an approved booking held the slot.
pub const BOOKING_CONFLICTS_TOTAL: &str = "roombook_booking_conflicts_total";

/// Counter: occurrences inserted by series materialization.
pub const OCCURRENCES_MATERIALIZED_TOTAL: &str = "roombook_occurrences_materialized_total";

// ── Horizon sweep ───────────────────────────────────────────────

/// Histogram: wall time of one sweep over every active series, in seconds.
pub const SWEEP_DURATION_SECONDS: &str = "roombook_sweep_duration_seconds";

/// Counter: series skipped by a sweep. Labels: reason (conflict, error).
pub const SWEEP_SKIPPED_TOTAL: &str = "roombook_sweep_skipped_total";

// ── Storage ─────────────────────────────────────────────────────

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "roombook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (transactions per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "roombook_wal_flush_batch_size";

/// Counter: completed WAL compactions.
pub const WAL_COMPACTIONS_TOTAL: &str = "roombook_wal_compactions_total";

/// Install the Prometheus exporter on `port`. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}
