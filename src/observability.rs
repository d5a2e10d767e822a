use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: queries executed over the wire. Labels: command, status.
pub const QUERIES_TOTAL: &str = "weekdesk_queries_total";

/// Counter: toggles. Labels: outcome (booked, unbooked, conflict, invalid_slot, store_unavailable).
pub const TOGGLES_TOTAL: &str = "weekdesk_toggles_total";

/// Histogram: toggle latency in seconds, store round trip included.
pub const TOGGLE_DURATION_SECONDS: &str = "weekdesk_toggle_duration_seconds";

/// Counter: weekly resets. Labels: status (ok, failed, skipped).
pub const RESETS_TOTAL: &str = "weekdesk_resets_total";

/// Counter: display-name lookups. Labels: result (hit, miss, error).
pub const NAME_LOOKUPS_TOTAL: &str = "weekdesk_name_lookups_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: slots currently held.
pub const OCCUPIED_SLOTS: &str = "weekdesk_occupied_slots";

/// Gauge: current week epoch.
pub const WEEK_EPOCH: &str = "weekdesk_week_epoch";

/// Gauge: active wire connections.
pub const CONNECTIONS_ACTIVE: &str = "weekdesk_connections_active";

/// Counter: connections accepted.
pub const CONNECTIONS_TOTAL: &str = "weekdesk_connections_total";

/// Counter: connections rejected due to the connection limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "weekdesk_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "weekdesk_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "weekdesk_wal_flush_batch_size";

/// Install the Prometheus exporter on `port`. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Short label for a wire command.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::SelectWeek => "select_week",
        Command::SelectBookings { .. } => "select_bookings",
        Command::Toggle { .. } => "toggle",
        Command::ResetWeek => "reset_week",
        Command::Listen { .. } => "listen",
        Command::Unlisten { .. } => "unlisten",
    }
}
