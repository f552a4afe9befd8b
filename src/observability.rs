use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "innkeep_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "innkeep_query_duration_seconds";

/// Counter: stay quotes computed. Labels: outcome (priced, unpriced).
pub const QUOTES_TOTAL: &str = "innkeep_quotes_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "innkeep_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "innkeep_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "innkeep_connections_rejected_total";

/// Gauge: number of loaded tenant engines.
pub const TENANTS_ACTIVE: &str = "innkeep_tenants_active";

/// Counter: holds released by the reaper after expiry.
pub const HOLDS_EXPIRED_TOTAL: &str = "innkeep_holds_expired_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "innkeep_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "innkeep_wal_flush_batch_size";

/// Install the Prometheus exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertRoomType { .. } => "insert_room_type",
        Command::DeleteRoomType { .. } => "delete_room_type",
        Command::InsertRatePlan { .. } => "insert_rate_plan",
        Command::DeleteRatePlan { .. } => "delete_rate_plan",
        Command::InsertHold { .. } => "insert_hold",
        Command::DeleteHold { .. } => "delete_hold",
        Command::InsertBooking { .. } => "insert_booking",
        Command::DeleteBooking { .. } => "delete_booking",
        Command::SelectRoomTypes => "select_room_types",
        Command::SelectRatePlans { .. } => "select_rate_plans",
        Command::SelectHolds { .. } => "select_holds",
        Command::SelectBookings { .. } => "select_bookings",
        Command::SelectNightlyRates { .. } => "select_nightly_rates",
        Command::SelectQuote { .. } => "select_quote",
        Command::SelectAvailability { .. } => "select_availability",
    }
}
