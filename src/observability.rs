use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "lendlog_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "lendlog_query_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "lendlog_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "lendlog_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "lendlog_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "lendlog_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "lendlog_wal_flush_batch_size";

// ── Lease lifecycle ─────────────────────────────────────────────

/// Counter: activities appended to lease logs. Labels: kind.
pub const LEASE_TRANSITIONS_TOTAL: &str = "lendlog_lease_transitions_total";

/// Counter: overdue sweeps that ran to completion.
pub const SWEEP_RUNS_TOTAL: &str = "lendlog_sweep_runs_total";

/// Counter: leases resolved by the overdue sweep. Labels: outcome.
pub const SWEEP_RESOLVED_TOTAL: &str = "lendlog_sweep_resolved_total";

/// Counter: ratings recorded. Labels: role.
pub const RATINGS_TOTAL: &str = "lendlog_ratings_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertItem { .. } => "insert_item",
        Command::DeleteItem { .. } => "delete_item",
        Command::InsertUnavailability { .. } => "insert_unavailability",
        Command::DeleteUnavailability { .. } => "delete_unavailability",
        Command::InsertClaim { .. } => "insert_claim",
        Command::DeleteClaim { .. } => "delete_claim",
        Command::InsertActivity { .. } => "insert_activity",
        Command::InsertAlert { .. } => "insert_alert",
        Command::DeleteAlert { .. } => "delete_alert",
        Command::DeleteNotifications { .. } => "delete_notifications",
        Command::InsertRating { .. } => "insert_rating",
        Command::SelectItems => "select_items",
        Command::SelectClaims { .. } => "select_claims",
        Command::SelectActivity { .. } => "select_activity",
        Command::SelectAvailability { .. } => "select_availability",
        Command::SelectFreeSlots { .. } => "select_free_slots",
        Command::SelectUnavailability => "select_unavailability",
        Command::SelectNotifications => "select_notifications",
        Command::SelectRatings { .. } => "select_ratings",
        Command::SelectRatingSummary { .. } => "select_rating_summary",
        Command::SelectPendingRatings => "select_pending_ratings",
    }
}
