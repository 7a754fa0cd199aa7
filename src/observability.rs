use std::net::SocketAddr;

use crate::engine::EngineError;

// ── RED metrics (operation-driven) ──────────────────────────────

/// Counter: engine operations. Labels: op, status.
pub const OPERATIONS_TOTAL: &str = "tandem_operations_total";

/// Histogram: slot search latency in seconds (fetch excluded).
pub const SLOT_SEARCH_DURATION_SECONDS: &str = "tandem_slot_search_duration_seconds";

/// Histogram: candidates returned per search.
pub const SLOT_SEARCH_RESULTS: &str = "tandem_slot_search_results";

/// Counter: calendar fetches that failed and were treated as free.
pub const CALENDAR_FETCH_FAILURES_TOTAL: &str = "tandem_calendar_fetch_failures_total";

// ── Coordination ────────────────────────────────────────────────

/// Gauge: live booking aggregates.
pub const BOOKINGS_ACTIVE: &str = "tandem_bookings_active";

/// Counter: notification obligations emitted. Labels: kind.
pub const NOTIFICATIONS_EMITTED_TOTAL: &str = "tandem_notifications_emitted_total";

/// Counter: delivery failures. Labels: kind.
pub const NOTIFICATION_FAILURES_TOTAL: &str = "tandem_notification_failures_total";

/// Counter: obligations the dispatcher fell behind on.
pub const NOTIFICATIONS_DROPPED_TOTAL: &str = "tandem_notifications_dropped_total";

/// Counter: deadline sweep outcomes. Labels: outcome (auto_selected, notified).
pub const DEADLINES_PROCESSED_TOTAL: &str = "tandem_deadlines_processed_total";

/// Counter: reminders sent.
pub const REMINDERS_SENT_TOTAL: &str = "tandem_reminders_sent_total";

/// Counter: reschedule terminal outcomes. Labels: outcome (confirmed, objections, auto_confirmed).
pub const RESCHEDULES_RESOLVED_TOTAL: &str = "tandem_reschedules_resolved_total";

/// Histogram: full sweep duration in seconds.
pub const SWEEP_DURATION_SECONDS: &str = "tandem_sweep_duration_seconds";

// ── WAL ─────────────────────────────────────────────────────────

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "tandem_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "tandem_wal_flush_batch_size";

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

/// Count one engine operation.
pub fn record_operation<T>(op: &'static str, result: &Result<T, EngineError>) {
    let status = match result {
        Ok(_) => "ok",
        Err(e) => error_label(e),
    };
    metrics::counter!(OPERATIONS_TOTAL, "op" => op, "status" => status).increment(1);
}

/// Map an error to a short label for metrics.
pub fn error_label(err: &EngineError) -> &'static str {
    match err {
        EngineError::BookingNotFound(_) => "booking_not_found",
        EngineError::RequestNotFound(_) => "request_not_found",
        EngineError::UnknownParticipant(_) => "unknown_participant",
        EngineError::NotOrganizer => "not_organizer",
        EngineError::InvalidInput(_) => "invalid_input",
        EngineError::LimitExceeded(_) => "limit_exceeded",
        EngineError::InvalidState(_) => "invalid_state",
        EngineError::AlreadyExists(_) => "already_exists",
        EngineError::NoAvailability => "no_availability",
        EngineError::Vote(_) => "vote_rejected",
        EngineError::WalError(_) => "wal_error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::VoteRejection;

    #[test]
    fn labels_are_stable() {
        assert_eq!(error_label(&EngineError::NotOrganizer), "not_organizer");
        assert_eq!(
            error_label(&EngineError::Vote(VoteRejection::AlreadyVoted)),
            "vote_rejected"
        );
        assert_eq!(init(None).ok(), Some(()));
    }
}
