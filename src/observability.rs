use std::net::SocketAddr;

use tracing_subscriber::EnvFilter;

// ── Enrollment ──────────────────────────────────────────────────

/// Counter: registration attempts. Labels: outcome.
pub const REGISTRATIONS_TOTAL: &str = "clubhouse_registrations_total";

/// Counter: waitlisted registrations promoted to confirmed.
pub const WAITLIST_PROMOTIONS_TOTAL: &str = "clubhouse_waitlist_promotions_total";

// ── Facilities ──────────────────────────────────────────────────

/// Counter: facility booking attempts. Labels: outcome.
pub const BOOKINGS_TOTAL: &str = "clubhouse_bookings_total";

/// Counter: individual usage-policy violations reported.
pub const LIMIT_VIOLATIONS_TOTAL: &str = "clubhouse_limit_violations_total";

// ── Series & equipment ──────────────────────────────────────────

/// Counter: occurrences materialized by creation, extension or update.
pub const OCCURRENCES_GENERATED_TOTAL: &str = "clubhouse_occurrences_generated_total";

/// Counter: equipment assignments created. Labels: mode (auto, bulk).
pub const EQUIPMENT_ASSIGNMENTS_TOTAL: &str = "clubhouse_equipment_assignments_total";

/// Histogram: rolling-generation sweep duration in seconds.
pub const SWEEP_DURATION_SECONDS: &str = "clubhouse_sweep_duration_seconds";

/// Install the fmt subscriber (filtered by `RUST_LOG`) and, if a port is
/// given, the Prometheus exporter. Embedders call this once at startup.
pub fn init(metrics_port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
    let Some(port) = metrics_port else {
        return Ok(());
    };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}
