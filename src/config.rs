use std::time::Duration;

use crate::limits::MAX_CONFIG_SPAN_DAYS;

/// Tunables for the engine. Read from `CLUBHOUSE_*` environment variables;
/// anything missing or unparsable falls back to the default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// How far past "now" rolling generation materializes occurrences.
    pub generation_lookahead: chrono::Duration,
    /// Step used by next-available-slot search.
    pub slot_increment: chrono::Duration,
    pub slot_search_horizon: chrono::Duration,
    /// Check-in opens this long before an event starts...
    pub check_in_opens_before: chrono::Duration,
    /// ...and closes this long after it ends.
    pub check_in_closes_after: chrono::Duration,
    /// Upper bound on any single store read.
    pub store_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            generation_lookahead: chrono::Duration::days(90),
            slot_increment: chrono::Duration::minutes(15),
            slot_search_horizon: chrono::Duration::days(30),
            check_in_opens_before: chrono::Duration::minutes(60),
            check_in_closes_after: chrono::Duration::minutes(30),
            store_timeout: Duration::from_millis(5000),
        }
    }
}

fn env_num(key: &str) -> Option<i64> {
    std::env::var(key).ok().and_then(|s| s.parse().ok()).filter(|n| *n > 0)
}

/// A positive span from `key`, built with `unit`. Out-of-range values fall back
/// like unparsable ones do.
fn env_span(key: &str, unit: fn(i64) -> Option<chrono::Duration>) -> Option<chrono::Duration> {
    env_num(key)
        .and_then(unit)
        .filter(|span| *span <= chrono::Duration::days(MAX_CONFIG_SPAN_DAYS))
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            generation_lookahead: env_span("CLUBHOUSE_GENERATION_LOOKAHEAD_DAYS", chrono::Duration::try_days)
                .unwrap_or(d.generation_lookahead),
            slot_increment: env_span("CLUBHOUSE_SLOT_INCREMENT_MINUTES", chrono::Duration::try_minutes)
                .unwrap_or(d.slot_increment),
            slot_search_horizon: env_span("CLUBHOUSE_SLOT_SEARCH_HORIZON_DAYS", chrono::Duration::try_days)
                .unwrap_or(d.slot_search_horizon),
            check_in_opens_before: env_span("CLUBHOUSE_CHECKIN_OPENS_MINUTES", chrono::Duration::try_minutes)
                .unwrap_or(d.check_in_opens_before),
            check_in_closes_after: env_span("CLUBHOUSE_CHECKIN_CLOSES_MINUTES", chrono::Duration::try_minutes)
                .unwrap_or(d.check_in_closes_after),
            store_timeout: env_num("CLUBHOUSE_STORE_TIMEOUT_MS")
                .map(|ms| Duration::from_millis(ms as u64))
                .unwrap_or(d.store_timeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_env_falls_back_to_defaults() {
        // Only this test touches these keys.
        unsafe {
            std::env::set_var("CLUBHOUSE_SLOT_INCREMENT_MINUTES", "not-a-number");
            std::env::set_var("CLUBHOUSE_SLOT_SEARCH_HORIZON_DAYS", "7");
            std::env::set_var("CLUBHOUSE_GENERATION_LOOKAHEAD_DAYS", "99999999999999");
            std::env::set_var("CLUBHOUSE_CHECKIN_OPENS_MINUTES", "9223372036854775807");
        }
        let cfg = EngineConfig::from_env();
        assert_eq!(cfg.slot_increment, chrono::Duration::minutes(15));
        assert_eq!(cfg.slot_search_horizon, chrono::Duration::days(7));
        assert_eq!(cfg.generation_lookahead, chrono::Duration::days(90));
        assert_eq!(cfg.check_in_opens_before, chrono::Duration::minutes(60));
    }
}
