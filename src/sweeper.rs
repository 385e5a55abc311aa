use std::time::Instant;

use tracing::info;

use crate::engine::{Engine, EngineError, ExtendOutcome};
use crate::observability::SWEEP_DURATION_SECONDS;
use crate::tenant::Ctx;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub masters: usize,
    pub extended: usize,
    pub created: usize,
    /// Up to date, inactive, or already being extended.
    pub skipped: usize,
    pub failed: usize,
}

/// One rolling-generation pass over a tenant's active series. Meant to be
/// fired by an external scheduler; safe to fire redundantly.
pub async fn sweep(engine: &Engine, ctx: &Ctx) -> Result<SweepReport, EngineError> {
    let started = Instant::now();
    let masters = engine.active_masters(ctx).await?;
    let mut report = SweepReport {
        masters: masters.len(),
        ..Default::default()
    };
    let now = engine.now();
    for master_id in masters {
        ctx.check()?;
        match engine.extend_generation(ctx, master_id, now).await {
            Ok(ExtendOutcome::Extended { created, .. }) => {
                report.extended += 1;
                report.created += created;
            }
            Ok(_) => report.skipped += 1,
            Err(e) => {
                // Deleted or changed underneath us; the next pass retries.
                tracing::debug!("sweep skip {master_id}: {e}");
                report.failed += 1;
            }
        }
    }
    let pruned = engine.prune_locks();
    metrics::histogram!(SWEEP_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
    info!(
        tenant = %ctx.tenant,
        extended = report.extended,
        created = report.created,
        pruned,
        "sweep finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::{Duration, TimeZone, Utc};

    use crate::config::EngineConfig;
    use crate::engine::FixedClock;
    use crate::model::*;
    use crate::notify::NotifyHub;
    use crate::store::{MemoryStore, Stores};
    use crate::tenant::TenantId;

    #[tokio::test]
    async fn sweep_extends_active_series_once() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap();
        let clock = Arc::new(FixedClock::new(start - Duration::days(1)));
        let engine = Engine::new(
            Stores::in_memory(Arc::new(MemoryStore::new())),
            EngineConfig::default(),
            Arc::new(NotifyHub::new()),
        )
        .with_clock(clock.clone());
        let ctx = Ctx::new(TenantId::parse("club").unwrap());

        let draft = EventDraft::new("Swim", TimeWindow::new(start, start + Duration::hours(1)), 10);
        let series = engine
            .create_series(
                &ctx,
                draft,
                RecurrencePattern::new(RecurrenceType::Daily, 1),
                TimeWindow::new(start, start + Duration::days(7)),
            )
            .await
            .unwrap();
        assert_eq!(series.occurrences.len(), 7);

        let first = sweep(&engine, &ctx).await.unwrap();
        assert_eq!(first.masters, 1);
        assert_eq!(first.extended, 1);
        assert!(first.created > 0);

        let second = sweep(&engine, &ctx).await.unwrap();
        assert_eq!(second.created, 0);
        assert_eq!(second.skipped, 1);
    }
}
