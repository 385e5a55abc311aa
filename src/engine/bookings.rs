use std::collections::{HashMap, HashSet};

use chrono::Duration;
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::{BOOKINGS_TOTAL, LIMIT_VIOLATIONS_TOTAL};
use crate::tenant::Ctx;

use super::conflict::{self, BookingConflict};
use super::policy::{self, LimitCheck, UsageCounts};
use super::{Engine, EngineError, LockKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BookingRequest {
    pub member_id: Ulid,
    pub facility_id: Ulid,
    pub window: TimeWindow,
}

fn validate_window(window: &TimeWindow) -> Result<(), EngineError> {
    if window.start >= window.end {
        return Err(EngineError::validation("booking must end after it starts"));
    }
    if window.duration() > Duration::days(MAX_BOOKING_SPAN_DAYS) {
        return Err(EngineError::validation(format!(
            "booking longer than {MAX_BOOKING_SPAN_DAYS} days"
        )));
    }
    Ok(())
}

impl Engine {
    /// True iff no confirmed or checked-in booking overlaps `window`.
    pub async fn is_available(
        &self,
        ctx: &Ctx,
        facility_id: Ulid,
        window: TimeWindow,
        exclude: Option<Ulid>,
    ) -> Result<bool, EngineError> {
        validate_window(&window)?;
        self.load_facility(ctx, facility_id).await?;
        let existing = self.facility_bookings(ctx, facility_id, window).await?;
        Ok(conflict::is_available(&existing, &window, exclude))
    }

    /// Every reason `window` cannot be booked on the facility. Empty means bookable.
    pub async fn check_facility_window(
        &self,
        ctx: &Ctx,
        facility_id: Ulid,
        window: TimeWindow,
        exclude: Option<Ulid>,
    ) -> Result<Vec<BookingConflict>, EngineError> {
        validate_window(&window)?;
        let facility = self.load_facility(ctx, facility_id).await?;
        let existing = self.facility_bookings(ctx, facility_id, window).await?;
        Ok(conflict::evaluate(&facility, &existing, &window, exclude, self.now()))
    }

    pub async fn find_next_available_slot(
        &self,
        ctx: &Ctx,
        facility_id: Ulid,
        duration: Duration,
        after: Timestamp,
    ) -> Result<Option<TimeWindow>, EngineError> {
        if duration <= Duration::zero() {
            return Err(EngineError::validation("duration must be positive"));
        }
        let facility = self.load_facility(ctx, facility_id).await?;
        let horizon = self.config.slot_search_horizon;
        let range = TimeWindow::new(after, after + horizon + duration);
        let existing = self.facility_bookings(ctx, facility_id, range).await?;
        Ok(conflict::next_available_slot(
            &facility,
            &existing,
            duration,
            after,
            self.config.slot_increment,
            horizon,
        ))
    }

    /// Facility types of the facilities a member has booked, for type-scoped policies.
    async fn facility_types(
        &self,
        ctx: &Ctx,
        bookings: &[FacilityBooking],
    ) -> Result<HashMap<Ulid, Ulid>, EngineError> {
        let ids: HashSet<Ulid> = bookings.iter().map(|b| b.facility_id).collect();
        let mut out = HashMap::with_capacity(ids.len());
        for id in ids {
            if let Some(f) = ctx
                .read(self.config.store_timeout, self.stores.bookings.get_facility(&ctx.tenant, id))
                .await?
            {
                out.insert(id, f.facility_type_id);
            }
        }
        Ok(out)
    }

    /// Live usage of a member, narrowed to the bookings `scope` governs.
    async fn live_usage(
        &self,
        ctx: &Ctx,
        member_id: Ulid,
        scope: Option<LimitScope>,
        reference: Timestamp,
        exclude: Option<Ulid>,
    ) -> Result<UsageCounts, EngineError> {
        let now = self.now();
        let windows = policy::usage_windows(reference);
        let range = TimeWindow::new(
            windows.month.start.min(now),
            windows.day.end.max(now) + Duration::days(USAGE_LOOKAHEAD_DAYS),
        );
        let bookings = ctx
            .read(
                self.config.store_timeout,
                self.stores.bookings.bookings_for_member(&ctx.tenant, member_id, range),
            )
            .await?;
        let counts = match scope {
            Some(LimitScope::MemberFacility { facility_id, .. }) => {
                policy::count_usage(&bookings, &windows, now, exclude, |b| b.facility_id == facility_id)
            }
            Some(LimitScope::MemberFacilityType { facility_type_id, .. }) => {
                let types = self.facility_types(ctx, &bookings).await?;
                policy::count_usage(&bookings, &windows, now, exclude, |b| {
                    types.get(&b.facility_id) == Some(&facility_type_id)
                })
            }
            _ => policy::count_usage(&bookings, &windows, now, exclude, |_| true),
        };
        Ok(counts)
    }

    /// Check a proposed booking against the member's most specific policy,
    /// recomputed from live bookings. All violations are reported.
    pub async fn validate_booking_limits(
        &self,
        ctx: &Ctx,
        member_id: Ulid,
        facility_id: Ulid,
        window: TimeWindow,
        exclude: Option<Ulid>,
    ) -> Result<LimitCheck, EngineError> {
        validate_window(&window)?;
        let member = self.load_member(ctx, member_id).await?;
        let facility = self.load_facility(ctx, facility_id).await?;
        let candidates = ctx
            .read(
                self.config.store_timeout,
                self.stores.limits.policies_for(&ctx.tenant, &member),
            )
            .await?;
        let resolved = policy::resolve_policy(&candidates, &member, &facility);
        let usage = self
            .live_usage(ctx, member_id, resolved.map(|p| p.scope), window.start, exclude)
            .await?;
        Ok(policy::check(resolved, usage, &window, self.now()))
    }

    async fn save_usage_snapshot(&self, ctx: &Ctx, member_id: Ulid) {
        let now = self.now();
        let snapshot = match self.live_usage(ctx, member_id, None, now, None).await {
            Ok(c) => MemberBookingUsage {
                member_id,
                computed_at: now,
                concurrent: c.concurrent,
                today: c.today,
                this_week: c.this_week,
                this_month: c.this_month,
            },
            Err(e) => {
                debug!(%member_id, "usage snapshot skipped: {e}");
                return;
            }
        };
        if let Err(e) = self.stores.limits.save_usage(&ctx.tenant, snapshot).await {
            debug!(%member_id, "usage snapshot not saved: {e}");
        }
    }

    /// Limits, then facility constraints, then commit. Pending when the
    /// facility requires approval.
    pub async fn book_facility(&self, ctx: &Ctx, req: BookingRequest) -> Result<FacilityBooking, EngineError> {
        validate_window(&req.window)?;

        let _member = self.locks.lock(ctx, LockKind::Member, req.member_id).await?;
        let _facility = self.locks.lock(ctx, LockKind::Facility, req.facility_id).await?;

        let limits = self
            .validate_booking_limits(ctx, req.member_id, req.facility_id, req.window, None)
            .await?;
        if !limits.is_valid {
            metrics::counter!(BOOKINGS_TOTAL, "outcome" => "limit_exceeded").increment(1);
            metrics::counter!(LIMIT_VIOLATIONS_TOTAL).increment(limits.violations.len() as u64);
            debug!(member = %req.member_id, violations = limits.violations.len(), "booking over limits");
            return Err(EngineError::LimitExceeded(limits.violations));
        }

        let facility = self.load_facility(ctx, req.facility_id).await?;
        let existing = self.facility_bookings(ctx, req.facility_id, req.window).await?;
        let conflicts = conflict::evaluate(&facility, &existing, &req.window, None, self.now());
        if let Some(BookingConflict::Overlap { booking_id, window }) = conflicts
            .iter()
            .find(|c| matches!(c, BookingConflict::Overlap { .. }))
        {
            metrics::counter!(BOOKINGS_TOTAL, "outcome" => "overlap").increment(1);
            return Err(EngineError::Overlap {
                existing: *booking_id,
                window: *window,
            });
        }
        if !conflicts.is_empty() {
            metrics::counter!(BOOKINGS_TOTAL, "outcome" => "rejected").increment(1);
            return Err(EngineError::BookingRejected(
                conflicts.iter().map(|c| c.to_string()).collect(),
            ));
        }

        let booking = FacilityBooking {
            id: Ulid::new(),
            facility_id: req.facility_id,
            member_id: req.member_id,
            window: req.window,
            status: if facility.requires_approval {
                BookingStatus::Pending
            } else {
                BookingStatus::Confirmed
            },
            created_at: self.now(),
        };
        ctx.commit(self.stores.bookings.create_booking(&ctx.tenant, booking.clone()))
            .await?;
        metrics::counter!(BOOKINGS_TOTAL, "outcome" => "committed").increment(1);
        info!(booking = %booking.id, facility = %booking.facility_id, status = ?booking.status, "booking committed");

        self.save_usage_snapshot(ctx, req.member_id).await;
        Ok(booking)
    }

    /// Move a booking along its lifecycle. Entering a blocking status
    /// re-checks overlap against the facility's other bookings.
    pub async fn transition_booking(
        &self,
        ctx: &Ctx,
        booking_id: Ulid,
        next: BookingStatus,
    ) -> Result<FacilityBooking, EngineError> {
        let booking = ctx
            .read(
                self.config.store_timeout,
                self.stores.bookings.get_booking(&ctx.tenant, booking_id),
            )
            .await?
            .ok_or(EngineError::NotFound(booking_id))?;

        let _facility = self
            .locks
            .lock(ctx, LockKind::Facility, booking.facility_id)
            .await;
        let mut booking = ctx
            .read(
                self.config.store_timeout,
                self.stores.bookings.get_booking(&ctx.tenant, booking_id),
            )
            .await?
            .ok_or(EngineError::NotFound(booking_id))?;

        if !booking.status.can_transition_to(next) {
            return Err(EngineError::invalid_transition(booking_id, booking.status, next));
        }
        if next.blocks_facility() && !booking.status.blocks_facility() {
            let existing = self
                .facility_bookings(ctx, booking.facility_id, booking.window)
                .await?;
            if let Some(other) = conflict::find_overlap(&existing, &booking.window, Some(booking_id)) {
                return Err(EngineError::Overlap {
                    existing: other.id,
                    window: other.window,
                });
            }
        }
        booking.status = next;
        ctx.commit(self.stores.bookings.update_booking(&ctx.tenant, booking.clone()))
            .await?;
        debug!(%booking_id, status = ?next, "booking transitioned");
        Ok(booking)
    }

    pub async fn cancel_booking(&self, ctx: &Ctx, booking_id: Ulid) -> Result<FacilityBooking, EngineError> {
        let booking = self
            .transition_booking(ctx, booking_id, BookingStatus::Cancelled)
            .await?;
        self.save_usage_snapshot(ctx, booking.member_id).await;
        Ok(booking)
    }
}
