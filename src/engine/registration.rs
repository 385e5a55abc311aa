use std::collections::BTreeSet;

use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::notify::Notice;
use crate::observability::{REGISTRATIONS_TOTAL, WAITLIST_PROMOTIONS_TOTAL};
use crate::tenant::Ctx;

use super::equipment::AllocationReport;
use super::{Engine, EngineError, LockKind};

/// Capacity and waitlist state of one event, loaded at a point in time.
///
/// Every mutation goes through here so that, on commit, the event's
/// enrollment counter and the waitlist positions agree with the rows:
/// confirmed count equals `current_enrollment` (never above capacity) and
/// waitlist positions run 1..=n in registration order.
#[derive(Debug, Clone)]
pub struct Ledger {
    event: Event,
    registrations: Vec<EventRegistration>,
    changed: BTreeSet<Ulid>,
}

impl Ledger {
    pub fn new(event: Event, mut registrations: Vec<EventRegistration>) -> Self {
        registrations.sort_by_key(|r| (r.registered_at, r.id));
        Self {
            event,
            registrations,
            changed: BTreeSet::new(),
        }
    }

    pub fn event(&self) -> &Event {
        &self.event
    }

    pub fn registrations(&self) -> &[EventRegistration] {
        &self.registrations
    }

    pub fn get(&self, id: Ulid) -> Option<&EventRegistration> {
        self.registrations.iter().find(|r| r.id == id)
    }

    pub fn confirmed_count(&self) -> u32 {
        self.registrations
            .iter()
            .filter(|r| r.status == RegistrationStatus::Confirmed)
            .count() as u32
    }

    pub fn waitlist_len(&self) -> u32 {
        self.registrations.iter().filter(|r| r.is_waitlisted()).count() as u32
    }

    /// Add `member` to the event: confirmed while seats remain, waitlisted after.
    pub fn register(
        &mut self,
        id: Ulid,
        member: &Member,
        now: Timestamp,
    ) -> Result<&EventRegistration, EngineError> {
        let event_id = self.event.id;
        if self.event.is_recurring_master() {
            return Err(EngineError::validation(format!(
                "{event_id} is a series master; register on an occurrence"
            )));
        }
        if self
            .registrations
            .iter()
            .any(|r| r.member_id == member.id && r.status.is_active())
        {
            return Err(EngineError::AlreadyRegistered {
                event_id,
                member_id: member.id,
            });
        }
        if !self.event.status.accepts_registrations()
            || self.event.registration_deadline.is_some_and(|d| now > d)
        {
            return Err(EngineError::RegistrationClosed(event_id));
        }

        let (status, waitlist_position) = if self.event.current_enrollment < self.event.max_capacity {
            self.event.current_enrollment += 1;
            (RegistrationStatus::Confirmed, None)
        } else if self.event.allow_waitlist {
            (RegistrationStatus::Waitlisted, Some(self.waitlist_len() + 1))
        } else {
            return Err(EngineError::EventFull(event_id));
        };

        self.registrations.push(EventRegistration {
            id,
            event_id,
            member_id: member.id,
            member_name: member.name.clone(),
            status,
            waitlist_position,
            registered_at: now,
            checked_in_at: None,
            cancelled_at: None,
        });
        self.changed.insert(id);
        let idx = self.registrations.len() - 1;
        Ok(&self.registrations[idx])
    }

    /// Cancel a registration. A freed seat goes to the head of the waitlist.
    /// Returns the ids of promoted registrations.
    pub fn cancel(&mut self, registration_id: Ulid, now: Timestamp) -> Result<Vec<Ulid>, EngineError> {
        let idx = self
            .registrations
            .iter()
            .position(|r| r.id == registration_id)
            .ok_or(EngineError::NotFound(registration_id))?;
        let reg = &mut self.registrations[idx];
        if !reg.status.can_transition_to(RegistrationStatus::Cancelled) {
            return Err(EngineError::invalid_transition(
                registration_id,
                reg.status,
                RegistrationStatus::Cancelled,
            ));
        }
        let was = reg.status;
        reg.status = RegistrationStatus::Cancelled;
        reg.waitlist_position = None;
        reg.cancelled_at = Some(now);
        self.changed.insert(registration_id);

        let mut promoted = Vec::new();
        match was {
            RegistrationStatus::Confirmed => {
                self.event.current_enrollment = self.event.current_enrollment.saturating_sub(1);
                promoted = self.fill_from_waitlist();
                self.renumber_waitlist();
            }
            RegistrationStatus::Waitlisted => self.renumber_waitlist(),
            _ => {}
        }
        Ok(promoted)
    }

    /// Cancel every active registration, promotions included. Returns the
    /// rows that were cancelled.
    pub fn cancel_all(&mut self, now: Timestamp) -> Vec<EventRegistration> {
        let mut cancelled = Vec::new();
        while let Some(id) = self
            .registrations
            .iter()
            .find(|r| r.status.is_active())
            .map(|r| r.id)
        {
            if self.cancel(id, now).is_err() {
                break;
            }
            if let Some(r) = self.get(id) {
                cancelled.push(r.clone());
            }
        }
        cancelled
    }

    /// Change capacity, never below current enrollment. Seats that open up go
    /// to the head of the waitlist. Returns the ids of promoted registrations.
    pub fn set_capacity(&mut self, capacity: u32) -> Vec<Ulid> {
        self.event.max_capacity = capacity.max(self.event.current_enrollment);
        let promoted = self.fill_from_waitlist();
        self.renumber_waitlist();
        promoted
    }

    /// Promote from the head of the waitlist while seats are free.
    fn fill_from_waitlist(&mut self) -> Vec<Ulid> {
        let mut promoted = Vec::new();
        while self.event.current_enrollment < self.event.max_capacity {
            let Some(idx) = self
                .registrations
                .iter()
                .enumerate()
                .filter(|(_, r)| r.is_waitlisted())
                .min_by_key(|(_, r)| (r.waitlist_position, r.registered_at, r.id))
                .map(|(i, _)| i)
            else {
                break;
            };
            let reg = &mut self.registrations[idx];
            reg.status = RegistrationStatus::Confirmed;
            reg.waitlist_position = None;
            self.event.current_enrollment += 1;
            self.changed.insert(reg.id);
            promoted.push(reg.id);
        }
        promoted
    }

    fn renumber_waitlist(&mut self) {
        let mut waiting: Vec<usize> = (0..self.registrations.len())
            .filter(|&i| self.registrations[i].is_waitlisted())
            .collect();
        waiting.sort_by_key(|&i| {
            let r = &self.registrations[i];
            (r.waitlist_position, r.registered_at, r.id)
        });
        for (pos, i) in waiting.into_iter().enumerate() {
            let reg = &mut self.registrations[i];
            let want = Some(pos as u32 + 1);
            if reg.waitlist_position != want {
                reg.waitlist_position = want;
                self.changed.insert(reg.id);
            }
        }
    }

    /// Consistency of counters and positions. Used by tests and debug builds.
    pub fn check_invariants(&self) -> Result<(), String> {
        let confirmed = self.confirmed_count();
        if confirmed != self.event.current_enrollment {
            return Err(format!(
                "confirmed {confirmed} != enrollment {}",
                self.event.current_enrollment
            ));
        }
        if confirmed > self.event.max_capacity {
            return Err(format!("confirmed {confirmed} > capacity {}", self.event.max_capacity));
        }
        let mut waiting: Vec<&EventRegistration> =
            self.registrations.iter().filter(|r| r.is_waitlisted()).collect();
        waiting.sort_by_key(|r| r.waitlist_position);
        for (i, r) in waiting.iter().enumerate() {
            if r.waitlist_position != Some(i as u32 + 1) {
                return Err(format!("waitlist position gap at {}", i + 1));
            }
        }
        if waiting.windows(2).any(|w| w[0].registered_at > w[1].registered_at) {
            return Err("waitlist out of registration order".into());
        }
        if self
            .registrations
            .iter()
            .any(|r| !r.is_waitlisted() && r.waitlist_position.is_some())
        {
            return Err("position on a non-waitlisted registration".into());
        }
        Ok(())
    }

    /// The event (with its read version) and the rows that changed.
    pub fn into_commit(self) -> (Event, Vec<EventRegistration>) {
        let changed = self.changed;
        let rows = self
            .registrations
            .into_iter()
            .filter(|r| changed.contains(&r.id))
            .collect();
        (self.event, rows)
    }
}

#[derive(Debug, Clone)]
pub struct RegisterOutcome {
    pub registration: EventRegistration,
    /// Present when a confirmation triggered equipment auto-allocation.
    pub equipment: Option<AllocationReport>,
}

#[derive(Debug, Clone)]
pub struct CancelOutcome {
    pub cancelled: EventRegistration,
    pub promoted: Vec<EventRegistration>,
}

/// Per-member outcome of a bulk check-in. Never aborted by one bad member.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkCheckInResult {
    pub total: usize,
    /// Registration ids checked in by this call.
    pub succeeded: Vec<Ulid>,
    /// Member ids that were already checked in.
    pub already_checked_in: Vec<Ulid>,
    /// Member ids with no confirmed registration for the event.
    pub not_found: Vec<Ulid>,
    pub errors: Vec<String>,
}

impl BulkCheckInResult {
    pub fn failed(&self) -> usize {
        self.already_checked_in.len() + self.not_found.len()
    }

    /// `PartialFailure` when any member was not checked in.
    pub fn into_result(self) -> Result<Self, EngineError> {
        if self.failed() == 0 {
            return Ok(self);
        }
        Err(EngineError::PartialFailure {
            total: self.total,
            failed: self.failed(),
            errors: self.errors,
        })
    }
}

impl Engine {
    async fn load_ledger(&self, ctx: &Ctx, event_id: Ulid) -> Result<Ledger, EngineError> {
        let event = self.load_event(ctx, event_id).await?;
        let regs = self.load_registrations(ctx, event_id).await?;
        Ok(Ledger::new(event, regs))
    }

    pub(super) async fn commit_ledger(&self, ctx: &Ctx, ledger: Ledger) -> Result<Event, EngineError> {
        debug_assert!(ledger.check_invariants().is_ok());
        let (event, rows) = ledger.into_commit();
        ctx.commit(self.stores.registrations.commit_ledger(&ctx.tenant, event, rows))
            .await
    }

    pub(super) fn announce_promotions(&self, ctx: &Ctx, event_id: Ulid, promoted: &[EventRegistration]) {
        for p in promoted {
            info!(%event_id, registration = %p.id, "waitlist promotion");
            metrics::counter!(WAITLIST_PROMOTIONS_TOTAL).increment(1);
            self.notify.send(
                &ctx.tenant,
                Notice::WaitlistPromoted {
                    event_id,
                    registration_id: p.id,
                    member_id: p.member_id,
                },
            );
        }
    }

    pub async fn register(
        &self,
        ctx: &Ctx,
        event_id: Ulid,
        member_id: Ulid,
    ) -> Result<RegisterOutcome, EngineError> {
        let member = self.load_member(ctx, member_id).await?;
        if member.name.len() > MAX_MEMBER_NAME_LEN {
            return Err(EngineError::validation("member name too long"));
        }

        let guard = self.locks.lock(ctx, LockKind::Event, event_id).await?;
        let mut ledger = self.load_ledger(ctx, event_id).await?;
        let registration = match ledger.register(Ulid::new(), &member, self.now()) {
            Ok(r) => r.clone(),
            Err(e) => {
                metrics::counter!(REGISTRATIONS_TOTAL, "outcome" => "rejected").increment(1);
                return Err(e);
            }
        };
        self.commit_ledger(ctx, ledger).await?;
        drop(guard);

        let outcome = match registration.status {
            RegistrationStatus::Confirmed => "confirmed",
            _ => "waitlisted",
        };
        metrics::counter!(REGISTRATIONS_TOTAL, "outcome" => outcome).increment(1);
        debug!(%event_id, %member_id, outcome, "registered");

        let equipment = if registration.status == RegistrationStatus::Confirmed {
            // Soft dependency: allocation trouble never fails the registration.
            match self.auto_allocate(ctx, event_id).await {
                Ok(report) => Some(report),
                Err(e) => {
                    tracing::warn!(%event_id, "equipment auto-allocation failed: {e}");
                    None
                }
            }
        } else {
            None
        };

        Ok(RegisterOutcome {
            registration,
            equipment,
        })
    }

    pub async fn cancel_registration(
        &self,
        ctx: &Ctx,
        registration_id: Ulid,
    ) -> Result<CancelOutcome, EngineError> {
        let reg = ctx
            .read(
                self.config.store_timeout,
                self.stores.registrations.get_registration(&ctx.tenant, registration_id),
            )
            .await?
            .ok_or(EngineError::NotFound(registration_id))?;
        let event_id = reg.event_id;

        let _guard = self.locks.lock(ctx, LockKind::Event, event_id).await?;
        let mut ledger = self.load_ledger(ctx, event_id).await?;
        let promoted_ids = ledger.cancel(registration_id, self.now())?;
        let cancelled = ledger
            .get(registration_id)
            .cloned()
            .ok_or(EngineError::NotFound(registration_id))?;
        let promoted: Vec<EventRegistration> = promoted_ids
            .iter()
            .filter_map(|id| ledger.get(*id).cloned())
            .collect();
        self.commit_ledger(ctx, ledger).await?;

        self.notify.send(
            &ctx.tenant,
            Notice::RegistrationCancelled {
                event_id,
                registration_id,
                member_id: cancelled.member_id,
            },
        );
        self.announce_promotions(ctx, event_id, &promoted);
        Ok(CancelOutcome { cancelled, promoted })
    }

    /// Cancel every active registration on an event through the ledger.
    /// The caller holds the event lock.
    pub(super) async fn cancel_all_for_event(
        &self,
        ctx: &Ctx,
        event_id: Ulid,
    ) -> Result<Vec<EventRegistration>, EngineError> {
        let mut ledger = self.load_ledger(ctx, event_id).await?;
        let cancelled = ledger.cancel_all(self.now());
        if cancelled.is_empty() {
            return Ok(cancelled);
        }
        self.commit_ledger(ctx, ledger).await?;
        for r in &cancelled {
            self.notify.send(
                &ctx.tenant,
                Notice::RegistrationCancelled {
                    event_id,
                    registration_id: r.id,
                    member_id: r.member_id,
                },
            );
        }
        Ok(cancelled)
    }

    fn check_in_window(&self, event: &Event) -> TimeWindow {
        TimeWindow::new(
            event.window.start - self.config.check_in_opens_before,
            event.window.end + self.config.check_in_closes_after,
        )
    }

    pub async fn check_in(&self, ctx: &Ctx, registration_id: Ulid) -> Result<EventRegistration, EngineError> {
        let reg = ctx
            .read(
                self.config.store_timeout,
                self.stores.registrations.get_registration(&ctx.tenant, registration_id),
            )
            .await?
            .ok_or(EngineError::NotFound(registration_id))?;

        let _guard = self.locks.lock(ctx, LockKind::Event, reg.event_id).await?;
        let event = self.load_event(ctx, reg.event_id).await?;
        let mut reg = ctx
            .read(
                self.config.store_timeout,
                self.stores.registrations.get_registration(&ctx.tenant, registration_id),
            )
            .await?
            .ok_or(EngineError::NotFound(registration_id))?;

        if reg.checked_in_at.is_some() {
            return Err(EngineError::AlreadyCheckedIn(registration_id));
        }
        if reg.status != RegistrationStatus::Confirmed {
            return Err(EngineError::validation(format!(
                "only confirmed registrations can check in ({:?})",
                reg.status
            )));
        }
        let now = self.now();
        if !self.check_in_window(&event).contains_instant(now) {
            return Err(EngineError::CheckInClosed(event.id));
        }
        reg.checked_in_at = Some(now);
        ctx.commit(
            self.stores
                .registrations
                .update_registrations(&ctx.tenant, vec![reg.clone()]),
        )
        .await?;
        Ok(reg)
    }

    pub async fn bulk_check_in(
        &self,
        ctx: &Ctx,
        event_id: Ulid,
        member_ids: &[Ulid],
    ) -> Result<BulkCheckInResult, EngineError> {
        if member_ids.len() > MAX_BULK_CHECKIN {
            return Err(EngineError::validation(format!(
                "bulk check-in limited to {MAX_BULK_CHECKIN} members"
            )));
        }

        let _guard = self.locks.lock(ctx, LockKind::Event, event_id).await?;
        let event = self.load_event(ctx, event_id).await?;
        let now = self.now();
        if !self.check_in_window(&event).contains_instant(now) {
            return Err(EngineError::CheckInClosed(event_id));
        }
        let regs = self.load_registrations(ctx, event_id).await?;

        let mut result = BulkCheckInResult {
            total: member_ids.len(),
            ..Default::default()
        };
        let mut updates = Vec::new();
        let mut seen = BTreeSet::new();
        for &member_id in member_ids {
            if !seen.insert(member_id) {
                result.already_checked_in.push(member_id);
                result.errors.push(format!("member {member_id} listed twice"));
                continue;
            }
            let Some(reg) = regs
                .iter()
                .find(|r| r.member_id == member_id && r.status == RegistrationStatus::Confirmed)
            else {
                result.not_found.push(member_id);
                result
                    .errors
                    .push(format!("member {member_id} has no confirmed registration"));
                continue;
            };
            if reg.checked_in_at.is_some() {
                result.already_checked_in.push(member_id);
                result.errors.push(format!("member {member_id} already checked in"));
                continue;
            }
            let mut reg = reg.clone();
            reg.checked_in_at = Some(now);
            result.succeeded.push(reg.id);
            updates.push(reg);
        }

        if !updates.is_empty() {
            ctx.commit(self.stores.registrations.update_registrations(&ctx.tenant, updates))
                .await?;
        }
        info!(
            %event_id,
            succeeded = result.succeeded.len(),
            failed = result.failed(),
            "bulk check-in"
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use proptest::prelude::*;

    fn now() -> Timestamp {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    fn event(capacity: u32, waitlist: bool) -> Event {
        let start = now() + Duration::days(1);
        let mut draft = EventDraft::new("Clinic", TimeWindow::new(start, start + Duration::hours(1)), capacity);
        draft.allow_waitlist = waitlist;
        draft.materialize(Ulid::new(), draft.window, SeriesRole::Standalone)
    }

    fn member(name: &str) -> Member {
        Member {
            id: Ulid::new(),
            name: name.into(),
            tier_id: None,
        }
    }

    fn register(ledger: &mut Ledger, m: &Member, minute: i64) -> EventRegistration {
        ledger
            .register(Ulid::new(), m, now() + Duration::minutes(minute))
            .unwrap()
            .clone()
    }

    #[test]
    fn waitlist_promotion_scenario() {
        let mut ledger = Ledger::new(event(2, true), Vec::new());
        let ms: Vec<Member> = ["M1", "M2", "M3", "M4"].iter().map(|n| member(n)).collect();
        let regs: Vec<EventRegistration> =
            ms.iter().enumerate().map(|(i, m)| register(&mut ledger, m, i as i64)).collect();

        assert_eq!(regs[0].status, RegistrationStatus::Confirmed);
        assert_eq!(regs[1].status, RegistrationStatus::Confirmed);
        assert_eq!(regs[2].waitlist_position, Some(1));
        assert_eq!(regs[3].waitlist_position, Some(2));

        let promoted = ledger.cancel(regs[0].id, now() + Duration::minutes(10)).unwrap();
        assert_eq!(promoted, vec![regs[2].id]);
        assert_eq!(ledger.get(regs[0].id).unwrap().status, RegistrationStatus::Cancelled);
        assert_eq!(ledger.get(regs[1].id).unwrap().status, RegistrationStatus::Confirmed);
        assert_eq!(ledger.get(regs[2].id).unwrap().status, RegistrationStatus::Confirmed);
        assert_eq!(ledger.get(regs[3].id).unwrap().waitlist_position, Some(1));
        assert_eq!(ledger.event().current_enrollment, 2);
        ledger.check_invariants().unwrap();
    }

    #[test]
    fn duplicate_active_registration_rejected() {
        let mut ledger = Ledger::new(event(5, false), Vec::new());
        let m = member("Ana");
        register(&mut ledger, &m, 0);
        let err = ledger.register(Ulid::new(), &m, now()).unwrap_err();
        assert!(matches!(err, EngineError::AlreadyRegistered { .. }));
    }

    #[test]
    fn full_without_waitlist_rejected() {
        let mut ledger = Ledger::new(event(1, false), Vec::new());
        register(&mut ledger, &member("A"), 0);
        let err = ledger.register(Ulid::new(), &member("B"), now()).unwrap_err();
        assert!(matches!(err, EngineError::EventFull(_)));
    }

    #[test]
    fn deadline_and_status_close_registration() {
        let mut ev = event(5, false);
        ev.registration_deadline = Some(now() - Duration::minutes(1));
        let mut ledger = Ledger::new(ev, Vec::new());
        assert!(matches!(
            ledger.register(Ulid::new(), &member("A"), now()),
            Err(EngineError::RegistrationClosed(_))
        ));

        let mut ev = event(5, false);
        ev.status = EventStatus::Cancelled;
        let mut ledger = Ledger::new(ev, Vec::new());
        assert!(matches!(
            ledger.register(Ulid::new(), &member("A"), now()),
            Err(EngineError::RegistrationClosed(_))
        ));
    }

    #[test]
    fn cancelling_waitlisted_shifts_positions() {
        let mut ledger = Ledger::new(event(1, true), Vec::new());
        register(&mut ledger, &member("A"), 0);
        let w1 = register(&mut ledger, &member("B"), 1);
        let w2 = register(&mut ledger, &member("C"), 2);
        let w3 = register(&mut ledger, &member("D"), 3);
        let promoted = ledger.cancel(w1.id, now()).unwrap();
        assert!(promoted.is_empty());
        assert_eq!(ledger.get(w2.id).unwrap().waitlist_position, Some(1));
        assert_eq!(ledger.get(w3.id).unwrap().waitlist_position, Some(2));
        assert_eq!(ledger.get(w1.id).unwrap().waitlist_position, None);
        ledger.check_invariants().unwrap();
    }

    #[test]
    fn raising_capacity_promotes_in_waitlist_order() {
        let mut ledger = Ledger::new(event(1, true), Vec::new());
        register(&mut ledger, &member("A"), 0);
        let b = register(&mut ledger, &member("B"), 1);
        let c = register(&mut ledger, &member("C"), 2);
        let d = register(&mut ledger, &member("D"), 3);

        let promoted = ledger.set_capacity(3);
        assert_eq!(promoted, vec![b.id, c.id]);
        assert_eq!(ledger.event().current_enrollment, 3);
        assert_eq!(ledger.get(d.id).unwrap().waitlist_position, Some(1));
        ledger.check_invariants().unwrap();

        // Never below enrollment.
        assert!(ledger.set_capacity(1).is_empty());
        assert_eq!(ledger.event().max_capacity, 3);
        let late = register(&mut ledger, &member("E"), 4);
        assert_eq!(late.waitlist_position, Some(2));
        ledger.check_invariants().unwrap();
    }

    #[test]
    fn series_master_takes_no_registrations() {
        let ev = event(5, false);
        let master = EventDraft::new("Clinic", ev.window, 5).materialize(
            Ulid::new(),
            ev.window,
            SeriesRole::Master(SeriesState {
                pattern: RecurrencePattern::new(RecurrenceType::Daily, 1),
                last_generated_until: ev.window.end,
                status: RecurrenceStatus::Active,
            }),
        );
        let mut ledger = Ledger::new(master, Vec::new());
        assert!(matches!(
            ledger.register(Ulid::new(), &member("A"), now()),
            Err(EngineError::Validation(_))
        ));
        assert_eq!(ledger.event().current_enrollment, 0);
    }

    #[test]
    fn cancel_twice_is_invalid_transition() {
        let mut ledger = Ledger::new(event(2, false), Vec::new());
        let r = register(&mut ledger, &member("A"), 0);
        ledger.cancel(r.id, now()).unwrap();
        assert!(matches!(
            ledger.cancel(r.id, now()),
            Err(EngineError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn cancel_all_counts_promotions() {
        let mut ledger = Ledger::new(event(1, true), Vec::new());
        register(&mut ledger, &member("A"), 0);
        register(&mut ledger, &member("B"), 1);
        let cancelled = ledger.cancel_all(now());
        assert_eq!(cancelled.len(), 2);
        assert_eq!(ledger.event().current_enrollment, 0);
        assert_eq!(ledger.waitlist_len(), 0);
        ledger.check_invariants().unwrap();
    }

    #[test]
    fn into_commit_carries_only_changed_rows() {
        let mut ledger = Ledger::new(event(3, false), Vec::new());
        let a = register(&mut ledger, &member("A"), 0);
        let (ev, rows) = ledger.into_commit();
        let mut ledger = Ledger::new(ev, rows);
        register(&mut ledger, &member("B"), 1);
        let (_, rows) = ledger.into_commit();
        assert_eq!(rows.len(), 1);
        assert_ne!(rows[0].id, a.id);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Register,
        Cancel(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![Just(Op::Register), (0usize..32).prop_map(Op::Cancel)]
    }

    proptest! {
        #[test]
        fn invariants_hold_under_any_sequence(
            capacity in 1u32..5,
            waitlist in any::<bool>(),
            ops in proptest::collection::vec(op(), 1..40),
        ) {
            let mut ledger = Ledger::new(event(capacity, waitlist), Vec::new());
            for (i, op) in ops.into_iter().enumerate() {
                let at = now() + Duration::minutes(i as i64);
                match op {
                    Op::Register => {
                        let _ = ledger.register(Ulid::new(), &member("M"), at);
                    }
                    Op::Cancel(k) => {
                        let ids: Vec<Ulid> = ledger.registrations().iter().map(|r| r.id).collect();
                        if !ids.is_empty() {
                            let _ = ledger.cancel(ids[k % ids.len()], at);
                        }
                    }
                }
                prop_assert!(ledger.check_invariants().is_ok(), "{:?}", ledger.check_invariants());
            }
        }
    }
}
