use std::collections::HashSet;

use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::notify::{ConflictingEvent, Notice};
use crate::observability::OCCURRENCES_GENERATED_TOTAL;
use crate::tenant::Ctx;

use super::conflict;
use super::recurrence::{self, Horizon, Slot, Stop};
use super::{Engine, EngineError, Ledger, LockKind};

/// How a recurrence update treats occurrences that already exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateStrategy {
    /// Keep occurrences that have registrations; replace the rest.
    PreserveRegistrations,
    /// Replace every future occurrence, cancelling its registrations.
    ForceUpdate,
    /// Move occurrences to their new slots; cancel those whose new slot
    /// the facility cannot take.
    CancelConflicts,
}

#[derive(Debug, Clone)]
pub struct SeriesOutcome {
    pub master: Event,
    pub occurrences: Vec<Event>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtendOutcome {
    Extended {
        created: usize,
        until: Timestamp,
        /// The pattern ran out; the series is now Completed.
        completed: bool,
    },
    /// Already generated past the lookahead target.
    UpToDate,
    /// Another extension of this master is running.
    InFlight,
    /// Paused, completed or cancelled series do not generate.
    Inactive(RecurrenceStatus),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateOutcome {
    pub deleted: usize,
    pub created: usize,
    pub preserved: usize,
    /// Moved in place to their new slot.
    pub moved: usize,
    pub cancelled: usize,
    pub registrations_affected: usize,
    pub conflicts: Vec<ConflictingEvent>,
    pub warnings: Vec<String>,
    /// The caller cancelled part way; the counts above were applied.
    pub interrupted: bool,
}

fn validate_draft(draft: &EventDraft) -> Result<(), EngineError> {
    if draft.title.trim().is_empty() {
        return Err(EngineError::validation("title is required"));
    }
    if draft.title.len() > MAX_TITLE_LEN {
        return Err(EngineError::validation("title too long"));
    }
    if draft.max_capacity == 0 || draft.max_capacity > MAX_EVENT_CAPACITY {
        return Err(EngineError::validation(format!(
            "capacity must be between 1 and {MAX_EVENT_CAPACITY}"
        )));
    }
    if draft.window.start >= draft.window.end {
        return Err(EngineError::validation("event must end after it starts"));
    }
    if let Some(deadline) = draft.registration_deadline
        && deadline > draft.window.end
    {
        return Err(EngineError::validation("registration deadline after event end"));
    }
    Ok(())
}

fn occurrence_from(draft: &EventDraft, master_id: Ulid, slot: &Slot) -> Event {
    draft.materialize(
        Ulid::new(),
        slot.window,
        SeriesRole::Occurrence(OccurrenceLink {
            master_id,
            number: slot.number,
            detached: false,
            diverged: false,
        }),
    )
}

/// Drop slots that are already materialized. An occurrence still following
/// the pattern claims its number; any occurrence claims its start time.
fn unmaterialized(slots: Vec<Slot>, existing: &[Event]) -> Vec<Slot> {
    let starts: HashSet<Timestamp> = existing.iter().map(|e| e.window.start).collect();
    let numbers: HashSet<u32> = existing
        .iter()
        .filter_map(|e| e.link())
        .filter(|l| !l.diverged)
        .map(|l| l.number)
        .collect();
    slots
        .into_iter()
        .filter(|s| !starts.contains(&s.window.start) && !numbers.contains(&s.number))
        .collect()
}

fn member_names(regs: &[EventRegistration]) -> Vec<String> {
    regs.iter().map(|r| r.member_name.clone()).collect()
}

impl Engine {
    pub async fn occurrences_of(
        &self,
        ctx: &Ctx,
        master_id: Ulid,
        range: Option<TimeWindow>,
    ) -> Result<Vec<Event>, EngineError> {
        ctx.read(
            self.config.store_timeout,
            self.stores.events.occurrences(&ctx.tenant, master_id, range),
        )
        .await
    }

    /// Masters whose series is still generating.
    pub async fn active_masters(&self, ctx: &Ctx) -> Result<Vec<Ulid>, EngineError> {
        ctx.read(self.config.store_timeout, self.stores.events.active_masters(&ctx.tenant))
            .await
    }

    async fn validate_custom_fields(&self, ctx: &Ctx, draft: &EventDraft) -> Result<(), EngineError> {
        let schema = ctx
            .read(self.config.store_timeout, self.stores.events.field_schema(&ctx.tenant))
            .await?;
        draft
            .custom_fields
            .validate(&schema)
            .map_err(|errs| EngineError::validation(errs.join("; ")))
    }

    fn announce_generated(&self, ctx: &Ctx, master_id: Ulid, count: usize) {
        if count == 0 {
            return;
        }
        metrics::counter!(OCCURRENCES_GENERATED_TOTAL).increment(count as u64);
        self.notify
            .send(&ctx.tenant, Notice::OccurrencesGenerated { master_id, count });
    }

    /// Create a one-off event outside any series.
    pub async fn create_event(&self, ctx: &Ctx, draft: EventDraft) -> Result<Event, EngineError> {
        validate_draft(&draft)?;
        self.validate_custom_fields(ctx, &draft).await?;
        let event = draft.materialize(Ulid::new(), draft.window, SeriesRole::Standalone);
        ctx.commit(self.stores.events.create_events(&ctx.tenant, vec![event.clone()]))
            .await?;
        debug!(event_id = %event.id, "event created");
        Ok(event)
    }

    /// Create a master and materialize its occurrences within `window`.
    pub async fn create_series(
        &self,
        ctx: &Ctx,
        draft: EventDraft,
        pattern: RecurrencePattern,
        window: TimeWindow,
    ) -> Result<SeriesOutcome, EngineError> {
        self.create_series_with_id(ctx, Ulid::new(), draft, pattern, window)
            .await
    }

    /// `create_series` with a caller-chosen master id, safe to retry. If the
    /// master already exists with the same shape, only slots not yet
    /// materialized are created; `occurrences` holds what this call created.
    pub async fn create_series_with_id(
        &self,
        ctx: &Ctx,
        master_id: Ulid,
        draft: EventDraft,
        pattern: RecurrencePattern,
        window: TimeWindow,
    ) -> Result<SeriesOutcome, EngineError> {
        validate_draft(&draft)?;
        if window.start >= window.end {
            return Err(EngineError::validation("generation window is empty"));
        }
        self.validate_custom_fields(ctx, &draft).await?;
        let expansion = recurrence::expand(
            &pattern,
            &draft.window,
            Horizon::between(window.start, window.end),
        )?;

        let _gen = self.locks.lock(ctx, LockKind::Generation, master_id).await?;
        let stored = ctx
            .read(
                self.config.store_timeout,
                self.stores.events.get_event(&ctx.tenant, master_id),
            )
            .await?;

        let Some(mut master) = stored else {
            let master = draft.materialize(
                master_id,
                draft.window,
                SeriesRole::Master(SeriesState {
                    pattern,
                    last_generated_until: window.end,
                    status: RecurrenceStatus::Active,
                }),
            );
            let occurrences: Vec<Event> = expansion
                .slots
                .iter()
                .map(|s| occurrence_from(&draft, master_id, s))
                .collect();
            let mut batch = Vec::with_capacity(occurrences.len() + 1);
            batch.push(master.clone());
            batch.extend(occurrences.iter().cloned());
            ctx.commit(self.stores.events.create_events(&ctx.tenant, batch))
                .await?;

            info!(%master_id, occurrences = occurrences.len(), "series created");
            self.announce_generated(ctx, master_id, occurrences.len());
            return Ok(SeriesOutcome { master, occurrences });
        };

        let Some(state) = master.series_state() else {
            return Err(EngineError::validation(format!(
                "{master_id} already exists and is not a recurring master"
            )));
        };
        if state.pattern != pattern || master.window != draft.window {
            return Err(EngineError::validation(format!(
                "series {master_id} exists with a different shape; update it instead"
            )));
        }
        if state.status != RecurrenceStatus::Active {
            return Ok(SeriesOutcome {
                master,
                occurrences: Vec::new(),
            });
        }
        let advance = window.end > state.last_generated_until;

        let existing = self.occurrences_of(ctx, master_id, None).await?;
        let master_draft = draft_of(&master);
        let occurrences: Vec<Event> = unmaterialized(expansion.slots, &existing)
            .iter()
            .map(|s| occurrence_from(&master_draft, master_id, s))
            .collect();
        if !occurrences.is_empty() {
            ctx.commit(
                self.stores
                    .events
                    .create_events(&ctx.tenant, occurrences.clone()),
            )
            .await?;
        }
        if advance {
            if let Some(state) = master.series_state_mut() {
                state.last_generated_until = window.end;
            }
            master = ctx
                .commit(self.stores.events.update_event(&ctx.tenant, master))
                .await?;
        }

        debug!(%master_id, created = occurrences.len(), "series creation resumed");
        self.announce_generated(ctx, master_id, occurrences.len());
        Ok(SeriesOutcome { master, occurrences })
    }

    /// Rolling generation: materialize slots up to `now + lookahead`.
    /// A concurrent call for the same master returns `InFlight`.
    pub async fn extend_generation(
        &self,
        ctx: &Ctx,
        master_id: Ulid,
        now: Timestamp,
    ) -> Result<ExtendOutcome, EngineError> {
        let Some(_gen) = self.locks.try_lock(&ctx.tenant, LockKind::Generation, master_id) else {
            debug!(%master_id, "extension already in flight");
            return Ok(ExtendOutcome::InFlight);
        };
        let mut master = self.load_master(ctx, master_id).await?;
        let Some(state) = master.series_state() else {
            return Err(EngineError::validation(format!("{master_id} is not a recurring master")));
        };
        if state.status != RecurrenceStatus::Active {
            return Ok(ExtendOutcome::Inactive(state.status));
        }
        let target = now + self.config.generation_lookahead;
        if target <= state.last_generated_until {
            return Ok(ExtendOutcome::UpToDate);
        }

        let from = state.last_generated_until.max(now);
        let expansion = recurrence::expand(&state.pattern, &master.window, Horizon::between(from, target))?;
        let completed = expansion.stop == Stop::PatternExhausted;
        let existing = self.occurrences_of(ctx, master_id, None).await?;
        let draft = draft_of(&master);
        let new: Vec<Event> = unmaterialized(expansion.slots, &existing)
            .iter()
            .map(|s| occurrence_from(&draft, master_id, s))
            .collect();
        let created = new.len();
        if !new.is_empty() {
            ctx.commit(self.stores.events.create_events(&ctx.tenant, new))
                .await?;
        }

        if let Some(state) = master.series_state_mut() {
            state.last_generated_until = target;
            if completed {
                state.status = RecurrenceStatus::Completed;
            }
        }
        ctx.commit(self.stores.events.update_event(&ctx.tenant, master))
            .await?;

        info!(%master_id, created, completed, "series extended");
        self.announce_generated(ctx, master_id, created);
        Ok(ExtendOutcome::Extended {
            created,
            until: target,
            completed,
        })
    }

    /// Apply a new shape and pattern to a series. Past occurrences are never
    /// touched; future ones are handled per `strategy`, one at a time.
    pub async fn update_recurrence(
        &self,
        ctx: &Ctx,
        master_id: Ulid,
        draft: EventDraft,
        pattern: RecurrencePattern,
        strategy: UpdateStrategy,
    ) -> Result<UpdateOutcome, EngineError> {
        validate_draft(&draft)?;
        recurrence::validate_pattern(&pattern, &draft.window)?;
        self.validate_custom_fields(ctx, &draft).await?;

        let _gen = self.locks.lock(ctx, LockKind::Generation, master_id).await?;
        let master = self.load_master(ctx, master_id).await?;
        let Some(state) = master.series_state() else {
            return Err(EngineError::validation(format!("{master_id} is not a recurring master")));
        };
        if state.status == RecurrenceStatus::Cancelled {
            return Err(EngineError::invalid_transition(
                master_id,
                state.status,
                RecurrenceStatus::Active,
            ));
        }

        let now = self.now();
        let until = if state.last_generated_until > now {
            state.last_generated_until
        } else {
            now + self.config.generation_lookahead
        };
        let slots: Vec<Slot> = recurrence::expand(&pattern, &draft.window, Horizon::between(now, until))?
            .slots
            .into_iter()
            .filter(|s| s.window.start > now)
            .collect();

        let all = self.occurrences_of(ctx, master_id, None).await?;
        let (future, past): (Vec<Event>, Vec<Event>) = all
            .into_iter()
            .filter(|e| !e.is_detached())
            .partition(|e| e.window.start > now);

        let mut out = UpdateOutcome::default();
        // Old-pattern occurrences stop claiming their numbers.
        for ev in past {
            if let Err(e) = self.mark_diverged(ctx, ev).await {
                out.warnings.push(e.to_string());
            }
        }

        let consumed = match strategy {
            UpdateStrategy::PreserveRegistrations => {
                self.preserve_registrations(ctx, future, &mut out).await;
                HashSet::new()
            }
            UpdateStrategy::ForceUpdate => {
                self.force_update(ctx, future, &mut out).await;
                HashSet::new()
            }
            UpdateStrategy::CancelConflicts => {
                self.cancel_conflicts(ctx, master_id, &draft, future, &slots, &mut out)
                    .await
            }
        };
        if out.interrupted {
            warn!(%master_id, "recurrence update interrupted");
            return Ok(out);
        }

        // Slots already served by a moved or cancelled occurrence.
        let remaining: Vec<Slot> = slots
            .into_iter()
            .filter(|s| !consumed.contains(&s.number))
            .collect();
        let existing = self.occurrences_of(ctx, master_id, None).await?;
        let new: Vec<Event> = unmaterialized(remaining, &existing)
            .iter()
            .map(|s| occurrence_from(&draft, master_id, s))
            .collect();
        out.created = new.len();
        if !new.is_empty() {
            ctx.commit(self.stores.events.create_events(&ctx.tenant, new))
                .await?;
        }

        let mut updated = draft.materialize(
            master_id,
            draft.window,
            SeriesRole::Master(SeriesState {
                pattern,
                last_generated_until: until,
                // A completed series may have room again; a paused one stays paused.
                status: match state.status {
                    RecurrenceStatus::Paused => RecurrenceStatus::Paused,
                    _ => RecurrenceStatus::Active,
                },
            }),
        );
        updated.current_enrollment = master.current_enrollment;
        updated.status = master.status;
        updated.version = master.version;
        ctx.commit(self.stores.events.update_event(&ctx.tenant, updated))
            .await?;

        info!(
            %master_id,
            ?strategy,
            deleted = out.deleted,
            created = out.created,
            preserved = out.preserved,
            cancelled = out.cancelled,
            "recurrence updated"
        );
        self.announce_generated(ctx, master_id, out.created);
        if !out.conflicts.is_empty() {
            self.notify.send(
                &ctx.tenant,
                Notice::RecurrenceConflicts {
                    master_id,
                    conflicts: out.conflicts.clone(),
                },
            );
        }
        Ok(out)
    }

    async fn mark_diverged(&self, ctx: &Ctx, mut ev: Event) -> Result<(), EngineError> {
        if ev.link().is_some_and(|l| l.diverged) {
            return Ok(());
        }
        let _guard = self.locks.lock(ctx, LockKind::Event, ev.id).await?;
        if let Some(link) = ev.link_mut() {
            link.diverged = true;
        }
        ctx.commit(self.stores.events.update_event(&ctx.tenant, ev))
            .await?;
        Ok(())
    }

    async fn delete_occurrence(&self, ctx: &Ctx, id: Ulid) -> Result<(), EngineError> {
        ctx.commit(self.stores.events.delete_events(&ctx.tenant, &[id]))
            .await
    }

    async fn preserve_registrations(&self, ctx: &Ctx, future: Vec<Event>, out: &mut UpdateOutcome) {
        for ev in future {
            if ctx.check().is_err() {
                out.interrupted = true;
                break;
            }
            match self.preserve_one(ctx, ev.id).await {
                Ok(true) => out.preserved += 1,
                Ok(false) => out.deleted += 1,
                Err(EngineError::Cancelled | EngineError::Timeout) => {
                    out.interrupted = true;
                    break;
                }
                Err(e) => out.warnings.push(format!("occurrence {}: {e}", ev.id)),
            }
        }
    }

    /// Keep (and mark diverged) if anyone is still registered, else delete.
    /// Returns whether it was kept.
    async fn preserve_one(&self, ctx: &Ctx, id: Ulid) -> Result<bool, EngineError> {
        let _guard = self.locks.lock(ctx, LockKind::Event, id).await?;
        let regs = self.load_registrations(ctx, id).await?;
        if !regs.iter().any(|r| r.status != RegistrationStatus::Cancelled) {
            self.delete_occurrence(ctx, id).await?;
            return Ok(false);
        }
        let mut current = self.load_event(ctx, id).await?;
        if let Some(link) = current.link_mut() {
            link.diverged = true;
        }
        ctx.commit(self.stores.events.update_event(&ctx.tenant, current))
            .await?;
        Ok(true)
    }

    async fn force_update(&self, ctx: &Ctx, future: Vec<Event>, out: &mut UpdateOutcome) {
        for ev in future {
            if ctx.check().is_err() {
                out.interrupted = true;
                break;
            }
            match self.force_one(ctx, ev.id).await {
                Ok(cancelled) => {
                    out.deleted += 1;
                    out.registrations_affected += cancelled.len();
                    if !cancelled.is_empty() {
                        out.conflicts.push(ConflictingEvent {
                            event_id: ev.id,
                            reason: "occurrence replaced by series update".into(),
                            member_names: member_names(&cancelled),
                        });
                    }
                }
                Err(EngineError::Cancelled | EngineError::Timeout) => {
                    out.interrupted = true;
                    break;
                }
                Err(e) => out.warnings.push(format!("occurrence {}: {e}", ev.id)),
            }
        }
    }

    /// Cancel every registration through the ledger, then delete.
    async fn force_one(&self, ctx: &Ctx, id: Ulid) -> Result<Vec<EventRegistration>, EngineError> {
        let _guard = self.locks.lock(ctx, LockKind::Event, id).await?;
        let cancelled = self.cancel_all_for_event(ctx, id).await?;
        self.delete_occurrence(ctx, id).await?;
        Ok(cancelled)
    }

    /// Why the facility cannot host `window`, or `None` if it can.
    async fn facility_conflict(
        &self,
        ctx: &Ctx,
        facility_id: Option<Ulid>,
        window: TimeWindow,
    ) -> Result<Option<String>, EngineError> {
        let Some(facility_id) = facility_id else {
            return Ok(None);
        };
        let facility = self.load_facility(ctx, facility_id).await?;
        let existing = self.facility_bookings(ctx, facility_id, window).await?;
        let mut reasons: Vec<String> = conflict::find_overlap(&existing, &window, None)
            .map(|b| format!("facility booked by {} at that time", b.id))
            .into_iter()
            .collect();
        reasons.extend(
            conflict::check_operating_hours(&facility, &window)
                .iter()
                .map(|c| c.to_string()),
        );
        Ok((!reasons.is_empty()).then(|| reasons.join("; ")))
    }

    /// Pair future occurrences with new slots in start order. Each is moved
    /// to its slot, or cancelled in place if the facility cannot take the
    /// slot. Unpaired leftovers are deleted when empty, cancelled otherwise.
    /// Returns the numbers of the slots that were served.
    async fn cancel_conflicts(
        &self,
        ctx: &Ctx,
        master_id: Ulid,
        draft: &EventDraft,
        future: Vec<Event>,
        slots: &[Slot],
        out: &mut UpdateOutcome,
    ) -> HashSet<u32> {
        let mut consumed = HashSet::new();
        for (i, ev) in future.into_iter().enumerate() {
            if ctx.check().is_err() {
                out.interrupted = true;
                break;
            }
            let slot = slots.get(i).copied();
            match self.reconcile_one(ctx, master_id, draft, ev.id, slot).await {
                Ok(Step::Deleted) => out.deleted += 1,
                Ok(Step::Moved { capacity_kept }) => {
                    out.moved += 1;
                    if capacity_kept {
                        out.warnings.push(format!(
                            "occurrence {}: capacity kept at current enrollment",
                            ev.id
                        ));
                    }
                }
                Ok(Step::Cancelled(c)) => {
                    out.cancelled += 1;
                    out.registrations_affected += c.member_names.len();
                    out.conflicts.push(c);
                }
                Err(EngineError::Cancelled | EngineError::Timeout) => {
                    out.interrupted = true;
                    break;
                }
                Err(e) => {
                    out.warnings.push(format!("occurrence {}: {e}", ev.id));
                    continue;
                }
            }
            if let Some(s) = slot {
                consumed.insert(s.number);
            }
        }
        consumed
    }

    async fn reconcile_one(
        &self,
        ctx: &Ctx,
        master_id: Ulid,
        draft: &EventDraft,
        id: Ulid,
        slot: Option<Slot>,
    ) -> Result<Step, EngineError> {
        let _guard = self.locks.lock(ctx, LockKind::Event, id).await?;
        let mut current = self.load_event(ctx, id).await?;
        let regs = self.load_registrations(ctx, id).await?;
        let active: Vec<EventRegistration> = regs
            .iter()
            .filter(|r| r.status.is_active())
            .cloned()
            .collect();

        let reason = match slot {
            Some(s) => match self.facility_conflict(ctx, draft.facility_id, s.window).await? {
                None => {
                    let mut moved = draft.materialize(
                        id,
                        s.window,
                        SeriesRole::Occurrence(OccurrenceLink {
                            master_id,
                            number: s.number,
                            detached: false,
                            diverged: false,
                        }),
                    );
                    moved.current_enrollment = current.current_enrollment;
                    moved.version = current.version;
                    let capacity_kept = current.current_enrollment > draft.max_capacity;
                    // Capacity goes through the ledger so a raise fills from the waitlist.
                    let mut ledger = Ledger::new(moved, regs);
                    let promoted: Vec<EventRegistration> = ledger
                        .set_capacity(draft.max_capacity)
                        .into_iter()
                        .filter_map(|r| ledger.get(r).cloned())
                        .collect();
                    self.commit_ledger(ctx, ledger).await?;
                    self.announce_promotions(ctx, id, &promoted);
                    return Ok(Step::Moved { capacity_kept });
                }
                Some(reason) => reason,
            },
            None if active.is_empty() => {
                self.delete_occurrence(ctx, id).await?;
                return Ok(Step::Deleted);
            }
            None => "no longer part of the series".to_string(),
        };

        if !current.status.can_transition_to(EventStatus::Cancelled) {
            return Err(EngineError::invalid_transition(id, current.status, EventStatus::Cancelled));
        }
        current.status = EventStatus::Cancelled;
        if let Some(link) = current.link_mut() {
            link.detached = true;
            link.diverged = true;
        }
        ctx.commit(self.stores.events.update_event(&ctx.tenant, current))
            .await?;
        Ok(Step::Cancelled(ConflictingEvent {
            event_id: id,
            reason,
            member_names: member_names(&active),
        }))
    }

    /// Cancel one occurrence and detach it from regeneration.
    pub async fn cancel_occurrence(&self, ctx: &Ctx, event_id: Ulid) -> Result<Event, EngineError> {
        let _guard = self.locks.lock(ctx, LockKind::Event, event_id).await?;
        let mut ev = self.load_event(ctx, event_id).await?;
        if ev.link().is_none() {
            return Err(EngineError::validation(format!("{event_id} is not an occurrence")));
        }
        if !ev.status.can_transition_to(EventStatus::Cancelled) {
            return Err(EngineError::invalid_transition(event_id, ev.status, EventStatus::Cancelled));
        }
        ev.status = EventStatus::Cancelled;
        if let Some(link) = ev.link_mut() {
            link.detached = true;
        }
        let ev = ctx
            .commit(self.stores.events.update_event(&ctx.tenant, ev))
            .await?;
        debug!(%event_id, "occurrence cancelled");
        Ok(ev)
    }

    /// Move one occurrence to `window` and detach it from regeneration.
    pub async fn reschedule_occurrence(
        &self,
        ctx: &Ctx,
        event_id: Ulid,
        window: TimeWindow,
    ) -> Result<Event, EngineError> {
        if window.start >= window.end {
            return Err(EngineError::validation("event must end after it starts"));
        }
        let _guard = self.locks.lock(ctx, LockKind::Event, event_id).await?;
        let mut ev = self.load_event(ctx, event_id).await?;
        if ev.link().is_none() {
            return Err(EngineError::validation(format!("{event_id} is not an occurrence")));
        }
        if !ev.status.can_transition_to(EventStatus::Rescheduled) {
            return Err(EngineError::invalid_transition(event_id, ev.status, EventStatus::Rescheduled));
        }
        if let Some(reason) = self.facility_conflict(ctx, ev.facility_id, window).await? {
            return Err(EngineError::BookingRejected(vec![reason]));
        }
        let shift = window.start - ev.window.start;
        ev.registration_deadline = ev.registration_deadline.map(|d| d + shift);
        ev.window = window;
        ev.status = EventStatus::Rescheduled;
        if let Some(link) = ev.link_mut() {
            link.detached = true;
        }
        ctx.commit(self.stores.events.update_event(&ctx.tenant, ev))
            .await
    }

    async fn set_series_status(
        &self,
        ctx: &Ctx,
        master_id: Ulid,
        next: RecurrenceStatus,
    ) -> Result<Event, EngineError> {
        let _gen = self.locks.lock(ctx, LockKind::Generation, master_id).await?;
        let mut master = self.load_master(ctx, master_id).await?;
        let Some(state) = master.series_state_mut() else {
            return Err(EngineError::validation(format!("{master_id} is not a recurring master")));
        };
        if !state.status.can_transition_to(next) {
            return Err(EngineError::invalid_transition(master_id, state.status, next));
        }
        state.status = next;
        let master = ctx
            .commit(self.stores.events.update_event(&ctx.tenant, master))
            .await?;
        info!(%master_id, status = ?next, "series status changed");
        Ok(master)
    }

    /// Stop generation; existing occurrences stay.
    pub async fn pause_series(&self, ctx: &Ctx, master_id: Ulid) -> Result<Event, EngineError> {
        self.set_series_status(ctx, master_id, RecurrenceStatus::Paused).await
    }

    pub async fn resume_series(&self, ctx: &Ctx, master_id: Ulid) -> Result<Event, EngineError> {
        self.set_series_status(ctx, master_id, RecurrenceStatus::Active).await
    }

    /// Cancel the series and every future occurrence that can still be
    /// cancelled. Returns the master and the number of occurrences cancelled.
    pub async fn cancel_series(&self, ctx: &Ctx, master_id: Ulid) -> Result<(Event, usize), EngineError> {
        let master = self
            .set_series_status(ctx, master_id, RecurrenceStatus::Cancelled)
            .await?;
        let now = self.now();
        let future: Vec<Event> = self
            .occurrences_of(ctx, master_id, None)
            .await?
            .into_iter()
            .filter(|e| e.window.start > now && e.status.can_transition_to(EventStatus::Cancelled))
            .collect();
        let mut cancelled = 0;
        for ev in future {
            ctx.check()?;
            let _guard = self.locks.lock(ctx, LockKind::Event, ev.id).await?;
            let mut current = self.load_event(ctx, ev.id).await?;
            if !current.status.can_transition_to(EventStatus::Cancelled) {
                continue;
            }
            current.status = EventStatus::Cancelled;
            ctx.commit(self.stores.events.update_event(&ctx.tenant, current))
                .await?;
            cancelled += 1;
        }
        Ok((master, cancelled))
    }
}

enum Step {
    Deleted,
    Moved { capacity_kept: bool },
    Cancelled(ConflictingEvent),
}

/// The shape a master stamps onto its occurrences.
fn draft_of(master: &Event) -> EventDraft {
    EventDraft {
        title: master.title.clone(),
        window: master.window,
        facility_id: master.facility_id,
        max_capacity: master.max_capacity,
        allow_waitlist: master.allow_waitlist,
        registration_deadline: master.registration_deadline,
        custom_fields: master.custom_fields.clone(),
    }
}
