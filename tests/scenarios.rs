use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, NaiveTime, TimeZone, Utc, Weekday};
use ulid::Ulid;

use clubhouse::config::EngineConfig;
use clubhouse::engine::{BookingRequest, Engine, EngineError, ErrorKind, FixedClock, UpdateStrategy};
use clubhouse::model::*;
use clubhouse::notify::{Notice, NotifyHub};
use clubhouse::store::{EventStore, MemoryStore, RegistrationStore, Stores};
use clubhouse::sweeper;
use clubhouse::tenant::{Ctx, TenantId};

// ── Test infrastructure ──────────────────────────────────────

struct Club {
    engine: Arc<Engine>,
    store: Arc<MemoryStore>,
    clock: Arc<FixedClock>,
    ctx: Ctx,
}

fn at(month: u32, day: u32, h: u32) -> Timestamp {
    Utc.with_ymd_and_hms(2024, month, day, h, 0, 0).unwrap()
}

fn start_club(name: &str) -> Club {
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(FixedClock::new(at(1, 1, 8)));
    let engine = Engine::new(
        Stores::in_memory(store.clone()),
        EngineConfig::default(),
        Arc::new(NotifyHub::new()),
    )
    .with_clock(clock.clone());
    Club {
        engine: Arc::new(engine),
        store,
        clock,
        ctx: Ctx::new(TenantId::parse(name).unwrap()),
    }
}

async fn add_member(club: &Club, name: &str) -> Member {
    let member = Member {
        id: Ulid::new(),
        name: name.into(),
        tier_id: None,
    };
    club.store.put_member(&club.ctx.tenant, member.clone()).await;
    member
}

async fn add_court(club: &Club) -> Facility {
    let facility = Facility {
        id: Ulid::new(),
        name: "Court A".into(),
        facility_type_id: Ulid::new(),
        operating_days: Vec::new(),
        opens_at: NaiveTime::from_hms_opt(7, 0, 0),
        closes_at: NaiveTime::from_hms_opt(23, 0, 0),
        min_booking_duration_minutes: Some(30),
        max_booking_duration_minutes: Some(180),
        max_booking_days_in_advance: None,
        requires_approval: false,
    };
    club.store.put_facility(&club.ctx.tenant, facility.clone()).await;
    facility
}

// ── Waitlist ─────────────────────────────────────────────────

#[tokio::test]
async fn waitlist_promotion_is_announced() {
    let club = start_club("riverside");
    let start = at(1, 3, 18);
    let mut draft = EventDraft::new("Beginners clinic", TimeWindow::new(start, start + Duration::hours(1)), 2);
    draft.allow_waitlist = true;
    let event = club.engine.create_event(&club.ctx, draft).await.unwrap();
    let mut rx = club.engine.notify.subscribe(&club.ctx.tenant);

    let mut regs = Vec::new();
    for name in ["Ada", "Brook", "Cruz", "Dee"] {
        let m = add_member(&club, name).await;
        club.clock.advance(Duration::minutes(1));
        regs.push(club.engine.register(&club.ctx, event.id, m.id).await.unwrap().registration);
    }

    club.engine.cancel_registration(&club.ctx, regs[0].id).await.unwrap();

    let promoted = tokio::time::timeout(StdDuration::from_secs(1), async {
        loop {
            if let Notice::WaitlistPromoted { registration_id, .. } = rx.recv().await.unwrap() {
                return registration_id;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(promoted, regs[2].id);

    let dee = club
        .store
        .get_registration(&club.ctx.tenant, regs[3].id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(dee.waitlist_position, Some(1));
    let stored = club.store.get_event(&club.ctx.tenant, event.id).await.unwrap().unwrap();
    assert_eq!(stored.current_enrollment, 2);
}

// ── Series lifecycle ─────────────────────────────────────────

#[tokio::test]
async fn weekly_series_rolls_forward_and_updates() {
    let club = start_club("hillside");
    let court = add_court(&club).await;
    let start = at(1, 2, 9);
    let mut draft = EventDraft::new("Ladder night", TimeWindow::new(start, start + Duration::hours(2)), 12);
    draft.facility_id = Some(court.id);
    let pattern = RecurrencePattern::weekly([Weekday::Tue, Weekday::Thu]);

    let series = club
        .engine
        .create_series(
            &club.ctx,
            draft.clone(),
            pattern.clone(),
            TimeWindow::new(at(1, 1, 0), at(1, 15, 0)),
        )
        .await
        .unwrap();
    assert_eq!(series.occurrences.len(), 4);

    let report = sweeper::sweep(&club.engine, &club.ctx).await.unwrap();
    assert_eq!(report.extended, 1);
    let rolled = club
        .engine
        .occurrences_of(&club.ctx, series.master.id, None)
        .await
        .unwrap();
    assert!(rolled.len() > 4);
    for pair in rolled.windows(2) {
        assert!(pair[0].window.start < pair[1].window.start);
    }

    // Move the series an hour later; nobody is registered so nothing conflicts.
    let later = start + Duration::hours(1);
    draft.window = TimeWindow::new(later, later + Duration::hours(2));
    let out = club
        .engine
        .update_recurrence(
            &club.ctx,
            series.master.id,
            draft,
            pattern,
            UpdateStrategy::CancelConflicts,
        )
        .await
        .unwrap();
    assert_eq!(out.moved, rolled.len());
    assert!(out.conflicts.is_empty());
    let moved = club
        .engine
        .occurrences_of(&club.ctx, series.master.id, None)
        .await
        .unwrap();
    assert_eq!(moved.len(), rolled.len());
    assert!(moved.iter().all(|e| e.window.start.time() == NaiveTime::from_hms_opt(10, 0, 0).unwrap()));
}

// ── Facility bookings ────────────────────────────────────────

#[tokio::test]
async fn court_bookings_respect_overlap_and_limits() {
    let club = start_club("lakeside");
    let court = add_court(&club).await;
    let ana = add_member(&club, "Ana").await;
    let ben = add_member(&club, "Ben").await;

    let mut policy = MemberBookingLimit::unrestricted(Ulid::new(), LimitScope::Global);
    policy.max_bookings_per_day = Some(2);
    club.store.put_policy(&club.ctx.tenant, policy).await;

    let book = |member_id: Ulid, from: u32| BookingRequest {
        member_id,
        facility_id: court.id,
        window: TimeWindow::new(at(1, 2, from), at(1, 2, from + 1)),
    };

    club.engine.book_facility(&club.ctx, book(ana.id, 10)).await.unwrap();
    // Touching the end of Ana's booking is fine.
    club.engine.book_facility(&club.ctx, book(ben.id, 11)).await.unwrap();

    let overlap = club
        .engine
        .book_facility(
            &club.ctx,
            BookingRequest {
                member_id: ben.id,
                facility_id: court.id,
                window: TimeWindow::new(at(1, 2, 10) + Duration::minutes(30), at(1, 2, 11) + Duration::minutes(30)),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(overlap, EngineError::Overlap { .. }));

    club.engine.book_facility(&club.ctx, book(ana.id, 14)).await.unwrap();
    let over = club
        .engine
        .book_facility(&club.ctx, book(ana.id, 16))
        .await
        .unwrap_err();
    assert_eq!(over.kind(), ErrorKind::LimitExceeded);
    assert!(over.to_string().contains("MaxBookingsPerDay exceeded"));

    let check = club
        .engine
        .validate_booking_limits(&club.ctx, ana.id, court.id, TimeWindow::new(at(1, 2, 16), at(1, 2, 17)), None)
        .await
        .unwrap();
    assert_eq!(check.remaining_bookings_today, Some(0));

    let slot = club
        .engine
        .find_next_available_slot(&club.ctx, court.id, Duration::hours(1), at(1, 2, 10))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(slot.start, at(1, 2, 12));
}

// ── Tenancy ──────────────────────────────────────────────────

#[tokio::test]
async fn tenants_share_a_store_without_seeing_each_other() {
    let club = start_club("north");
    let south = Ctx::new(TenantId::parse("south").unwrap());
    let court = add_court(&club).await;

    let res = club
        .engine
        .is_available(&south, court.id, TimeWindow::new(at(1, 2, 10), at(1, 2, 11)), None)
        .await;
    assert!(matches!(res, Err(EngineError::NotFound(id)) if id == court.id));
    assert!(TenantId::parse("").is_err());
}
