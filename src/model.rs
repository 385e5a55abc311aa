use chrono::{DateTime, Duration, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::fields::CustomFields;

/// UTC instant. The engine never reasons in local time.
pub type Timestamp = DateTime<Utc>;

/// Half-open window `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: Timestamp,
    pub end: Timestamp,
}

impl TimeWindow {
    pub fn new(start: Timestamp, end: Timestamp) -> Self {
        debug_assert!(start < end, "TimeWindow start must be before end");
        Self { start, end }
    }

    /// Checked constructor for caller-supplied windows.
    pub fn try_new(start: Timestamp, end: Timestamp) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn duration(&self) -> Duration {
        self.end - self.start
    }

    /// Open-interval overlap: windows that only touch at an endpoint do not overlap.
    pub fn overlaps(&self, other: &TimeWindow) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Timestamp) -> bool {
        self.start <= t && t < self.end
    }

    pub fn shifted(&self, by: Duration) -> Self {
        Self {
            start: self.start + by,
            end: self.end + by,
        }
    }
}

// ── Events & recurrence ─────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventStatus {
    Scheduled,
    InProgress,
    Completed,
    Cancelled,
    Rescheduled,
}

impl EventStatus {
    pub fn can_transition_to(self, next: EventStatus) -> bool {
        use EventStatus::*;
        matches!(
            (self, next),
            (Scheduled, InProgress | Cancelled | Rescheduled)
                | (Rescheduled, Scheduled | InProgress | Cancelled | Rescheduled)
                | (InProgress, Completed | Cancelled)
        )
    }

    /// Statuses that still accept registrations.
    pub fn accepts_registrations(self) -> bool {
        matches!(self, EventStatus::Scheduled | EventStatus::Rescheduled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecurrenceStatus {
    Active,
    Paused,
    Completed,
    Cancelled,
}

impl RecurrenceStatus {
    pub fn can_transition_to(self, next: RecurrenceStatus) -> bool {
        use RecurrenceStatus::*;
        matches!(
            (self, next),
            (Active, Paused | Completed | Cancelled) | (Paused, Active | Cancelled)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecurrenceType {
    None,
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecurrencePattern {
    pub kind: RecurrenceType,
    pub interval: u32,
    /// Weekly only. Empty means "the anchor's own weekday".
    pub days_of_week: Vec<Weekday>,
    /// Inclusive last date on which an occurrence may start.
    pub end_date: Option<chrono::NaiveDate>,
    pub max_occurrences: Option<u32>,
}

impl RecurrencePattern {
    pub fn new(kind: RecurrenceType, interval: u32) -> Self {
        Self {
            kind,
            interval,
            days_of_week: Vec::new(),
            end_date: None,
            max_occurrences: None,
        }
    }

    pub fn weekly(days: impl IntoIterator<Item = Weekday>) -> Self {
        Self {
            days_of_week: days.into_iter().collect(),
            ..Self::new(RecurrenceType::Weekly, 1)
        }
    }

    pub fn with_interval(mut self, interval: u32) -> Self {
        self.interval = interval;
        self
    }

    pub fn until(mut self, end_date: chrono::NaiveDate) -> Self {
        self.end_date = Some(end_date);
        self
    }

    pub fn max_occurrences(mut self, n: u32) -> Self {
        self.max_occurrences = Some(n);
        self
    }
}

/// State a master event carries for its series.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeriesState {
    pub pattern: RecurrencePattern,
    /// High-water mark of generation.
    pub last_generated_until: Timestamp,
    pub status: RecurrenceStatus,
}

/// Back-reference from an occurrence to its master. Looked up by id, never embedded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OccurrenceLink {
    pub master_id: Ulid,
    /// 1-based position in the series.
    pub number: u32,
    /// Edited individually; regeneration passes never recreate or delete it.
    pub detached: bool,
    /// Kept through a recurrence update that would otherwise have moved it.
    pub diverged: bool,
}

/// Where an event sits in a recurring series. Only `Master` carries a pattern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SeriesRole {
    Standalone,
    Master(SeriesState),
    Occurrence(OccurrenceLink),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: Ulid,
    pub title: String,
    pub window: TimeWindow,
    pub facility_id: Option<Ulid>,
    pub max_capacity: u32,
    /// Written only by the registration ledger.
    pub current_enrollment: u32,
    pub allow_waitlist: bool,
    pub registration_deadline: Option<Timestamp>,
    pub status: EventStatus,
    pub custom_fields: CustomFields,
    pub series: SeriesRole,
    /// Optimistic-concurrency token, bumped by the store on every update.
    pub version: u64,
}

impl Event {
    pub fn is_recurring_master(&self) -> bool {
        matches!(self.series, SeriesRole::Master(_))
    }

    pub fn master_event_id(&self) -> Option<Ulid> {
        match &self.series {
            SeriesRole::Occurrence(link) => Some(link.master_id),
            _ => None,
        }
    }

    pub fn occurrence_number(&self) -> Option<u32> {
        match &self.series {
            SeriesRole::Occurrence(link) => Some(link.number),
            _ => None,
        }
    }

    pub fn pattern(&self) -> Option<&RecurrencePattern> {
        match &self.series {
            SeriesRole::Master(state) => Some(&state.pattern),
            _ => None,
        }
    }

    pub fn series_state(&self) -> Option<&SeriesState> {
        match &self.series {
            SeriesRole::Master(state) => Some(state),
            _ => None,
        }
    }

    pub fn series_state_mut(&mut self) -> Option<&mut SeriesState> {
        match &mut self.series {
            SeriesRole::Master(state) => Some(state),
            _ => None,
        }
    }

    pub fn link(&self) -> Option<&OccurrenceLink> {
        match &self.series {
            SeriesRole::Occurrence(link) => Some(link),
            _ => None,
        }
    }

    pub fn link_mut(&mut self) -> Option<&mut OccurrenceLink> {
        match &mut self.series {
            SeriesRole::Occurrence(link) => Some(link),
            _ => None,
        }
    }

    pub fn is_detached(&self) -> bool {
        self.link().is_some_and(|l| l.detached)
    }
}

/// The shape shared by a master and every occurrence generated from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventDraft {
    pub title: String,
    pub window: TimeWindow,
    pub facility_id: Option<Ulid>,
    pub max_capacity: u32,
    pub allow_waitlist: bool,
    pub registration_deadline: Option<Timestamp>,
    pub custom_fields: CustomFields,
}

impl EventDraft {
    pub fn new(title: impl Into<String>, window: TimeWindow, max_capacity: u32) -> Self {
        Self {
            title: title.into(),
            window,
            facility_id: None,
            max_capacity,
            allow_waitlist: false,
            registration_deadline: None,
            custom_fields: CustomFields::default(),
        }
    }

    /// Build an event at `window`, keeping the deadline's offset from the start.
    pub fn materialize(&self, id: Ulid, window: TimeWindow, series: SeriesRole) -> Event {
        let deadline = self
            .registration_deadline
            .map(|d| window.start - (self.window.start - d));
        Event {
            id,
            title: self.title.clone(),
            window,
            facility_id: self.facility_id,
            max_capacity: self.max_capacity,
            current_enrollment: 0,
            allow_waitlist: self.allow_waitlist,
            registration_deadline: deadline,
            status: EventStatus::Scheduled,
            custom_fields: self.custom_fields.clone(),
            series,
            version: 0,
        }
    }
}

// ── Registrations ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RegistrationStatus {
    Confirmed,
    Pending,
    Cancelled,
    Waitlisted,
    NoShow,
    Completed,
}

impl RegistrationStatus {
    pub fn can_transition_to(self, next: RegistrationStatus) -> bool {
        use RegistrationStatus::*;
        matches!(
            (self, next),
            (Pending, Confirmed | Waitlisted | Cancelled)
                | (Waitlisted, Confirmed | Cancelled)
                | (Confirmed, Cancelled | NoShow | Completed)
        )
    }

    /// Holds a seat or a place in line.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            RegistrationStatus::Confirmed | RegistrationStatus::Pending | RegistrationStatus::Waitlisted
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRegistration {
    pub id: Ulid,
    pub event_id: Ulid,
    pub member_id: Ulid,
    pub member_name: String,
    pub status: RegistrationStatus,
    /// Meaningful only while `status == Waitlisted`.
    pub waitlist_position: Option<u32>,
    pub registered_at: Timestamp,
    pub checked_in_at: Option<Timestamp>,
    pub cancelled_at: Option<Timestamp>,
}

impl EventRegistration {
    pub fn is_waitlisted(&self) -> bool {
        self.status == RegistrationStatus::Waitlisted
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub id: Ulid,
    pub name: String,
    pub tier_id: Option<Ulid>,
}

// ── Facilities & bookings ───────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Facility {
    pub id: Ulid,
    pub name: String,
    pub facility_type_id: Ulid,
    /// Empty means open every day.
    pub operating_days: Vec<Weekday>,
    /// `None` means open from midnight.
    pub opens_at: Option<NaiveTime>,
    /// `None` means open until midnight.
    pub closes_at: Option<NaiveTime>,
    pub min_booking_duration_minutes: Option<u32>,
    pub max_booking_duration_minutes: Option<u32>,
    pub max_booking_days_in_advance: Option<u32>,
    pub requires_approval: bool,
}

impl Facility {
    pub fn is_operating_on(&self, day: Weekday) -> bool {
        self.operating_days.is_empty() || self.operating_days.contains(&day)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingStatus {
    Confirmed,
    Pending,
    CheckedIn,
    CheckedOut,
    Cancelled,
    NoShow,
    Completed,
}

impl BookingStatus {
    pub fn can_transition_to(self, next: BookingStatus) -> bool {
        use BookingStatus::*;
        matches!(
            (self, next),
            (Pending, Confirmed | Cancelled)
                | (Confirmed, CheckedIn | Cancelled | NoShow)
                | (CheckedIn, CheckedOut)
                | (CheckedOut, Completed)
        )
    }

    /// Occupies the facility for overlap purposes.
    pub fn blocks_facility(self) -> bool {
        matches!(self, BookingStatus::Confirmed | BookingStatus::CheckedIn)
    }

    /// Counts against a member's usage limits.
    pub fn counts_toward_usage(self) -> bool {
        matches!(
            self,
            BookingStatus::Confirmed | BookingStatus::Pending | BookingStatus::CheckedIn
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FacilityBooking {
    pub id: Ulid,
    pub facility_id: Ulid,
    pub member_id: Ulid,
    pub window: TimeWindow,
    pub status: BookingStatus,
    pub created_at: Timestamp,
}

// ── Booking limits ──────────────────────────────────────────────

/// Who a usage policy applies to. Ordered from most to least specific.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LimitScope {
    MemberFacility { member_id: Ulid, facility_id: Ulid },
    MemberFacilityType { member_id: Ulid, facility_type_id: Ulid },
    Tier { tier_id: Ulid },
    Global,
}

impl LimitScope {
    /// Lower wins.
    pub fn precedence(&self) -> u8 {
        match self {
            LimitScope::MemberFacility { .. } => 0,
            LimitScope::MemberFacilityType { .. } => 1,
            LimitScope::Tier { .. } => 2,
            LimitScope::Global => 3,
        }
    }

    pub fn applies_to(&self, member: &Member, facility: &Facility) -> bool {
        match *self {
            LimitScope::MemberFacility { member_id, facility_id } => {
                member_id == member.id && facility_id == facility.id
            }
            LimitScope::MemberFacilityType { member_id, facility_type_id } => {
                member_id == member.id && facility_type_id == facility.facility_type_id
            }
            LimitScope::Tier { tier_id } => member.tier_id == Some(tier_id),
            LimitScope::Global => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberBookingLimit {
    pub id: Ulid,
    pub scope: LimitScope,
    pub is_active: bool,
    pub max_concurrent_bookings: Option<u32>,
    pub max_bookings_per_day: Option<u32>,
    pub max_bookings_per_week: Option<u32>,
    pub max_bookings_per_month: Option<u32>,
    pub min_duration_minutes: Option<u32>,
    pub max_duration_minutes: Option<u32>,
    pub min_advance_notice_hours: Option<u32>,
    pub max_advance_days: Option<u32>,
    pub earliest_booking_time: Option<NaiveTime>,
    pub latest_booking_time: Option<NaiveTime>,
    /// Empty means every day.
    pub allowed_days: Vec<Weekday>,
}

impl MemberBookingLimit {
    /// A policy with no caps at all.
    pub fn unrestricted(id: Ulid, scope: LimitScope) -> Self {
        Self {
            id,
            scope,
            is_active: true,
            max_concurrent_bookings: None,
            max_bookings_per_day: None,
            max_bookings_per_week: None,
            max_bookings_per_month: None,
            min_duration_minutes: None,
            max_duration_minutes: None,
            min_advance_notice_hours: None,
            max_advance_days: None,
            earliest_booking_time: None,
            latest_booking_time: None,
            allowed_days: Vec::new(),
        }
    }
}

/// Advisory snapshot of a member's usage. Never consulted for validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberBookingUsage {
    pub member_id: Ulid,
    pub computed_at: Timestamp,
    pub concurrent: u32,
    pub today: u32,
    pub this_week: u32,
    pub this_month: u32,
}

// ── Equipment ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HardwareStatus {
    Available,
    InUse,
    Maintenance,
    Retired,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hardware {
    pub id: Ulid,
    pub hardware_type_id: Ulid,
    pub name: String,
    pub status: HardwareStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEquipmentRequirement {
    pub id: Ulid,
    pub event_id: Ulid,
    pub hardware_type_id: Option<Ulid>,
    /// Pins the requirement to one item instead of a type.
    pub hardware_id: Option<Ulid>,
    pub quantity_required: u32,
    pub is_mandatory: bool,
    pub auto_assign: bool,
    pub is_fulfilled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AssignmentStatus {
    Reserved,
    CheckedOut,
    InUse,
    Returned,
    Missing,
    Damaged,
}

impl AssignmentStatus {
    pub fn can_transition_to(self, next: AssignmentStatus) -> bool {
        use AssignmentStatus::*;
        matches!(
            (self, next),
            (Reserved, CheckedOut | Returned)
                | (CheckedOut, InUse | Returned | Missing | Damaged)
                | (InUse, Returned | Missing | Damaged)
                | (Missing, Returned)
        )
    }

    /// Holds the item for its window.
    pub fn holds_item(self) -> bool {
        matches!(
            self,
            AssignmentStatus::Reserved | AssignmentStatus::CheckedOut | AssignmentStatus::InUse
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEquipmentAssignment {
    pub id: Ulid,
    pub requirement_id: Ulid,
    pub event_id: Ulid,
    pub hardware_id: Ulid,
    pub responsible_member_id: Option<Ulid>,
    pub window: TimeWindow,
    pub status: AssignmentStatus,
}

/// Weekday order used for weekly expansion and display: Sunday first.
pub fn weekday_rank(day: Weekday) -> u32 {
    day.num_days_from_sunday()
}

/// Midnight (UTC) at the start of the day containing `t`.
pub fn start_of_day(t: Timestamp) -> Timestamp {
    t.date_naive().and_time(NaiveTime::MIN).and_utc()
}


#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> Timestamp {
        Utc.with_ymd_and_hms(2024, 1, 2, h, m, 0).unwrap()
    }

    #[test]
    fn window_overlap_is_open_interval() {
        let a = TimeWindow::new(at(10, 0), at(11, 0));
        let touching = TimeWindow::new(at(11, 0), at(12, 0));
        let inside = TimeWindow::new(at(10, 30), at(11, 30));
        assert!(!a.overlaps(&touching));
        assert!(!touching.overlaps(&a));
        assert!(a.overlaps(&inside));
        assert!(inside.overlaps(&a));
    }

    #[test]
    fn window_try_new_rejects_empty() {
        assert!(TimeWindow::try_new(at(10, 0), at(10, 0)).is_none());
        assert!(TimeWindow::try_new(at(11, 0), at(10, 0)).is_none());
        assert!(TimeWindow::try_new(at(10, 0), at(10, 1)).is_some());
    }

    #[test]
    fn window_contains_instant_half_open() {
        let w = TimeWindow::new(at(10, 0), at(11, 0));
        assert!(w.contains_instant(at(10, 0)));
        assert!(!w.contains_instant(at(11, 0)));
    }

    #[test]
    fn booking_transition_table() {
        use BookingStatus::*;
        assert!(Pending.can_transition_to(Confirmed));
        assert!(Confirmed.can_transition_to(CheckedIn));
        assert!(CheckedIn.can_transition_to(CheckedOut));
        assert!(CheckedOut.can_transition_to(Completed));
        assert!(!Cancelled.can_transition_to(Confirmed));
        assert!(!CheckedIn.can_transition_to(Cancelled));
        assert!(Confirmed.blocks_facility());
        assert!(CheckedIn.blocks_facility());
        assert!(!Pending.blocks_facility());
    }

    #[test]
    fn registration_transition_table() {
        use RegistrationStatus::*;
        assert!(Waitlisted.can_transition_to(Confirmed));
        assert!(Confirmed.can_transition_to(Cancelled));
        assert!(!Cancelled.can_transition_to(Confirmed));
        assert!(!Completed.can_transition_to(NoShow));
        assert!(Waitlisted.is_active());
        assert!(!NoShow.is_active());
    }

    #[test]
    fn assignment_transition_table() {
        use AssignmentStatus::*;
        assert!(Reserved.can_transition_to(CheckedOut));
        assert!(CheckedOut.can_transition_to(Damaged));
        assert!(!Returned.can_transition_to(InUse));
        assert!(Reserved.holds_item());
        assert!(!Returned.holds_item());
    }

    #[test]
    fn limit_scope_precedence_orders_specific_first() {
        let m = Ulid::new();
        let mut scopes = [
            LimitScope::Global,
            LimitScope::Tier { tier_id: Ulid::new() },
            LimitScope::MemberFacility { member_id: m, facility_id: Ulid::new() },
            LimitScope::MemberFacilityType { member_id: m, facility_type_id: Ulid::new() },
        ];
        scopes.sort_by_key(|s| s.precedence());
        assert!(matches!(scopes[0], LimitScope::MemberFacility { .. }));
        assert!(matches!(scopes[3], LimitScope::Global));
    }

    #[test]
    fn draft_materialize_keeps_deadline_offset() {
        let mut draft = EventDraft::new("Open play", TimeWindow::new(at(9, 0), at(10, 0)), 8);
        draft.registration_deadline = Some(at(8, 0));
        let later = TimeWindow::new(at(9, 0), at(10, 0)).shifted(Duration::days(7));
        let ev = draft.materialize(Ulid::new(), later, SeriesRole::Standalone);
        assert_eq!(ev.registration_deadline, Some(at(8, 0) + Duration::days(7)));
        assert_eq!(ev.current_enrollment, 0);
        assert!(ev.pattern().is_none());
    }
}
