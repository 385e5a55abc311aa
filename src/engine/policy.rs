//! Member booking limits: policy resolution and rolling-window usage checks.

use chrono::{Datelike, Duration, Months, NaiveTime, Weekday};
use ulid::Ulid;

use crate::model::*;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    MaxConcurrentBookings { limit: u32, current: u32 },
    MaxBookingsPerDay { limit: u32, current: u32 },
    MaxBookingsPerWeek { limit: u32, current: u32 },
    MaxBookingsPerMonth { limit: u32, current: u32 },
    DurationTooShort { min_minutes: u32 },
    DurationTooLong { max_minutes: u32 },
    BeforeEarliestTime(NaiveTime),
    AfterLatestTime(NaiveTime),
    DayNotAllowed(Weekday),
    InsufficientNotice { min_hours: u32 },
    TooFarInAdvance { max_days: u32 },
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Violation::MaxConcurrentBookings { limit, current } => {
                write!(f, "MaxConcurrentBookings exceeded ({current}/{limit})")
            }
            Violation::MaxBookingsPerDay { limit, current } => {
                write!(f, "MaxBookingsPerDay exceeded ({current}/{limit})")
            }
            Violation::MaxBookingsPerWeek { limit, current } => {
                write!(f, "MaxBookingsPerWeek exceeded ({current}/{limit})")
            }
            Violation::MaxBookingsPerMonth { limit, current } => {
                write!(f, "MaxBookingsPerMonth exceeded ({current}/{limit})")
            }
            Violation::DurationTooShort { min_minutes } => {
                write!(f, "booking shorter than {min_minutes} minutes")
            }
            Violation::DurationTooLong { max_minutes } => {
                write!(f, "booking longer than {max_minutes} minutes")
            }
            Violation::BeforeEarliestTime(t) => write!(f, "starts before earliest booking time {t}"),
            Violation::AfterLatestTime(t) => write!(f, "ends after latest booking time {t}"),
            Violation::DayNotAllowed(d) => write!(f, "bookings not allowed on {d}"),
            Violation::InsufficientNotice { min_hours } => {
                write!(f, "requires at least {min_hours} hours notice")
            }
            Violation::TooFarInAdvance { max_days } => {
                write!(f, "more than {max_days} days in advance")
            }
        }
    }
}

/// Most specific active policy that applies; ties go to the lowest id.
pub fn resolve_policy<'a>(
    candidates: &'a [MemberBookingLimit],
    member: &Member,
    facility: &Facility,
) -> Option<&'a MemberBookingLimit> {
    candidates
        .iter()
        .filter(|p| p.is_active && p.scope.applies_to(member, facility))
        .min_by_key(|p| (p.scope.precedence(), p.id))
}

/// Rolling windows ending at the close of the booking's start date.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageWindows {
    pub day: TimeWindow,
    pub week: TimeWindow,
    pub month: TimeWindow,
}

pub fn usage_windows(start: Timestamp) -> UsageWindows {
    let day_start = start_of_day(start);
    let day_end = day_start + Duration::days(1);
    let month_start = day_end
        .checked_sub_months(Months::new(1))
        .unwrap_or(day_end - Duration::days(30));
    UsageWindows {
        day: TimeWindow::new(day_start, day_end),
        week: TimeWindow::new(day_end - Duration::days(7), day_end),
        month: TimeWindow::new(month_start, day_end),
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageCounts {
    pub concurrent: u32,
    pub today: u32,
    pub this_week: u32,
    pub this_month: u32,
}

/// Count live bookings. `in_scope` narrows to the bookings the policy governs.
pub fn count_usage(
    bookings: &[FacilityBooking],
    windows: &UsageWindows,
    now: Timestamp,
    exclude: Option<Ulid>,
    in_scope: impl Fn(&FacilityBooking) -> bool,
) -> UsageCounts {
    let mut c = UsageCounts::default();
    for b in bookings {
        if Some(b.id) == exclude || !b.status.counts_toward_usage() || !in_scope(b) {
            continue;
        }
        if b.window.end > now {
            c.concurrent += 1;
        }
        if windows.day.contains_instant(b.window.start) {
            c.today += 1;
        }
        if windows.week.contains_instant(b.window.start) {
            c.this_week += 1;
        }
        if windows.month.contains_instant(b.window.start) {
            c.this_month += 1;
        }
    }
    c
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimitCheck {
    pub is_valid: bool,
    pub violations: Vec<Violation>,
    /// Policy that was applied, if any exists.
    pub policy_id: Option<Ulid>,
    pub usage: UsageCounts,
    pub remaining_concurrent: Option<u32>,
    pub remaining_bookings_today: Option<u32>,
    pub remaining_bookings_this_week: Option<u32>,
    pub remaining_bookings_this_month: Option<u32>,
}

fn cap(
    limit: Option<u32>,
    current: u32,
    violations: &mut Vec<Violation>,
    violation: impl FnOnce(u32) -> Violation,
) -> Option<u32> {
    let limit = limit?;
    if current >= limit {
        violations.push(violation(limit));
    }
    Some(limit.saturating_sub(current))
}

/// Check a proposed window against a resolved policy. Every violated
/// constraint is reported. No policy means no limits.
pub fn check(
    policy: Option<&MemberBookingLimit>,
    usage: UsageCounts,
    window: &TimeWindow,
    now: Timestamp,
) -> LimitCheck {
    let Some(p) = policy else {
        return LimitCheck {
            is_valid: true,
            violations: Vec::new(),
            policy_id: None,
            usage,
            remaining_concurrent: None,
            remaining_bookings_today: None,
            remaining_bookings_this_week: None,
            remaining_bookings_this_month: None,
        };
    };

    let mut v = Vec::new();
    let remaining_concurrent = cap(p.max_concurrent_bookings, usage.concurrent, &mut v, |limit| {
        Violation::MaxConcurrentBookings { limit, current: usage.concurrent }
    });
    let remaining_today = cap(p.max_bookings_per_day, usage.today, &mut v, |limit| {
        Violation::MaxBookingsPerDay { limit, current: usage.today }
    });
    let remaining_week = cap(p.max_bookings_per_week, usage.this_week, &mut v, |limit| {
        Violation::MaxBookingsPerWeek { limit, current: usage.this_week }
    });
    let remaining_month = cap(p.max_bookings_per_month, usage.this_month, &mut v, |limit| {
        Violation::MaxBookingsPerMonth { limit, current: usage.this_month }
    });

    let minutes = window.duration().num_minutes();
    if let Some(min) = p.min_duration_minutes
        && minutes < i64::from(min)
    {
        v.push(Violation::DurationTooShort { min_minutes: min });
    }
    if let Some(max) = p.max_duration_minutes
        && minutes > i64::from(max)
    {
        v.push(Violation::DurationTooLong { max_minutes: max });
    }

    if let Some(earliest) = p.earliest_booking_time
        && window.start.time() < earliest
    {
        v.push(Violation::BeforeEarliestTime(earliest));
    }
    if let Some(latest) = p.latest_booking_time {
        let same_day = window.end.date_naive() == window.start.date_naive();
        if !same_day || window.end.time() > latest {
            v.push(Violation::AfterLatestTime(latest));
        }
    }
    let day = window.start.weekday();
    if !p.allowed_days.is_empty() && !p.allowed_days.contains(&day) {
        v.push(Violation::DayNotAllowed(day));
    }

    let lead = window.start - now;
    if let Some(hours) = p.min_advance_notice_hours
        && lead < Duration::hours(i64::from(hours))
    {
        v.push(Violation::InsufficientNotice { min_hours: hours });
    }
    if let Some(days) = p.max_advance_days
        && lead > Duration::days(i64::from(days))
    {
        v.push(Violation::TooFarInAdvance { max_days: days });
    }

    LimitCheck {
        is_valid: v.is_empty(),
        violations: v,
        policy_id: Some(p.id),
        usage,
        remaining_concurrent,
        remaining_bookings_today: remaining_today,
        remaining_bookings_this_week: remaining_week,
        remaining_bookings_this_month: remaining_month,
    }
}
