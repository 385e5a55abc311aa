use chrono::{Datelike, Duration, NaiveDate, NaiveTime};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

/// One reason a proposed facility window cannot be booked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BookingConflict {
    Overlap { booking_id: Ulid, window: TimeWindow },
    ClosedOnDay(NaiveDate),
    OutsideOperatingHours(NaiveDate),
    TooShort { minutes: i64, min: u32 },
    TooLong { minutes: i64, max: u32 },
    TooFarInAdvance { max_days: u32 },
    InPast,
    SpanTooWide,
}

impl std::fmt::Display for BookingConflict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BookingConflict::Overlap { booking_id, .. } => write!(f, "overlaps booking {booking_id}"),
            BookingConflict::ClosedOnDay(d) => write!(f, "facility closed on {d}"),
            BookingConflict::OutsideOperatingHours(d) => {
                write!(f, "outside operating hours on {d}")
            }
            BookingConflict::TooShort { minutes, min } => {
                write!(f, "duration {minutes}m below minimum {min}m")
            }
            BookingConflict::TooLong { minutes, max } => {
                write!(f, "duration {minutes}m above maximum {max}m")
            }
            BookingConflict::TooFarInAdvance { max_days } => {
                write!(f, "more than {max_days} days in advance")
            }
            BookingConflict::InPast => write!(f, "starts in the past"),
            BookingConflict::SpanTooWide => {
                write!(f, "window longer than {MAX_BOOKING_SPAN_DAYS} days")
            }
        }
    }
}

/// First blocking booking overlapping `window`, ignoring `exclude`.
pub fn find_overlap<'a>(
    existing: &'a [FacilityBooking],
    window: &TimeWindow,
    exclude: Option<Ulid>,
) -> Option<&'a FacilityBooking> {
    existing.iter().find(|b| {
        Some(b.id) != exclude && b.status.blocks_facility() && b.window.overlaps(window)
    })
}

pub fn is_available(existing: &[FacilityBooking], window: &TimeWindow, exclude: Option<Ulid>) -> bool {
    find_overlap(existing, window, exclude).is_none()
}

/// Every day the window touches must be an operating day, and the part of the
/// window on that day must sit within opening hours.
pub fn check_operating_hours(facility: &Facility, window: &TimeWindow) -> Vec<BookingConflict> {
    let mut out = Vec::new();
    if window.duration() > Duration::days(MAX_BOOKING_SPAN_DAYS) {
        out.push(BookingConflict::SpanTooWide);
        return out;
    }
    let last = (window.end - Duration::nanoseconds(1)).date_naive();
    let mut day = window.start.date_naive();
    while day <= last {
        let day_start = day.and_time(NaiveTime::MIN).and_utc();
        let day_end = day_start + Duration::days(1);
        if !facility.is_operating_on(day.weekday()) {
            out.push(BookingConflict::ClosedOnDay(day));
        } else {
            let seg_start = window.start.max(day_start);
            let seg_end = window.end.min(day_end);
            let opens = facility
                .opens_at
                .map_or(day_start, |t| day.and_time(t).and_utc());
            let closes = facility
                .closes_at
                .map_or(day_end, |t| day.and_time(t).and_utc());
            if seg_start < opens || seg_end > closes {
                out.push(BookingConflict::OutsideOperatingHours(day));
            }
        }
        let Some(next) = day.succ_opt() else { break };
        day = next;
    }
    out
}

pub fn check_duration(facility: &Facility, window: &TimeWindow) -> Option<BookingConflict> {
    let minutes = window.duration().num_minutes();
    if let Some(min) = facility.min_booking_duration_minutes
        && minutes < i64::from(min)
    {
        return Some(BookingConflict::TooShort { minutes, min });
    }
    if let Some(max) = facility.max_booking_duration_minutes
        && minutes > i64::from(max)
    {
        return Some(BookingConflict::TooLong { minutes, max });
    }
    None
}

pub fn check_advance(facility: &Facility, window: &TimeWindow, now: Timestamp) -> Option<BookingConflict> {
    if window.start < now {
        return Some(BookingConflict::InPast);
    }
    match facility.max_booking_days_in_advance {
        Some(max_days) if window.start > now + Duration::days(i64::from(max_days)) => {
            Some(BookingConflict::TooFarInAdvance { max_days })
        }
        _ => None,
    }
}

/// Full check of a proposed window. Empty result means bookable.
pub fn evaluate(
    facility: &Facility,
    existing: &[FacilityBooking],
    window: &TimeWindow,
    exclude: Option<Ulid>,
    now: Timestamp,
) -> Vec<BookingConflict> {
    let mut out = Vec::new();
    if let Some(b) = find_overlap(existing, window, exclude) {
        out.push(BookingConflict::Overlap {
            booking_id: b.id,
            window: b.window,
        });
    }
    out.extend(check_operating_hours(facility, window));
    out.extend(check_duration(facility, window));
    out.extend(check_advance(facility, window, now));
    out
}

/// Scan forward from `after` in `increment` steps for the first window of
/// `duration` that is free and within operating hours. Gives up once the
/// candidate start passes `after + horizon`.
pub fn next_available_slot(
    facility: &Facility,
    existing: &[FacilityBooking],
    duration: Duration,
    after: Timestamp,
    increment: Duration,
    horizon: Duration,
) -> Option<TimeWindow> {
    if duration <= Duration::zero() || increment <= Duration::zero() {
        return None;
    }
    let limit = after + horizon;
    let mut start = after;
    while start <= limit {
        let candidate = TimeWindow::new(start, start + duration);
        if is_available(existing, &candidate, None)
            && check_operating_hours(facility, &candidate).is_empty()
        {
            return Some(candidate);
        }
        start += increment;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc, Weekday};

    fn at(d: u32, h: u32, m: u32) -> Timestamp {
        Utc.with_ymd_and_hms(2024, 1, d, h, m, 0).unwrap()
    }

    fn facility() -> Facility {
        Facility {
            id: Ulid::new(),
            name: "Court 1".into(),
            facility_type_id: Ulid::new(),
            operating_days: vec![
                Weekday::Mon,
                Weekday::Tue,
                Weekday::Wed,
                Weekday::Thu,
                Weekday::Fri,
            ],
            opens_at: NaiveTime::from_hms_opt(8, 0, 0),
            closes_at: NaiveTime::from_hms_opt(22, 0, 0),
            min_booking_duration_minutes: Some(30),
            max_booking_duration_minutes: Some(180),
            max_booking_days_in_advance: Some(14),
            requires_approval: false,
        }
    }

    fn booking(start: Timestamp, end: Timestamp, status: BookingStatus) -> FacilityBooking {
        FacilityBooking {
            id: Ulid::new(),
            facility_id: Ulid::new(),
            member_id: Ulid::new(),
            window: TimeWindow::new(start, end),
            status,
            created_at: at(1, 0, 0),
        }
    }

    #[test]
    fn touching_windows_do_not_conflict() {
        let existing = vec![booking(at(2, 10, 0), at(2, 11, 0), BookingStatus::Confirmed)];
        assert!(is_available(&existing, &TimeWindow::new(at(2, 11, 0), at(2, 12, 0)), None));
        assert!(is_available(&existing, &TimeWindow::new(at(2, 9, 0), at(2, 10, 0)), None));
        assert!(!is_available(&existing, &TimeWindow::new(at(2, 10, 30), at(2, 11, 30)), None));
    }

    #[test]
    fn only_confirmed_and_checked_in_block() {
        let w = TimeWindow::new(at(2, 10, 0), at(2, 11, 0));
        for status in [
            BookingStatus::Pending,
            BookingStatus::Cancelled,
            BookingStatus::CheckedOut,
            BookingStatus::NoShow,
            BookingStatus::Completed,
        ] {
            let existing = vec![booking(w.start, w.end, status)];
            assert!(is_available(&existing, &w, None), "{status:?} should not block");
        }
        let existing = vec![booking(w.start, w.end, BookingStatus::CheckedIn)];
        assert!(!is_available(&existing, &w, None));
    }

    #[test]
    fn excluded_booking_is_ignored() {
        let b = booking(at(2, 10, 0), at(2, 11, 0), BookingStatus::Confirmed);
        let id = b.id;
        let existing = vec![b];
        assert!(is_available(&existing, &TimeWindow::new(at(2, 10, 15), at(2, 10, 45)), Some(id)));
    }

    #[test]
    fn operating_hours_checked_per_day() {
        let f = facility();
        assert!(check_operating_hours(&f, &TimeWindow::new(at(2, 8, 0), at(2, 22, 0))).is_empty());
        assert_eq!(
            check_operating_hours(&f, &TimeWindow::new(at(2, 7, 30), at(2, 9, 0))),
            vec![BookingConflict::OutsideOperatingHours(at(2, 0, 0).date_naive())]
        );
        // Saturday 6 January.
        assert_eq!(
            check_operating_hours(&f, &TimeWindow::new(at(6, 10, 0), at(6, 11, 0))),
            vec![BookingConflict::ClosedOnDay(at(6, 0, 0).date_naive())]
        );
        // Crossing midnight leaves opening hours on both days.
        let overnight = check_operating_hours(&f, &TimeWindow::new(at(2, 21, 0), at(3, 9, 0)));
        assert_eq!(overnight.len(), 2);
    }

    #[test]
    fn unrestricted_hours_allow_midnight_end() {
        let mut f = facility();
        f.opens_at = None;
        f.closes_at = None;
        assert!(check_operating_hours(&f, &TimeWindow::new(at(2, 23, 0), at(3, 0, 0))).is_empty());
    }

    #[test]
    fn duration_and_advance_bounds() {
        let f = facility();
        let now = at(1, 12, 0);
        let short = TimeWindow::new(at(2, 10, 0), at(2, 10, 15));
        assert!(matches!(check_duration(&f, &short), Some(BookingConflict::TooShort { .. })));
        let long = TimeWindow::new(at(2, 10, 0), at(2, 14, 0));
        assert!(matches!(check_duration(&f, &long), Some(BookingConflict::TooLong { .. })));
        let far = TimeWindow::new(at(25, 10, 0), at(25, 11, 0));
        assert_eq!(
            check_advance(&f, &far, now),
            Some(BookingConflict::TooFarInAdvance { max_days: 14 })
        );
        let past = TimeWindow::new(at(1, 9, 0), at(1, 10, 0));
        assert_eq!(check_advance(&f, &past, now), Some(BookingConflict::InPast));
    }

    #[test]
    fn evaluate_collects_everything() {
        let f = facility();
        let existing = vec![booking(at(6, 10, 0), at(6, 11, 0), BookingStatus::Confirmed)];
        let w = TimeWindow::new(at(6, 10, 0), at(6, 10, 10));
        let found = evaluate(&f, &existing, &w, None, at(1, 0, 0));
        assert!(found.iter().any(|c| matches!(c, BookingConflict::Overlap { .. })));
        assert!(found.iter().any(|c| matches!(c, BookingConflict::ClosedOnDay(_))));
        assert!(found.iter().any(|c| matches!(c, BookingConflict::TooShort { .. })));
    }

    #[test]
    fn next_slot_skips_bookings_and_closed_hours() {
        let f = facility();
        let existing = vec![
            booking(at(2, 8, 0), at(2, 9, 0), BookingStatus::Confirmed),
            booking(at(2, 9, 0), at(2, 10, 30), BookingStatus::CheckedIn),
        ];
        let slot = next_available_slot(
            &f,
            &existing,
            Duration::hours(1),
            at(2, 7, 0),
            Duration::minutes(15),
            Duration::days(30),
        );
        assert_eq!(slot, Some(TimeWindow::new(at(2, 10, 30), at(2, 11, 30))));
    }

    #[test]
    fn next_slot_none_within_horizon() {
        let f = facility();
        let existing = vec![booking(at(2, 0, 0), at(20, 0, 0), BookingStatus::Confirmed)];
        let slot = next_available_slot(
            &f,
            &existing,
            Duration::hours(1),
            at(2, 8, 0),
            Duration::minutes(15),
            Duration::days(3),
        );
        assert_eq!(slot, None);
    }
}
