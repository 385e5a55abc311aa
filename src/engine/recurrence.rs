use chrono::{Datelike, Days, Duration, Months, NaiveDate, NaiveTime};

use crate::limits::*;
use crate::model::*;

use super::EngineError;

/// One generated occurrence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub window: TimeWindow,
    /// 1-based position in the series, counted from the anchor.
    pub number: u32,
}

/// Caller-side bounds on an expansion, independent of the pattern's own bounds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Horizon {
    /// Slots starting before this are skipped (still numbered, not emitted).
    pub from: Option<Timestamp>,
    /// Exclusive: generation stops at the first slot starting at or after this.
    pub until: Option<Timestamp>,
    /// Stop after emitting this many.
    pub max_count: Option<u32>,
}

impl Horizon {
    pub fn until(until: Timestamp) -> Self {
        Self {
            until: Some(until),
            ..Self::default()
        }
    }

    pub fn between(from: Timestamp, until: Timestamp) -> Self {
        Self {
            from: Some(from),
            until: Some(until),
            max_count: None,
        }
    }
}

pub fn validate_pattern(pattern: &RecurrencePattern, anchor: &TimeWindow) -> Result<(), EngineError> {
    if pattern.interval == 0 || pattern.interval > MAX_RECURRENCE_INTERVAL {
        return Err(EngineError::validation(format!(
            "recurrence interval must be between 1 and {MAX_RECURRENCE_INTERVAL}"
        )));
    }
    if pattern.max_occurrences == Some(0) {
        return Err(EngineError::validation("max occurrences must be at least 1"));
    }
    if pattern.kind != RecurrenceType::Weekly && !pattern.days_of_week.is_empty() {
        return Err(EngineError::validation(
            "days of week apply to weekly patterns only",
        ));
    }
    if let Some(end) = pattern.end_date
        && end < anchor.start.date_naive()
    {
        return Err(EngineError::validation("recurrence ends before it starts"));
    }
    Ok(())
}

/// Unbounded-by-caller sequence of slots for a pattern. Stops only on the
/// pattern's own end date or max-occurrence count. Restart by constructing anew.
#[derive(Debug, Clone)]
pub struct Occurrences {
    pattern: RecurrencePattern,
    anchor_date: NaiveDate,
    time_of_day: NaiveTime,
    duration: Duration,
    /// Weekly: days to emit, Sunday-first.
    week_days: Vec<u32>,
    /// Period index (days, weeks, months or years, scaled by interval).
    step: u32,
    /// Weekly: index into `week_days` within the current period.
    day_idx: usize,
    emitted: u32,
    done: bool,
}

impl Occurrences {
    pub fn new(pattern: &RecurrencePattern, anchor: &TimeWindow) -> Self {
        let mut week_days: Vec<u32> = if pattern.days_of_week.is_empty() {
            vec![weekday_rank(anchor.start.weekday())]
        } else {
            pattern.days_of_week.iter().map(|d| weekday_rank(*d)).collect()
        };
        week_days.sort_unstable();
        week_days.dedup();
        Self {
            pattern: pattern.clone(),
            anchor_date: anchor.start.date_naive(),
            time_of_day: anchor.start.time(),
            duration: anchor.duration(),
            week_days,
            step: 0,
            day_idx: 0,
            emitted: 0,
            done: false,
        }
    }

    /// Next candidate date, or `None` when dates run out of range.
    fn next_date(&mut self) -> Option<NaiveDate> {
        let interval = self.pattern.interval.max(1);
        match self.pattern.kind {
            RecurrenceType::None => {
                if self.step > 0 {
                    return None;
                }
                self.step += 1;
                Some(self.anchor_date)
            }
            RecurrenceType::Daily => {
                let offset = u64::from(self.step) * u64::from(interval);
                self.step += 1;
                self.anchor_date.checked_add_days(Days::new(offset))
            }
            RecurrenceType::Weekly => loop {
                let week_start = self
                    .anchor_date
                    .checked_sub_days(Days::new(u64::from(weekday_rank(self.anchor_date.weekday()))))?;
                let week_offset = u64::from(self.step) * u64::from(interval) * 7;
                let rank = self.week_days[self.day_idx];
                self.day_idx += 1;
                if self.day_idx == self.week_days.len() {
                    self.day_idx = 0;
                    self.step += 1;
                }
                let date = week_start.checked_add_days(Days::new(week_offset + u64::from(rank)))?;
                // Days of the anchor's week that fall before the anchor are not part of the series.
                if date >= self.anchor_date {
                    return Some(date);
                }
            },
            RecurrenceType::Monthly => {
                let months = self.step.checked_mul(interval)?;
                self.step += 1;
                // chrono clamps to the last day of shorter months.
                self.anchor_date.checked_add_months(Months::new(months))
            }
            RecurrenceType::Yearly => {
                let months = self.step.checked_mul(interval)?.checked_mul(12)?;
                self.step += 1;
                // Feb 29 lands on Feb 28 in non-leap years.
                self.anchor_date.checked_add_months(Months::new(months))
            }
        }
    }
}

impl Iterator for Occurrences {
    type Item = Slot;

    fn next(&mut self) -> Option<Slot> {
        if self.done {
            return None;
        }
        if self
            .pattern
            .max_occurrences
            .is_some_and(|max| self.emitted >= max)
        {
            self.done = true;
            return None;
        }
        let Some(date) = self.next_date() else {
            self.done = true;
            return None;
        };
        if self.pattern.end_date.is_some_and(|end| date > end) {
            self.done = true;
            return None;
        }
        let start = date.and_time(self.time_of_day).and_utc();
        self.emitted += 1;
        Some(Slot {
            window: TimeWindow::new(start, start + self.duration),
            number: self.emitted,
        })
    }
}

/// Why an expansion ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stop {
    /// The pattern's end date or max count was reached.
    PatternExhausted,
    /// A caller bound was reached; more slots exist.
    HorizonReached,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expansion {
    pub slots: Vec<Slot>,
    pub stop: Stop,
}

/// Expand `pattern` from `anchor` within `horizon`.
///
/// Fails with `GenerationLimitExceeded` when the safety ceiling is hit before
/// any pattern or caller bound.
pub fn expand(
    pattern: &RecurrencePattern,
    anchor: &TimeWindow,
    horizon: Horizon,
) -> Result<Expansion, EngineError> {
    validate_pattern(pattern, anchor)?;
    let mut slots = Vec::new();
    for slot in Occurrences::new(pattern, anchor) {
        if horizon.until.is_some_and(|u| slot.window.start >= u) {
            return Ok(Expansion { slots, stop: Stop::HorizonReached });
        }
        if horizon.from.is_some_and(|f| slot.window.start < f) {
            continue;
        }
        if slots.len() as u32 >= MAX_GENERATED_OCCURRENCES {
            return Err(EngineError::GenerationLimitExceeded(MAX_GENERATED_OCCURRENCES));
        }
        slots.push(slot);
        if horizon.max_count.is_some_and(|m| slots.len() as u32 >= m) {
            return Ok(Expansion { slots, stop: Stop::HorizonReached });
        }
    }
    Ok(Expansion { slots, stop: Stop::PatternExhausted })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc, Weekday};
    use proptest::prelude::*;

    fn anchor(y: i32, m: u32, d: u32) -> TimeWindow {
        let start = Utc.with_ymd_and_hms(y, m, d, 9, 0, 0).unwrap();
        TimeWindow::new(start, start + Duration::hours(1))
    }

    fn dates(exp: &Expansion) -> Vec<NaiveDate> {
        exp.slots.iter().map(|s| s.window.start.date_naive()).collect()
    }

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn weekly_tue_thu_four_occurrences() {
        let pattern = RecurrencePattern::weekly([Weekday::Thu, Weekday::Tue]).max_occurrences(4);
        let exp = expand(&pattern, &anchor(2024, 1, 2), Horizon::default()).unwrap();
        assert_eq!(
            dates(&exp),
            vec![ymd(2024, 1, 2), ymd(2024, 1, 4), ymd(2024, 1, 9), ymd(2024, 1, 11)]
        );
        for s in &exp.slots {
            assert_eq!(s.window.start.time(), NaiveTime::from_hms_opt(9, 0, 0).unwrap());
            assert_eq!(s.window.duration(), Duration::hours(1));
        }
        assert_eq!(exp.slots.iter().map(|s| s.number).collect::<Vec<_>>(), vec![1, 2, 3, 4]);
        assert_eq!(exp.stop, Stop::PatternExhausted);
    }

    #[test]
    fn weekly_skips_days_before_anchor_in_first_week() {
        // Anchor Wednesday; Monday of that week is not part of the series.
        let pattern = RecurrencePattern::weekly([Weekday::Mon, Weekday::Wed]).max_occurrences(3);
        let exp = expand(&pattern, &anchor(2024, 1, 3), Horizon::default()).unwrap();
        assert_eq!(dates(&exp), vec![ymd(2024, 1, 3), ymd(2024, 1, 8), ymd(2024, 1, 10)]);
    }

    #[test]
    fn weekly_empty_days_uses_anchor_weekday() {
        let pattern = RecurrencePattern::new(RecurrenceType::Weekly, 2).max_occurrences(3);
        let exp = expand(&pattern, &anchor(2024, 1, 2), Horizon::default()).unwrap();
        assert_eq!(dates(&exp), vec![ymd(2024, 1, 2), ymd(2024, 1, 16), ymd(2024, 1, 30)]);
    }

    #[test]
    fn fortnightly_tue_thu() {
        let pattern = RecurrencePattern::weekly([Weekday::Tue, Weekday::Thu])
            .with_interval(2)
            .max_occurrences(4);
        let exp = expand(&pattern, &anchor(2024, 1, 2), Horizon::default()).unwrap();
        assert_eq!(
            dates(&exp),
            vec![ymd(2024, 1, 2), ymd(2024, 1, 4), ymd(2024, 1, 16), ymd(2024, 1, 18)]
        );
    }

    #[test]
    fn daily_interval() {
        let pattern = RecurrencePattern::new(RecurrenceType::Daily, 3).max_occurrences(3);
        let exp = expand(&pattern, &anchor(2024, 2, 27), Horizon::default()).unwrap();
        assert_eq!(dates(&exp), vec![ymd(2024, 2, 27), ymd(2024, 3, 1), ymd(2024, 3, 4)]);
    }

    #[test]
    fn monthly_clamps_to_month_end_without_drift() {
        let pattern = RecurrencePattern::new(RecurrenceType::Monthly, 1).max_occurrences(4);
        let exp = expand(&pattern, &anchor(2024, 1, 31), Horizon::default()).unwrap();
        assert_eq!(
            dates(&exp),
            vec![ymd(2024, 1, 31), ymd(2024, 2, 29), ymd(2024, 3, 31), ymd(2024, 4, 30)]
        );
    }

    #[test]
    fn yearly_leap_day_clamps() {
        let pattern = RecurrencePattern::new(RecurrenceType::Yearly, 1).max_occurrences(5);
        let exp = expand(&pattern, &anchor(2024, 2, 29), Horizon::default()).unwrap();
        assert_eq!(
            dates(&exp),
            vec![
                ymd(2024, 2, 29),
                ymd(2025, 2, 28),
                ymd(2026, 2, 28),
                ymd(2027, 2, 28),
                ymd(2028, 2, 29)
            ]
        );
    }

    #[test]
    fn end_date_is_inclusive() {
        let pattern = RecurrencePattern::new(RecurrenceType::Daily, 1).until(ymd(2024, 1, 4));
        let exp = expand(&pattern, &anchor(2024, 1, 2), Horizon::default()).unwrap();
        assert_eq!(exp.slots.len(), 3);
        assert_eq!(exp.stop, Stop::PatternExhausted);
    }

    #[test]
    fn none_pattern_yields_anchor_only() {
        let pattern = RecurrencePattern::new(RecurrenceType::None, 1);
        let exp = expand(&pattern, &anchor(2024, 1, 2), Horizon::default()).unwrap();
        assert_eq!(exp.slots.len(), 1);
    }

    #[test]
    fn horizon_until_is_exclusive() {
        let a = anchor(2024, 1, 1);
        let pattern = RecurrencePattern::new(RecurrenceType::Daily, 1);
        let exp = expand(&pattern, &a, Horizon::until(a.start + Duration::days(3))).unwrap();
        assert_eq!(exp.slots.len(), 3);
        assert_eq!(exp.stop, Stop::HorizonReached);
    }

    #[test]
    fn horizon_from_keeps_numbering() {
        let a = anchor(2024, 1, 1);
        let pattern = RecurrencePattern::new(RecurrenceType::Daily, 1);
        let exp = expand(
            &pattern,
            &a,
            Horizon::between(a.start + Duration::days(2), a.start + Duration::days(4)),
        )
        .unwrap();
        assert_eq!(exp.slots.iter().map(|s| s.number).collect::<Vec<_>>(), vec![3, 4]);
    }

    #[test]
    fn unbounded_expansion_hits_ceiling() {
        let pattern = RecurrencePattern::new(RecurrenceType::Daily, 1);
        let res = expand(&pattern, &anchor(2024, 1, 1), Horizon::default());
        assert!(matches!(
            res,
            Err(EngineError::GenerationLimitExceeded(MAX_GENERATED_OCCURRENCES))
        ));
    }

    #[test]
    fn exactly_ceiling_then_exhausted_is_fine() {
        let pattern = RecurrencePattern::new(RecurrenceType::Daily, 1)
            .max_occurrences(MAX_GENERATED_OCCURRENCES);
        let exp = expand(&pattern, &anchor(2024, 1, 1), Horizon::default()).unwrap();
        assert_eq!(exp.slots.len() as u32, MAX_GENERATED_OCCURRENCES);
    }

    #[test]
    fn invalid_patterns_rejected() {
        let a = anchor(2024, 1, 2);
        let zero = RecurrencePattern::new(RecurrenceType::Daily, 0);
        assert!(matches!(expand(&zero, &a, Horizon::default()), Err(EngineError::Validation(_))));
        let mut days_on_daily = RecurrencePattern::new(RecurrenceType::Daily, 1).max_occurrences(2);
        days_on_daily.days_of_week = vec![Weekday::Mon];
        assert!(matches!(
            expand(&days_on_daily, &a, Horizon::default()),
            Err(EngineError::Validation(_))
        ));
        let backwards = RecurrencePattern::new(RecurrenceType::Daily, 1).until(ymd(2023, 12, 1));
        assert!(matches!(expand(&backwards, &a, Horizon::default()), Err(EngineError::Validation(_))));
    }

    #[test]
    fn iterator_is_restartable() {
        let pattern = RecurrencePattern::weekly([Weekday::Mon, Weekday::Fri]);
        let a = anchor(2024, 1, 1);
        let first: Vec<Slot> = Occurrences::new(&pattern, &a).take(6).collect();
        let again: Vec<Slot> = Occurrences::new(&pattern, &a).take(6).collect();
        assert_eq!(first, again);
    }

    fn kind_strategy() -> impl Strategy<Value = RecurrenceType> {
        prop_oneof![
            Just(RecurrenceType::Daily),
            Just(RecurrenceType::Weekly),
            Just(RecurrenceType::Monthly),
            Just(RecurrenceType::Yearly),
        ]
    }

    proptest! {
        #[test]
        fn max_occurrences_bounds_output(
            kind in kind_strategy(),
            interval in 1u32..4,
            n in 1u32..60,
            day in 1u32..29,
        ) {
            let pattern = RecurrencePattern::new(kind, interval).max_occurrences(n);
            let exp = expand(&pattern, &anchor(2024, 3, day), Horizon::default()).unwrap();
            prop_assert_eq!(exp.slots.len() as u32, n);
            for (i, s) in exp.slots.iter().enumerate() {
                prop_assert_eq!(s.number, i as u32 + 1);
                prop_assert_eq!(s.window.duration(), Duration::hours(1));
            }
            for pair in exp.slots.windows(2) {
                prop_assert!(pair[0].window.start < pair[1].window.start);
            }
        }

        #[test]
        fn end_date_truncates_before_max(
            interval in 1u32..3,
            n in 1u32..40,
            span_days in 0u64..30,
        ) {
            let a = anchor(2024, 5, 1);
            let end = a.start.date_naive().checked_add_days(Days::new(span_days)).unwrap();
            let pattern = RecurrencePattern::new(RecurrenceType::Daily, interval)
                .max_occurrences(n)
                .until(end);
            let exp = expand(&pattern, &a, Horizon::default()).unwrap();
            prop_assert!(exp.slots.len() as u32 <= n);
            prop_assert!(exp.slots.iter().all(|s| s.window.start.date_naive() <= end));
        }
    }
}
