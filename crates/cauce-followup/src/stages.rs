// SPDX-FileCopyrightText: 2026 Cauce Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Stage cadence and civil-time window arithmetic.
//!
//! Offsets are hours from the user's last activity. Stage 0 fires one hour
//! after activation; stage 13 is the terminal scripted message 15 days after
//! stage 12, optionally recurring every 15 days in maintenance mode. All
//! window decisions happen in the configured civil zone, never in UTC.

use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Timelike, Utc};
use chrono_tz::Tz;

/// Hours from last activity for stages 0..=12.
pub const STAGE_OFFSETS_HOURS: [i64; 13] = [
    1, 24, 48, 96, 168, 240, 336, 432, 624, 864, 1104, 1344, 1584,
];

/// The terminal scripted stage.
pub const TERMINAL_STAGE: u8 = 13;

/// Gap between recurring maintenance sends (15 days).
pub const MAINTENANCE_INTERVAL_HOURS: i64 = 360;

/// Offset in hours from activation for a stage. Stage 13 follows stage 12
/// by one maintenance interval.
pub fn offset_hours(stage: u8) -> Option<i64> {
    match stage {
        0..=12 => Some(STAGE_OFFSETS_HOURS[stage as usize]),
        13 => Some(STAGE_OFFSETS_HOURS[12] + MAINTENANCE_INTERVAL_HOURS),
        _ => None,
    }
}

/// Allowed send window in a civil zone: hours `[start, end)` on the given
/// ISO weekdays (1 = Monday .. 7 = Sunday).
#[derive(Debug, Clone)]
pub struct ScheduleWindow {
    pub start_hour: u32,
    pub end_hour: u32,
    pub allowed_weekdays: Vec<u8>,
    pub tz: Tz,
}

impl ScheduleWindow {
    /// Whether `at` falls inside the window.
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        let local = at.with_timezone(&self.tz);
        let weekday = local.weekday().number_from_monday() as u8;
        self.allowed_weekdays.contains(&weekday)
            && local.hour() >= self.start_hour
            && local.hour() < self.end_hour
    }

    /// The earliest instant at or after `from` inside the window.
    pub fn next_valid(&self, from: DateTime<Utc>) -> DateTime<Utc> {
        let mut local = from.with_timezone(&self.tz);

        // Bounded: at most two weeks of day-steps.
        for _ in 0..15 {
            let weekday = local.weekday().number_from_monday() as u8;
            if !self.allowed_weekdays.contains(&weekday) {
                local = self.at_hour(local.date_naive().succ_opt().unwrap_or(local.date_naive()), self.start_hour);
                continue;
            }
            if local.hour() < self.start_hour {
                local = self.at_hour(local.date_naive(), self.start_hour);
                continue;
            }
            if local.hour() >= self.end_hour {
                local = self.at_hour(local.date_naive().succ_opt().unwrap_or(local.date_naive()), self.start_hour);
                continue;
            }
            break;
        }
        local.with_timezone(&Utc)
    }

    /// Start of the next civil day's window.
    pub fn next_day(&self, from: DateTime<Utc>) -> DateTime<Utc> {
        let local = from.with_timezone(&self.tz);
        let tomorrow = local
            .date_naive()
            .succ_opt()
            .unwrap_or(local.date_naive());
        self.next_valid(self.at_hour(tomorrow, self.start_hour).with_timezone(&Utc))
    }

    /// Civil day of `at` in the configured zone (for daily caps).
    pub fn civil_day(&self, at: DateTime<Utc>) -> NaiveDate {
        at.with_timezone(&self.tz).date_naive()
    }

    fn at_hour(&self, date: NaiveDate, hour: u32) -> DateTime<Tz> {
        let naive = date
            .and_hms_opt(hour, 0, 0)
            .unwrap_or_else(|| date.and_hms_opt(0, 0, 0).expect("midnight is valid"));
        self.tz
            .from_local_datetime(&naive)
            .earliest()
            .unwrap_or_else(|| self.tz.from_utc_datetime(&naive))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Weekday;

    fn window() -> ScheduleWindow {
        ScheduleWindow {
            start_hour: 9,
            end_hour: 21,
            allowed_weekdays: vec![1, 2, 3, 4, 5, 6],
            tz: chrono_tz::America::Argentina::Cordoba,
        }
    }

    fn cordoba(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        chrono_tz::America::Argentina::Cordoba
            .with_ymd_and_hms(y, m, d, h, 0, 0)
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn offsets_are_monotone() {
        let mut previous = 0;
        for stage in 0..=TERMINAL_STAGE {
            let offset = offset_hours(stage).unwrap();
            assert!(offset > previous, "stage {stage} offset must grow");
            previous = offset;
        }
        assert!(offset_hours(14).is_none());
    }

    #[test]
    fn stage_zero_is_one_hour() {
        assert_eq!(offset_hours(0), Some(1));
        assert_eq!(offset_hours(12), Some(1584));
        assert_eq!(offset_hours(13), Some(1584 + 360));
    }

    #[test]
    fn window_contains_business_hours() {
        // 2026-07-01 is a Wednesday.
        assert_eq!(
            cordoba(2026, 7, 1, 12).with_timezone(&chrono_tz::America::Argentina::Cordoba).weekday(),
            Weekday::Wed
        );
        assert!(window().contains(cordoba(2026, 7, 1, 12)));
        assert!(!window().contains(cordoba(2026, 7, 1, 8)));
        assert!(!window().contains(cordoba(2026, 7, 1, 22)));
    }

    #[test]
    fn sunday_is_excluded() {
        // 2026-07-05 is a Sunday.
        assert!(!window().contains(cordoba(2026, 7, 5, 12)));
    }

    #[test]
    fn next_valid_inside_window_is_identity() {
        let at = cordoba(2026, 7, 1, 12);
        assert_eq!(window().next_valid(at), at);
    }

    #[test]
    fn next_valid_early_morning_moves_to_start_hour() {
        let adjusted = window().next_valid(cordoba(2026, 7, 1, 6));
        assert_eq!(adjusted, cordoba(2026, 7, 1, 9));
    }

    #[test]
    fn next_valid_late_night_moves_to_next_morning() {
        let adjusted = window().next_valid(cordoba(2026, 7, 1, 22));
        assert_eq!(adjusted, cordoba(2026, 7, 2, 9));
    }

    #[test]
    fn next_valid_sunday_moves_to_monday() {
        let adjusted = window().next_valid(cordoba(2026, 7, 5, 12));
        assert_eq!(adjusted, cordoba(2026, 7, 6, 9));
    }

    #[test]
    fn saturday_night_skips_sunday_entirely() {
        // Saturday 2026-07-04 at 22:00 -> Monday 09:00.
        let adjusted = window().next_valid(cordoba(2026, 7, 4, 22));
        assert_eq!(adjusted, cordoba(2026, 7, 6, 9));
    }

    #[test]
    fn civil_day_uses_configured_zone() {
        // 01:00 UTC is still the previous civil day in Cordoba (UTC-3).
        let at = Utc.with_ymd_and_hms(2026, 7, 2, 1, 0, 0).unwrap();
        assert_eq!(
            window().civil_day(at),
            NaiveDate::from_ymd_opt(2026, 7, 1).unwrap()
        );
    }

    #[test]
    fn next_day_lands_on_next_allowed_morning() {
        let from = cordoba(2026, 7, 4, 12); // Saturday noon.
        assert_eq!(window().next_day(from), cordoba(2026, 7, 6, 9)); // Monday.
    }
}
