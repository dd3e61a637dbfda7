use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Utc, Weekday};
use chrono_tz::Tz;
use diesel::pg::PgConnection;
use diesel::prelude::*;

use crate::models::{BusinessHoursRow, Sequence};

/// Weekly send window in a fixed IANA timezone, with date-level holidays.
///
/// Work days use ISO numbering (1 = Monday .. 7 = Sunday) in the stored
/// JSON and are parsed into `chrono::Weekday` here.
#[derive(Debug, Clone)]
pub struct BusinessHours {
    pub timezone: Tz,
    pub work_days: Vec<Weekday>,
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub holidays: Vec<NaiveDate>,
}

impl BusinessHours {
    pub fn from_row(row: &BusinessHoursRow) -> Result<Self> {
        let timezone: Tz = row
            .timezone
            .parse()
            .map_err(|_| anyhow!("unknown timezone: {}", row.timezone))?;

        let work_days = row
            .work_days
            .as_array()
            .ok_or_else(|| anyhow!("work_days must be an array"))?
            .iter()
            .filter_map(|value| value.as_u64())
            .map(iso_weekday)
            .collect::<Result<Vec<_>>>()?;
        if work_days.is_empty() {
            return Err(anyhow!("work_days must not be empty"));
        }

        let start = parse_wall_clock(&row.work_hours_start)
            .with_context(|| format!("bad work_hours_start: {}", row.work_hours_start))?;
        let end = parse_wall_clock(&row.work_hours_end)
            .with_context(|| format!("bad work_hours_end: {}", row.work_hours_end))?;
        if end <= start {
            return Err(anyhow!("work hours must end after they start"));
        }

        let holidays = match row.holidays.as_array() {
            Some(values) => values
                .iter()
                .filter_map(|value| value.as_str())
                .map(|raw| {
                    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                        .with_context(|| format!("bad holiday date: {raw}"))
                })
                .collect::<Result<Vec<_>>>()?,
            None => Vec::new(),
        };

        Ok(Self {
            timezone,
            work_days,
            start,
            end,
            holidays,
        })
    }

    pub fn window_minutes(&self) -> i64 {
        (self.end - self.start).num_minutes()
    }

    pub fn is_work_day(&self, date: NaiveDate) -> bool {
        self.work_days.contains(&date.weekday()) && !self.holidays.contains(&date)
    }

    /// Whether `instant` falls inside the window on a valid business day.
    /// The window is half-open: `start <= t < end`.
    pub fn is_within(&self, instant: DateTime<Utc>) -> bool {
        let local = instant.with_timezone(&self.timezone);
        let time = local.time();
        self.is_work_day(local.date_naive()) && time >= self.start && time < self.end
    }

    /// The next instant at `start` wall-clock on a valid business day at or
    /// after `after`. Scans at most 14 days; past that the input is
    /// returned unchanged.
    pub fn next_business_start(&self, after: DateTime<Utc>) -> DateTime<Utc> {
        let local = after.with_timezone(&self.timezone);
        for offset in 0..=14 {
            let date = local.date_naive() + Duration::days(offset);
            if !self.is_work_day(date) {
                continue;
            }
            if offset == 0 && local.time() >= self.start {
                continue;
            }
            return self.local_instant(date, self.start);
        }
        after
    }

    /// Resolve a local wall-clock time to UTC, taking the earlier side of a
    /// DST fold and skipping forward across a DST gap.
    pub fn local_instant(&self, date: NaiveDate, time: NaiveTime) -> DateTime<Utc> {
        match self.timezone.from_local_datetime(&date.and_time(time)) {
            chrono::LocalResult::Single(instant) => instant.with_timezone(&Utc),
            chrono::LocalResult::Ambiguous(earlier, _) => earlier.with_timezone(&Utc),
            chrono::LocalResult::None => {
                let shifted = date.and_time(time) + Duration::hours(1);
                match self.timezone.from_local_datetime(&shifted) {
                    chrono::LocalResult::Single(instant) => instant.with_timezone(&Utc),
                    chrono::LocalResult::Ambiguous(earlier, _) => earlier.with_timezone(&Utc),
                    chrono::LocalResult::None => Utc.from_utc_datetime(&date.and_time(time)),
                }
            }
        }
    }
}

/// Effective window for a sequence: sequence-level configuration wins
/// over the owner's user-level default.
pub fn load_for_sequence(
    conn: &mut PgConnection,
    sequence: &Sequence,
) -> Result<Option<BusinessHours>> {
    use crate::schema::business_hours;

    let row = business_hours::table
        .filter(business_hours::sequence_id.eq(sequence.id))
        .first::<BusinessHoursRow>(conn)
        .optional()?;
    let row = match row {
        Some(row) => Some(row),
        None => business_hours::table
            .filter(business_hours::user_id.eq(sequence.user_id))
            .filter(business_hours::sequence_id.is_null())
            .first::<BusinessHoursRow>(conn)
            .optional()?,
    };
    row.map(|row| BusinessHours::from_row(&row)).transpose()
}

fn iso_weekday(value: u64) -> Result<Weekday> {
    match value {
        1 => Ok(Weekday::Mon),
        2 => Ok(Weekday::Tue),
        3 => Ok(Weekday::Wed),
        4 => Ok(Weekday::Thu),
        5 => Ok(Weekday::Fri),
        6 => Ok(Weekday::Sat),
        7 => Ok(Weekday::Sun),
        _ => Err(anyhow!("work day out of range: {value}")),
    }
}

fn parse_wall_clock(raw: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(raw, "%H:%M").map_err(|err| anyhow!("{err}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    fn weekday_row(timezone: &str) -> BusinessHoursRow {
        BusinessHoursRow {
            id: Uuid::new_v4(),
            user_id: None,
            sequence_id: None,
            timezone: timezone.to_string(),
            work_days: json!([1, 2, 3, 4, 5]),
            work_hours_start: "09:00".to_string(),
            work_hours_end: "17:00".to_string(),
            holidays: json!(["2025-12-25"]),
            created_at: Utc::now().naive_utc(),
            updated_at: Utc::now().naive_utc(),
        }
    }

    #[test]
    fn parses_row() {
        let hours = BusinessHours::from_row(&weekday_row("UTC")).unwrap();
        assert_eq!(hours.work_days.len(), 5);
        assert_eq!(hours.window_minutes(), 480);
        assert_eq!(hours.holidays.len(), 1);
    }

    #[test]
    fn rejects_unknown_timezone() {
        assert!(BusinessHours::from_row(&weekday_row("Mars/Olympus")).is_err());
    }

    #[test]
    fn weekday_afternoon_is_within() {
        let hours = BusinessHours::from_row(&weekday_row("UTC")).unwrap();
        // Monday 2025-06-02 14:00 UTC
        let instant = Utc.with_ymd_and_hms(2025, 6, 2, 14, 0, 0).unwrap();
        assert!(hours.is_within(instant));
    }

    #[test]
    fn saturday_is_outside() {
        let hours = BusinessHours::from_row(&weekday_row("UTC")).unwrap();
        let instant = Utc.with_ymd_and_hms(2025, 6, 7, 14, 0, 0).unwrap();
        assert!(!hours.is_within(instant));
    }

    #[test]
    fn holiday_is_outside() {
        let hours = BusinessHours::from_row(&weekday_row("UTC")).unwrap();
        // 2025-12-25 is a Thursday but listed as a holiday.
        let instant = Utc.with_ymd_and_hms(2025, 12, 25, 10, 0, 0).unwrap();
        assert!(!hours.is_within(instant));
    }

    #[test]
    fn friday_evening_advances_to_monday() {
        let hours = BusinessHours::from_row(&weekday_row("UTC")).unwrap();
        // Friday 2025-06-06 17:30 UTC
        let after = Utc.with_ymd_and_hms(2025, 6, 6, 17, 30, 0).unwrap();
        let next = hours.next_business_start(after);
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 6, 9, 9, 0, 0).unwrap());
    }

    #[test]
    fn early_morning_advances_to_same_day_start() {
        let hours = BusinessHours::from_row(&weekday_row("UTC")).unwrap();
        let after = Utc.with_ymd_and_hms(2025, 6, 2, 6, 0, 0).unwrap();
        let next = hours.next_business_start(after);
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 6, 2, 9, 0, 0).unwrap());
    }

    #[test]
    fn respects_timezone_offset() {
        let hours = BusinessHours::from_row(&weekday_row("America/New_York")).unwrap();
        // 12:00 UTC on a June Monday is 08:00 in New York: before opening.
        let instant = Utc.with_ymd_and_hms(2025, 6, 2, 12, 0, 0).unwrap();
        assert!(!hours.is_within(instant));
        // 14:00 UTC is 10:00 local.
        let instant = Utc.with_ymd_and_hms(2025, 6, 2, 14, 0, 0).unwrap();
        assert!(hours.is_within(instant));
    }
}
