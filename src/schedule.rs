use anyhow::Result;
use chrono::{DateTime, Duration, DurationRound, Utc};
use diesel::pg::PgConnection;
use diesel::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Mutex;
use tracing::warn;

use crate::hours::BusinessHours;
use crate::models::{step_timing, step_type, SequenceStep};

pub const DEFAULT_STEP_DELAY_MINUTES: i64 = 30;
pub const DEMO_MAX_DELAY_MINUTES: i64 = 8 * 60;
pub const MAX_EMAILS_PER_MINUTE: i64 = 50;
pub const MAX_EMAILS_PER_HOUR: i64 = 1000;
pub const DISTRIBUTION_WINDOW_MINUTES: i64 = 15;
const RATE_WINDOW_RETRIES: usize = 5;

/// How many sends are already scheduled around a candidate instant.
///
/// Backed by the store in production; tests substitute fixed counts.
pub trait RateWindow {
    fn scheduled_in_minute(&mut self, at: DateTime<Utc>) -> Result<i64>;
    fn scheduled_in_hour(&mut self, at: DateTime<Utc>) -> Result<i64>;
}

/// Counts pending `sequence_contacts` rows whose `next_scheduled_at` falls
/// in the same minute or hour as the candidate.
pub struct StoredRateWindow<'a> {
    conn: &'a mut PgConnection,
}

impl<'a> StoredRateWindow<'a> {
    pub fn new(conn: &'a mut PgConnection) -> Self {
        Self { conn }
    }

    fn count_between(&mut self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<i64> {
        use crate::schema::sequence_contacts::dsl::*;
        let count = sequence_contacts
            .filter(completed_at.is_null())
            .filter(next_scheduled_at.ge(from.naive_utc()))
            .filter(next_scheduled_at.lt(to.naive_utc()))
            .count()
            .get_result(self.conn)?;
        Ok(count)
    }
}

impl RateWindow for StoredRateWindow<'_> {
    fn scheduled_in_minute(&mut self, at: DateTime<Utc>) -> Result<i64> {
        let start = at.duration_trunc(Duration::minutes(1))?;
        self.count_between(start, start + Duration::minutes(1))
    }

    fn scheduled_in_hour(&mut self, at: DateTime<Utc>) -> Result<i64> {
        let start = at.duration_trunc(Duration::hours(1))?;
        self.count_between(start, start + Duration::hours(1))
    }
}

/// Turns a step's timing declaration into a concrete future send instant,
/// honoring business hours and the global distribution windows.
pub struct ScheduleGenerator {
    bypass_business_hours: bool,
    demo_mode: bool,
    rng: Mutex<StdRng>,
}

impl ScheduleGenerator {
    pub fn new(demo_mode: bool, bypass_business_hours: bool) -> Self {
        Self {
            demo_mode,
            bypass_business_hours: bypass_business_hours || demo_mode,
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Deterministic generator for tests.
    pub fn seeded(seed: u64, demo_mode: bool, bypass_business_hours: bool) -> Self {
        Self {
            demo_mode,
            bypass_business_hours: bypass_business_hours || demo_mode,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    pub fn next_send_time(
        &self,
        now: DateTime<Utc>,
        step: &SequenceStep,
        hours: Option<&BusinessHours>,
        window: Option<&mut dyn RateWindow>,
    ) -> DateTime<Utc> {
        match self.compute(now, self.base_delay_minutes(step), hours, window) {
            Ok(target) => target,
            Err(err) => {
                warn!(step_id = %step.id, error = %err, "schedule computation failed, deferring one hour");
                now + Duration::hours(1)
            }
        }
    }

    /// Adjustment-only path for rows that are already due: the step delay
    /// was consumed when the schedule was written, so only business hours
    /// and the distribution windows apply.
    pub fn dispatch_time(
        &self,
        now: DateTime<Utc>,
        hours: Option<&BusinessHours>,
        window: Option<&mut dyn RateWindow>,
    ) -> DateTime<Utc> {
        match self.compute(now, 0, hours, window) {
            Ok(target) => target,
            Err(err) => {
                warn!(error = %err, "dispatch adjustment failed, deferring one hour");
                now + Duration::hours(1)
            }
        }
    }

    fn compute(
        &self,
        now: DateTime<Utc>,
        delay_minutes: i64,
        hours: Option<&BusinessHours>,
        window: Option<&mut dyn RateWindow>,
    ) -> Result<DateTime<Utc>> {
        let mut target = now + Duration::minutes(delay_minutes);

        let hours = if self.bypass_business_hours {
            None
        } else {
            hours
        };

        if let Some(hours) = hours {
            if !hours.is_within(target) {
                // Moving everything to opening time would burst at the top
                // of the window; spread arrivals across the business day.
                let start = hours.next_business_start(target);
                let offset = self.random_below(hours.window_minutes());
                target = start + Duration::minutes(offset);
            }
        }

        if let Some(window) = window {
            target = self.spread_across_windows(target, hours, window)?;
        }

        Ok(target)
    }

    fn spread_across_windows(
        &self,
        mut target: DateTime<Utc>,
        hours: Option<&BusinessHours>,
        window: &mut dyn RateWindow,
    ) -> Result<DateTime<Utc>> {
        for _ in 0..RATE_WINDOW_RETRIES {
            if window.scheduled_in_minute(target)? >= MAX_EMAILS_PER_MINUTE {
                target = target + Duration::minutes(self.random_below(DISTRIBUTION_WINDOW_MINUTES));
            } else if window.scheduled_in_hour(target)? >= MAX_EMAILS_PER_HOUR {
                let next_hour = target.duration_trunc(Duration::hours(1))? + Duration::hours(1);
                target = next_hour + Duration::minutes(self.random_below(60));
            } else {
                break;
            }

            if let Some(hours) = hours {
                if !hours.is_within(target) {
                    target = hours.next_business_start(target);
                }
            }
        }
        Ok(target)
    }

    fn base_delay_minutes(&self, step: &SequenceStep) -> i64 {
        let minutes = match step.step_type.as_str() {
            step_type::WAIT => match (step.delay_amount, step.delay_unit.as_deref()) {
                (Some(amount), Some(unit)) => i64::from(amount) * unit_minutes(unit),
                _ => {
                    warn!(step_id = %step.id, "wait step missing delay, using default");
                    DEFAULT_STEP_DELAY_MINUTES
                }
            },
            step_type::MANUAL_EMAIL | step_type::AUTOMATED_EMAIL => {
                match step.timing.as_str() {
                    step_timing::IMMEDIATE => 0,
                    step_timing::DELAY => match step.delay_amount {
                        Some(amount) => {
                            let unit = step.delay_unit.as_deref().unwrap_or_else(|| {
                                warn!(step_id = %step.id, "delay step missing unit, assuming minutes");
                                "minutes"
                            });
                            i64::from(amount) * unit_minutes(unit)
                        }
                        None => {
                            warn!(step_id = %step.id, "delay step missing amount, using default");
                            DEFAULT_STEP_DELAY_MINUTES
                        }
                    },
                    _ => DEFAULT_STEP_DELAY_MINUTES,
                }
            }
            _ => DEFAULT_STEP_DELAY_MINUTES,
        };

        if self.demo_mode {
            minutes.min(DEMO_MAX_DELAY_MINUTES)
        } else {
            minutes
        }
    }

    fn random_below(&self, upper: i64) -> i64 {
        if upper <= 0 {
            return 0;
        }
        let mut rng = self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        rng.gen_range(0..upper)
    }
}

fn unit_minutes(unit: &str) -> i64 {
    match unit {
        "minutes" => 1,
        "hours" => 60,
        "days" => 24 * 60,
        other => {
            warn!(unit = other, "unknown delay unit, assuming minutes");
            1
        }
    }
}
