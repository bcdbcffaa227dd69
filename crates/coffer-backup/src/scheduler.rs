// Copyright (c) 2024 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Minimal round scheduler: one timer, a 5-field cron subset, and a
//! skip-on-overlap policy.
//!
//! The driver owns a single timer and awaits each round to completion, so
//! two scheduled rounds never run at once; ticks that would have fired
//! while a round was still running are skipped and logged.

use std::{future::Future, str::FromStr, time::Duration};

use chrono::{DateTime, Datelike, Timelike, Utc};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    error::{BackupError, BackupResult},
    remote_path::truncate_to_minute,
};

/// `minute hour day-of-month month day-of-week`, supporting `*`, single
/// values, ranges, `*/step`, `range/step` and comma lists. Standard cron
/// day matching: when both day fields are restricted, either may match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    minutes: Vec<u8>,
    hours: Vec<u8>,
    days_of_month: Vec<u8>,
    months: Vec<u8>,
    days_of_week: Vec<u8>,
    dom_restricted: bool,
    dow_restricted: bool,
}

impl FromStr for CronExpr {
    type Err = BackupError;

    fn from_str(expr: &str) -> BackupResult<Self> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(BackupError::Config(format!(
                "cron expression needs 5 fields, got {}: {expr:?}",
                fields.len()
            )));
        }
        Ok(Self {
            minutes: parse_field(fields[0], 0, 59)?,
            hours: parse_field(fields[1], 0, 23)?,
            days_of_month: parse_field(fields[2], 1, 31)?,
            months: parse_field(fields[3], 1, 12)?,
            days_of_week: parse_field(fields[4], 0, 6)?,
            dom_restricted: fields[2] != "*",
            dow_restricted: fields[4] != "*",
        })
    }
}

impl CronExpr {
    pub fn matches(&self, time: DateTime<Utc>) -> bool {
        let minute = time.minute() as u8;
        let hour = time.hour() as u8;
        let day_of_month = time.day() as u8;
        let month = time.month() as u8;
        // chrono Sunday=7 under weekday number; cron wants Sunday=0
        let day_of_week = (time.weekday().num_days_from_sunday()) as u8;

        if !self.minutes.contains(&minute)
            || !self.hours.contains(&hour)
            || !self.months.contains(&month)
        {
            return false;
        }
        let dom_ok = self.days_of_month.contains(&day_of_month);
        let dow_ok = self.days_of_week.contains(&day_of_week);
        match (self.dom_restricted, self.dow_restricted) {
            (true, true) => dom_ok || dow_ok,
            (true, false) => dom_ok,
            (false, true) => dow_ok,
            (false, false) => true,
        }
    }

    /// First matching minute strictly after `time`. Cron fields always
    /// recur within 366 days; `None` means the expression is
    /// unsatisfiable (e.g. Feb 30).
    pub fn next_after(&self, time: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut candidate = truncate_to_minute(time) + chrono::Duration::minutes(1);
        let limit = candidate + chrono::Duration::days(366);
        while candidate < limit {
            if self.matches(candidate) {
                return Some(candidate);
            }
            candidate += chrono::Duration::minutes(1);
        }
        None
    }
}

fn parse_field(field: &str, min: u8, max: u8) -> BackupResult<Vec<u8>> {
    let mut values = vec![];
    for part in field.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u8 = step.parse().map_err(|_| bad_field(field))?;
                if step == 0 {
                    return Err(bad_field(field));
                }
                (range, step)
            }
            None => (part, 1),
        };
        let (start, end) = if range == "*" {
            (min, max)
        } else {
            match range.split_once('-') {
                Some((start, end)) => (
                    start.parse().map_err(|_| bad_field(field))?,
                    end.parse().map_err(|_| bad_field(field))?,
                ),
                None => {
                    let value: u8 = range.parse().map_err(|_| bad_field(field))?;
                    // a bare value with a step means "every step from value"
                    if part.contains('/') { (value, max) } else { (value, value) }
                }
            }
        };
        if start < min || end > max || start > end {
            return Err(bad_field(field));
        }
        values.extend((start..=end).step_by(step as usize));
    }
    values.sort_unstable();
    values.dedup();
    Ok(values)
}

fn bad_field(field: &str) -> BackupError {
    BackupError::Config(format!("invalid cron field {field:?}"))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Schedule {
    Cron(CronExpr),
    Interval(Duration),
}

impl Schedule {
    pub fn cron(expr: &str) -> BackupResult<Self> {
        Ok(Schedule::Cron(expr.parse()?))
    }

    fn delay_from(&self, now: DateTime<Utc>) -> Option<Duration> {
        match self {
            Schedule::Interval(interval) => Some(*interval),
            Schedule::Cron(expr) => {
                let next = expr.next_after(now)?;
                (next - now).to_std().ok().or(Some(Duration::ZERO))
            }
        }
    }
}

/// Fires `round` at every schedule tick until cancelled. Each invocation
/// is awaited, so rounds are serialized here; a tick whose slot was
/// consumed by a still-running round is skipped with a warning.
pub async fn run_schedule<F, Fut, R>(schedule: Schedule, token: CancellationToken, mut round: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = R>,
{
    loop {
        let now = Utc::now();
        let Some(delay) = schedule.delay_from(now) else {
            warn!("schedule will never fire again, stopping the driver");
            return;
        };
        tokio::select! {
            _ = token.cancelled() => return,
            _ = sleep(delay) => {}
        }
        let started = Utc::now();
        round().await;
        // ticks that elapsed while the round ran are gone; say so
        if let Some(missed) = schedule.delay_from(started) {
            if Utc::now() > started + chrono::Duration::from_std(missed).unwrap_or_default() {
                warn!("RoundSkipped: round overran its schedule slot");
            }
        }
        info!("round finished, next tick pending");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use chrono::TimeZone;

    use super::*;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn parses_common_expressions() {
        let nightly: CronExpr = "30 2 * * *".parse().unwrap();
        assert!(nightly.matches(at(2018, 6, 5, 2, 30)));
        assert!(!nightly.matches(at(2018, 6, 5, 2, 31)));

        let every_15: CronExpr = "*/15 * * * *".parse().unwrap();
        assert!(every_15.matches(at(2018, 6, 5, 9, 45)));
        assert!(!every_15.matches(at(2018, 6, 5, 9, 50)));

        let weekdays: CronExpr = "0 12 * * 1-5".parse().unwrap();
        // 2018-06-04 was a Monday
        assert!(weekdays.matches(at(2018, 6, 4, 12, 0)));
        assert!(!weekdays.matches(at(2018, 6, 3, 12, 0)));

        let lists: CronExpr = "0 0,12 1,15 * *".parse().unwrap();
        assert!(lists.matches(at(2018, 6, 15, 12, 0)));
        assert!(!lists.matches(at(2018, 6, 14, 12, 0)));
    }

    #[test]
    fn rejects_malformed_expressions() {
        for expr in ["* * * *", "61 * * * *", "* 24 * * *", "a * * * *", "*/0 * * * *"] {
            assert!(
                expr.parse::<CronExpr>().is_err(),
                "expected parse error for {expr:?}"
            );
        }
    }

    #[test]
    fn next_after_finds_the_following_tick() {
        let nightly: CronExpr = "30 2 * * *".parse().unwrap();
        assert_eq!(
            nightly.next_after(at(2018, 6, 5, 2, 30)),
            Some(at(2018, 6, 6, 2, 30))
        );
        assert_eq!(
            nightly.next_after(at(2018, 6, 5, 1, 0)),
            Some(at(2018, 6, 5, 2, 30))
        );
    }

    #[test]
    fn restricted_day_fields_match_either_way() {
        // the 1st of the month OR any Monday
        let either: CronExpr = "0 0 1 * 1".parse().unwrap();
        assert!(either.matches(at(2018, 6, 1, 0, 0)));
        assert!(either.matches(at(2018, 6, 4, 0, 0)));
        assert!(!either.matches(at(2018, 6, 5, 0, 0)));
    }

    #[tokio::test(start_paused = true)]
    async fn interval_schedule_fires_until_cancelled() {
        let fired = Arc::new(AtomicUsize::new(0));
        let token = CancellationToken::new();
        let handle = {
            let fired = fired.clone();
            let token = token.clone();
            tokio::spawn(run_schedule(
                Schedule::Interval(Duration::from_secs(60)),
                token,
                move || {
                    let fired = fired.clone();
                    async move {
                        fired.fetch_add(1, Ordering::SeqCst);
                    }
                },
            ))
        };
        tokio::time::sleep(Duration::from_secs(310)).await;
        token.cancel();
        handle.await.unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 5);
    }
}
