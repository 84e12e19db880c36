//! Civil-day arithmetic for the rollover schedule.
//!
//! Every "when does date D roll over" question goes through [`deadline_for`],
//! which resolves the configured local wall-clock time in the configured
//! IANA timezone. UTC offsets are never cached, so DST transitions shift the
//! UTC fire instant while the local fire time stays put.

use crate::errors::AppError;
use chrono::offset::LocalResult;
use chrono::{DateTime, Days, Duration, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FireTime {
    hour: u32,
    minute: u32,
}

impl FireTime {
    pub fn new(hour: u32, minute: u32) -> Result<Self, AppError> {
        if hour > 23 || minute > 59 {
            return Err(AppError::Config(format!(
                "fire time {:02}:{:02} is out of range",
                hour, minute
            )));
        }
        Ok(Self { hour, minute })
    }

    pub fn hour(self) -> u32 {
        self.hour
    }

    pub fn minute(self) -> u32 {
        self.minute
    }

    fn as_naive_time(self) -> NaiveTime {
        NaiveTime::from_hms_opt(self.hour, self.minute, 0).unwrap_or_default()
    }
}

impl FromStr for FireTime {
    type Err = AppError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let invalid = || AppError::Config(format!("fire time '{}' must look like HH:MM", raw));
        let (hour, minute) = raw.trim().split_once(':').ok_or_else(invalid)?;
        let hour = hour.parse::<u32>().map_err(|_| invalid())?;
        let minute = minute.parse::<u32>().map_err(|_| invalid())?;
        Self::new(hour, minute)
    }
}

impl fmt::Display for FireTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually driven clock for deterministic scheduling tests.
#[derive(Debug)]
pub struct FixedClock {
    now: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self { now: Mutex::new(now) }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        if let Ok(mut guard) = self.now.lock() {
            *guard = now;
        }
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        match self.now.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

pub fn civil_date(now: DateTime<Utc>, tz: Tz) -> NaiveDate {
    now.with_timezone(&tz).date_naive()
}

/// The UTC instant at which `date` rolls over.
pub fn deadline_for(date: NaiveDate, fire_time: FireTime, tz: Tz) -> DateTime<Utc> {
    resolve_local(tz, date.and_time(fire_time.as_naive_time()))
}

/// Ambiguous local times (fall-back) take the earlier instant; times inside a
/// spring-forward gap move to the first valid minute after the gap.
fn resolve_local(tz: Tz, naive: NaiveDateTime) -> DateTime<Utc> {
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(at) => at.with_timezone(&Utc),
        LocalResult::Ambiguous(earliest, _) => earliest.with_timezone(&Utc),
        LocalResult::None => {
            let mut probe = naive;
            for _ in 0..(24 * 60) {
                probe += Duration::minutes(1);
                if let Some(at) = tz.from_local_datetime(&probe).earliest() {
                    return at.with_timezone(&Utc);
                }
            }
            Utc.from_utc_datetime(&naive)
        }
    }
}

/// Next (civil date, UTC instant) the trigger should fire for.
///
/// A date at or before `last_fired` is never returned. A fire instant that is
/// at most `grace` in the past is still returned so it fires immediately.
pub fn next_fire(
    now: DateTime<Utc>,
    fire_time: FireTime,
    tz: Tz,
    last_fired: Option<NaiveDate>,
    grace: Duration,
) -> (NaiveDate, DateTime<Utc>) {
    let mut date = civil_date(now, tz);
    loop {
        let at = deadline_for(date, fire_time, tz);
        let already_fired = last_fired.is_some_and(|last| date <= last);
        if !already_fired && at + grace >= now {
            return (date, at);
        }
        date = date + Days::new(1);
    }
}

#[cfg(test)]
mod tests {
    use super::{civil_date, deadline_for, next_fire, FireTime};
    use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
    use chrono_tz::America::New_York;
    use std::collections::BTreeMap;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("date")
    }

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).single().expect("utc")
    }

    #[test]
    fn fire_time_parses_and_rejects_garbage() {
        let parsed: FireTime = "07:05".parse().expect("parse");
        assert_eq!(parsed, FireTime::new(7, 5).expect("new"));
        assert_eq!(parsed.to_string(), "07:05");
        assert!("24:00".parse::<FireTime>().is_err());
        assert!("noon".parse::<FireTime>().is_err());
        assert!("12:60".parse::<FireTime>().is_err());
    }

    #[test]
    fn civil_date_follows_configured_timezone() {
        // 03:00 UTC is still the previous evening in New York.
        assert_eq!(civil_date(utc(2024, 6, 2, 3, 0), New_York), date(2024, 6, 1));
        assert_eq!(civil_date(utc(2024, 6, 2, 3, 0), chrono_tz::UTC), date(2024, 6, 2));
    }

    #[test]
    fn deadline_uses_current_offset_on_each_side_of_dst() {
        let fire = FireTime::new(0, 30).expect("fire");
        assert_eq!(deadline_for(date(2024, 3, 9), fire, New_York), utc(2024, 3, 9, 5, 30));
        assert_eq!(deadline_for(date(2024, 3, 11), fire, New_York), utc(2024, 3, 11, 4, 30));
    }

    #[test]
    fn deadline_inside_spring_forward_gap_moves_past_the_gap() {
        let fire = FireTime::new(2, 30).expect("fire");
        // 02:30 does not exist on 2024-03-10 in New York; 03:00 EDT is 07:00 UTC.
        assert_eq!(deadline_for(date(2024, 3, 10), fire, New_York), utc(2024, 3, 10, 7, 0));
    }

    #[test]
    fn ambiguous_fall_back_time_fires_once_at_the_earlier_instant() {
        let fire = FireTime::new(1, 30).expect("fire");
        let grace = Duration::seconds(60);
        let first = deadline_for(date(2024, 11, 3), fire, New_York);
        assert_eq!(first, utc(2024, 11, 3, 5, 30));

        // The second 01:30 (EST) arrives an hour later but must not refire.
        let (next_date, next_at) = next_fire(
            utc(2024, 11, 3, 6, 30),
            fire,
            New_York,
            Some(date(2024, 11, 3)),
            grace,
        );
        assert_eq!(next_date, date(2024, 11, 4));
        assert_eq!(next_at, utc(2024, 11, 4, 6, 30));
    }

    #[test]
    fn fires_exactly_once_per_civil_day_across_dst_transition() {
        let fire = FireTime::new(0, 30).expect("fire");
        let grace = Duration::seconds(60);
        let mut now = utc(2024, 3, 7, 12, 0);
        let mut last_fired = None;
        let mut fired: BTreeMap<NaiveDate, DateTime<Utc>> = BTreeMap::new();

        for _ in 0..7 {
            let (target, at) = next_fire(now, fire, New_York, last_fired, grace);
            assert!(fired.insert(target, at).is_none(), "fired twice for {target}");
            last_fired = Some(target);
            now = at + Duration::seconds(1);
        }

        let dates: Vec<_> = fired.keys().copied().collect();
        let expected: Vec<_> = (8..=14).map(|day| date(2024, 3, day)).collect();
        assert_eq!(dates, expected);
        assert_eq!(fired[&date(2024, 3, 10)], utc(2024, 3, 10, 5, 30));
        assert_eq!(fired[&date(2024, 3, 11)], utc(2024, 3, 11, 4, 30));
        assert_eq!(
            fired[&date(2024, 3, 11)] - fired[&date(2024, 3, 10)],
            Duration::hours(23)
        );
    }

    #[test]
    fn fire_time_just_passed_is_due_within_grace_only() {
        let fire = FireTime::new(22, 0).expect("fire");
        let grace = Duration::seconds(60);
        let deadline = utc(2024, 6, 1, 22, 0);
        let tz = chrono_tz::UTC;

        let (due_date, due_at) = next_fire(deadline + Duration::seconds(30), fire, tz, None, grace);
        assert_eq!((due_date, due_at), (date(2024, 6, 1), deadline));

        let (late_date, _) = next_fire(deadline + Duration::minutes(5), fire, tz, None, grace);
        assert_eq!(late_date, date(2024, 6, 2));
    }
}
