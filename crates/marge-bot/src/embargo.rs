//! Embargo calendar
//!
//! Parses human-readable weekly windows like `Friday 18:00 - Monday 09:00
//! UTC` (also `Friday 6pm - Monday 9am Europe/London`) and answers whether
//! a given instant falls inside any of them. Overlapping windows union;
//! the worker sleeps the whole union out.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Datelike, Timelike, Utc, Weekday};
use chrono_tz::Tz;
use std::fmt;
use std::time::Duration;

const MINUTES_PER_WEEK: u32 = 7 * 24 * 60;

/// One point in the weekly cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct WeekTime {
    weekday: Weekday,
    hour: u32,
    minute: u32,
}

impl WeekTime {
    fn minute_of_week(self) -> u32 {
        self.weekday.num_days_from_monday() * 24 * 60 + self.hour * 60 + self.minute
    }
}

impl fmt::Display for WeekTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let day = match self.weekday {
            Weekday::Mon => "Monday",
            Weekday::Tue => "Tuesday",
            Weekday::Wed => "Wednesday",
            Weekday::Thu => "Thursday",
            Weekday::Fri => "Friday",
            Weekday::Sat => "Saturday",
            Weekday::Sun => "Sunday",
        };
        write!(f, "{day} {:02}:{:02}", self.hour, self.minute)
    }
}

/// A half-open weekly window `[from, to)` in a named timezone.
///
/// Windows may wrap the week boundary (`Friday .. Monday`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeeklyInterval {
    from: WeekTime,
    to: WeekTime,
    tz: Tz,
}

impl WeeklyInterval {
    /// Parse `Weekday HH:MM - Weekday HH:MM [TZ]`.
    ///
    /// 12-hour forms (`6pm`, `9:30am`) are accepted; the timezone
    /// defaults to UTC.
    pub fn from_human(raw: &str) -> Result<WeeklyInterval> {
        let (body, tz) = split_timezone(raw)?;
        let (from_raw, to_raw) = body
            .split_once('-')
            .with_context(|| format!("embargo {raw:?} has no `-` separator"))?;
        Ok(WeeklyInterval {
            from: parse_week_time(from_raw.trim())?,
            to: parse_week_time(to_raw.trim())?,
            tz,
        })
    }

    /// Whether `now` falls inside the window.
    pub fn covers(&self, now: DateTime<Utc>) -> bool {
        let minute = self.local_minute_of_week(now);
        let from = self.from.minute_of_week();
        let to = self.to.minute_of_week();
        if from <= to {
            (from..to).contains(&minute)
        } else {
            minute >= from || minute < to
        }
    }

    /// Minutes until the window next releases `now`; zero when outside.
    fn minutes_until_clear(&self, now: DateTime<Utc>) -> u32 {
        if !self.covers(now) {
            return 0;
        }
        let minute = self.local_minute_of_week(now);
        let to = self.to.minute_of_week();
        (to + MINUTES_PER_WEEK - minute) % MINUTES_PER_WEEK
    }

    fn local_minute_of_week(&self, now: DateTime<Utc>) -> u32 {
        let local = now.with_timezone(&self.tz);
        local.weekday().num_days_from_monday() * 24 * 60 + local.hour() * 60 + local.minute()
    }
}

impl fmt::Display for WeeklyInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} - {} {}", self.from, self.to, self.tz.name())
    }
}

fn split_timezone(raw: &str) -> Result<(&str, Tz)> {
    let trimmed = raw.trim();
    if let Some(idx) = trimmed.rfind(char::is_whitespace) {
        let candidate = &trimmed[idx + 1..];
        // A trailing token is a timezone if chrono-tz knows it; otherwise
        // it's part of the time ("... 9am").
        if let Ok(tz) = candidate.parse::<Tz>() {
            return Ok((&trimmed[..idx], tz));
        }
    }
    Ok((trimmed, Tz::UTC))
}

fn parse_week_time(raw: &str) -> Result<WeekTime> {
    let (day_raw, time_raw) = raw
        .split_once(char::is_whitespace)
        .with_context(|| format!("expected `Weekday HH:MM`, got {raw:?}"))?;
    let weekday = parse_weekday(day_raw.trim())?;
    let (hour, minute) = parse_time(time_raw.trim())?;
    Ok(WeekTime {
        weekday,
        hour,
        minute,
    })
}

fn parse_weekday(raw: &str) -> Result<Weekday> {
    let lower = raw.to_lowercase();
    let day = match lower.as_str() {
        "mon" | "monday" => Weekday::Mon,
        "tue" | "tues" | "tuesday" => Weekday::Tue,
        "wed" | "wednesday" => Weekday::Wed,
        "thu" | "thur" | "thurs" | "thursday" => Weekday::Thu,
        "fri" | "friday" => Weekday::Fri,
        "sat" | "saturday" => Weekday::Sat,
        "sun" | "sunday" => Weekday::Sun,
        _ => bail!("unknown weekday {raw:?}"),
    };
    Ok(day)
}

fn parse_time(raw: &str) -> Result<(u32, u32)> {
    let lower = raw.to_lowercase();
    let (digits, meridiem) = if let Some(stripped) = lower.strip_suffix("am") {
        (stripped.trim(), Some(false))
    } else if let Some(stripped) = lower.strip_suffix("pm") {
        (stripped.trim(), Some(true))
    } else {
        (lower.as_str(), None)
    };

    let (h_raw, m_raw) = match digits.split_once(':') {
        Some((h, m)) => (h, m),
        None => (digits, "0"),
    };
    let mut hour: u32 = h_raw.parse().with_context(|| format!("bad hour in {raw:?}"))?;
    let minute: u32 = m_raw
        .parse()
        .with_context(|| format!("bad minute in {raw:?}"))?;

    match meridiem {
        Some(pm) => {
            if hour == 0 || hour > 12 {
                bail!("12-hour time out of range: {raw:?}");
            }
            hour %= 12;
            if pm {
                hour += 12;
            }
        }
        None => {
            if hour > 23 {
                bail!("hour out of range: {raw:?}");
            }
        }
    }
    if minute > 59 {
        bail!("minute out of range: {raw:?}");
    }
    Ok((hour, minute))
}

/// The union of all configured embargo windows.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntervalUnion {
    intervals: Vec<WeeklyInterval>,
}

impl IntervalUnion {
    pub fn empty() -> IntervalUnion {
        IntervalUnion::default()
    }

    pub fn parse(raw: &[String]) -> Result<IntervalUnion> {
        let intervals = raw
            .iter()
            .map(|s| WeeklyInterval::from_human(s))
            .collect::<Result<Vec<_>>>()?;
        Ok(IntervalUnion { intervals })
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    pub fn covers(&self, now: DateTime<Utc>) -> bool {
        self.intervals.iter().any(|i| i.covers(now))
    }

    /// How long until every window in the union has released `now`.
    ///
    /// Chained windows are walked to a fixpoint: leaving one window
    /// directly into another extends the wait.
    pub fn wait_until_clear(&self, now: DateTime<Utc>) -> Duration {
        let mut t = now;
        for _ in 0..=self.intervals.len() {
            let worst = self
                .intervals
                .iter()
                .map(|i| i.minutes_until_clear(t))
                .max()
                .unwrap_or(0);
            if worst == 0 {
                break;
            }
            t += chrono::Duration::minutes(i64::from(worst));
        }
        (t - now).to_std().unwrap_or(Duration::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn test_parse_24h_form() {
        let i = WeeklyInterval::from_human("Friday 18:00 - Monday 09:00 UTC").unwrap();
        assert_eq!(i.to_string(), "Friday 18:00 - Monday 09:00 UTC");
    }

    #[test]
    fn test_parse_12h_form() {
        let i = WeeklyInterval::from_human("Friday 6pm - Monday 9am").unwrap();
        assert_eq!(i.to_string(), "Friday 18:00 - Monday 09:00 UTC");

        let noonish = WeeklyInterval::from_human("Sat 12pm - Sat 11:30pm").unwrap();
        assert_eq!(noonish.to_string(), "Saturday 12:00 - Saturday 23:30 UTC");

        let midnight = WeeklyInterval::from_human("Sun 12am - Sun 1am").unwrap();
        assert_eq!(midnight.to_string(), "Sunday 00:00 - Sunday 01:00 UTC");
    }

    #[test]
    fn test_render_parse_round_trip() {
        for raw in [
            "Friday 18:00 - Monday 09:00 UTC",
            "Tue 1pm - Wed 2:15pm Europe/London",
            "Sunday 23:00 - Monday 01:00 UTC",
        ] {
            let parsed = WeeklyInterval::from_human(raw).unwrap();
            let reparsed = WeeklyInterval::from_human(&parsed.to_string()).unwrap();
            assert_eq!(parsed, reparsed);
        }
    }

    #[test]
    fn test_wraparound_weekend_window() {
        let i = WeeklyInterval::from_human("Friday 18:00 - Monday 09:00 UTC").unwrap();
        // 2021-01-02 was a Saturday.
        assert!(i.covers(at(2021, 1, 2, 12, 0)));
        // Friday morning is outside.
        assert!(!i.covers(at(2021, 1, 1, 12, 0)));
        // Monday 09:00 sharp is already clear (half-open).
        assert!(!i.covers(at(2021, 1, 4, 9, 0)));
        assert!(i.covers(at(2021, 1, 4, 8, 59)));
    }

    #[test]
    fn test_wait_until_clear_saturday_noon() {
        let union = IntervalUnion::parse(&["Friday 18:00 - Monday 09:00 UTC".to_string()]).unwrap();
        // Saturday 12:00 -> Monday 09:00 is 45 hours.
        let wait = union.wait_until_clear(at(2021, 1, 2, 12, 0));
        assert_eq!(wait, Duration::from_secs(45 * 3600));
    }

    #[test]
    fn test_overlapping_windows_union() {
        let union = IntervalUnion::parse(&[
            "Friday 18:00 - Saturday 18:00 UTC".to_string(),
            "Saturday 12:00 - Monday 09:00 UTC".to_string(),
        ])
        .unwrap();
        // Saturday 13:00 sits in both; the union releases Monday 09:00.
        let wait = union.wait_until_clear(at(2021, 1, 2, 13, 0));
        assert_eq!(wait, Duration::from_secs(44 * 3600));
    }

    #[test]
    fn test_chained_windows_walk_to_fixpoint() {
        let union = IntervalUnion::parse(&[
            "Friday 18:00 - Saturday 12:00 UTC".to_string(),
            "Saturday 12:00 - Sunday 12:00 UTC".to_string(),
        ])
        .unwrap();
        // Inside the first window; leaving it lands in the second.
        let wait = union.wait_until_clear(at(2021, 1, 1, 20, 0));
        assert_eq!(wait, Duration::from_secs(40 * 3600));
    }

    #[test]
    fn test_empty_union_never_covers() {
        let union = IntervalUnion::empty();
        assert!(!union.covers(at(2021, 1, 2, 12, 0)));
        assert_eq!(union.wait_until_clear(at(2021, 1, 2, 12, 0)), Duration::ZERO);
    }

    #[test]
    fn test_named_timezone_shifts_window() {
        // 17:30 UTC in winter is 18:30 in Europe/Berlin (inside).
        let i = WeeklyInterval::from_human("Friday 18:00 - Friday 20:00 Europe/Berlin").unwrap();
        assert!(i.covers(at(2021, 1, 1, 17, 30)));
        assert!(!i.covers(at(2021, 1, 1, 19, 30)));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(WeeklyInterval::from_human("whenever").is_err());
        assert!(WeeklyInterval::from_human("Blursday 10:00 - Friday 11:00").is_err());
        assert!(WeeklyInterval::from_human("Friday 25:00 - Friday 26:00").is_err());
        assert!(WeeklyInterval::from_human("Friday 13pm - Saturday 9am").is_err());
    }
}
