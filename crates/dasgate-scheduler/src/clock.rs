//! Wall-clock trigger arithmetic.
//! Computes the wait until the next occurrence of a time of day, restricted
//! to a set of allowed weekdays.
//!
//! Day lists: "always", "weekday", "weekend", "never", or a comma list such as
//! "mo,tu,we" (full and three-letter names work too).

use std::fmt;
use std::time::Duration;

use chrono::{Datelike, Duration as ChronoDuration, NaiveDateTime, NaiveTime, Weekday};

use crate::error::{TaskError, TaskResult};

/// Set of weekdays a clock task may fire on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Weekdays(u8);

impl Weekdays {
    pub const NONE: Weekdays = Weekdays(0);
    pub const ALL: Weekdays = Weekdays(0b111_1111);
    pub const WORKDAYS: Weekdays = Weekdays(0b001_1111);
    pub const WEEKEND: Weekdays = Weekdays(0b110_0000);

    pub fn contains(&self, day: Weekday) -> bool {
        self.0 & (1 << day.num_days_from_monday()) != 0
    }

    pub fn insert(&mut self, day: Weekday) {
        self.0 |= 1 << day.num_days_from_monday();
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Parse a day list.
    pub fn parse(spec: &str) -> TaskResult<Self> {
        let spec = spec.trim().to_lowercase();
        match spec.as_str() {
            "" | "never" | "none" => return Ok(Self::NONE),
            "always" | "all" | "daily" => return Ok(Self::ALL),
            "weekday" | "weekdays" | "workdays" => return Ok(Self::WORKDAYS),
            "weekend" | "weekends" => return Ok(Self::WEEKEND),
            _ => {}
        }
        let mut days = Self::NONE;
        for item in spec.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            days.insert(parse_day(item)?);
        }
        Ok(days)
    }
}

fn parse_day(item: &str) -> TaskResult<Weekday> {
    let day = match item {
        "mo" => Weekday::Mon,
        "tu" => Weekday::Tue,
        "we" => Weekday::Wed,
        "th" => Weekday::Thu,
        "fr" => Weekday::Fri,
        "sa" => Weekday::Sat,
        "su" => Weekday::Sun,
        other => other
            .parse::<Weekday>()
            .map_err(|_| TaskError::Config(format!("unknown weekday '{other}'")))?,
    };
    Ok(day)
}

impl Default for Weekdays {
    fn default() -> Self {
        Self::ALL
    }
}

impl fmt::Display for Weekdays {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::ALL => return write!(f, "always"),
            Self::NONE => return write!(f, "never"),
            Self::WORKDAYS => return write!(f, "weekday"),
            Self::WEEKEND => return write!(f, "weekend"),
            _ => {}
        }
        let names = ["mo", "tu", "we", "th", "fr", "sa", "su"];
        let list: Vec<&str> = names
            .iter()
            .enumerate()
            .filter(|(i, _)| self.0 & (1 << i) != 0)
            .map(|(_, n)| *n)
            .collect();
        write!(f, "{}", list.join(","))
    }
}

/// Time until the next `time` on an allowed day, seen from `now`.
/// Returns `None` when no day is allowed. The result is always below 7 days.
pub fn until_next(time: NaiveTime, days: Weekdays, now: NaiveDateTime) -> Option<Duration> {
    if days.is_empty() {
        return None;
    }
    let mut candidate = now.date().and_time(time);
    if candidate < now {
        candidate += ChronoDuration::days(1);
    }
    // At most six extra days are needed to reach any allowed weekday.
    for _ in 0..7 {
        if days.contains(candidate.weekday()) {
            return (candidate - now).to_std().ok();
        }
        candidate += ChronoDuration::days(1);
    }
    None
}

/// Time until the next occurrence at least `gap` after `now`.
pub fn until_next_after(
    time: NaiveTime,
    days: Weekdays,
    now: NaiveDateTime,
    gap: Duration,
) -> Option<Duration> {
    let shift = ChronoDuration::from_std(gap).ok()?;
    until_next(time, days, now + shift).map(|wait| wait + gap)
}

/// Time until the next local midnight.
pub fn until_midnight(now: NaiveDateTime) -> Duration {
    let tomorrow = now.date() + ChronoDuration::days(1);
    tomorrow
        .and_hms_opt(0, 0, 0)
        .and_then(|midnight| (midnight - now).to_std().ok())
        .unwrap_or(Duration::ZERO)
}

/// Parse "HH:MM" or "HH:MM:SS".
pub fn parse_time(text: &str) -> TaskResult<NaiveTime> {
    let text = text.trim();
    NaiveTime::parse_from_str(text, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(text, "%H:%M"))
        .map_err(|_| TaskError::Config(format!("invalid time of day '{text}'")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    const WEEK: u64 = 7 * 86_400;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, min, s)
            .unwrap()
    }

    #[test]
    fn test_later_today() {
        // 2026-02-23 is a Monday
        let now = at(2026, 2, 23, 7, 0, 0);
        let wait = until_next(parse_time("08:00").unwrap(), Weekdays::ALL, now).unwrap();
        assert_eq!(wait.as_secs(), 3600);
    }

    #[test]
    fn test_already_passed_rolls_to_tomorrow() {
        let now = at(2026, 2, 23, 9, 0, 0);
        let wait = until_next(parse_time("08:00").unwrap(), Weekdays::ALL, now).unwrap();
        assert_eq!(wait.as_secs(), 23 * 3600);
    }

    #[test]
    fn test_skips_to_allowed_day() {
        // Saturday morning, weekdays only -> Monday 08:00
        let now = at(2026, 2, 28, 7, 0, 0);
        let wait = until_next(parse_time("08:00").unwrap(), Weekdays::WORKDAYS, now).unwrap();
        assert_eq!(wait.as_secs(), 2 * 86_400 + 3600);
    }

    #[test]
    fn test_same_day_next_week_stays_below_a_week() {
        let mut monday = Weekdays::NONE;
        monday.insert(Weekday::Mon);
        let now = at(2026, 2, 23, 8, 0, 1);
        let wait = until_next(parse_time("08:00").unwrap(), monday, now).unwrap();
        assert_eq!(wait.as_secs(), WEEK - 1);
    }

    #[test]
    fn test_delay_always_within_a_week() {
        let times = ["00:00", "06:30", "12:00:30", "23:59:59"];
        let day_sets = ["always", "weekday", "weekend", "mo", "su", "we,fr"];
        for day in 1..=14 {
            for hour in [0, 5, 12, 23] {
                let now = at(2026, 3, day, hour, 17, 3);
                for t in times {
                    for d in day_sets {
                        let days = Weekdays::parse(d).unwrap();
                        let wait = until_next(parse_time(t).unwrap(), days, now).unwrap();
                        assert!(wait.as_secs() < WEEK, "{t} {d} from {now}: {wait:?}");
                    }
                }
            }
        }
    }

    #[test]
    fn test_early_firing_does_not_repeat_the_same_occurrence() {
        let early = NaiveDate::from_ymd_opt(2026, 2, 23)
            .unwrap()
            .and_hms_milli_opt(7, 59, 59, 990)
            .unwrap();
        let eight = parse_time("08:00").unwrap();
        let gap = Duration::from_secs(1);
        assert_eq!(until_next(eight, Weekdays::ALL, early).unwrap().as_millis(), 10);
        let wait = until_next_after(eight, Weekdays::ALL, early, gap).unwrap();
        assert_eq!(wait.as_secs(), 86_400);
        let wait = until_next_after(eight, Weekdays::ALL, at(2026, 2, 23, 7, 0, 0), gap).unwrap();
        assert_eq!(wait.as_secs(), 3600);
        assert!(until_next_after(eight, Weekdays::NONE, early, gap).is_none());
    }

    #[test]
    fn test_no_days_means_never() {
        let now = at(2026, 2, 23, 7, 0, 0);
        assert!(until_next(parse_time("08:00").unwrap(), Weekdays::NONE, now).is_none());
        assert!(Weekdays::parse("").unwrap().is_empty());
    }

    #[test]
    fn test_parse_day_lists() {
        let days = Weekdays::parse("mo, we,friday").unwrap();
        assert!(days.contains(Weekday::Mon));
        assert!(days.contains(Weekday::Wed));
        assert!(days.contains(Weekday::Fri));
        assert!(!days.contains(Weekday::Tue));
        assert_eq!(days.to_string(), "mo,we,fr");
        assert!(Weekdays::parse("funday").is_err());
    }

    #[test]
    fn test_until_midnight() {
        let now = at(2026, 2, 23, 23, 0, 0);
        assert_eq!(until_midnight(now).as_secs(), 3600);
    }

    #[test]
    fn test_invalid_time() {
        assert!(parse_time("25:00").is_err());
        assert_eq!(
            parse_time("08:15:30").unwrap(),
            NaiveTime::from_hms_opt(8, 15, 30).unwrap()
        );
    }
}
