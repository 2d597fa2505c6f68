//! Calendar-aware time values.
//!
//! Gridded datasets encode time as numeric offsets from a reference date in
//! one of several calendars. Everything outside this module works with
//! [`CivilDate`] (a plain year-month-day) or with the decoded axis values.

use crate::error::{ExtractError, Result};
use chrono::{Datelike, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Cumulative days before each month in a 365-day year.
const CUM_DAYS_NOLEAP: [i64; 12] = [0, 31, 59, 90, 120, 151, 181, 212, 243, 273, 304, 334];

const SECONDS_PER_DAY: i64 = 86_400;

/// Julian day number of 1582-10-15, the first day of the Gregorian calendar.
const GREGORIAN_REFORM_JDN: i64 = 2_299_161;

/// A calendar-agnostic date, ordered by (year, month, day).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CivilDate {
    pub year: i32,
    pub month: u32,
    pub day: u32,
}

impl CivilDate {
    /// Build a date with a month in 1..=12 and a day in 1..=31. Whether the
    /// day exists depends on the calendar it is later converted to.
    pub fn new(year: i32, month: u32, day: u32) -> Option<Self> {
        if (1..=12).contains(&month) && (1..=31).contains(&day) {
            Some(Self { year, month, day })
        } else {
            None
        }
    }
}

impl fmt::Display for CivilDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}-{:02}", self.year, self.month, self.day)
    }
}

impl FromStr for CivilDate {
    type Err = ExtractError;

    fn from_str(s: &str) -> Result<Self> {
        parse_ymd(s.trim())
            .and_then(|(y, m, d)| CivilDate::new(y, m, d))
            .ok_or_else(|| ExtractError::InvalidParameter(format!("'{s}' is not a YYYY-MM-DD date")))
    }
}

impl TryFrom<String> for CivilDate {
    type Error = ExtractError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<CivilDate> for String {
    fn from(date: CivilDate) -> Self {
        date.to_string()
    }
}

/// Parse `Y-M-D` with an optional leading minus on the year.
fn parse_ymd(s: &str) -> Option<(i32, u32, u32)> {
    let (negative, body) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };
    let mut parts = body.splitn(3, '-');
    let year: i32 = parts.next()?.parse().ok()?;
    let month: u32 = parts.next()?.parse().ok()?;
    let day: u32 = parts.next()?.parse().ok()?;
    Some((if negative { -year } else { year }, month, day))
}

/// The calendar families a time axis can be encoded in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CalendarFamily {
    /// Mixed Julian/Gregorian with the October 1582 reform.
    Standard,
    ProlepticGregorian,
    NoLeap,
    Day360,
    Julian,
}

impl CalendarFamily {
    /// Map a CF `calendar` attribute to a family. Unknown names fall back to
    /// [`CalendarFamily::Standard`].
    pub fn from_calendar_name(name: &str) -> Self {
        let name = name.trim().to_lowercase();

        if name.contains("noleap") || name.contains("365_day") || name.contains("no_leap") {
            CalendarFamily::NoLeap
        } else if name.contains("360_day") || name.contains("360") {
            CalendarFamily::Day360
        } else if name.contains("proleptic_gregorian") {
            CalendarFamily::ProlepticGregorian
        } else if name.is_empty()
            || name.contains("gregorian")
            || name.contains("standard")
            || name.contains("greg")
        {
            CalendarFamily::Standard
        } else if name.contains("julian") {
            CalendarFamily::Julian
        } else {
            CalendarFamily::Standard
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            CalendarFamily::Standard => "standard",
            CalendarFamily::ProlepticGregorian => "proleptic_gregorian",
            CalendarFamily::NoLeap => "noleap",
            CalendarFamily::Day360 => "360_day",
            CalendarFamily::Julian => "julian",
        }
    }

    fn is_leap_year(self, year: i32) -> bool {
        let gregorian = year.rem_euclid(4) == 0 && (year.rem_euclid(100) != 0 || year.rem_euclid(400) == 0);
        match self {
            CalendarFamily::ProlepticGregorian => gregorian,
            CalendarFamily::Julian => year.rem_euclid(4) == 0,
            CalendarFamily::Standard if year < 1583 => year.rem_euclid(4) == 0,
            CalendarFamily::Standard => gregorian,
            CalendarFamily::NoLeap | CalendarFamily::Day360 => false,
        }
    }

    pub fn days_in_month(self, year: i32, month: u32) -> u32 {
        if self == CalendarFamily::Day360 {
            return 30;
        }
        match month {
            1 | 3 | 5 | 7 | 8 | 10 | 12 => 31,
            4 | 6 | 9 | 11 => 30,
            2 if self.is_leap_year(year) => 29,
            2 => 28,
            _ => 0,
        }
    }

    /// Day number of a date. Real calendars use the Julian day number so
    /// Standard can switch rules at the reform; model calendars count from
    /// year zero.
    fn day_number(self, year: i32, month: u32, day: u32) -> i64 {
        let (y, m, d) = (year as i64, month as i64, day as i64);
        match self {
            CalendarFamily::NoLeap => 365 * y + CUM_DAYS_NOLEAP[(m - 1) as usize] + d - 1,
            CalendarFamily::Day360 => 360 * y + 30 * (m - 1) + d - 1,
            CalendarFamily::ProlepticGregorian => gregorian_jdn(y, m, d),
            CalendarFamily::Julian => julian_jdn(y, m, d),
            CalendarFamily::Standard => {
                if (year, month, day) >= (1582, 10, 15) {
                    gregorian_jdn(y, m, d)
                } else {
                    julian_jdn(y, m, d)
                }
            }
        }
    }

    fn date_from_day_number(self, n: i64) -> (i32, u32, u32) {
        match self {
            CalendarFamily::NoLeap => {
                let year = n.div_euclid(365);
                let doy = n.rem_euclid(365);
                let month = CUM_DAYS_NOLEAP.iter().rposition(|&c| c <= doy).unwrap_or(0);
                (year as i32, month as u32 + 1, (doy - CUM_DAYS_NOLEAP[month]) as u32 + 1)
            }
            CalendarFamily::Day360 => {
                let year = n.div_euclid(360);
                let doy = n.rem_euclid(360);
                (year as i32, (doy / 30) as u32 + 1, (doy % 30) as u32 + 1)
            }
            CalendarFamily::ProlepticGregorian => date_from_jdn(n, true),
            CalendarFamily::Julian => date_from_jdn(n, false),
            CalendarFamily::Standard => date_from_jdn(n, n >= GREGORIAN_REFORM_JDN),
        }
    }
}

impl fmt::Display for CalendarFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn gregorian_jdn(y: i64, m: i64, d: i64) -> i64 {
    let a = (14 - m) / 12;
    let y = y + 4800 - a;
    let m = m + 12 * a - 3;
    d + (153 * m + 2) / 5 + 365 * y + y.div_euclid(4) - y.div_euclid(100) + y.div_euclid(400) - 32045
}

fn julian_jdn(y: i64, m: i64, d: i64) -> i64 {
    let a = (14 - m) / 12;
    let y = y + 4800 - a;
    let m = m + 12 * a - 3;
    d + (153 * m + 2) / 5 + 365 * y + y.div_euclid(4) - 32083
}

fn date_from_jdn(jdn: i64, gregorian: bool) -> (i32, u32, u32) {
    let (b, c) = if gregorian {
        let a = jdn + 32044;
        let b = (4 * a + 3).div_euclid(146_097);
        (b, a - (146_097 * b).div_euclid(4))
    } else {
        (0, jdn + 32082)
    };
    let d = (4 * c + 3).div_euclid(1461);
    let e = c - (1461 * d).div_euclid(4);
    let m = (5 * e + 2).div_euclid(153);

    let day = e - (153 * m + 2).div_euclid(5) + 1;
    let month = m + 3 - 12 * (m / 10);
    let year = 100 * b + d - 4800 + m / 10;
    (year as i32, month as u32, day as u32)
}

/// Date and time of day without any calendar attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CalendarDateTime {
    pub year: i32,
    pub month: u32,
    pub day: u32,
    pub hour: u32,
    pub minute: u32,
    pub second: u32,
}

impl CalendarDateTime {
    pub fn midnight(date: CivilDate) -> Self {
        Self {
            year: date.year,
            month: date.month,
            day: date.day,
            hour: 0,
            minute: 0,
            second: 0,
        }
    }

    pub fn date(&self) -> CivilDate {
        CivilDate {
            year: self.year,
            month: self.month,
            day: self.day,
        }
    }

    fn seconds_of_day(&self) -> i64 {
        self.hour as i64 * 3600 + self.minute as i64 * 60 + self.second as i64
    }
}

/// A time value typed by its calendar family. Values only compare with values
/// of the same family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AxisTime {
    Standard(CalendarDateTime),
    ProlepticGregorian(CalendarDateTime),
    NoLeap(CalendarDateTime),
    Day360(CalendarDateTime),
    Julian(CalendarDateTime),
}

impl AxisTime {
    /// Build a value, rejecting dates that do not exist in the family.
    pub fn new(family: CalendarFamily, dt: CalendarDateTime) -> Option<Self> {
        if !(1..=12).contains(&dt.month)
            || dt.day < 1
            || dt.day > family.days_in_month(dt.year, dt.month)
            || dt.hour > 23
            || dt.minute > 59
            || dt.second > 59
        {
            return None;
        }
        // Ten days were dropped at the reform.
        if family == CalendarFamily::Standard
            && (dt.year, dt.month) == (1582, 10)
            && (5..=14).contains(&dt.day)
        {
            return None;
        }

        Some(match family {
            CalendarFamily::Standard => AxisTime::Standard(dt),
            CalendarFamily::ProlepticGregorian => AxisTime::ProlepticGregorian(dt),
            CalendarFamily::NoLeap => AxisTime::NoLeap(dt),
            CalendarFamily::Day360 => AxisTime::Day360(dt),
            CalendarFamily::Julian => AxisTime::Julian(dt),
        })
    }

    pub fn family(&self) -> CalendarFamily {
        match self {
            AxisTime::Standard(_) => CalendarFamily::Standard,
            AxisTime::ProlepticGregorian(_) => CalendarFamily::ProlepticGregorian,
            AxisTime::NoLeap(_) => CalendarFamily::NoLeap,
            AxisTime::Day360(_) => CalendarFamily::Day360,
            AxisTime::Julian(_) => CalendarFamily::Julian,
        }
    }

    pub fn datetime(&self) -> &CalendarDateTime {
        match self {
            AxisTime::Standard(dt)
            | AxisTime::ProlepticGregorian(dt)
            | AxisTime::NoLeap(dt)
            | AxisTime::Day360(dt)
            | AxisTime::Julian(dt) => dt,
        }
    }

    pub fn date(&self) -> CivilDate {
        self.datetime().date()
    }

    /// Gregorian timestamp, when the value lies on the Gregorian calendar.
    pub fn to_timestamp(&self) -> Option<NaiveDateTime> {
        let dt = self.datetime();
        let gregorian = match self {
            AxisTime::ProlepticGregorian(_) => true,
            AxisTime::Standard(_) => (dt.year, dt.month, dt.day) >= (1582, 10, 15),
            _ => false,
        };
        if !gregorian {
            return None;
        }
        NaiveDate::from_ymd_opt(dt.year, dt.month, dt.day)?.and_hms_opt(dt.hour, dt.minute, dt.second)
    }
}

impl PartialOrd for AxisTime {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        if self.family() == other.family() {
            Some(self.datetime().cmp(other.datetime()))
        } else {
            None
        }
    }
}

impl fmt::Display for AxisTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dt = self.datetime();
        write!(
            f,
            "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
            dt.year, dt.month, dt.day, dt.hour, dt.minute, dt.second
        )
    }
}

/// What to convert a civil date into: a named calendar, or the calendar of an
/// existing axis value.
#[derive(Debug, Clone, Copy)]
pub enum CalendarTarget<'a> {
    Name(&'a str),
    Sample(&'a AxisTime),
}

/// Convert a civil date to a midnight value in the target calendar. Returns
/// `None` when the date does not exist there (for example 2001-02-30 in the
/// standard calendar).
pub fn to_axis_time(date: CivilDate, target: CalendarTarget<'_>) -> Option<AxisTime> {
    let family = match target {
        CalendarTarget::Name(name) => CalendarFamily::from_calendar_name(name),
        CalendarTarget::Sample(sample) => sample.family(),
    };
    AxisTime::new(family, CalendarDateTime::midnight(date))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeUnit {
    Seconds,
    Minutes,
    Hours,
    Days,
}

impl TimeUnit {
    pub fn seconds(self) -> i64 {
        match self {
            TimeUnit::Seconds => 1,
            TimeUnit::Minutes => 60,
            TimeUnit::Hours => 3600,
            TimeUnit::Days => SECONDS_PER_DAY,
        }
    }
}

/// Parsed CF `units` attribute of a time variable, `<unit> since <reference>`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeUnits {
    pub unit: TimeUnit,
    pub reference: CalendarDateTime,
}

impl TimeUnits {
    pub fn parse(units: &str) -> Result<Self> {
        let invalid = || ExtractError::InvalidTimeUnits(units.to_string());

        let lower = units.trim().to_lowercase();
        let (unit, reference) = lower.split_once(" since ").ok_or_else(invalid)?;

        let unit = match unit.trim() {
            "second" | "seconds" | "sec" | "secs" | "s" => TimeUnit::Seconds,
            "minute" | "minutes" | "min" | "mins" => TimeUnit::Minutes,
            "hour" | "hours" | "hr" | "hrs" | "h" => TimeUnit::Hours,
            "day" | "days" | "d" => TimeUnit::Days,
            _ => return Err(invalid()),
        };

        let reference = reference.trim().trim_end_matches('z').trim_end_matches(" utc");
        let (date_part, time_part) = match reference.split_once(['t', ' ']) {
            Some((date, time)) => (date, Some(time.trim())),
            None => (reference, None),
        };

        let CivilDate { year, month, day } = parse_ymd(date_part)
            .and_then(|(y, m, d)| CivilDate::new(y, m, d))
            .ok_or_else(invalid)?;
        let (hour, minute, second) = match time_part {
            Some(time) if !time.is_empty() => parse_hms(time).ok_or_else(invalid)?,
            _ => (0, 0, 0),
        };

        Ok(Self {
            unit,
            reference: CalendarDateTime {
                year,
                month,
                day,
                hour,
                minute,
                second,
            },
        })
    }

    /// Decode one raw offset. Non-finite offsets and results that do not
    /// exist in the family decode to `None`.
    pub fn decode(&self, family: CalendarFamily, offset: f64) -> Option<AxisTime> {
        if !offset.is_finite() {
            return None;
        }
        let seconds = offset * self.unit.seconds() as f64;
        if seconds.abs() > 1e15 {
            return None;
        }

        let r = &self.reference;
        let total = r.seconds_of_day() + seconds.round() as i64;
        let days = family.day_number(r.year, r.month, r.day) + total.div_euclid(SECONDS_PER_DAY);
        let sod = total.rem_euclid(SECONDS_PER_DAY);

        let (year, month, day) = family.date_from_day_number(days);
        AxisTime::new(
            family,
            CalendarDateTime {
                year,
                month,
                day,
                hour: (sod / 3600) as u32,
                minute: (sod % 3600 / 60) as u32,
                second: (sod % 60) as u32,
            },
        )
    }
}

fn parse_hms(s: &str) -> Option<(u32, u32, u32)> {
    let mut parts = s.splitn(3, ':');
    let hour: u32 = parts.next()?.parse().ok()?;
    let minute: u32 = parts.next().map(str::parse::<u32>).transpose().ok()?.unwrap_or(0);
    let second = match parts.next() {
        Some(sec) => sec.parse::<f64>().ok()?.trunc() as u32,
        None => 0,
    };
    Some((hour, minute, second))
}

/// A decoded time axis. Gregorian axes become plain timestamps; every other
/// axis stays calendar-typed.
#[derive(Debug, Clone, PartialEq)]
pub enum TimeAxisValues {
    Timestamps(Vec<Option<NaiveDateTime>>),
    Calendar(Vec<Option<AxisTime>>),
}

impl TimeAxisValues {
    pub fn decode(raw: &[f64], units: &TimeUnits, family: CalendarFamily) -> Self {
        let decoded: Vec<Option<AxisTime>> = raw.iter().map(|&v| units.decode(family, v)).collect();

        let gregorian = matches!(family, CalendarFamily::Standard | CalendarFamily::ProlepticGregorian);
        if gregorian {
            let stamps: Vec<Option<NaiveDateTime>> =
                decoded.iter().map(|t| t.and_then(|t| t.to_timestamp())).collect();
            // A Standard value before the reform keeps the whole axis calendar-typed.
            let all_converted = decoded
                .iter()
                .zip(&stamps)
                .all(|(t, s)| t.is_none() || s.is_some());
            if all_converted {
                return TimeAxisValues::Timestamps(stamps);
            }
        }

        TimeAxisValues::Calendar(decoded)
    }

    pub fn len(&self) -> usize {
        match self {
            TimeAxisValues::Timestamps(v) => v.len(),
            TimeAxisValues::Calendar(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_calendar_typed(&self) -> bool {
        matches!(self, TimeAxisValues::Calendar(_))
    }

    /// First non-missing calendar-typed value.
    pub fn sample(&self) -> Option<&AxisTime> {
        match self {
            TimeAxisValues::Calendar(values) => values.iter().flatten().next(),
            TimeAxisValues::Timestamps(_) => None,
        }
    }

    pub fn date_at(&self, index: usize) -> Option<CivilDate> {
        match self {
            TimeAxisValues::Timestamps(v) => v.get(index).copied().flatten().map(|ts| {
                let d = ts.date();
                CivilDate {
                    year: d.year(),
                    month: d.month(),
                    day: d.day(),
                }
            }),
            TimeAxisValues::Calendar(v) => v.get(index).copied().flatten().map(|t| t.date()),
        }
    }

    /// Values at the given positions, in that order.
    pub fn select(&self, positions: &[usize]) -> Self {
        match self {
            TimeAxisValues::Timestamps(v) => {
                TimeAxisValues::Timestamps(positions.iter().map(|&i| v[i]).collect())
            }
            TimeAxisValues::Calendar(v) => TimeAxisValues::Calendar(positions.iter().map(|&i| v[i]).collect()),
        }
    }
}
