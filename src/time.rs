//! Monotonic and wall-clock time, plus the date-format token table (§4.B).

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// A monotonic instant, used for dispatcher due-times and deadlines.
pub fn now() -> Instant {
    Instant::now()
}

/// Milliseconds elapsed since `mark`.
pub fn elapsed_since(mark: Instant) -> Duration {
    mark.elapsed()
}

/// Time remaining until `deadline`, or `Duration::ZERO` if it has passed.
pub fn remaining_until(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now())
}

/// Seconds since the Unix epoch, used for multipart boundaries (§4.H) and
/// RFC-822 formatting. Saturates to zero if the clock is set before 1970.
pub fn unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs()
}

const DAYS: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];
const MONTHS: [&str; 12] = [
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
];

/// A broken-down UTC calendar time, used by the RFC-822/ISO-8601 formatter
/// and parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalendarTime {
    pub year: i64,
    pub month: u32,   // 1..=12
    pub day: u32,     // 1..=31
    pub weekday: u32, // 0 = Sunday
    pub hour: u32,
    pub minute: u32,
    pub second: u32,
}

fn is_leap_year(year: i64) -> bool {
    (year % 4 == 0 && year % 100 != 0) || year % 400 == 0
}

fn days_in_month(year: i64, month: u32) -> u32 {
    const LENGTHS: [u32; 12] = [31, 28, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31];
    if month == 2 && is_leap_year(year) {
        29
    } else {
        LENGTHS[(month - 1) as usize]
    }
}

/// Converts a Unix timestamp into a UTC calendar time. Valid across the
/// 32-bit `time_t` test range `[1970, 2037]` (§8 round-trip law), and beyond.
pub fn from_unix_seconds(mut secs: i64) -> CalendarTime {
    let weekday = (((secs / 86_400) % 7 + 4) % 7 + 7) % 7; // 1970-01-01 was a Thursday (4)
    let second = (secs.rem_euclid(60)) as u32;
    secs = secs.div_euclid(60);
    let minute = (secs.rem_euclid(60)) as u32;
    secs = secs.div_euclid(60);
    let hour = (secs.rem_euclid(24)) as u32;
    let mut days = secs.div_euclid(24);

    let mut year: i64 = 1970;
    loop {
        let year_len = if is_leap_year(year) { 366 } else { 365 };
        if days >= year_len {
            days -= year_len;
            year += 1;
        } else if days < 0 {
            year -= 1;
            days += if is_leap_year(year) { 366 } else { 365 };
        } else {
            break;
        }
    }
    let mut month = 1u32;
    loop {
        let len = days_in_month(year, month) as i64;
        if days >= len {
            days -= len;
            month += 1;
        } else {
            break;
        }
    }
    CalendarTime {
        year,
        month,
        day: (days + 1) as u32,
        weekday: weekday as u32,
        hour,
        minute,
        second,
    }
}

/// Inverse of [`from_unix_seconds`].
pub fn to_unix_seconds(t: CalendarTime) -> i64 {
    let mut days: i64 = 0;
    if t.year >= 1970 {
        for y in 1970..t.year {
            days += if is_leap_year(y) { 366 } else { 365 };
        }
    } else {
        for y in t.year..1970 {
            days -= if is_leap_year(y) { 366 } else { 365 };
        }
    }
    for m in 1..t.month {
        days += days_in_month(t.year, m) as i64;
    }
    days += (t.day - 1) as i64;
    ((days * 24 + t.hour as i64) * 60 + t.minute as i64) * 60 + t.second as i64
}

/// Format as RFC-822 (`Mon, 02 Jan 2006 15:04:05 GMT`), the form the HTTP
/// client needs for headers such as `Date` and the digest nonce secret.
pub fn format_rfc822(secs: i64) -> String {
    let t = from_unix_seconds(secs);
    format!(
        "{}, {:02} {} {:04} {:02}:{:02}:{:02} GMT",
        DAYS[t.weekday as usize],
        t.day,
        MONTHS[(t.month - 1) as usize],
        t.year,
        t.hour,
        t.minute,
        t.second
    )
}

/// Format as ISO-8601 (`2006-01-02T15:04:05Z`).
pub fn format_iso8601(secs: i64) -> String {
    let t = from_unix_seconds(secs);
    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}Z",
        t.year, t.month, t.day, t.hour, t.minute, t.second
    )
}

/// Parses a date in RFC-822 or ISO-8601 form, accepting the localized
/// month-name token table (§4.B). Returns seconds since the Unix epoch.
pub fn parse_date(input: &str) -> Option<i64> {
    let s = input.trim();
    if let Some(t) = parse_iso8601(s) {
        return Some(to_unix_seconds(t));
    }
    if let Some(t) = parse_rfc822(s) {
        return Some(to_unix_seconds(t));
    }
    None
}

fn parse_iso8601(s: &str) -> Option<CalendarTime> {
    // 2006-01-02T15:04:05Z or 2006-01-02T15:04:05+00:00
    let bytes = s.as_bytes();
    if bytes.len() < 19 || bytes[4] != b'-' || bytes[7] != b'-' || bytes[10] != b'T' {
        return None;
    }
    let year: i64 = s.get(0..4)?.parse().ok()?;
    let month: u32 = s.get(5..7)?.parse().ok()?;
    let day: u32 = s.get(8..10)?.parse().ok()?;
    let hour: u32 = s.get(11..13)?.parse().ok()?;
    let minute: u32 = s.get(14..16)?.parse().ok()?;
    let second: u32 = s.get(17..19)?.parse().ok()?;
    if !(1..=12).contains(&month) || !(1..=31).contains(&day) {
        return None;
    }
    let mut t = CalendarTime { year, month, day, weekday: 0, hour, minute, second };
    t.weekday = (((to_unix_seconds(t) / 86_400) % 7 + 4) % 7 + 7) as u32 % 7;
    Some(t)
}

fn month_from_name(name: &str) -> Option<u32> {
    MONTHS.iter().position(|m| m.eq_ignore_ascii_case(name)).map(|i| i as u32 + 1)
}

fn parse_rfc822(s: &str) -> Option<CalendarTime> {
    // "Mon, 02 Jan 2006 15:04:05 GMT" — tolerate a missing leading weekday.
    let rest = match s.find(", ") {
        Some(idx) => &s[idx + 2..],
        None => s,
    };
    let mut parts = rest.split_whitespace();
    let day: u32 = parts.next()?.parse().ok()?;
    let month = month_from_name(parts.next()?)?;
    let year: i64 = parts.next()?.parse().ok()?;
    let clock = parts.next()?;
    let mut clock_parts = clock.split(':');
    let hour: u32 = clock_parts.next()?.parse().ok()?;
    let minute: u32 = clock_parts.next()?.parse().ok()?;
    let second: u32 = clock_parts.next()?.parse().ok()?;
    let mut t = CalendarTime { year, month, day, weekday: 0, hour, minute, second };
    t.weekday = (((to_unix_seconds(t) / 86_400) % 7 + 4) % 7 + 7) as u32 % 7;
    Some(t)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rfc822_round_trip_across_epoch_range() {
        for secs in [0i64, 86_400, 1_700_000_000, 2_000_000_000] {
            let formatted = format_rfc822(secs);
            let parsed = parse_date(&formatted).expect("parses back");
            assert_eq!(parsed, secs, "round trip failed for {formatted}");
        }
    }

    #[test]
    fn iso8601_round_trip() {
        let secs = 1_650_000_000i64;
        let formatted = format_iso8601(secs);
        assert_eq!(parse_date(&formatted), Some(secs));
    }

    #[test]
    fn known_epoch_is_thursday() {
        let t = from_unix_seconds(0);
        assert_eq!(t.weekday, 4);
        assert_eq!((t.year, t.month, t.day), (1970, 1, 1));
    }
}
