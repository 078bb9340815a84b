//! Play window computation for the source feed.

use chrono::{DateTime, FixedOffset, NaiveDateTime, NaiveTime, TimeDelta, Utc};

const FEED_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S.00%:z";

/// Inclusive time range of plays requested from the source feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlayWindow {
    pub since: DateTime<FixedOffset>,
    pub until: DateTime<FixedOffset>,
}

impl PlayWindow {
    /// The previous full calendar day in `offset`: 00:00:00 through 23:59:00.
    pub fn previous_day(now: DateTime<Utc>, offset: FixedOffset) -> Self {
        let today = now.with_timezone(&offset).date_naive();
        let yesterday = today.pred_opt().unwrap_or(today);
        let at = |time: NaiveTime| -> DateTime<FixedOffset> {
            let local = NaiveDateTime::new(yesterday, time);
            let utc = local - TimeDelta::seconds(i64::from(offset.local_minus_utc()));
            DateTime::from_naive_utc_and_offset(utc, offset)
        };
        Self {
            since: at(NaiveTime::default()),
            until: at(NaiveTime::from_hms_opt(23, 59, 0).unwrap_or_default()),
        }
    }

    /// `since` formatted the way the feed expects it.
    pub fn since_param(&self) -> String {
        self.since.format(FEED_TIMESTAMP_FORMAT).to_string()
    }

    /// `until` formatted the way the feed expects it.
    pub fn until_param(&self) -> String {
        self.until.format(FEED_TIMESTAMP_FORMAT).to_string()
    }
}

/// Parses a `±HH:MM` (or `Z`) utc offset.
pub fn parse_utc_offset(raw: &str) -> Option<FixedOffset> {
    let trimmed = raw.trim();
    if trimmed.eq_ignore_ascii_case("z") {
        return FixedOffset::east_opt(0);
    }
    let (sign, rest) = match trimmed.chars().next()? {
        '+' => (1, &trimmed[1..]),
        '-' => (-1, &trimmed[1..]),
        _ => return None,
    };
    let (hours, minutes) = rest.split_once(':')?;
    if hours.len() != 2 || minutes.len() != 2 {
        return None;
    }
    let hours: i32 = hours.parse().ok()?;
    let minutes: i32 = minutes.parse().ok()?;
    if hours > 14 || minutes > 59 {
        return None;
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}
