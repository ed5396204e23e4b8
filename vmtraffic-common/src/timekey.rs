//! Hour and day bucket keys.
//!
//! Keys are zero-padded UTC calendar strings (`YYYY-MM-DD-HH` and `YYYY-MM-DD`),
//! so their lexicographic order is also their chronological order. Storage
//! backends rely on this to run range queries and retention cutoffs on the
//! raw key.
use std::{fmt, iter::FusedIterator};

use chrono::{DateTime, Duration, NaiveDate, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};

const DAY_FORMAT: &str = "%Y-%m-%d";
const HOUR_FORMAT: &str = "%Y-%m-%d-%H";

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Hour,
    Day,
}

impl Granularity {
    /// Length of a window.
    pub fn window(self) -> Duration {
        match self {
            Self::Hour => Duration::hours(1),
            Self::Day => Duration::days(1),
        }
    }

    /// Start of the window containing `at`.
    pub fn floor(self, at: DateTime<Utc>) -> DateTime<Utc> {
        let hour = match self {
            Self::Hour => at.hour(),
            Self::Day => 0,
        };

        at.date_naive()
            .and_hms_opt(hour, 0, 0)
            .map(|naive| Utc.from_utc_datetime(&naive))
            .unwrap_or(at)
    }

    /// Key of the window containing `at`.
    pub fn key_of(self, at: DateTime<Utc>) -> String {
        match self {
            Self::Hour => at.format(HOUR_FORMAT).to_string(),
            Self::Day => at.format(DAY_FORMAT).to_string(),
        }
    }

    /// Start of the window named by `key`, if `key` is well-formed.
    pub fn start_of_key(self, key: &str) -> Option<DateTime<Utc>> {
        let (date, hour) = match self {
            Self::Day => (key, 0),
            Self::Hour => {
                let date = key.get(..10)?;
                let hour = key.get(10..)?.strip_prefix('-')?;

                if hour.len() != 2 {
                    return None;
                }

                (date, hour.parse().ok()?)
            }
        };

        if date.len() != 10 {
            return None;
        }

        let naive = NaiveDate::parse_from_str(date, DAY_FORMAT)
            .ok()?
            .and_hms_opt(hour, 0, 0)?;

        Some(Utc.from_utc_datetime(&naive))
    }

    /// Check that `key` is a valid key of this granularity.
    pub fn is_valid_key(self, key: &str) -> bool {
        self.start_of_key(key).is_some()
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Hour => "hour",
            Self::Day => "day",
        })
    }
}

pub fn hour_key(at: DateTime<Utc>) -> String {
    Granularity::Hour.key_of(at)
}

pub fn day_key(at: DateTime<Utc>) -> String {
    Granularity::Day.key_of(at)
}

/// Seconds elapsed since the start of the current hour, never less than one.
pub fn seconds_into_hour(now: DateTime<Utc>) -> i64 {
    (now - Granularity::Hour.floor(now)).num_seconds().max(1)
}

/// Keys of consecutive hours, oldest first, produced on demand.
#[derive(Clone, Debug)]
pub struct HourKeys {
    next: DateTime<Utc>,
    remaining: usize,
}

impl HourKeys {
    /// Key of the first hour left, if any.
    pub fn first_key(&self) -> Option<String> {
        (self.remaining > 0).then(|| hour_key(self.next))
    }

    /// Key of the last hour of the sequence, if any.
    pub fn last_key(&self) -> Option<String> {
        let back = i64::try_from(self.remaining.checked_sub(1)?).ok()?;

        self.next
            .checked_add_signed(Duration::try_hours(back)?)
            .map(hour_key)
    }
}

impl Iterator for HourKeys {
    type Item = String;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }

        let key = hour_key(self.next);
        self.remaining -= 1;

        if self.remaining > 0 {
            match self.next.checked_add_signed(Duration::hours(1)) {
                Some(next) => self.next = next,
                None => self.remaining = 0,
            }
        }

        Some(key)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl ExactSizeIterator for HourKeys {}
impl FusedIterator for HourKeys {}

/// Keys of the `count` consecutive hours ending with the hour containing `now`,
/// oldest first. `None` if the first of these hours is not representable.
pub fn hours_ending_at(now: DateTime<Utc>, count: usize) -> Option<HourKeys> {
    let current = Granularity::Hour.floor(now);
    let back = i64::try_from(count.saturating_sub(1)).ok()?;
    let start = current.checked_sub_signed(Duration::try_hours(back)?)?;

    Some(HourKeys {
        next: start,
        remaining: count,
    })
}

/// Cutoff keys for an age-based purge: every bucket with a key strictly lower
/// than the returned keys is older than `days`.
pub fn retention_cutoff(now: DateTime<Utc>, days: u32) -> (String, String) {
    let cutoff = now - Duration::days(days as i64);

    (hour_key(cutoff), day_key(cutoff))
}
