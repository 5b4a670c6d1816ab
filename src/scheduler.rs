//! SM-2 spaced repetition scheduling.
//!
//! After every review a card's memory state is recomputed from the learner's
//! 0-5 quality rating:
//! - Quality 0-2 is a lapse: repetitions reset to 0 and the card comes back tomorrow
//! - Quality 3-5 is a recall: the easiness factor moves by the SM-2 formula and the
//!   interval grows 1 day, 6 days, then previous interval times easiness
//! - The easiness factor never drops below 1.3 and is left alone on a lapse
//! - Intervals stop growing at [`MAX_INTERVAL_DAYS`]
//!
//! Nothing here touches the clock except [`compute_next_state`]; every other
//! function takes `now` explicitly.

use chrono::{DateTime, Duration, LocalResult, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const MIN_EASINESS: f64 = 1.3;
pub const DEFAULT_EASINESS: f64 = 2.5;
pub const MAX_QUALITY: u8 = 5;
/// Longest gap between reviews, about a century.
pub const MAX_INTERVAL_DAYS: i64 = 36_500;
const PASSING_QUALITY: u8 = 3;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleError {
    #[error("invalid quality '{0}': expected an integer from 0 to 5")]
    InvalidQuality(String),

    #[error("invalid card state: {0}")]
    InvalidState(String),
}

/// Self-rated recall quality for a single review, 0 (blackout) to 5 (perfect).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "u8")]
pub struct Quality(u8);

/// Which arm of the algorithm a quality rating selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recall {
    Lapsed,
    Recalled,
}

impl Quality {
    pub fn new(value: i64) -> Result<Self, ScheduleError> {
        match u8::try_from(value) {
            Ok(q) if q <= MAX_QUALITY => Ok(Quality(q)),
            _ => Err(ScheduleError::InvalidQuality(value.to_string())),
        }
    }

    pub fn value(self) -> u8 {
        self.0
    }

    pub fn recall(self) -> Recall {
        if self.0 < PASSING_QUALITY {
            Recall::Lapsed
        } else {
            Recall::Recalled
        }
    }

    pub fn is_lapse(self) -> bool {
        self.recall() == Recall::Lapsed
    }

    pub fn label(self) -> &'static str {
        match self.0 {
            0 => "Blackout",
            1 => "Wrong",
            2 => "Wrong (familiar)",
            3 => "Hard",
            4 => "Good",
            _ => "Perfect",
        }
    }

    pub fn all() -> impl Iterator<Item = Quality> {
        (0..=MAX_QUALITY).map(Quality)
    }
}

impl TryFrom<i64> for Quality {
    type Error = ScheduleError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Quality::new(value)
    }
}

impl TryFrom<f64> for Quality {
    type Error = ScheduleError;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        if !value.is_finite() || value.fract() != 0.0 {
            return Err(ScheduleError::InvalidQuality(value.to_string()));
        }
        if !(0.0..=MAX_QUALITY as f64).contains(&value) {
            return Err(ScheduleError::InvalidQuality(value.to_string()));
        }
        Ok(Quality(value as u8))
    }
}

impl From<Quality> for u8 {
    fn from(q: Quality) -> u8 {
        q.0
    }
}

impl FromStr for Quality {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        trimmed
            .parse::<i64>()
            .map_err(|_| ScheduleError::InvalidQuality(trimmed.to_string()))
            .and_then(Quality::new)
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CardMemoryState {
    pub easiness_factor: f64,
    pub interval: i64,
    pub repetitions: i64,
    pub next_review_date: DateTime<Utc>,
}

impl CardMemoryState {
    /// Pristine state for a card that has never been reviewed: due immediately.
    pub fn new_card(now: DateTime<Utc>) -> Self {
        Self {
            easiness_factor: DEFAULT_EASINESS,
            interval: 0,
            repetitions: 0,
            next_review_date: now,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_review_date <= now
    }

    pub fn validate(&self) -> Result<(), ScheduleError> {
        if !self.easiness_factor.is_finite() {
            return Err(ScheduleError::InvalidState(format!(
                "easiness factor must be finite, got {}",
                self.easiness_factor
            )));
        }
        if self.easiness_factor < MIN_EASINESS {
            return Err(ScheduleError::InvalidState(format!(
                "easiness factor {} is below the floor of {}",
                self.easiness_factor, MIN_EASINESS
            )));
        }
        if self.interval < 0 {
            return Err(ScheduleError::InvalidState(format!(
                "interval must not be negative, got {}",
                self.interval
            )));
        }
        if self.repetitions < 0 {
            return Err(ScheduleError::InvalidState(format!(
                "repetitions must not be negative, got {}",
                self.repetitions
            )));
        }
        Ok(())
    }
}

/// Schedule a review against the local wall clock.
pub fn compute_next_state(
    current: &CardMemoryState,
    quality: Quality,
) -> Result<CardMemoryState, ScheduleError> {
    compute_next_state_at(current, quality, chrono::Local::now())
}

/// Schedule a review as if it happened at `now`. Day arithmetic runs in `now`'s
/// time zone, so "in 6 days" means the same wall-clock time six calendar days on.
pub fn compute_next_state_at<Tz: TimeZone>(
    current: &CardMemoryState,
    quality: Quality,
    now: DateTime<Tz>,
) -> Result<CardMemoryState, ScheduleError> {
    current.validate()?;

    let (easiness_factor, interval, repetitions) = match quality.recall() {
        Recall::Lapsed => (current.easiness_factor, 1, 0),
        Recall::Recalled => {
            let easiness_factor = next_easiness(current.easiness_factor, quality);
            let repetitions = current.repetitions + 1;
            let interval = match repetitions {
                1 => 1,
                2 => 6,
                _ => grow_interval(current.interval, easiness_factor),
            };
            (easiness_factor, interval, repetitions)
        }
    };

    let next_review_date = add_days(&now, interval)?;

    Ok(CardMemoryState {
        easiness_factor,
        interval,
        repetitions,
        next_review_date,
    })
}

/// SM-2 easiness update: +0.10 at quality 5, 0.00 at 4, -0.14 at 3.
pub fn next_easiness(easiness_factor: f64, quality: Quality) -> f64 {
    let miss = (MAX_QUALITY - quality.value()) as f64;
    let updated = easiness_factor + (0.1 - miss * (0.08 + miss * 0.02));
    updated.max(MIN_EASINESS)
}

fn grow_interval(previous: i64, easiness_factor: f64) -> i64 {
    let grown = (previous as f64 * easiness_factor)
        .round()
        .min(MAX_INTERVAL_DAYS as f64);
    // A repetition count of 3+ with a zero interval only comes from hand-edited
    // state; keep such cards out of the same-instant due queue.
    (grown as i64).max(1)
}

/// Add whole calendar days in `now`'s time zone.
///
/// If the target wall-clock time falls in a DST gap the result is exactly
/// `24 * days` hours later; if it is ambiguous the earlier instant wins.
pub fn add_days<Tz: TimeZone>(now: &DateTime<Tz>, days: i64) -> Result<DateTime<Utc>, ScheduleError> {
    let out_of_range = || {
        ScheduleError::InvalidState(format!(
            "a {}-day interval is outside the supported calendar",
            days
        ))
    };

    let step = u64::try_from(days).map_err(|_| out_of_range())?;
    let target = now
        .naive_local()
        .checked_add_days(chrono::Days::new(step))
        .ok_or_else(out_of_range)?;

    let next = match now.timezone().from_local_datetime(&target) {
        LocalResult::Single(dt) => dt.with_timezone(&Utc),
        LocalResult::Ambiguous(earliest, _) => earliest.with_timezone(&Utc),
        LocalResult::None => {
            let exact = Duration::try_days(days).ok_or_else(out_of_range)?;
            now.with_timezone(&Utc)
                .checked_add_signed(exact)
                .ok_or_else(out_of_range)?
        }
    };

    Ok(next)
}
