// src/types.rs
//
// Common shared types for the control stack.

use std::future::Future;
use std::pin::Pin;

use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike, Weekday};
use serde::{Deserialize, Serialize};

use crate::error::{PilotError, PilotResult};

/// Millisecond timestamp since Unix epoch.
pub type TimestampMs = i64;

/// Boxed future used at the async seams (backend, policy, sleep).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Ordered feature vector handed to the policy.
///
/// The layout is contractually significant: the policy was trained on
/// exactly this order and width.
pub type ObservationVector = Vec<f64>;

/// Calendar fields of one control tick (wall clock of the controlled site).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarStamp {
    pub year: i32,
    /// 1..=12
    pub month: u32,
    /// 1..=31
    pub day: u32,
    /// 0..=23
    pub hour: u32,
}

impl CalendarStamp {
    pub fn new(year: i32, month: u32, day: u32, hour: u32) -> Self {
        Self {
            year,
            month,
            day,
            hour,
        }
    }

    pub fn from_datetime(dt: &NaiveDateTime) -> Self {
        Self {
            year: dt.year(),
            month: dt.month(),
            day: dt.day(),
            hour: dt.hour(),
        }
    }

    /// Validated calendar date; fails on impossible dates or hours.
    pub fn date(&self) -> PilotResult<NaiveDate> {
        if self.hour > 23 {
            return Err(self.invalid());
        }
        NaiveDate::from_ymd_opt(self.year, self.month, self.day).ok_or_else(|| self.invalid())
    }

    pub fn weekday(&self) -> PilotResult<Weekday> {
        Ok(self.date()?.weekday())
    }

    pub fn is_weekend(&self) -> PilotResult<bool> {
        Ok(matches!(self.weekday()?, Weekday::Sat | Weekday::Sun))
    }

    /// `(month, day, hour)` key used by the price table.
    pub fn key(&self) -> (u32, u32, u32) {
        (self.month, self.day, self.hour)
    }

    fn invalid(&self) -> PilotError {
        PilotError::InvalidCalendar {
            year: self.year,
            month: self.month,
            day: self.day,
            hour: self.hour,
        }
    }
}

/// Physical readings of one tick, in sensor-map order.
///
/// Produced fresh every control tick and never persisted. The raw layout the
/// pipeline starts from is `[month, day, hour, reading_0, .., reading_n]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawObservation {
    pub calendar: CalendarStamp,
    /// Step index into time-indexed tables (forecast rows).
    pub step_index: i64,
    pub readings: Vec<(String, f64)>,
}

impl RawObservation {
    /// Number of leading calendar scalars in the raw layout.
    pub const CALENDAR_WIDTH: usize = 3;

    pub fn new(calendar: CalendarStamp, step_index: i64) -> Self {
        Self {
            calendar,
            step_index,
            readings: Vec::new(),
        }
    }

    pub fn with_reading(mut self, name: impl Into<String>, value: f64) -> Self {
        self.readings.push((name.into(), value));
        self
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.readings
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| *v)
    }

    pub fn base_width(&self) -> usize {
        Self::CALENDAR_WIDTH + self.readings.len()
    }

    pub fn base_vector(&self) -> ObservationVector {
        let mut out = Vec::with_capacity(self.base_width());
        out.push(self.calendar.month as f64);
        out.push(self.calendar.day as f64);
        out.push(self.calendar.hour as f64);
        out.extend(self.readings.iter().map(|(_, v)| *v));
        out
    }
}
