// src/pipeline/time_encoder.rs
//
// Replaces the leading `[month, day, hour]` scalars with
// `[month_sin, month_cos, is_weekend, hour_sin, hour_cos]` (net +2).

use crate::error::{PilotError, PilotResult};
use crate::numeric::cyclic_encode;
use crate::types::{CalendarStamp, ObservationVector, RawObservation};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeEncoder;

impl TimeEncoder {
    pub const OUTPUT_NAMES: [&'static str; 5] =
        ["month_sin", "month_cos", "is_weekend", "hour_sin", "hour_cos"];
    pub const DELTA: isize = 2;

    /// Month uses `month - 1` over a period of 12 so January sits at angle 0.
    pub fn encode(calendar: &CalendarStamp) -> PilotResult<[f64; 5]> {
        let weekend = if calendar.is_weekend()? { 1.0 } else { 0.0 };
        let (month_sin, month_cos) = cyclic_encode(calendar.month as f64 - 1.0, 12.0);
        let (hour_sin, hour_cos) = cyclic_encode(calendar.hour as f64, 24.0);
        Ok([month_sin, month_cos, weekend, hour_sin, hour_cos])
    }

    pub(crate) fn apply(
        &self,
        raw: &RawObservation,
        vector: &mut ObservationVector,
    ) -> PilotResult<()> {
        if vector.len() < RawObservation::CALENDAR_WIDTH {
            return Err(PilotError::ShapeMismatch {
                context: "time_encoder input",
                expected: RawObservation::CALENDAR_WIDTH,
                actual: vector.len(),
            });
        }
        let encoded = Self::encode(&raw.calendar)?;
        vector.splice(0..RawObservation::CALENDAR_WIDTH, encoded);
        Ok(())
    }
}
