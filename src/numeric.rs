// src/numeric.rs
//
// Shared numeric helpers: cyclic encoding, Welford running moments,
// the simplified PMV regression and action denormalization.

use std::f64::consts::PI;

use serde::{Deserialize, Serialize};

/// `(sin, cos)` of `2π·x/period`.
pub fn cyclic_encode(x: f64, period: f64) -> (f64, f64) {
    let angle = 2.0 * PI * x / period;
    (angle.sin(), angle.cos())
}

/// Running mean / population variance of one channel (Welford).
///
/// Stored as `(mean, var, count)` so persisted stats stay readable; the
/// second moment is recovered as `var * count` on update.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RunningMoments {
    pub mean: f64,
    pub var: f64,
    pub count: u64,
}

impl Default for RunningMoments {
    fn default() -> Self {
        Self {
            mean: 0.0,
            var: 1.0,
            count: 0,
        }
    }
}

impl RunningMoments {
    pub fn update(&mut self, x: f64) {
        let prev_count = self.count as f64;
        let m2 = self.var * prev_count;
        self.count += 1;
        let n = self.count as f64;
        let delta = x - self.mean;
        self.mean += delta / n;
        let m2 = m2 + delta * (x - self.mean);
        self.var = (m2 / n).max(0.0);
    }

    pub fn normalize(&self, x: f64, epsilon: f64) -> f64 {
        (x - self.mean) / (self.var + epsilon).sqrt()
    }
}

/// Predicted mean vote from dry-bulb temperature (°C) and relative
/// humidity (%), regression fitted at clo=0.57, met=1.2, vr=0.1.
pub fn estimate_pmv(tdb: f64, rh: f64) -> f64 {
    -7.4928 + 0.2882 * tdb - 0.0020 * rh + 0.0004 * tdb * rh
}

/// Map a policy output in `[-1, 1]` onto `[low, high]`, clipping first.
/// NaN passes through so the safety layer can reject it.
pub fn denormalize(action: f64, low: f64, high: f64) -> f64 {
    let a = action.clamp(-1.0, 1.0);
    low + (a + 1.0) * 0.5 * (high - low)
}

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Population variance; 0 for fewer than two samples.
pub fn variance<'a, I>(values: I) -> f64
where
    I: IntoIterator<Item = &'a f64>,
{
    let values: Vec<f64> = values.into_iter().copied().collect();
    if values.len() < 2 {
        return 0.0;
    }
    let m = values.iter().sum::<f64>() / values.len() as f64;
    values.iter().map(|v| (v - m) * (v - m)).sum::<f64>() / values.len() as f64
}
