// src/reward/mod.rs
//
// Reward engine for (comfort, energy, time-of-day) triples.
//
// r = w * λ_E * energy_penalty
//   + (1 - w) * λ_T * comfort_penalty
//   + comfort_bonus
//   [+ flat_peak_term + cycling_term + stability_term]
//
// Every term is returned in `RewardTerms` so a degenerate equilibrium can be
// read off the per-step log instead of hiding inside one scalar.
//
// Known hazard: enabling both the cycling penalty and the stability
// (comfort-variance) penalty makes "never engage the actuator" cheaper than
// sustained heating. Both apply every step while the bonus only pays inside
// the comfort band, so a frozen, stable, uncomfortable zone scores better
// than the transitions needed to reach the band.

pub mod tariff;

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::error::{PilotError, PilotResult};
use crate::numeric::{estimate_pmv, mean, variance};
use crate::types::{CalendarStamp, RawObservation};

pub use tariff::{PeakWindow, Tariff, TariffPrices};

/// Which optional terms contribute to the scalar reward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RewardToggles {
    pub peak_multiplier: bool,
    pub waste_factor: bool,
    pub comfort_bonus: bool,
    /// Per-zone violation `d + d²` instead of `d`.
    pub quadratic_violation: bool,
    pub flat_peak_penalty: bool,
    pub cycling_penalty: bool,
    pub stability_penalty: bool,
}

impl Default for RewardToggles {
    fn default() -> Self {
        Self {
            peak_multiplier: true,
            waste_factor: true,
            comfort_bonus: true,
            quadratic_violation: false,
            flat_peak_penalty: false,
            cycling_penalty: false,
            stability_penalty: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RewardConfig {
    /// Energy weight `w` in [0, 1]; comfort gets `1 - w`.
    pub energy_weight: f64,
    pub lambda_energy: f64,
    pub lambda_temperature: f64,
    pub comfort_low: f64,
    pub comfort_high: f64,
    pub waste_coef: f64,
    pub comfort_threshold: f64,
    pub peak_multiplier: f64,
    pub bonus_value: f64,
    /// Magnitude of the fixed penalty for any energy use during peak.
    pub flat_peak_penalty: f64,
    /// Magnitude of the penalty per on/off transition.
    pub cycling_penalty: f64,
    /// Coefficient on the variance of recent average comfort.
    pub stability_coef: f64,
    pub history_len: usize,
    pub tariff: Tariff,
    pub toggles: RewardToggles,
}

impl Default for RewardConfig {
    fn default() -> Self {
        Self {
            energy_weight: 0.5,
            lambda_energy: 1.0,
            lambda_temperature: 1.0,
            comfort_low: -0.5,
            comfort_high: 0.5,
            waste_coef: 50.0,
            comfort_threshold: -0.5,
            peak_multiplier: 1.0,
            bonus_value: 10.0,
            flat_peak_penalty: 500.0,
            cycling_penalty: 1.0,
            stability_coef: 1.0,
            history_len: 6,
            tariff: Tariff::default(),
            toggles: RewardToggles::default(),
        }
    }
}

impl RewardConfig {
    pub fn validate(&self) -> PilotResult<()> {
        if !(0.0..=1.0).contains(&self.energy_weight) {
            return Err(PilotError::config(format!(
                "reward energy_weight must be in [0, 1], got {}",
                self.energy_weight
            )));
        }
        let scalars = [
            ("lambda_energy", self.lambda_energy),
            ("lambda_temperature", self.lambda_temperature),
            ("comfort_low", self.comfort_low),
            ("comfort_high", self.comfort_high),
            ("waste_coef", self.waste_coef),
            ("comfort_threshold", self.comfort_threshold),
            ("peak_multiplier", self.peak_multiplier),
            ("bonus_value", self.bonus_value),
            ("flat_peak_penalty", self.flat_peak_penalty),
            ("cycling_penalty", self.cycling_penalty),
            ("stability_coef", self.stability_coef),
        ];
        if let Some((name, v)) = scalars.iter().find(|(_, v)| !v.is_finite()) {
            return Err(PilotError::config(format!(
                "reward {} must be finite, got {}",
                name, v
            )));
        }
        if self.comfort_low > self.comfort_high {
            return Err(PilotError::config(format!(
                "reward comfort band [{}, {}] is inverted",
                self.comfort_low, self.comfort_high
            )));
        }
        if self.history_len == 0 {
            return Err(PilotError::config("reward history_len must be at least 1"));
        }
        self.tariff.validate()
    }
}

/// One step's inputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RewardInput {
    /// Per-zone comfort index (PMV-like; 0 is neutral, negative is cold).
    pub zone_comfort: Vec<f64>,
    /// Aggregate energy over the step, kWh.
    pub energy_kwh: f64,
    /// Whether the actuator was engaged this step.
    pub actuator_on: bool,
}

/// One comfort zone: temperature and humidity sensors feeding the PMV
/// estimate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneBinding {
    pub temperature: String,
    pub humidity: String,
}

/// Binds mapped sensors to reward inputs so the live loop can log the reward
/// it would have earned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RewardBinding {
    pub zones: Vec<ZoneBinding>,
    pub energy_sensors: Vec<String>,
    /// Multiplier from the summed energy readings to kWh per step
    /// (e.g. 0.001 for average watts over a one-hour step).
    #[serde(default = "default_energy_scale")]
    pub energy_scale: f64,
    /// Actuator whose last command decides `actuator_on` (> 0.5). When
    /// absent, any energy use counts as on.
    #[serde(default)]
    pub on_actuator: Option<String>,
}

fn default_energy_scale() -> f64 {
    1.0
}

impl RewardBinding {
    pub fn validate(&self, sensor_names: &[&str], actuator_names: &[&str]) -> PilotResult<()> {
        let zone_names = self
            .zones
            .iter()
            .flat_map(|z| [z.temperature.as_str(), z.humidity.as_str()]);
        for name in zone_names.chain(self.energy_sensors.iter().map(String::as_str)) {
            if !sensor_names.contains(&name) {
                return Err(PilotError::config(format!(
                    "reward binding refers to unmapped sensor '{}'",
                    name
                )));
            }
        }
        if let Some(a) = &self.on_actuator {
            if !actuator_names.contains(&a.as_str()) {
                return Err(PilotError::config(format!(
                    "reward binding refers to unmapped actuator '{}'",
                    a
                )));
            }
        }
        if !self.energy_scale.is_finite() || self.energy_scale < 0.0 {
            return Err(PilotError::config("reward energy_scale must be finite and non-negative"));
        }
        Ok(())
    }

    /// Build the step input from one raw observation.
    pub fn input(&self, raw: &RawObservation, actuator_on: Option<bool>) -> PilotResult<RewardInput> {
        let get = |name: &str| {
            raw.get(name).ok_or_else(|| {
                PilotError::config(format!("reward binding sensor '{}' missing from observation", name))
            })
        };
        let mut zone_comfort = Vec::with_capacity(self.zones.len());
        for z in &self.zones {
            zone_comfort.push(estimate_pmv(get(&z.temperature)?, get(&z.humidity)?));
        }
        let mut energy = 0.0;
        for name in &self.energy_sensors {
            energy += get(name)?;
        }
        let energy_kwh = energy * self.energy_scale;
        Ok(RewardInput {
            zone_comfort,
            energy_kwh,
            actuator_on: actuator_on.unwrap_or(energy_kwh > 0.0),
        })
    }
}

/// Every contribution to one reward value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RewardTerms {
    pub is_peak: bool,
    pub unit_price: f64,
    pub energy_kwh: f64,
    pub avg_comfort: Option<f64>,
    pub zones_in_band: usize,
    pub waste_factor: f64,
    pub energy_penalty: f64,
    pub comfort_penalty: f64,
    pub energy_term: f64,
    pub comfort_term: f64,
    pub comfort_bonus: f64,
    pub flat_peak_term: f64,
    pub cycling_term: f64,
    pub stability_term: f64,
    pub reward: f64,
}

/// Per-episode memory for the temporal-shaping terms.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RewardState {
    history: VecDeque<f64>,
    prev_on: Option<bool>,
}

impl RewardState {
    pub fn reset(&mut self) {
        self.history.clear();
        self.prev_on = None;
    }

    pub fn history(&self) -> &VecDeque<f64> {
        &self.history
    }

    pub fn prev_on(&self) -> Option<bool> {
        self.prev_on
    }
}

#[derive(Debug, Clone)]
pub struct RewardEngine {
    config: RewardConfig,
    state: RewardState,
}

impl RewardEngine {
    pub fn new(config: RewardConfig) -> PilotResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            state: RewardState::default(),
        })
    }

    pub fn config(&self) -> &RewardConfig {
        &self.config
    }

    pub fn state(&self) -> &RewardState {
        &self.state
    }

    /// Episode boundary.
    pub fn reset(&mut self) {
        self.state.reset();
    }

    /// Score with the peak flag derived from the tariff's peak window.
    pub fn score_at(
        &mut self,
        input: &RewardInput,
        calendar: &CalendarStamp,
    ) -> PilotResult<RewardTerms> {
        let peak = self.config.tariff.is_peak(calendar)?;
        Ok(self.score(input, peak))
    }

    pub fn score(&mut self, input: &RewardInput, is_peak: bool) -> RewardTerms {
        let cfg = &self.config;
        let toggles = cfg.toggles;
        let energy = input.energy_kwh.max(0.0);
        let unit_price = cfg.tariff.unit_price(is_peak);
        let avg_comfort = mean(&input.zone_comfort);

        // 1-3: energy.
        let mut energy_penalty = -energy * unit_price;
        if is_peak && toggles.peak_multiplier {
            energy_penalty *= cfg.peak_multiplier;
        }
        let mut waste_factor = 1.0;
        if toggles.waste_factor && energy > 0.0 {
            if let Some(avg) = avg_comfort {
                if avg > cfg.comfort_threshold {
                    let excess = avg - cfg.comfort_threshold;
                    waste_factor = 1.0 + cfg.waste_coef * excess * excess;
                    energy_penalty *= waste_factor;
                }
            }
        }

        // 4-5: comfort.
        let mut violation = 0.0;
        let mut zones_in_band = 0;
        for &c in &input.zone_comfort {
            let d = (cfg.comfort_low - c).max(0.0) + (c - cfg.comfort_high).max(0.0);
            if d > 0.0 {
                violation += if toggles.quadratic_violation { d + d * d } else { d };
            } else {
                zones_in_band += 1;
            }
        }
        let comfort_penalty = -violation;
        let comfort_bonus = if toggles.comfort_bonus {
            zones_in_band as f64 * cfg.bonus_value
        } else {
            0.0
        };

        let flat_peak_term = if toggles.flat_peak_penalty && is_peak && energy > 0.0 {
            -cfg.flat_peak_penalty.abs()
        } else {
            0.0
        };

        // Temporal shaping. State advances whether or not the terms are on.
        let cycling_term = match self.state.prev_on {
            Some(prev) if toggles.cycling_penalty && prev != input.actuator_on => {
                -cfg.cycling_penalty.abs()
            }
            _ => 0.0,
        };
        self.state.prev_on = Some(input.actuator_on);

        if let Some(avg) = avg_comfort {
            self.state.history.push_back(avg);
            while self.state.history.len() > cfg.history_len {
                self.state.history.pop_front();
            }
        }
        let stability_term = if toggles.stability_penalty && self.state.history.len() >= 2 {
            -cfg.stability_coef * variance(self.state.history.iter())
        } else {
            0.0
        };

        // 6: combine.
        let energy_term = cfg.energy_weight * cfg.lambda_energy * energy_penalty;
        let comfort_term = (1.0 - cfg.energy_weight) * cfg.lambda_temperature * comfort_penalty;
        let reward =
            energy_term + comfort_term + comfort_bonus + flat_peak_term + cycling_term + stability_term;

        RewardTerms {
            is_peak,
            unit_price,
            energy_kwh: energy,
            avg_comfort,
            zones_in_band,
            waste_factor,
            energy_penalty,
            comfort_penalty,
            energy_term,
            comfort_term,
            comfort_bonus,
            flat_peak_term,
            cycling_term,
            stability_term,
            reward,
        }
    }
}
