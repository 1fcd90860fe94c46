// src/safety.rs
//
// Deterministic safety layer between the action decoder and the actuators.

use serde::{Deserialize, Serialize};

use crate::live::actuators::ActuatorSpec;
use crate::types::RawObservation;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    /// Zone temperatures outside `[zone_min_c, zone_max_c]` raise an alert.
    pub zone_min_c: f64,
    pub zone_max_c: f64,
    /// Logical sensor names treated as zone temperatures.
    pub zone_sensors: Vec<String>,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            zone_min_c: 16.0,
            zone_max_c: 28.0,
            zone_sensors: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneAlert {
    pub sensor: String,
    pub value: f64,
    pub limit: f64,
    pub too_cold: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SafetyResult {
    pub raw: Vec<f64>,
    /// `None` when nothing safe can be commanded for that actuator.
    pub applied: Vec<Option<f64>>,
    pub rejection_reasons: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct SafetyLayer {
    limits: Vec<(String, f64, f64)>,
    config: SafetyConfig,
}

impl SafetyLayer {
    pub fn new(actuators: &[ActuatorSpec], config: SafetyConfig) -> Self {
        Self {
            limits: actuators
                .iter()
                .map(|a| (a.name.clone(), a.low.min(a.high), a.low.max(a.high)))
                .collect(),
            config,
        }
    }

    pub fn config(&self) -> &SafetyConfig {
        &self.config
    }

    /// Clamp each command into its actuator range. A non-finite command
    /// holds the previous commanded value.
    pub fn apply(&self, commands: &[f64], previous: &[Option<f64>]) -> SafetyResult {
        let mut reasons = Vec::new();
        let mut applied = Vec::with_capacity(self.limits.len());

        for (i, (name, low, high)) in self.limits.iter().enumerate() {
            let prev = previous.get(i).copied().flatten();
            let value = match commands.get(i) {
                None => {
                    reasons.push(format!("{}_missing", name));
                    prev
                }
                Some(v) if !v.is_finite() => {
                    reasons.push(format!("{}_nan_or_inf", name));
                    prev
                }
                Some(&v) => {
                    let clamped = v.clamp(*low, *high);
                    if (v - clamped).abs() > 1e-12 {
                        reasons.push(format!("{}_clamped", name));
                    }
                    Some(clamped)
                }
            };
            applied.push(value);
        }

        SafetyResult {
            raw: commands.to_vec(),
            applied,
            rejection_reasons: reasons,
        }
    }

    pub fn zone_alerts(&self, raw: &RawObservation) -> Vec<ZoneAlert> {
        let mut alerts = Vec::new();
        for sensor in &self.config.zone_sensors {
            let Some(value) = raw.get(sensor) else {
                continue;
            };
            if value < self.config.zone_min_c {
                alerts.push(ZoneAlert {
                    sensor: sensor.clone(),
                    value,
                    limit: self.config.zone_min_c,
                    too_cold: true,
                });
            } else if value > self.config.zone_max_c {
                alerts.push(ZoneAlert {
                    sensor: sensor.clone(),
                    value,
                    limit: self.config.zone_max_c,
                    too_cold: false,
                });
            }
        }
        alerts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CalendarStamp;

    fn layer() -> SafetyLayer {
        SafetyLayer::new(
            &[
                ActuatorSpec::new("setpoint", "input_number.setpoint", 15.0, 25.0),
                ActuatorSpec::new("pump", "switch.pump", 0.0, 1.0),
            ],
            SafetyConfig {
                zone_sensors: vec!["t_living".into(), "t_bed".into()],
                ..SafetyConfig::default()
            },
        )
    }

    #[test]
    fn clamps_and_records_reasons() {
        let r = layer().apply(&[30.0, 0.5], &[None, None]);
        assert_eq!(r.applied, vec![Some(25.0), Some(0.5)]);
        assert_eq!(r.rejection_reasons, vec!["setpoint_clamped".to_string()]);
    }

    #[test]
    fn non_finite_holds_previous() {
        let r = layer().apply(&[f64::NAN, f64::INFINITY], &[Some(21.0), None]);
        assert_eq!(r.applied, vec![Some(21.0), None]);
        assert_eq!(r.rejection_reasons.len(), 2);
    }

    #[test]
    fn deterministic() {
        let a = layer().apply(&[18.0, 2.0], &[None, None]);
        let b = layer().apply(&[18.0, 2.0], &[None, None]);
        assert_eq!(a, b);
    }

    #[test]
    fn zone_alerts_outside_limits() {
        let raw = RawObservation::new(CalendarStamp::new(2024, 1, 15, 6), 0)
            .with_reading("t_living", 15.2)
            .with_reading("t_bed", 21.0)
            .with_reading("t_out", -3.0);
        let alerts = layer().zone_alerts(&raw);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].sensor, "t_living");
        assert!(alerts[0].too_cold);
    }
}
