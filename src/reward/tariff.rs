// src/reward/tariff.rs
//
// Peak/off-peak electricity tariff.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{PilotError, PilotResult};
use crate::types::CalendarStamp;

/// Unit prices per kWh.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TariffPrices {
    #[serde(alias = "punta")]
    pub peak: f64,
    #[serde(alias = "fuera_de_punta")]
    pub off_peak: f64,
}

impl Default for TariffPrices {
    fn default() -> Self {
        Self {
            peak: 1.0,
            off_peak: 1.0,
        }
    }
}

/// Inclusive hour range on a set of weekdays (0 = Monday .. 6 = Sunday).
///
/// Days deserialize from indices or from day names, Spanish or English.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeakWindow {
    #[serde(alias = "punta_inicio")]
    pub start_hour: u32,
    #[serde(alias = "punta_fin")]
    pub end_hour: u32,
    #[serde(alias = "dias_punta", deserialize_with = "deserialize_days")]
    pub days: Vec<u32>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DayRef {
    Index(u32),
    Name(String),
}

fn day_index(name: &str) -> Option<u32> {
    let day = match name.trim().to_lowercase().as_str() {
        "lunes" | "monday" | "mon" => 0,
        "martes" | "tuesday" | "tue" => 1,
        "miercoles" | "miércoles" | "wednesday" | "wed" => 2,
        "jueves" | "thursday" | "thu" => 3,
        "viernes" | "friday" | "fri" => 4,
        "sabado" | "sábado" | "saturday" | "sat" => 5,
        "domingo" | "sunday" | "sun" => 6,
        _ => return None,
    };
    Some(day)
}

fn deserialize_days<'de, D>(deserializer: D) -> Result<Vec<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    Vec::<DayRef>::deserialize(deserializer)?
        .into_iter()
        .map(|d| match d {
            DayRef::Index(i) => Ok(i),
            DayRef::Name(name) => day_index(&name)
                .ok_or_else(|| {
                <D::Error as serde::de::Error>::custom(format!("unknown day name '{}'", name))
            }),
        })
        .collect()
}

impl Default for PeakWindow {
    fn default() -> Self {
        Self {
            start_hour: 17,
            end_hour: 20,
            days: vec![0, 1, 2, 3, 4],
        }
    }
}

impl PeakWindow {
    pub fn contains(&self, calendar: &CalendarStamp) -> PilotResult<bool> {
        let weekday = calendar.weekday()?.num_days_from_monday();
        Ok(self.days.contains(&weekday)
            && (self.start_hour..=self.end_hour).contains(&calendar.hour))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Tariff {
    #[serde(default, alias = "precios")]
    pub prices: TariffPrices,
    #[serde(default, alias = "horarios")]
    pub peak_window: PeakWindow,
}

impl Tariff {
    pub fn flat(price: f64) -> Self {
        Self {
            prices: TariffPrices {
                peak: price,
                off_peak: price,
            },
            peak_window: PeakWindow::default(),
        }
    }

    /// Tariff file: `{"prices": {"peak", "off_peak"}, "peak_window":
    /// {"start_hour", "end_hour", "days"}}`. The Spanish layout
    /// `{"precios": {"punta", "fuera_de_punta"}, "horarios": {"punta_inicio",
    /// "punta_fin", "dias_punta": ["lunes", ..]}}` is read as well.
    pub fn load(path: &Path) -> PilotResult<Self> {
        let text = fs::read_to_string(path).map_err(|e| {
            PilotError::config(format!("cannot read tariff '{}': {}", path.display(), e))
        })?;
        let tariff: Tariff = serde_json::from_str(&text).map_err(|e| {
            PilotError::config(format!("malformed tariff '{}': {}", path.display(), e))
        })?;
        tariff.validate()?;
        Ok(tariff)
    }

    pub fn validate(&self) -> PilotResult<()> {
        let p = &self.prices;
        if !(p.peak.is_finite() && p.off_peak.is_finite()) || p.peak < 0.0 || p.off_peak < 0.0 {
            return Err(PilotError::config("tariff prices must be finite and non-negative"));
        }
        let w = &self.peak_window;
        if w.start_hour > 23 || w.end_hour > 23 || w.start_hour > w.end_hour {
            return Err(PilotError::config(format!(
                "peak window hours {}..={} are not a valid range",
                w.start_hour, w.end_hour
            )));
        }
        if let Some(d) = w.days.iter().find(|d| **d > 6) {
            return Err(PilotError::config(format!(
                "peak window day {} is not in 0 (Mon) ..= 6 (Sun)",
                d
            )));
        }
        Ok(())
    }

    pub fn is_peak(&self, calendar: &CalendarStamp) -> PilotResult<bool> {
        self.peak_window.contains(calendar)
    }

    pub fn unit_price(&self, peak: bool) -> f64 {
        if peak {
            self.prices.peak
        } else {
            self.prices.off_peak
        }
    }
}
