// src/pipeline/energy_cost.rs
//
// Hourly energy price keyed by (month, day, hour). One scalar per tick.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Duration, NaiveDateTime};

use super::StageParams;
use crate::error::{PilotError, PilotResult};
use crate::tables::DelimitedTable;
use crate::types::{CalendarStamp, ObservationVector, RawObservation};

pub type PriceKey = (u32, u32, u32);

pub const DEFAULT_DELIMITER: char = ';';
pub const DEFAULT_TIMESTAMP_COLUMN: &str = "datetime";
pub const DEFAULT_VALUE_COLUMN: &str = "value";
/// Price timestamps are keyed one hour after their UTC instant, the same
/// convention the training environment used.
pub const DEFAULT_HOUR_SHIFT: i64 = 1;

#[derive(Debug, Clone, PartialEq)]
pub struct PriceTable {
    prices: BTreeMap<PriceKey, f64>,
}

impl PriceTable {
    pub fn from_entries<I>(entries: I) -> PilotResult<Self>
    where
        I: IntoIterator<Item = (PriceKey, f64)>,
    {
        let mut prices = BTreeMap::new();
        for (key, price) in entries {
            if !price.is_finite() {
                return Err(PilotError::config(format!(
                    "price for {:?} is not finite",
                    key
                )));
            }
            if prices.insert(key, price).is_some() {
                return Err(PilotError::config(format!(
                    "price table has more than one row for (month, day, hour) {:?}",
                    key
                )));
            }
        }
        Ok(Self { prices })
    }

    /// `hour_shift` is added to each timestamp before the key is derived.
    pub fn from_table(
        table: &DelimitedTable,
        timestamp_column: &str,
        value_column: &str,
        hour_shift: i64,
    ) -> PilotResult<Self> {
        let ts_col = table.column_index(timestamp_column)?;
        let value_col = table.column_index(value_column)?;

        let mut entries = Vec::with_capacity(table.rows.len());
        for r in 0..table.rows.len() {
            let raw_ts = &table.rows[r][ts_col];
            let ts = parse_timestamp(raw_ts).ok_or_else(|| {
                PilotError::config(format!(
                    "price table '{}' row {}: unparseable timestamp '{}'",
                    table.source,
                    r + 1,
                    raw_ts
                ))
            })?;
            let shifted = ts + Duration::hours(hour_shift);
            entries.push((
                CalendarStamp::from_datetime(&shifted).key(),
                table.parse_f64(r, value_col)?,
            ));
        }
        Self::from_entries(entries)
    }

    pub fn load(
        path: &Path,
        delimiter: char,
        timestamp_column: &str,
        value_column: &str,
        hour_shift: i64,
    ) -> PilotResult<Self> {
        let table = DelimitedTable::read(path, delimiter)?;
        Self::from_table(&table, timestamp_column, value_column, hour_shift)
    }

    pub fn lookup(&self, key: PriceKey) -> PilotResult<f64> {
        self.prices.get(&key).copied().ok_or_else(|| {
            PilotError::LookupMiss(format!(
                "price (month={}, day={}, hour={})",
                key.0, key.1, key.2
            ))
        })
    }

    pub fn len(&self) -> usize {
        self.prices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prices.is_empty()
    }
}

/// RFC 3339 and zoned timestamps are converted to UTC; naive ones are taken
/// as-is.
fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.naive_utc());
    }
    for fmt in ["%Y-%m-%d %H:%M:%S%:z", "%Y-%m-%d %H:%M:%S%z"] {
        if let Ok(dt) = DateTime::parse_from_str(raw, fmt) {
            return Some(dt.naive_utc());
        }
    }
    for fmt in [
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%d %H:%M",
        "%Y-%m-%dT%H:%M",
    ] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(dt);
        }
    }
    None
}

#[derive(Debug, Clone)]
pub struct EnergyCostInjector {
    table: PriceTable,
}

impl EnergyCostInjector {
    pub fn new(table: PriceTable) -> Self {
        Self { table }
    }

    /// Params: `path` (required); `delimiter` (`;`), `timestamp_column`
    /// (`datetime`), `value_column` (`value`), `hour_shift` ([`DEFAULT_HOUR_SHIFT`]).
    pub(crate) fn from_params(params: &StageParams<'_>) -> PilotResult<Self> {
        let path = params.required_str("path")?;
        let delimiter = params
            .optional_char("delimiter")?
            .unwrap_or(DEFAULT_DELIMITER);
        let ts_col = params
            .optional_str("timestamp_column")?
            .unwrap_or_else(|| DEFAULT_TIMESTAMP_COLUMN.to_string());
        let value_col = params
            .optional_str("value_column")?
            .unwrap_or_else(|| DEFAULT_VALUE_COLUMN.to_string());
        let hour_shift = params
            .optional_i64("hour_shift")?
            .unwrap_or(DEFAULT_HOUR_SHIFT);

        let table = PriceTable::load(Path::new(&path), delimiter, &ts_col, &value_col, hour_shift)?;
        if table.is_empty() {
            return Err(PilotError::config(format!("price table '{}' has no rows", path)));
        }
        Ok(Self::new(table))
    }

    pub fn table(&self) -> &PriceTable {
        &self.table
    }

    pub fn price_at(&self, calendar: &CalendarStamp) -> PilotResult<f64> {
        self.table.lookup(calendar.key())
    }

    pub(crate) fn apply(
        &self,
        raw: &RawObservation,
        vector: &mut ObservationVector,
    ) -> PilotResult<()> {
        vector.push(self.price_at(&raw.calendar)?);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day_table(shift: i64) -> PriceTable {
        let mut text = String::from("datetime;value\n");
        for h in 0..24 {
            text.push_str(&format!("2024-01-15 {:02}:00:00;{}\n", h, 40.0 + h as f64 * 0.25));
        }
        let t = DelimitedTable::parse(&text, ';', "mem").unwrap();
        PriceTable::from_table(&t, "datetime", "value", shift).unwrap()
    }

    #[test]
    fn every_hour_of_the_day_resolves() {
        let prices = day_table(0);
        assert_eq!(prices.len(), 24);
        for h in 0..24 {
            assert_eq!(prices.lookup((1, 15, h)).unwrap(), 40.0 + h as f64 * 0.25);
        }
    }

    #[test]
    fn missing_key_is_lookup_miss() {
        let prices = day_table(0);
        assert!(matches!(
            prices.lookup((1, 16, 0)),
            Err(PilotError::LookupMiss(_))
        ));
    }

    #[test]
    fn hour_shift_moves_keys() {
        let prices = day_table(1);
        assert_eq!(prices.lookup((1, 15, 1)).unwrap(), 40.0);
        // 23:00 shifted by one hour rolls into the next day.
        assert_eq!(prices.lookup((1, 16, 0)).unwrap(), 40.0 + 23.0 * 0.25);
        assert!(prices.lookup((1, 15, 0)).is_err());
    }

    #[test]
    fn zoned_timestamps_are_converted_to_utc() {
        let t = DelimitedTable::parse(
            "datetime;value\n2024-01-15 10:00:00+01:00;41.45\n",
            ';',
            "mem",
        )
        .unwrap();
        let prices = PriceTable::from_table(&t, "datetime", "value", 0).unwrap();
        assert_eq!(prices.lookup((1, 15, 9)).unwrap(), 41.45);
    }

    #[test]
    fn default_params_key_zoned_prices_by_shifted_utc_hour() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prices.csv");
        std::fs::write(&path, "datetime;value\n2024-01-15 10:00:00+01:00;41.45\n").unwrap();

        let mut raw = BTreeMap::new();
        raw.insert(
            "path".to_string(),
            serde_yaml::Value::String(path.display().to_string()),
        );
        let injector = EnergyCostInjector::from_params(&StageParams::new("energy_cost", &raw)).unwrap();

        // 10:00+01:00 is 09:00 UTC, keyed one hour later.
        let stamp = CalendarStamp::new(2024, 1, 15, 10);
        assert_eq!(injector.price_at(&stamp).unwrap(), 41.45);
    }

    #[test]
    fn duplicate_keys_are_configuration_errors() {
        let entries = vec![((1, 15, 10), 1.0), ((1, 15, 10), 2.0)];
        assert!(matches!(
            PriceTable::from_entries(entries),
            Err(PilotError::Configuration(_))
        ));
    }

    #[test]
    fn bad_timestamp_is_configuration_error() {
        let t = DelimitedTable::parse("datetime;value\nyesterday;1.0\n", ';', "mem").unwrap();
        assert!(PriceTable::from_table(&t, "datetime", "value", 0).is_err());
    }
}
