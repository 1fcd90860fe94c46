// src/pipeline/forecast.rs
//
// Forward-looking weather window, keyed by the raw observation's step index.
// Appends rows `t .. t+H-1` flattened row-major (H x C values). A short tail
// is an error; the window is never truncated or padded.

use std::path::Path;

use super::StageParams;
use crate::error::{PilotError, PilotResult};
use crate::tables::DelimitedTable;
use crate::types::{ObservationVector, RawObservation};

pub const DEFAULT_INDEX_COLUMN: &str = "timestep";

#[derive(Debug, Clone, PartialEq)]
pub struct ForecastTable {
    columns: Vec<String>,
    /// Strictly ascending step indices.
    index: Vec<i64>,
    rows: Vec<Vec<f64>>,
}

impl ForecastTable {
    pub fn new(columns: Vec<String>, rows: Vec<(i64, Vec<f64>)>) -> PilotResult<Self> {
        if columns.is_empty() {
            return Err(PilotError::config("forecast table has no value columns"));
        }
        let mut index = Vec::with_capacity(rows.len());
        let mut values = Vec::with_capacity(rows.len());
        for (step, row) in rows {
            if row.len() != columns.len() {
                return Err(PilotError::config(format!(
                    "forecast row {} has {} values, expected {}",
                    step,
                    row.len(),
                    columns.len()
                )));
            }
            if let Some(&prev) = index.last() {
                if step == prev {
                    return Err(PilotError::config(format!(
                        "forecast table has duplicate step {}",
                        step
                    )));
                }
                if step < prev {
                    return Err(PilotError::config(format!(
                        "forecast table is not ordered by step ({} after {})",
                        step, prev
                    )));
                }
            }
            index.push(step);
            values.push(row);
        }
        Ok(Self {
            columns,
            index,
            rows: values,
        })
    }

    /// Every column other than `index_column` is a forecast value column.
    pub fn from_table(table: &DelimitedTable, index_column: &str) -> PilotResult<Self> {
        let index_col = table.column_index(index_column)?;
        let value_cols: Vec<usize> = (0..table.headers.len()).filter(|&c| c != index_col).collect();
        let columns = value_cols.iter().map(|&c| table.headers[c].clone()).collect();

        let mut rows = Vec::with_capacity(table.rows.len());
        for r in 0..table.rows.len() {
            let step = table.rows[r][index_col].parse::<i64>().map_err(|_| {
                PilotError::config(format!(
                    "forecast table '{}' row {}: index '{}' is not an integer",
                    table.source,
                    r + 1,
                    table.rows[r][index_col]
                ))
            })?;
            let values = value_cols
                .iter()
                .map(|&c| table.parse_f64(r, c))
                .collect::<PilotResult<Vec<f64>>>()?;
            rows.push((step, values));
        }
        Self::new(columns, rows)
    }

    pub fn load(path: &Path, delimiter: char, index_column: &str) -> PilotResult<Self> {
        Self::from_table(&DelimitedTable::read(path, delimiter)?, index_column)
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Rows `step .. step+horizon-1`, flattened.
    pub fn window(&self, step: i64, horizon: usize) -> PilotResult<Vec<f64>> {
        let start = self
            .index
            .binary_search(&step)
            .map_err(|_| PilotError::LookupMiss(format!("forecast step {}", step)))?;
        let available = self.rows.len() - start;
        if available < horizon {
            return Err(PilotError::DataExhausted {
                step,
                horizon,
                available,
            });
        }
        Ok(self.rows[start..start + horizon]
            .iter()
            .flat_map(|row| row.iter().copied())
            .collect())
    }
}

#[derive(Debug, Clone)]
pub struct ForecastInjector {
    table: ForecastTable,
    horizon: usize,
}

impl ForecastInjector {
    pub fn new(table: ForecastTable, horizon: usize) -> PilotResult<Self> {
        if horizon == 0 {
            return Err(PilotError::config("forecast horizon must be at least 1"));
        }
        Ok(Self { table, horizon })
    }

    /// Params: `path`, `horizon` (required); `delimiter` (`,`),
    /// `index_column` (`timestep`).
    pub(crate) fn from_params(params: &StageParams<'_>) -> PilotResult<Self> {
        let path = params.required_str("path")?;
        let horizon = params.required_usize("horizon")?;
        let delimiter = params.optional_char("delimiter")?.unwrap_or(',');
        let index_column = params
            .optional_str("index_column")?
            .unwrap_or_else(|| DEFAULT_INDEX_COLUMN.to_string());
        let table = ForecastTable::load(Path::new(&path), delimiter, &index_column)?;
        Self::new(table, horizon)
    }

    pub fn horizon(&self) -> usize {
        self.horizon
    }

    pub fn table(&self) -> &ForecastTable {
        &self.table
    }

    pub fn width(&self) -> usize {
        self.horizon * self.table.columns().len()
    }

    pub(crate) fn apply(
        &self,
        raw: &RawObservation,
        vector: &mut ObservationVector,
    ) -> PilotResult<()> {
        vector.extend(self.table.window(raw.step_index, self.horizon)?);
        Ok(())
    }
}
