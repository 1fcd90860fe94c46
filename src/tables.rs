// src/tables.rs
//
// Delimited-text tables (forecast and price sources).
//
// Tables are read once at construction. Any problem with the file itself
// (missing, empty, ragged rows, unknown columns) is a configuration error:
// the pipeline must not start on a table it cannot trust.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use crate::error::{PilotError, PilotResult};

#[derive(Debug, Clone, PartialEq)]
pub struct DelimitedTable {
    pub source: String,
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl DelimitedTable {
    pub fn read(path: &Path, delimiter: char) -> PilotResult<Self> {
        let file = File::open(path).map_err(|e| {
            PilotError::config(format!("cannot read table '{}': {}", path.display(), e))
        })?;
        Self::from_reader(file, delimiter, &path.display().to_string())
    }

    pub fn parse(text: &str, delimiter: char, source: &str) -> PilotResult<Self> {
        Self::from_reader(text.as_bytes(), delimiter, source)
    }

    fn from_reader<R: Read>(input: R, delimiter: char, source: &str) -> PilotResult<Self> {
        if !delimiter.is_ascii() {
            return Err(PilotError::config(format!(
                "table '{}': delimiter {:?} is not a single-byte character",
                source, delimiter
            )));
        }

        let mut reader = csv::ReaderBuilder::new()
            .delimiter(delimiter as u8)
            .has_headers(true)
            .flexible(false)
            .trim(csv::Trim::All)
            .from_reader(input);

        let headers: Vec<String> = reader
            .headers()
            .map_err(|e| table_error(source, e))?
            .iter()
            .map(str::to_string)
            .collect();
        if headers.is_empty() || headers.iter().all(String::is_empty) {
            return Err(PilotError::config(format!("table '{}' is empty", source)));
        }

        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record.map_err(|e| table_error(source, e))?;
            rows.push(record.iter().map(str::to_string).collect());
        }

        Ok(Self {
            source: source.to_string(),
            headers,
            rows,
        })
    }

    pub fn column_index(&self, name: &str) -> PilotResult<usize> {
        self.headers.iter().position(|h| h == name).ok_or_else(|| {
            PilotError::config(format!(
                "table '{}' has no column '{}' (columns: {})",
                self.source,
                name,
                self.headers.join(", ")
            ))
        })
    }

    pub fn parse_f64(&self, row: usize, col: usize) -> PilotResult<f64> {
        let raw = &self.rows[row][col];
        raw.parse::<f64>().map_err(|_| {
            PilotError::config(format!(
                "table '{}' row {} column '{}': '{}' is not numeric",
                self.source,
                row + 1,
                self.headers[col],
                raw
            ))
        })
    }
}

fn table_error(source: &str, err: csv::Error) -> PilotError {
    match err.kind() {
        csv::ErrorKind::UnequalLengths {
            pos,
            expected_len,
            len,
        } => PilotError::config(format!(
            "table '{}' line {} has {} fields, header has {}",
            source,
            pos.as_ref().map(|p| p.line()).unwrap_or(0),
            len,
            expected_len
        )),
        _ => PilotError::config(format!("table '{}': {}", source, err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_header_and_rows() {
        let t = DelimitedTable::parse("a;b\n1;2\n\n3;4\n", ';', "mem").unwrap();
        assert_eq!(t.headers, vec!["a", "b"]);
        assert_eq!(t.rows.len(), 2);
        assert_eq!(t.column_index("b").unwrap(), 1);
        assert_eq!(t.parse_f64(1, 0).unwrap(), 3.0);
    }

    #[test]
    fn quoted_fields_are_unwrapped() {
        let t = DelimitedTable::parse("\"datetime\",\"value\"\n\"x\",\"1.5\"", ',', "mem").unwrap();
        assert_eq!(t.headers, vec!["datetime", "value"]);
        assert_eq!(t.parse_f64(0, 1).unwrap(), 1.5);
    }

    #[test]
    fn quoted_field_may_contain_the_delimiter() {
        let t = DelimitedTable::parse("name;value\n\"Peaje; punta\";41.45\n", ';', "mem").unwrap();
        assert_eq!(t.rows, vec![vec!["Peaje; punta".to_string(), "41.45".to_string()]]);
        assert_eq!(t.parse_f64(0, 1).unwrap(), 41.45);
    }

    #[test]
    fn ragged_rows_are_configuration_errors() {
        let err = DelimitedTable::parse("a,b\n1,2,3", ',', "mem").unwrap_err();
        assert!(matches!(err, PilotError::Configuration(_)));
    }

    #[test]
    fn empty_input_is_configuration_error() {
        let err = DelimitedTable::parse("", ';', "mem").unwrap_err();
        assert!(matches!(err, PilotError::Configuration(_)));
    }

    #[test]
    fn multibyte_delimiter_is_rejected() {
        assert!(DelimitedTable::parse("a§b\n1§2", '§', "mem").is_err());
    }

    #[test]
    fn missing_file_is_configuration_error() {
        let err = DelimitedTable::read(Path::new("/nonexistent/prices.csv"), ';').unwrap_err();
        assert!(matches!(err, PilotError::Configuration(_)));
    }

    #[test]
    fn unknown_column_is_reported() {
        let t = DelimitedTable::parse("a,b\n1,2", ',', "mem").unwrap();
        assert!(t.column_index("value").is_err());
        assert!(t.parse_f64(0, 0).is_ok());
    }
}
