//! telemetry.rs
//!
//! JSONL telemetry sink for the control loop.
//!
//! One JSON object per tick (`TickRecord`) plus occasional event records
//! (`log_event`). Telemetry never affects control: open or write failures
//! disable the sink for the rest of the process instead of propagating.
//!
//! # Environment variables
//!
//! - `THERMO_PILOT_TELEMETRY_MODE`: `"off"` (default) or `"jsonl"`.
//! - `THERMO_PILOT_TELEMETRY_PATH`: JSONL file path, required for `"jsonl"`.
//! - `THERMO_PILOT_TELEMETRY_APPEND`: `"1"`/`"true"`/`"yes"` appends instead
//!   of truncating.

use std::env;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use tracing::warn;

use crate::live::actuators::WriteOutcome;
use crate::live::sensors::Reading;
use crate::reward::RewardTerms;
use crate::safety::ZoneAlert;
use crate::types::TimestampMs;

/// Current tick record schema version.
pub const SCHEMA_VERSION: i64 = 1;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TelemetryMode {
    #[default]
    Off,
    Jsonl,
}

impl TelemetryMode {
    /// Unknown values are treated as Off.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "jsonl" => TelemetryMode::Jsonl,
            _ => TelemetryMode::Off,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub mode: TelemetryMode,
    pub path: Option<PathBuf>,
    pub append: bool,
}

impl TelemetryConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        cfg.apply_env();
        cfg
    }

    /// Overlay environment variables on top of file configuration.
    pub fn apply_env(&mut self) {
        if let Ok(mode) = env::var("THERMO_PILOT_TELEMETRY_MODE") {
            self.mode = TelemetryMode::parse(&mode);
        }
        if let Ok(path) = env::var("THERMO_PILOT_TELEMETRY_PATH") {
            self.path = Some(PathBuf::from(path));
        }
        if let Ok(value) = env::var("THERMO_PILOT_TELEMETRY_APPEND") {
            self.append = matches!(value.to_lowercase().as_str(), "1" | "true" | "yes");
        }
    }
}

/// Why a tick did not command fresh actuator values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HoldReason {
    SensorUnavailable,
    DeadlineExceeded,
    PolicyTimeout,
    PolicyError,
    SyncFlagNotSet,
}

/// One control tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickRecord {
    pub schema_version: i64,
    pub tick: u64,
    pub now_ms: TimestampMs,
    /// Forecast step the observation was built for.
    #[serde(default)]
    pub step_index: i64,
    pub layout_fingerprint: String,
    pub policy_version: String,
    pub readings: Vec<Reading>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observation: Option<Vec<f64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action_raw: Option<Vec<f64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commands_applied: Option<Vec<Option<f64>>>,
    pub safety_reasons: Vec<String>,
    pub writes: Vec<WriteOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hold: Option<HoldReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub zone_alerts: Vec<ZoneAlert>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reward: Option<RewardTerms>,
    pub elapsed_ms: u64,
}

impl TickRecord {
    pub fn new(tick: u64, now_ms: TimestampMs, layout_fingerprint: &str, policy_version: &str) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            tick,
            now_ms,
            step_index: 0,
            layout_fingerprint: layout_fingerprint.to_string(),
            policy_version: policy_version.to_string(),
            readings: Vec::new(),
            observation: None,
            action_raw: None,
            commands_applied: None,
            safety_reasons: Vec::new(),
            writes: Vec::new(),
            hold: None,
            error: None,
            zone_alerts: Vec::new(),
            reward: None,
            elapsed_ms: 0,
        }
    }

    /// Mark the tick as held: actuators keep their previous commands.
    pub fn set_hold(&mut self, reason: HoldReason, error: Option<String>) {
        self.hold = Some(reason);
        self.error = error;
    }
}

/// When mode == Off every method is a no-op. When mode == Jsonl the file is
/// opened lazily on first use.
pub struct TelemetrySink {
    mode: TelemetryMode,
    path: Option<PathBuf>,
    append: bool,
    writer: Option<BufWriter<File>>,
}

impl TelemetrySink {
    pub fn from_config(cfg: TelemetryConfig) -> Self {
        TelemetrySink {
            mode: cfg.mode,
            path: cfg.path,
            append: cfg.append,
            writer: None,
        }
    }

    pub fn off() -> Self {
        Self::from_config(TelemetryConfig::default())
    }

    pub fn is_enabled(&self) -> bool {
        self.mode == TelemetryMode::Jsonl
    }

    fn ensure_writer(&mut self) -> Option<&mut BufWriter<File>> {
        if self.mode != TelemetryMode::Jsonl {
            return None;
        }

        if self.writer.is_none() {
            let path = match &self.path {
                Some(p) => p.clone(),
                None => {
                    warn!("telemetry mode is jsonl but no path is set; telemetry disabled");
                    self.mode = TelemetryMode::Off;
                    return None;
                }
            };

            if let Some(parent) = path.parent() {
                let _ = std::fs::create_dir_all(parent);
            }

            let mut options = OpenOptions::new();
            options.create(true).write(true);
            if self.append {
                options.append(true);
            } else {
                options.truncate(true);
            }

            let file = match options.open(&path) {
                Ok(f) => f,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "cannot open telemetry file; telemetry disabled");
                    self.mode = TelemetryMode::Off;
                    return None;
                }
            };

            self.writer = Some(BufWriter::new(file));
        }

        self.writer.as_mut()
    }

    pub fn log_json(&mut self, value: &JsonValue) {
        if self.mode != TelemetryMode::Jsonl {
            return;
        }

        let writer = match self.ensure_writer() {
            Some(w) => w,
            None => return,
        };

        let line = match serde_json::to_string(value) {
            Ok(s) => s,
            Err(_) => return,
        };

        if writeln!(writer, "{}", line).is_err() {
            warn!("telemetry write failed; telemetry disabled");
            self.mode = TelemetryMode::Off;
            self.writer = None;
        }
    }

    pub fn log_tick(&mut self, record: &TickRecord) {
        if self.mode != TelemetryMode::Jsonl {
            return;
        }
        if let Ok(value) = serde_json::to_value(record) {
            self.log_json(&value);
        }
    }

    /// Non-tick event (startup, checkpoint, shutdown).
    pub fn log_event(&mut self, now_ms: TimestampMs, event: &str, detail: JsonValue) {
        self.log_json(&json!({
            "schema_version": SCHEMA_VERSION,
            "event": event,
            "now_ms": now_ms,
            "detail": detail,
        }));
    }

    pub fn flush(&mut self) {
        if let Some(writer) = self.writer.as_mut() {
            let _ = writer.flush();
        }
    }
}

impl Drop for TelemetrySink {
    fn drop(&mut self) {
        self.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn off_sink_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.jsonl");
        let mut sink = TelemetrySink::from_config(TelemetryConfig {
            mode: TelemetryMode::Off,
            path: Some(path.clone()),
            append: false,
        });
        sink.log_event(0, "startup", json!({}));
        sink.flush();
        assert!(!path.exists());
    }

    #[test]
    fn jsonl_sink_writes_one_line_per_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("t.jsonl");
        {
            let mut sink = TelemetrySink::from_config(TelemetryConfig {
                mode: TelemetryMode::Jsonl,
                path: Some(path.clone()),
                append: false,
            });
            let mut record = TickRecord::new(3, 1_000, "abc123", "const-v1");
            record.set_hold(HoldReason::PolicyTimeout, Some("slow".into()));
            sink.log_tick(&record);
            sink.log_event(1_000, "checkpoint", json!({"written": 1}));
        }
        let text = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: JsonValue = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["schema_version"], 1);
        assert_eq!(first["hold"], "policy_timeout");
        assert_eq!(first["tick"], 3);
    }

    #[test]
    fn jsonl_without_path_disables_itself() {
        let mut sink = TelemetrySink::from_config(TelemetryConfig {
            mode: TelemetryMode::Jsonl,
            path: None,
            append: false,
        });
        sink.log_event(0, "startup", json!({}));
        assert!(!sink.is_enabled());
    }

    #[test]
    fn mode_parse_defaults_off() {
        assert_eq!(TelemetryMode::parse("JSONL"), TelemetryMode::Jsonl);
        assert_eq!(TelemetryMode::parse("csv"), TelemetryMode::Off);
    }
}
