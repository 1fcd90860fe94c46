// src/error.rs
//
// Error taxonomy for the control stack.
//
// Construction-time problems surface as `Configuration` and abort startup.
// Step-time data-shape problems (`DataExhausted`, `LookupMiss`,
// `ShapeMismatch`, `InvalidCalendar`) abort the run. `SensorUnavailable`,
// `WriteError` and `PolicyInferenceTimeout` are degradable: the control loop
// decides what to do with them according to its configured policies.

use thiserror::Error;

pub type PilotResult<T> = Result<T, PilotError>;

#[derive(Debug, Error)]
pub enum PilotError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("forecast data exhausted at step {step}: horizon {horizon} needs rows that are not there ({available} left)")]
    DataExhausted {
        step: i64,
        horizon: usize,
        available: usize,
    },

    #[error("no table row for key {0}")]
    LookupMiss(String),

    #[error("invalid calendar stamp {year:04}-{month:02}-{day:02} {hour:02}h")]
    InvalidCalendar {
        year: i32,
        month: u32,
        day: u32,
        hour: u32,
    },

    #[error("shape mismatch in {context}: expected {expected}, got {actual}")]
    ShapeMismatch {
        context: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("sensor '{name}' unavailable: {reason}")]
    SensorUnavailable { name: String, reason: String },

    #[error("write to actuator '{name}' failed after {attempts} attempt(s): {reason}")]
    WriteError {
        name: String,
        attempts: u32,
        reason: String,
    },

    #[error("policy inference exceeded {timeout_ms} ms")]
    PolicyInferenceTimeout { timeout_ms: u64 },

    #[error("policy error: {0}")]
    Policy(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl PilotError {
    pub fn config(message: impl Into<String>) -> Self {
        PilotError::Configuration(message.into())
    }

    pub fn sensor_unavailable(name: impl Into<String>, reason: impl Into<String>) -> Self {
        PilotError::SensorUnavailable {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// True when the run cannot continue: the policy would otherwise receive
    /// a vector of the wrong shape, or the process is misconfigured.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            PilotError::SensorUnavailable { .. }
                | PilotError::WriteError { .. }
                | PilotError::PolicyInferenceTimeout { .. }
                | PilotError::Policy(_)
                | PilotError::Backend(_)
        )
    }

    /// Stable label used in telemetry records.
    pub fn reason_label(&self) -> &'static str {
        match self {
            PilotError::Configuration(_) => "configuration",
            PilotError::DataExhausted { .. } => "data_exhausted",
            PilotError::LookupMiss(_) => "lookup_miss",
            PilotError::InvalidCalendar { .. } => "invalid_calendar",
            PilotError::ShapeMismatch { .. } => "shape_mismatch",
            PilotError::SensorUnavailable { .. } => "sensor_unavailable",
            PilotError::WriteError { .. } => "write_error",
            PilotError::PolicyInferenceTimeout { .. } => "policy_inference_timeout",
            PilotError::Policy(_) => "policy",
            PilotError::Backend(_) => "backend",
            PilotError::Io(_) => "io",
            PilotError::Json(_) => "json",
            PilotError::Yaml(_) => "yaml",
        }
    }
}
