// src/live/actuators.rs
//
// Actuator gateway: logical actuator names -> backend service calls, with
// exponential-backoff retry. On exhaustion the caller gets `WriteError` and
// the actuator keeps its previously commanded value.

use std::collections::BTreeSet;
use std::env;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{debug, warn};

use super::backend::{HomeBackend, ServiceCall};
use crate::error::{PilotError, PilotResult};
use crate::types::BoxFuture;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActuatorSpec {
    pub name: String,
    pub entity_id: String,
    /// Physical range the normalized action is mapped onto.
    pub low: f64,
    pub high: f64,
    /// Service name override; the domain default is used otherwise.
    #[serde(default)]
    pub service: Option<String>,
}

impl ActuatorSpec {
    pub fn new(name: &str, entity_id: &str, low: f64, high: f64) -> Self {
        Self {
            name: name.to_string(),
            entity_id: entity_id.to_string(),
            low,
            high,
            service: None,
        }
    }

    pub fn with_service(mut self, service: &str) -> Self {
        self.service = Some(service.to_string());
        self
    }

    pub fn validate(&self) -> PilotResult<()> {
        if !(self.low.is_finite() && self.high.is_finite()) || self.low >= self.high {
            return Err(PilotError::config(format!(
                "actuator '{}' range [{}, {}] is invalid",
                self.name, self.low, self.high
            )));
        }
        if !self.entity_id.contains('.') {
            return Err(PilotError::config(format!(
                "actuator '{}' entity id '{}' has no domain",
                self.name, self.entity_id
            )));
        }
        Ok(())
    }
}

/// Retry configuration for actuator writes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub enabled: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 100,
            max_backoff_ms: 5_000,
            backoff_multiplier: 2.0,
            enabled: true,
        }
    }
}

impl RetryPolicy {
    /// Environment overrides:
    /// - THERMO_PILOT_RETRY_MAX: max retry attempts
    /// - THERMO_PILOT_RETRY_BACKOFF_MS: initial backoff in ms
    /// - THERMO_PILOT_RETRY_ENABLED: enable retries
    pub fn apply_env(&mut self) {
        if let Ok(val) = env::var("THERMO_PILOT_RETRY_MAX") {
            if let Ok(max) = val.parse::<u32>() {
                self.max_retries = max;
            }
        }
        if let Ok(val) = env::var("THERMO_PILOT_RETRY_BACKOFF_MS") {
            if let Ok(ms) = val.parse::<u64>() {
                self.initial_backoff_ms = ms;
            }
        }
        if let Ok(val) = env::var("THERMO_PILOT_RETRY_ENABLED") {
            self.enabled = val.to_lowercase() == "true" || val == "1";
        }
    }

    fn next_backoff(&self, backoff: Duration) -> Duration {
        Duration::from_millis(
            ((backoff.as_millis() as f64) * self.backoff_multiplier).min(self.max_backoff_ms as f64)
                as u64,
        )
    }
}

pub type SleepFn = Arc<dyn Fn(Duration) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteAck {
    pub name: String,
    pub value: f64,
    pub attempts: u32,
}

/// Per-actuator result of one `write_all`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteOutcome {
    pub name: String,
    pub requested: Option<f64>,
    pub ack: Option<WriteAck>,
    pub error: Option<String>,
}

pub struct ActuatorGateway<B> {
    backend: B,
    actuators: Vec<ActuatorSpec>,
    retry: RetryPolicy,
    sleep_fn: SleepFn,
    last_commanded: Vec<Option<f64>>,
}

impl<B> ActuatorGateway<B>
where
    B: HomeBackend,
{
    pub fn new(backend: B, actuators: Vec<ActuatorSpec>, retry: RetryPolicy) -> PilotResult<Self> {
        let mut seen = BTreeSet::new();
        for a in &actuators {
            a.validate()?;
            if !seen.insert(a.name.as_str()) {
                return Err(PilotError::config(format!(
                    "actuator '{}' is mapped more than once",
                    a.name
                )));
            }
        }
        let n = actuators.len();
        Ok(Self {
            backend,
            actuators,
            retry,
            sleep_fn: Arc::new(|duration| Box::pin(sleep(duration))),
            last_commanded: vec![None; n],
        })
    }

    pub fn with_sleep_fn(mut self, sleep_fn: SleepFn) -> Self {
        self.sleep_fn = sleep_fn;
        self
    }

    pub fn actuators(&self) -> &[ActuatorSpec] {
        &self.actuators
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Last value each actuator acknowledged, in actuator-map order.
    pub fn last_commanded(&self) -> &[Option<f64>] {
        &self.last_commanded
    }

    /// Send one service call under the retry policy. Returns the number of
    /// attempts on success.
    pub async fn send(&self, label: &str, call: ServiceCall) -> PilotResult<u32> {
        let mut attempt: u32 = 0;
        let mut backoff = Duration::from_millis(self.retry.initial_backoff_ms);
        loop {
            attempt += 1;
            match self.backend.call_service(call.clone()).await {
                Ok(()) => return Ok(attempt),
                Err(err) => {
                    let retryable = err.is_retryable() && self.retry.enabled;
                    if retryable && attempt <= self.retry.max_retries {
                        debug!(actuator = %label, attempt, backoff_ms = backoff.as_millis() as u64, reason = %err.message, "write failed, retrying");
                        (self.sleep_fn)(backoff).await;
                        backoff = self.retry.next_backoff(backoff);
                        continue;
                    }
                    warn!(actuator = %label, attempts = attempt, reason = %err.message, kind = err.reason_label(), "write failed");
                    return Err(PilotError::WriteError {
                        name: label.to_string(),
                        attempts: attempt,
                        reason: format!("{}: {}", err.reason_label(), err.message),
                    });
                }
            }
        }
    }

    pub async fn write(&mut self, name: &str, value: f64) -> PilotResult<WriteAck> {
        let idx = self
            .actuators
            .iter()
            .position(|a| a.name == name)
            .ok_or_else(|| PilotError::config(format!("actuator '{}' is not mapped", name)))?;
        self.write_index(idx, value).await
    }

    async fn write_index(&mut self, idx: usize, value: f64) -> PilotResult<WriteAck> {
        let spec = &self.actuators[idx];
        let call = ServiceCall::for_entity(&spec.entity_id, value, spec.service.as_deref());
        let name = spec.name.clone();
        let attempts = self.send(&name, call).await?;
        self.last_commanded[idx] = Some(value);
        Ok(WriteAck {
            name,
            value,
            attempts,
        })
    }

    /// Write each actuator in map order. `None` skips that actuator.
    /// A failed write leaves its previous command in place.
    pub async fn write_all(&mut self, values: &[Option<f64>]) -> PilotResult<Vec<WriteOutcome>> {
        if values.len() != self.actuators.len() {
            return Err(PilotError::ShapeMismatch {
                context: "actuator commands",
                expected: self.actuators.len(),
                actual: values.len(),
            });
        }
        let mut outcomes = Vec::with_capacity(values.len());
        for (idx, requested) in values.iter().copied().enumerate() {
            let name = self.actuators[idx].name.clone();
            let outcome = match requested {
                None => WriteOutcome {
                    name,
                    requested,
                    ack: None,
                    error: None,
                },
                Some(value) => match self.write_index(idx, value).await {
                    Ok(ack) => WriteOutcome {
                        name,
                        requested,
                        ack: Some(ack),
                        error: None,
                    },
                    Err(err) => WriteOutcome {
                        name,
                        requested,
                        ack: None,
                        error: Some(err.to_string()),
                    },
                },
            };
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }
}
