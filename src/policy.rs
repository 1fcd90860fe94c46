// src/policy.rs
//
// Serving-side interface to a trained policy, plus the action decoder.
//
// The policy is a black box: fixed-length observation in, fixed-length
// action in [-1, 1] out. Inference itself (and training) lives elsewhere.
//
// - Policy trait: async `act` so remote inference can be awaited and bounded
//   by the control loop's timeout.
// - ConstantPolicy: fixed action (dry runs, shadow baselines).
// - FnPolicy: wraps a synchronous closure (tests, embedded models).
// - HttpPolicy: POSTs `{"observation": [...]}` and reads `{"action": [...]}`.
// - ActionDecoder: maps normalized actions onto each actuator's physical range.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PilotError, PilotResult};
use crate::live::actuators::ActuatorSpec;
use crate::numeric::denormalize;
use crate::types::BoxFuture;

pub trait Policy: Send + Sync {
    /// Version string recorded with every tick.
    fn version(&self) -> &str;

    fn act<'a>(&'a self, observation: &'a [f64]) -> BoxFuture<'a, PilotResult<Vec<f64>>>;

    /// Episode boundary. Stateless policies ignore it.
    fn reset_episode(&self) {}
}

impl<P: Policy + ?Sized> Policy for Box<P> {
    fn version(&self) -> &str {
        (**self).version()
    }

    fn act<'a>(&'a self, observation: &'a [f64]) -> BoxFuture<'a, PilotResult<Vec<f64>>> {
        (**self).act(observation)
    }

    fn reset_episode(&self) {
        (**self).reset_episode()
    }
}

impl<P: Policy + ?Sized> Policy for Arc<P> {
    fn version(&self) -> &str {
        (**self).version()
    }

    fn act<'a>(&'a self, observation: &'a [f64]) -> BoxFuture<'a, PilotResult<Vec<f64>>> {
        (**self).act(observation)
    }

    fn reset_episode(&self) {
        (**self).reset_episode()
    }
}

#[derive(Debug, Clone)]
pub struct ConstantPolicy {
    version: String,
    action: Vec<f64>,
}

impl ConstantPolicy {
    pub fn new(version: impl Into<String>, action: Vec<f64>) -> Self {
        Self {
            version: version.into(),
            action,
        }
    }
}

impl Policy for ConstantPolicy {
    fn version(&self) -> &str {
        &self.version
    }

    fn act<'a>(&'a self, _observation: &'a [f64]) -> BoxFuture<'a, PilotResult<Vec<f64>>> {
        let action = self.action.clone();
        Box::pin(async move { Ok(action) })
    }
}

/// Synchronous inference closure. Each call runs on the blocking pool, so
/// the control loop's timeout bounds it even when the closure never yields.
pub struct FnPolicy<F> {
    version: String,
    f: Arc<F>,
}

impl<F> FnPolicy<F>
where
    F: Fn(&[f64]) -> PilotResult<Vec<f64>> + Send + Sync + 'static,
{
    pub fn new(version: impl Into<String>, f: F) -> Self {
        Self {
            version: version.into(),
            f: Arc::new(f),
        }
    }
}

impl<F> Policy for FnPolicy<F>
where
    F: Fn(&[f64]) -> PilotResult<Vec<f64>> + Send + Sync + 'static,
{
    fn version(&self) -> &str {
        &self.version
    }

    fn act<'a>(&'a self, observation: &'a [f64]) -> BoxFuture<'a, PilotResult<Vec<f64>>> {
        let f = Arc::clone(&self.f);
        let observation = observation.to_vec();
        Box::pin(async move {
            tokio::task::spawn_blocking(move || (*f)(&observation))
                .await
                .map_err(|e| PilotError::Policy(format!("inference task failed: {}", e)))?
        })
    }
}

#[derive(Serialize)]
struct InferenceRequest<'a> {
    observation: &'a [f64],
}

#[derive(Deserialize)]
struct InferenceResponse {
    action: Vec<f64>,
}

/// Remote inference over HTTP.
#[derive(Debug, Clone)]
pub struct HttpPolicy {
    version: String,
    endpoint: String,
    http: reqwest::Client,
}

impl HttpPolicy {
    pub fn new(version: impl Into<String>, endpoint: impl Into<String>, timeout: Duration) -> PilotResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| PilotError::config(format!("policy http client: {err}")))?;
        Ok(Self {
            version: version.into(),
            endpoint: endpoint.into(),
            http,
        })
    }

    async fn infer(&self, observation: &[f64]) -> PilotResult<Vec<f64>> {
        let resp = self
            .http
            .post(&self.endpoint)
            .json(&InferenceRequest { observation })
            .send()
            .await
            .map_err(|err| PilotError::Policy(format!("inference request: {err}")))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(PilotError::Policy(format!(
                "inference status {}: {}",
                status.as_u16(),
                body
            )));
        }
        let parsed: InferenceResponse = resp
            .json()
            .await
            .map_err(|err| PilotError::Policy(format!("inference response: {err}")))?;
        Ok(parsed.action)
    }
}

impl Policy for HttpPolicy {
    fn version(&self) -> &str {
        &self.version
    }

    fn act<'a>(&'a self, observation: &'a [f64]) -> BoxFuture<'a, PilotResult<Vec<f64>>> {
        Box::pin(self.infer(observation))
    }
}

/// Maps actions in [-1, 1] to `[low, high]` per actuator, in actuator-map
/// order.
#[derive(Debug, Clone)]
pub struct ActionDecoder {
    ranges: Vec<(f64, f64)>,
}

impl ActionDecoder {
    pub fn new(actuators: &[ActuatorSpec]) -> Self {
        Self {
            ranges: actuators.iter().map(|a| (a.low, a.high)).collect(),
        }
    }

    pub fn width(&self) -> usize {
        self.ranges.len()
    }

    /// A wrong-length action is a shape error, never padded or truncated.
    pub fn decode(&self, action: &[f64]) -> PilotResult<Vec<f64>> {
        if action.len() != self.ranges.len() {
            return Err(PilotError::ShapeMismatch {
                context: "policy action",
                expected: self.ranges.len(),
                actual: action.len(),
            });
        }
        Ok(action
            .iter()
            .zip(&self.ranges)
            .map(|(&a, &(low, high))| denormalize(a, low, high))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn actuators() -> Vec<ActuatorSpec> {
        vec![
            ActuatorSpec::new("heating_setpoint", "input_number.heating_setpoint", 15.0, 25.0),
            ActuatorSpec::new("heat_pump", "switch.heat_pump", 0.0, 1.0),
        ]
    }

    #[test]
    fn decoder_maps_each_actuator_range() {
        let d = ActionDecoder::new(&actuators());
        assert_eq!(d.decode(&[0.0, 1.0]).unwrap(), vec![20.0, 1.0]);
        assert_eq!(d.decode(&[-2.0, -1.0]).unwrap(), vec![15.0, 0.0]);
    }

    #[test]
    fn decoder_rejects_wrong_length() {
        let d = ActionDecoder::new(&actuators());
        let err = d.decode(&[0.0]).unwrap_err();
        assert!(matches!(err, PilotError::ShapeMismatch { expected: 2, actual: 1, .. }));
    }

    #[tokio::test]
    async fn constant_and_fn_policies() {
        let c = ConstantPolicy::new("const-v1", vec![0.5]);
        assert_eq!(c.act(&[1.0, 2.0]).await.unwrap(), vec![0.5]);
        assert_eq!(c.version(), "const-v1");

        let f = FnPolicy::new("sum-v1", |obs: &[f64]| Ok(vec![obs.iter().sum::<f64>().tanh()]));
        let boxed: Box<dyn Policy> = Box::new(f);
        let out = boxed.act(&[0.0, 0.0]).await.unwrap();
        assert_eq!(out, vec![0.0]);
        assert_eq!(boxed.version(), "sum-v1");
    }
}
