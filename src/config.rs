// src/config.rs
//
// Deployment configuration for the control loop: one YAML document mapping
// logical sensors and actuators to backend entities, the ordered pipeline
// stages, control timing, fallbacks, retry, safety, telemetry, the optional
// reward wiring and the policy endpoint.
//
// Secrets and per-host paths can be overridden from the environment:
// - THERMO_PILOT_BACKEND_URL / THERMO_PILOT_BACKEND_TOKEN
// - THERMO_PILOT_TELEMETRY_MODE / _PATH / _APPEND
// - THERMO_PILOT_RETRY_MAX / _BACKOFF_MS / _ENABLED

use std::collections::BTreeSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{PilotError, PilotResult};
use crate::live::actuators::{ActuatorGateway, ActuatorSpec, RetryPolicy};
use crate::live::backend::{HomeBackend, HttpBackend};
use crate::live::runner::{ControlLoop, ControlSettings};
use crate::live::sensors::{SensorFallback, SensorGateway, SensorSpec};
use crate::pipeline::{ObservationPipeline, StageSpec};
use crate::policy::{ConstantPolicy, HttpPolicy, Policy};
use crate::reward::tariff::Tariff;
use crate::reward::{RewardBinding, RewardConfig, RewardEngine};
use crate::safety::SafetyConfig;
use crate::telemetry::{TelemetryConfig, TelemetrySink};
use crate::types::RawObservation;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    pub url: String,
    #[serde(default)]
    pub token: String,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_request_timeout_ms() -> u64 {
    5_000
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8123".to_string(),
            token: String::new(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub version: String,
    /// Remote inference endpoint.
    pub endpoint: Option<String>,
    /// Fixed normalized action, used when no endpoint is configured.
    pub constant_action: Option<Vec<f64>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Human-readable config / release version.
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub backend: BackendConfig,
    /// Logical sensors in raw-layout order.
    pub sensors: Vec<SensorSpec>,
    /// Actuators in action-vector order.
    pub actuators: Vec<ActuatorSpec>,
    /// Pipeline stages in application order.
    #[serde(default)]
    pub pipeline: Vec<StageSpec>,
    #[serde(default)]
    pub control: ControlSettings,
    /// Fallback for sensors without their own.
    #[serde(default)]
    pub sensor_fallback: SensorFallback,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub safety: SafetyConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub reward: Option<RewardConfig>,
    #[serde(default)]
    pub reward_binding: Option<RewardBinding>,
    /// Tariff JSON replacing `reward.tariff`.
    #[serde(default)]
    pub tariff_path: Option<PathBuf>,
    #[serde(default)]
    pub policy: PolicyConfig,
}

impl Config {
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> PilotResult<Self> {
        let contents = fs::read_to_string(path.as_ref()).map_err(|e| {
            PilotError::config(format!("cannot read {}: {}", path.as_ref().display(), e))
        })?;
        Self::from_yaml_str(&contents)
    }

    /// Parse and validate. Environment overrides are not applied here.
    pub fn from_yaml_str(yaml: &str) -> PilotResult<Self> {
        let cfg: Config = serde_yaml::from_str(yaml)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = env::var("THERMO_PILOT_BACKEND_URL") {
            info!(url = %url, "backend url overridden from environment");
            self.backend.url = url;
        }
        if let Ok(token) = env::var("THERMO_PILOT_BACKEND_TOKEN") {
            self.backend.token = token;
        }
        self.telemetry.apply_env();
        self.retry.apply_env();
    }

    pub fn validate(&self) -> PilotResult<()> {
        if self.sensors.is_empty() {
            return Err(PilotError::config("at least one sensor must be mapped"));
        }
        if self.actuators.is_empty() {
            return Err(PilotError::config("at least one actuator must be mapped"));
        }
        let mut names = BTreeSet::new();
        for s in &self.sensors {
            if !names.insert(s.name.as_str()) {
                return Err(PilotError::config(format!(
                    "sensor '{}' is mapped more than once",
                    s.name
                )));
            }
        }
        for a in &self.actuators {
            a.validate()?;
        }
        self.control.validate()?;
        if let Some(reward) = &self.reward {
            reward.validate()?;
        }
        if self.reward_binding.is_some() && self.reward.is_none() {
            return Err(PilotError::config("reward_binding is set but reward is not"));
        }
        if let Some(action) = &self.policy.constant_action {
            if action.len() != self.actuators.len() {
                return Err(PilotError::ShapeMismatch {
                    context: "policy constant_action",
                    expected: self.actuators.len(),
                    actual: action.len(),
                });
            }
        }
        Ok(())
    }

    /// Raw observation width: calendar fields plus one value per sensor.
    pub fn base_width(&self) -> usize {
        RawObservation::CALENDAR_WIDTH + self.sensors.len()
    }

    pub fn build_pipeline(&self) -> PilotResult<ObservationPipeline> {
        ObservationPipeline::from_specs(&self.pipeline, self.base_width())
    }

    pub fn build_reward_engine(&self) -> PilotResult<Option<RewardEngine>> {
        let Some(reward) = &self.reward else {
            return Ok(None);
        };
        let mut reward = reward.clone();
        if let Some(path) = &self.tariff_path {
            reward.tariff = Tariff::load(path)?;
        }
        RewardEngine::new(reward).map(Some)
    }

    pub fn build_http_backend(&self) -> PilotResult<HttpBackend> {
        HttpBackend::new(
            &self.backend.url,
            &self.backend.token,
            Duration::from_millis(self.backend.request_timeout_ms),
        )
    }

    pub fn build_policy(&self) -> PilotResult<Box<dyn Policy>> {
        let version = if self.policy.version.is_empty() {
            "unversioned".to_string()
        } else {
            self.policy.version.clone()
        };
        match (&self.policy.endpoint, &self.policy.constant_action) {
            (Some(endpoint), _) => Ok(Box::new(HttpPolicy::new(
                version,
                endpoint.clone(),
                Duration::from_millis(self.control.policy_timeout_ms),
            )?)),
            (None, Some(action)) => Ok(Box::new(ConstantPolicy::new(version, action.clone()))),
            (None, None) => Err(PilotError::config(
                "policy needs either an endpoint or a constant_action",
            )),
        }
    }

    /// Assemble the full control loop over `backend`.
    pub fn build_control_loop<B, P>(&self, backend: B, policy: P) -> PilotResult<ControlLoop<B, P>>
    where
        B: HomeBackend + Clone,
        P: Policy,
    {
        let pipeline = self.build_pipeline()?;
        let sensors = SensorGateway::new(
            backend.clone(),
            self.sensors.clone(),
            self.sensor_fallback.clone(),
            Duration::from_millis(self.control.sensor_timeout_ms),
        )?;
        let actuators = ActuatorGateway::new(backend, self.actuators.clone(), self.retry.clone())?;
        let mut control = ControlLoop::new(pipeline, sensors, actuators, policy, self.control.clone())?
            .with_safety(self.safety.clone())?
            .with_telemetry(TelemetrySink::from_config(self.telemetry.clone()));
        if let (Some(engine), Some(binding)) = (self.build_reward_engine()?, &self.reward_binding) {
            control = control.with_reward(engine, binding.clone())?;
        }
        Ok(control)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
version: "site-a-2024"
backend:
  url: "http://ha.local:8123"
  token: "secret"
sensors:
  - name: t_in
    entity_id: sensor.living_temperature
  - name: rh_in
    entity_id: sensor.living_humidity
    fallback:
      mode: last_known_good
      max_staleness_ms: 600000
  - name: power
    entity_id: sensor.heat_pump_power
actuators:
  - name: setpoint
    entity_id: input_number.heat_setpoint
    low: 16.0
    high: 24.0
  - name: pump
    entity_id: switch.heat_pump
    low: 0.0
    high: 1.0
pipeline:
  - stage: time_encoder
control:
  interval_ms: 60000
  safety_margin_ms: 5000
  boundary: abort
sensor_fallback:
  mode: fail_tick
reward:
  energy_weight: 0.5
reward_binding:
  zones:
    - temperature: t_in
      humidity: rh_in
  energy_sensors: [power]
  energy_scale: 0.001
  on_actuator: pump
policy:
  version: "ppo-v3"
  constant_action: [0.0, -1.0]
"#;

    #[test]
    fn parses_full_document() {
        let cfg = Config::from_yaml_str(YAML).unwrap();
        assert_eq!(cfg.sensors.len(), 3);
        assert_eq!(cfg.base_width(), 6);
        assert_eq!(
            cfg.sensors[1].fallback,
            Some(SensorFallback::LastKnownGood {
                max_staleness_ms: Some(600_000)
            })
        );
        assert_eq!(cfg.control.boundary, crate::live::runner::BoundaryPolicy::Abort);
        assert_eq!(cfg.control.policy_timeout_ms, 2_000);
        assert_eq!(cfg.retry.max_retries, 3);
        let pipeline = cfg.build_pipeline().unwrap();
        assert_eq!(pipeline.declared_length(), 8);
        assert!(cfg.build_reward_engine().unwrap().is_some());
        assert_eq!(cfg.build_policy().unwrap().version(), "ppo-v3");
    }

    #[test]
    fn duplicate_sensor_names_are_rejected() {
        let yaml = r#"
sensors:
  - { name: t, entity_id: sensor.a }
  - { name: t, entity_id: sensor.b }
actuators:
  - { name: sp, entity_id: input_number.sp, low: 16, high: 24 }
"#;
        assert!(matches!(
            Config::from_yaml_str(yaml),
            Err(PilotError::Configuration(_))
        ));
    }

    #[test]
    fn constant_action_width_must_match_actuators() {
        let yaml = r#"
sensors:
  - { name: t, entity_id: sensor.a }
actuators:
  - { name: sp, entity_id: input_number.sp, low: 16, high: 24 }
policy:
  constant_action: [0.0, 0.0]
"#;
        assert!(matches!(
            Config::from_yaml_str(yaml),
            Err(PilotError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn policy_without_source_is_rejected() {
        let yaml = r#"
sensors:
  - { name: t, entity_id: sensor.a }
actuators:
  - { name: sp, entity_id: input_number.sp, low: 16, high: 24 }
"#;
        let cfg = Config::from_yaml_str(yaml).unwrap();
        assert!(cfg.build_policy().is_err());
    }

    #[test]
    fn malformed_yaml_is_a_yaml_error() {
        assert!(matches!(
            Config::from_yaml_str("sensors: [unterminated"),
            Err(PilotError::Yaml(_))
        ));
    }

    #[tokio::test]
    async fn assembles_control_loop_over_mock_backend() {
        let cfg = Config::from_yaml_str(YAML).unwrap();
        let policy = cfg.build_policy().unwrap();
        let control = cfg
            .build_control_loop(crate::live::MockBackend::new(), policy)
            .unwrap();
        assert_eq!(control.pipeline().declared_length(), 8);
        assert_eq!(control.actuators().actuators().len(), 2);
    }
}
