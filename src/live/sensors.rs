// src/live/sensors.rs
//
// Sensor gateway: logical sensor names -> numeric readings.
//
// A missing entity or an "unknown"/"unavailable"/non-numeric state is
// `SensorUnavailable`, never zero. What happens next is the configured
// fallback, and every fallback is logged with the logical name and the
// value it substituted.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::backend::HomeBackend;
use crate::error::{PilotError, PilotResult};
use crate::types::TimestampMs;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorSpec {
    pub name: String,
    pub entity_id: String,
    /// Overrides the gateway-wide fallback for this sensor.
    #[serde(default)]
    pub fallback: Option<SensorFallback>,
}

impl SensorSpec {
    pub fn new(name: &str, entity_id: &str) -> Self {
        Self {
            name: name.to_string(),
            entity_id: entity_id.to_string(),
            fallback: None,
        }
    }

    pub fn with_fallback(mut self, fallback: SensorFallback) -> Self {
        self.fallback = Some(fallback);
        self
    }
}

/// What to do when a sensor cannot be read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum SensorFallback {
    /// The tick fails with `SensorUnavailable`.
    FailTick,
    /// Reuse the last good reading if it is no older than `max_staleness_ms`
    /// (unbounded when absent).
    LastKnownGood {
        #[serde(default)]
        max_staleness_ms: Option<u64>,
    },
    /// Substitute a fixed value. Biases the observation; logged every time.
    NamedDefault { value: f64 },
}

impl Default for SensorFallback {
    fn default() -> Self {
        SensorFallback::FailTick
    }
}

impl SensorFallback {
    pub fn label(&self) -> &'static str {
        match self {
            SensorFallback::FailTick => "fail_tick",
            SensorFallback::LastKnownGood { .. } => "last_known_good",
            SensorFallback::NamedDefault { .. } => "named_default",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum ReadingSource {
    Live,
    LastKnownGood { age_ms: i64, reason: String },
    NamedDefault { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub name: String,
    pub value: f64,
    #[serde(flatten)]
    pub source: ReadingSource,
}

impl Reading {
    pub fn is_live(&self) -> bool {
        matches!(self.source, ReadingSource::Live)
    }
}

pub struct SensorGateway<B> {
    backend: B,
    sensors: Vec<SensorSpec>,
    default_fallback: SensorFallback,
    read_timeout: Duration,
    last_good: BTreeMap<String, (f64, TimestampMs)>,
}

impl<B> SensorGateway<B>
where
    B: HomeBackend,
{
    pub fn new(
        backend: B,
        sensors: Vec<SensorSpec>,
        default_fallback: SensorFallback,
        read_timeout: Duration,
    ) -> PilotResult<Self> {
        let mut seen = BTreeSet::new();
        for s in &sensors {
            if !seen.insert(s.name.as_str()) {
                return Err(PilotError::config(format!(
                    "sensor '{}' is mapped more than once",
                    s.name
                )));
            }
        }
        Ok(Self {
            backend,
            sensors,
            default_fallback,
            read_timeout,
            last_good: BTreeMap::new(),
        })
    }

    pub fn sensors(&self) -> &[SensorSpec] {
        &self.sensors
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn last_known_good(&self, name: &str) -> Option<(f64, TimestampMs)> {
        self.last_good.get(name).copied()
    }

    fn spec(&self, name: &str) -> PilotResult<&SensorSpec> {
        self.sensors
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| PilotError::config(format!("sensor '{}' is not mapped", name)))
    }

    /// One backend read, no fallback.
    pub async fn read_live(&self, name: &str) -> PilotResult<f64> {
        let spec = self.spec(name)?;
        fetch(&self.backend, &spec.entity_id, self.read_timeout)
            .await
            .map_err(|reason| PilotError::sensor_unavailable(name, reason))
    }

    /// One read with the configured fallback applied.
    pub async fn read(&mut self, name: &str, now_ms: TimestampMs) -> PilotResult<Reading> {
        let spec = self.spec(name)?.clone();
        let live = fetch(&self.backend, &spec.entity_id, self.read_timeout).await;
        self.resolve(&spec, live, now_ms)
    }

    /// Read every mapped sensor concurrently, in map order. Fallbacks are
    /// resolved for every sensor; the first unresolved failure is returned.
    pub async fn read_all(&mut self, now_ms: TimestampMs) -> PilotResult<Vec<Reading>> {
        let results = {
            let backend = &self.backend;
            let timeout = self.read_timeout;
            join_all(
                self.sensors
                    .iter()
                    .map(|s| fetch(backend, &s.entity_id, timeout)),
            )
            .await
        };

        let specs = self.sensors.clone();
        let mut readings = Vec::with_capacity(specs.len());
        let mut first_err = None;
        for (spec, live) in specs.iter().zip(results) {
            match self.resolve(spec, live, now_ms) {
                Ok(r) => readings.push(r),
                Err(err) => {
                    if first_err.is_none() {
                        first_err = Some(err);
                    }
                }
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(readings),
        }
    }

    fn resolve(
        &mut self,
        spec: &SensorSpec,
        live: Result<f64, String>,
        now_ms: TimestampMs,
    ) -> PilotResult<Reading> {
        let reason = match live {
            Ok(value) => {
                self.last_good.insert(spec.name.clone(), (value, now_ms));
                return Ok(Reading {
                    name: spec.name.clone(),
                    value,
                    source: ReadingSource::Live,
                });
            }
            Err(reason) => reason,
        };

        let fallback = spec.fallback.as_ref().unwrap_or(&self.default_fallback);
        match fallback {
            SensorFallback::FailTick => {
                warn!(sensor = %spec.name, entity = %spec.entity_id, reason = %reason, fallback = "fail_tick", "sensor unavailable");
                Err(PilotError::sensor_unavailable(&spec.name, reason))
            }
            SensorFallback::LastKnownGood { max_staleness_ms } => {
                let cached = self.last_good.get(&spec.name).copied().filter(|(_, at)| {
                    max_staleness_ms
                        .map(|max| now_ms.saturating_sub(*at) <= max as i64)
                        .unwrap_or(true)
                });
                match cached {
                    Some((value, at)) => {
                        let age_ms = now_ms.saturating_sub(at);
                        warn!(sensor = %spec.name, entity = %spec.entity_id, reason = %reason, fallback = "last_known_good", value, age_ms, "sensor unavailable, using last known good");
                        Ok(Reading {
                            name: spec.name.clone(),
                            value,
                            source: ReadingSource::LastKnownGood { age_ms, reason },
                        })
                    }
                    None => {
                        warn!(sensor = %spec.name, entity = %spec.entity_id, reason = %reason, fallback = "last_known_good", "sensor unavailable and no fresh last known good");
                        Err(PilotError::sensor_unavailable(
                            &spec.name,
                            format!("{reason}; no last-known-good within staleness bound"),
                        ))
                    }
                }
            }
            SensorFallback::NamedDefault { value } => {
                warn!(sensor = %spec.name, entity = %spec.entity_id, reason = %reason, fallback = "named_default", value = *value, "sensor unavailable, substituting named default");
                Ok(Reading {
                    name: spec.name.clone(),
                    value: *value,
                    source: ReadingSource::NamedDefault { reason },
                })
            }
        }
    }
}

async fn fetch<B: HomeBackend>(backend: &B, entity_id: &str, timeout: Duration) -> Result<f64, String> {
    match tokio::time::timeout(timeout, backend.get_state(entity_id)).await {
        Err(_) => Err(format!("read timed out after {} ms", timeout.as_millis())),
        Ok(Err(err)) => Err(format!("{}: {}", err.reason_label(), err.message)),
        Ok(Ok(state)) if state.is_unavailable() => Err(format!("state '{}'", state.state)),
        Ok(Ok(state)) => state
            .numeric()
            .ok_or_else(|| format!("non-numeric state '{}'", state.state)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::live::mock_backend::MockBackend;

    async fn gateway(fallback: SensorFallback) -> (MockBackend, SensorGateway<MockBackend>) {
        let mock = MockBackend::new();
        mock.set_numeric("sensor.t_living", 21.0).await;
        mock.set_numeric("sensor.rh_living", 45.0).await;
        let gw = SensorGateway::new(
            mock.clone(),
            vec![
                SensorSpec::new("t_living", "sensor.t_living"),
                SensorSpec::new("rh_living", "sensor.rh_living"),
            ],
            fallback,
            Duration::from_millis(200),
        )
        .unwrap();
        (mock, gw)
    }

    #[tokio::test]
    async fn live_reads_in_map_order() {
        let (_mock, mut gw) = gateway(SensorFallback::FailTick).await;
        let readings = gw.read_all(0).await.unwrap();
        let values: Vec<f64> = readings.iter().map(|r| r.value).collect();
        assert_eq!(values, vec![21.0, 45.0]);
        assert!(readings.iter().all(Reading::is_live));
    }

    #[tokio::test]
    async fn unknown_state_is_never_zero() {
        let (mock, gw) = gateway(SensorFallback::FailTick).await;
        mock.set_state("sensor.t_living", "unknown").await;
        let err = gw.read_live("t_living").await.unwrap_err();
        assert!(matches!(err, PilotError::SensorUnavailable { .. }));
    }

    #[tokio::test]
    async fn last_known_good_respects_staleness() {
        let (mock, mut gw) = gateway(SensorFallback::LastKnownGood {
            max_staleness_ms: Some(1_000),
        })
        .await;
        gw.read_all(0).await.unwrap();
        mock.set_state("sensor.t_living", "unavailable").await;

        let r = gw.read("t_living", 500).await.unwrap();
        assert_eq!(r.value, 21.0);
        assert!(matches!(r.source, ReadingSource::LastKnownGood { age_ms: 500, .. }));

        assert!(gw.read("t_living", 5_000).await.is_err());
    }

    #[tokio::test]
    async fn named_default_is_marked() {
        let (mock, mut gw) = gateway(SensorFallback::NamedDefault { value: 0.0 }).await;
        mock.remove("sensor.rh_living").await;
        let readings = gw.read_all(0).await.unwrap();
        assert_eq!(readings[1].value, 0.0);
        assert!(matches!(readings[1].source, ReadingSource::NamedDefault { .. }));
    }

    #[tokio::test]
    async fn per_sensor_fallback_overrides_default() {
        let mock = MockBackend::new();
        let mut gw = SensorGateway::new(
            mock.clone(),
            vec![SensorSpec::new("co2", "sensor.co2")
                .with_fallback(SensorFallback::NamedDefault { value: 400.0 })],
            SensorFallback::FailTick,
            Duration::from_millis(50),
        )
        .unwrap();
        assert_eq!(gw.read("co2", 0).await.unwrap().value, 400.0);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_reads_time_out() {
        let (mock, mut gw) = gateway(SensorFallback::FailTick).await;
        mock.set_read_delay("sensor.t_living", Duration::from_secs(5)).await;
        let err = gw.read_all(0).await.unwrap_err();
        match err {
            PilotError::SensorUnavailable { name, reason } => {
                assert_eq!(name, "t_living");
                assert!(reason.contains("timed out"), "{reason}");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let res = SensorGateway::new(
            MockBackend::new(),
            vec![SensorSpec::new("t", "sensor.a"), SensorSpec::new("t", "sensor.b")],
            SensorFallback::FailTick,
            Duration::from_millis(50),
        );
        assert!(res.is_err());
    }

    #[test]
    fn fallback_deserializes_from_tagged_yaml() {
        let f: SensorFallback =
            serde_yaml::from_str("mode: last_known_good\nmax_staleness_ms: 600000\n").unwrap();
        assert_eq!(
            f,
            SensorFallback::LastKnownGood {
                max_staleness_ms: Some(600_000)
            }
        );
        assert_eq!(f.label(), "last_known_good");
    }
}
