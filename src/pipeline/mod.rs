// src/pipeline/mod.rs
//
// Observation pipeline: raw observation -> fixed-length feature vector.
//
// The vector must reproduce training-time preprocessing exactly (width,
// order, formulas), so the pipeline is a closed set of stage variants that is
// resolved from configuration once, at construction, into an immutable
// ordered list. Nothing on the per-tick path dispatches on stage names.
//
// Layout contract:
// - The raw layout is `[month, day, hour, reading_0 .. reading_n]`.
// - Each stage declares a width delta; `declared_length()` is the raw width
//   plus the sum of deltas and never changes for the life of the pipeline.
// - `layout_fingerprint()` hashes the stage order and widths so telemetry can
//   prove which layout a served vector came from.

pub mod energy_cost;
pub mod forecast;
pub mod normalizer;
pub mod time_encoder;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::error::{PilotError, PilotResult};
use crate::types::{ObservationVector, RawObservation};

pub use energy_cost::{EnergyCostInjector, PriceTable};
pub use forecast::{ForecastInjector, ForecastTable};
pub use normalizer::{NormalizationStats, NormalizerMode, RunningNormalizer, StatsFormat};
pub use time_encoder::TimeEncoder;

/// One configured stage: a name plus its named parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSpec {
    pub stage: String,
    #[serde(default)]
    pub params: BTreeMap<String, serde_yaml::Value>,
}

impl StageSpec {
    pub fn new(stage: &str) -> Self {
        Self {
            stage: stage.to_string(),
            params: BTreeMap::new(),
        }
    }

    pub fn with_param(mut self, key: &str, value: impl Into<serde_yaml::Value>) -> Self {
        self.params.insert(key.to_string(), value.into());
        self
    }
}

/// Typed access to a stage's parameter map. Required parameters that are
/// absent fail construction; nothing here invents a value.
pub struct StageParams<'a> {
    stage: &'a str,
    params: &'a BTreeMap<String, serde_yaml::Value>,
}

impl<'a> StageParams<'a> {
    pub fn new(stage: &'a str, params: &'a BTreeMap<String, serde_yaml::Value>) -> Self {
        Self { stage, params }
    }

    fn missing(&self, key: &str) -> PilotError {
        PilotError::config(format!(
            "stage '{}' requires parameter '{}'",
            self.stage, key
        ))
    }

    fn malformed(&self, key: &str, expected: &str) -> PilotError {
        PilotError::config(format!(
            "stage '{}' parameter '{}' must be {}",
            self.stage, key, expected
        ))
    }

    pub fn optional_str(&self, key: &str) -> PilotResult<Option<String>> {
        match self.params.get(key) {
            None | Some(serde_yaml::Value::Null) => Ok(None),
            Some(v) => v
                .as_str()
                .map(|s| Some(s.to_string()))
                .ok_or_else(|| self.malformed(key, "a string")),
        }
    }

    pub fn required_str(&self, key: &str) -> PilotResult<String> {
        self.optional_str(key)?
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| self.missing(key))
    }

    pub fn optional_f64(&self, key: &str) -> PilotResult<Option<f64>> {
        match self.params.get(key) {
            None | Some(serde_yaml::Value::Null) => Ok(None),
            Some(v) => v
                .as_f64()
                .map(Some)
                .ok_or_else(|| self.malformed(key, "a number")),
        }
    }

    pub fn optional_i64(&self, key: &str) -> PilotResult<Option<i64>> {
        match self.params.get(key) {
            None | Some(serde_yaml::Value::Null) => Ok(None),
            Some(v) => v
                .as_i64()
                .map(Some)
                .ok_or_else(|| self.malformed(key, "an integer")),
        }
    }

    pub fn required_usize(&self, key: &str) -> PilotResult<usize> {
        let v = self.optional_i64(key)?.ok_or_else(|| self.missing(key))?;
        usize::try_from(v).map_err(|_| self.malformed(key, "a non-negative integer"))
    }

    pub fn optional_char(&self, key: &str) -> PilotResult<Option<char>> {
        match self.optional_str(key)? {
            None => Ok(None),
            Some(s) => {
                let mut chars = s.chars();
                match (chars.next(), chars.next()) {
                    (Some(c), None) => Ok(Some(c)),
                    _ => Err(self.malformed(key, "a single character")),
                }
            }
        }
    }
}

/// Closed set of stage variants.
#[derive(Debug)]
pub enum Stage {
    TimeEncoder(TimeEncoder),
    Normalizer(RunningNormalizer),
    Forecast(ForecastInjector),
    EnergyCost(EnergyCostInjector),
}

impl Stage {
    /// Resolve a configured stage. `width` is the vector width the stage will
    /// receive (needed by width-aware stages such as the normalizer).
    pub fn from_spec(spec: &StageSpec, width: usize) -> PilotResult<Self> {
        let params = StageParams::new(&spec.stage, &spec.params);
        match spec.stage.as_str() {
            "time_encoder" | "datetime" => Ok(Stage::TimeEncoder(TimeEncoder)),
            "normalizer" | "running_normalizer" => Ok(Stage::Normalizer(
                RunningNormalizer::from_params(&params, width)?,
            )),
            "forecast" => Ok(Stage::Forecast(ForecastInjector::from_params(&params)?)),
            "energy_cost" => Ok(Stage::EnergyCost(EnergyCostInjector::from_params(
                &params,
            )?)),
            other => Err(PilotError::config(format!("unknown pipeline stage '{}'", other))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Stage::TimeEncoder(_) => "time_encoder",
            Stage::Normalizer(_) => "normalizer",
            Stage::Forecast(_) => "forecast",
            Stage::EnergyCost(_) => "energy_cost",
        }
    }

    /// Output-width change contributed by this stage.
    pub fn delta(&self) -> isize {
        match self {
            Stage::TimeEncoder(_) => TimeEncoder::DELTA,
            Stage::Normalizer(_) => 0,
            Stage::Forecast(f) => f.width() as isize,
            Stage::EnergyCost(_) => 1,
        }
    }

    fn apply(&mut self, raw: &RawObservation, vector: &mut ObservationVector) -> PilotResult<()> {
        match self {
            Stage::TimeEncoder(t) => t.apply(raw, vector),
            Stage::Normalizer(n) => n.normalize(vector),
            Stage::Forecast(f) => f.apply(raw, vector),
            Stage::EnergyCost(e) => e.apply(raw, vector),
        }
    }
}

#[derive(Debug)]
pub struct ObservationPipeline {
    stages: Vec<Stage>,
    base_width: usize,
    declared_length: usize,
    fingerprint: String,
}

impl ObservationPipeline {
    /// Assemble an ordered pipeline over raw observations of `base_width`
    /// scalars (3 calendar fields + readings).
    pub fn new(stages: Vec<Stage>, base_width: usize) -> PilotResult<Self> {
        let mut width = base_width as isize;
        for (i, stage) in stages.iter().enumerate() {
            match stage {
                Stage::TimeEncoder(_) => {
                    if i != 0 {
                        return Err(PilotError::config(
                            "time_encoder consumes the leading calendar scalars and must be the first stage",
                        ));
                    }
                    if base_width < RawObservation::CALENDAR_WIDTH {
                        return Err(PilotError::config(
                            "time_encoder needs month, day and hour in the raw layout",
                        ));
                    }
                }
                Stage::Normalizer(n) => {
                    if n.width() as isize != width {
                        return Err(PilotError::config(format!(
                            "normalizer at position {} has {} channels but receives {} values",
                            i,
                            n.width(),
                            width
                        )));
                    }
                }
                Stage::Forecast(_) | Stage::EnergyCost(_) => {}
            }
            width += stage.delta();
        }

        let declared_length = width as usize;
        let fingerprint = layout_fingerprint(&stages, base_width, declared_length);
        info!(
            stages = stages.len(),
            base_width,
            declared_length,
            fingerprint = %fingerprint,
            "observation pipeline assembled"
        );

        Ok(Self {
            stages,
            base_width,
            declared_length,
            fingerprint,
        })
    }

    /// Resolve configured stage specs, in declared order.
    pub fn from_specs(specs: &[StageSpec], base_width: usize) -> PilotResult<Self> {
        let mut stages = Vec::with_capacity(specs.len());
        let mut width = base_width as isize;
        for spec in specs {
            let stage = Stage::from_spec(spec, width.max(0) as usize)?;
            width += stage.delta();
            stages.push(stage);
        }
        Self::new(stages, base_width)
    }

    pub fn declared_length(&self) -> usize {
        self.declared_length
    }

    pub fn base_width(&self) -> usize {
        self.base_width
    }

    pub fn layout_fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(Stage::name).collect()
    }

    /// Run every stage in order over one raw observation.
    pub fn build(&mut self, raw: &RawObservation) -> PilotResult<ObservationVector> {
        if raw.base_width() != self.base_width {
            return Err(PilotError::ShapeMismatch {
                context: "raw observation",
                expected: self.base_width,
                actual: raw.base_width(),
            });
        }

        let mut vector = raw.base_vector();
        for stage in &mut self.stages {
            stage.apply(raw, &mut vector)?;
        }

        if vector.len() != self.declared_length {
            return Err(PilotError::ShapeMismatch {
                context: "observation vector",
                expected: self.declared_length,
                actual: vector.len(),
            });
        }
        Ok(vector)
    }

    pub fn normalizers(&self) -> impl Iterator<Item = &RunningNormalizer> {
        self.stages.iter().filter_map(|s| match s {
            Stage::Normalizer(n) => Some(n),
            _ => None,
        })
    }

    /// Persist the stats of every fitting normalizer that has a stats path.
    /// Returns how many files were written.
    pub fn checkpoint(&self) -> PilotResult<usize> {
        let mut written = 0;
        for n in self.normalizers() {
            if n.checkpoint()? {
                written += 1;
            }
        }
        Ok(written)
    }
}

fn layout_fingerprint(stages: &[Stage], base_width: usize, declared_length: usize) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("base={}", base_width).as_bytes());
    for stage in stages {
        hasher.update(b"|");
        hasher.update(format!("{}:{}", stage.name(), stage.delta()).as_bytes());
    }
    hasher.update(format!("|len={}", declared_length).as_bytes());
    let hash = hasher.finalize();
    hash[..6].iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CalendarStamp;

    fn raw(readings: usize) -> RawObservation {
        let mut raw = RawObservation::new(CalendarStamp::new(2024, 1, 15, 10), 0);
        for i in 0..readings {
            raw = raw.with_reading(format!("s{}", i), i as f64);
        }
        raw
    }

    fn prices() -> PriceTable {
        PriceTable::from_entries((0..24).map(|h| ((1, 15, h), 10.0 + h as f64))).unwrap()
    }

    #[test]
    fn declared_length_is_sum_of_deltas() {
        let stages = vec![
            Stage::TimeEncoder(TimeEncoder),
            Stage::Normalizer(RunningNormalizer::fitting(9, 1e-8)),
            Stage::EnergyCost(EnergyCostInjector::new(prices())),
        ];
        let mut p = ObservationPipeline::new(stages, 7).unwrap();
        let sum: isize = p.stages().iter().map(Stage::delta).sum();
        assert_eq!(p.declared_length() as isize, 7 + sum);
        assert_eq!(p.declared_length(), 10);

        let v = p.build(&raw(4)).unwrap();
        assert_eq!(v.len(), p.declared_length());
    }

    #[test]
    fn empty_pipeline_is_identity_layout() {
        let mut p = ObservationPipeline::new(Vec::new(), 5).unwrap();
        assert_eq!(p.build(&raw(2)).unwrap(), vec![1.0, 15.0, 10.0, 0.0, 1.0]);
    }

    #[test]
    fn raw_width_mismatch_is_rejected() {
        let mut p = ObservationPipeline::new(vec![Stage::TimeEncoder(TimeEncoder)], 5).unwrap();
        let err = p.build(&raw(3)).unwrap_err();
        assert!(matches!(err, PilotError::ShapeMismatch { .. }));
    }

    #[test]
    fn time_encoder_must_come_first() {
        let stages = vec![
            Stage::EnergyCost(EnergyCostInjector::new(prices())),
            Stage::TimeEncoder(TimeEncoder),
        ];
        let err = ObservationPipeline::new(stages, 5).unwrap_err();
        assert!(matches!(err, PilotError::Configuration(_)));
    }

    #[test]
    fn normalizer_width_must_match_position() {
        let stages = vec![
            Stage::TimeEncoder(TimeEncoder),
            Stage::Normalizer(RunningNormalizer::fitting(5, 1e-8)),
        ];
        assert!(ObservationPipeline::new(stages, 5).is_err());
    }

    #[test]
    fn missing_required_parameter_fails_construction() {
        let specs = vec![StageSpec::new("time_encoder"), StageSpec::new("energy_cost")];
        let err = ObservationPipeline::from_specs(&specs, 5).unwrap_err();
        match err {
            PilotError::Configuration(msg) => assert!(msg.contains("path"), "{msg}"),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn frozen_normalizer_without_stats_fails_construction() {
        let specs = vec![StageSpec::new("normalizer").with_param("mode", "frozen")];
        assert!(ObservationPipeline::from_specs(&specs, 5).is_err());
    }

    #[test]
    fn unknown_stage_is_rejected() {
        let specs = vec![StageSpec::new("lag_features")];
        assert!(ObservationPipeline::from_specs(&specs, 5).is_err());
    }

    #[test]
    fn specs_resolve_normalizer_width_from_position() {
        let specs = vec![
            StageSpec::new("time_encoder"),
            StageSpec::new("normalizer").with_param("mode", "fitting"),
        ];
        let p = ObservationPipeline::from_specs(&specs, 6).unwrap();
        assert_eq!(p.declared_length(), 8);
        assert_eq!(p.normalizers().next().unwrap().width(), 8);
        assert_eq!(p.stage_names(), vec!["time_encoder", "normalizer"]);
    }

    #[test]
    fn fingerprint_tracks_layout() {
        let a = ObservationPipeline::new(vec![Stage::TimeEncoder(TimeEncoder)], 5).unwrap();
        let b = ObservationPipeline::new(vec![Stage::TimeEncoder(TimeEncoder)], 5).unwrap();
        let c = ObservationPipeline::new(vec![Stage::TimeEncoder(TimeEncoder)], 6).unwrap();
        assert_eq!(a.layout_fingerprint(), b.layout_fingerprint());
        assert_ne!(a.layout_fingerprint(), c.layout_fingerprint());
        assert_eq!(a.layout_fingerprint().len(), 12);
    }
}
