// src/pipeline/normalizer.rs
//
// Per-channel running normalization.
//
// Fitting mode updates the moments with each sample before normalizing it.
// Frozen mode never mutates the stats; in production the normalizer must be
// frozen with the stats the policy was trained against.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::StageParams;
use crate::error::{PilotError, PilotResult};
use crate::numeric::RunningMoments;

pub const DEFAULT_EPSILON: f64 = 1e-8;
/// Sample count assumed for text stats shipped without a `count.txt`.
pub const DEFAULT_TEXT_COUNT: f64 = 1e4;

const MEAN_FILE: &str = "mean.txt";
const VAR_FILE: &str = "var.txt";
const COUNT_FILE: &str = "count.txt";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NormalizerMode {
    Fitting,
    Frozen,
}

impl NormalizerMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            NormalizerMode::Fitting => "fitting",
            NormalizerMode::Frozen => "frozen",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fitting" | "fit" | "train" => Some(NormalizerMode::Fitting),
            "frozen" | "eval" | "inference" => Some(NormalizerMode::Frozen),
            _ => None,
        }
    }
}

/// On-disk layout of normalization stats.
///
/// `Json` is a single file. `Text` is a directory holding whitespace-separated
/// `mean.txt` and `var.txt` plus an optional one-number `count.txt`, the form
/// trained policies are shipped with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StatsFormat {
    #[default]
    Json,
    Text,
}

impl StatsFormat {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Some(StatsFormat::Json),
            "text" | "txt" => Some(StatsFormat::Text),
            _ => None,
        }
    }

    fn exists(&self, path: &Path) -> bool {
        match self {
            StatsFormat::Json => path.exists(),
            StatsFormat::Text => path.join(MEAN_FILE).exists() && path.join(VAR_FILE).exists(),
        }
    }
}

/// Persisted normalization stats: one set of moments per channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizationStats {
    pub channels: Vec<RunningMoments>,
}

impl NormalizationStats {
    /// Fresh stats (mean 0, var 1, count 0) for `width` channels.
    pub fn new(width: usize) -> Self {
        Self {
            channels: vec![RunningMoments::default(); width],
        }
    }

    pub fn from_mean_var(mean: &[f64], var: &[f64]) -> PilotResult<Self> {
        if mean.len() != var.len() {
            return Err(PilotError::config(format!(
                "normalization stats have {} means but {} variances",
                mean.len(),
                var.len()
            )));
        }
        if var.iter().any(|v| !v.is_finite() || *v < 0.0) {
            return Err(PilotError::config(
                "normalization variances must be finite and non-negative",
            ));
        }
        Ok(Self {
            channels: mean
                .iter()
                .zip(var)
                .map(|(&mean, &var)| RunningMoments {
                    mean,
                    var,
                    count: 0,
                })
                .collect(),
        })
    }

    pub fn width(&self) -> usize {
        self.channels.len()
    }

    /// Samples folded in so far (channels are updated together).
    pub fn sample_count(&self) -> u64 {
        self.channels.first().map(|c| c.count).unwrap_or(0)
    }

    pub fn load(path: &Path) -> PilotResult<Self> {
        let text = fs::read_to_string(path).map_err(|e| {
            PilotError::config(format!(
                "cannot read normalization stats '{}': {}",
                path.display(),
                e
            ))
        })?;
        let stats: Self = serde_json::from_str(&text).map_err(|e| {
            PilotError::config(format!(
                "malformed normalization stats '{}': {}",
                path.display(),
                e
            ))
        })?;
        Ok(stats)
    }

    /// Load `mean.txt`, `var.txt` and, if present, `count.txt` from `dir`.
    pub fn load_text(dir: &Path) -> PilotResult<Self> {
        let mean = read_numbers(&dir.join(MEAN_FILE))?;
        let var = read_numbers(&dir.join(VAR_FILE))?;
        let mut stats = Self::from_mean_var(&mean, &var)?;

        let count_path = dir.join(COUNT_FILE);
        let count = if count_path.exists() {
            match read_numbers(&count_path)?.as_slice() {
                [c] if c.is_finite() && *c >= 0.0 => *c,
                _ => {
                    return Err(PilotError::config(format!(
                        "'{}' must hold one non-negative number",
                        count_path.display()
                    )))
                }
            }
        } else {
            DEFAULT_TEXT_COUNT
        };
        for channel in &mut stats.channels {
            channel.count = count.round() as u64;
        }
        Ok(stats)
    }

    pub fn load_as(path: &Path, format: StatsFormat) -> PilotResult<Self> {
        match format {
            StatsFormat::Json => Self::load(path),
            StatsFormat::Text => Self::load_text(path),
        }
    }

    pub fn save_text(&self, dir: &Path) -> PilotResult<()> {
        fs::create_dir_all(dir)?;
        let mean: String = self.channels.iter().map(|c| format!("{:e}\n", c.mean)).collect();
        let var: String = self.channels.iter().map(|c| format!("{:e}\n", c.var)).collect();
        fs::write(dir.join(MEAN_FILE), mean)?;
        fs::write(dir.join(VAR_FILE), var)?;
        fs::write(dir.join(COUNT_FILE), format!("{}\n", self.sample_count()))?;
        Ok(())
    }

    pub fn save_as(&self, path: &Path, format: StatsFormat) -> PilotResult<()> {
        match format {
            StatsFormat::Json => self.save(path),
            StatsFormat::Text => self.save_text(path),
        }
    }

    /// Write via a sibling temp file so a crash never leaves a torn file.
    pub fn save(&self, path: &Path) -> PilotResult<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(self)?)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

fn read_numbers(path: &Path) -> PilotResult<Vec<f64>> {
    let text = fs::read_to_string(path).map_err(|e| {
        PilotError::config(format!(
            "cannot read normalization stats '{}': {}",
            path.display(),
            e
        ))
    })?;
    text.lines()
        .filter(|line| !line.trim_start().starts_with('#'))
        .flat_map(str::split_whitespace)
        .map(|tok| {
            tok.parse::<f64>().map_err(|_| {
                PilotError::config(format!(
                    "normalization stats '{}': '{}' is not numeric",
                    path.display(),
                    tok
                ))
            })
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct RunningNormalizer {
    mode: NormalizerMode,
    stats: NormalizationStats,
    epsilon: f64,
    clip: Option<f64>,
    stats_path: Option<PathBuf>,
    stats_format: StatsFormat,
}

impl RunningNormalizer {
    pub fn fitting(width: usize, epsilon: f64) -> Self {
        Self::with_stats(NormalizerMode::Fitting, NormalizationStats::new(width), epsilon)
    }

    pub fn frozen(stats: NormalizationStats, epsilon: f64) -> Self {
        Self::with_stats(NormalizerMode::Frozen, stats, epsilon)
    }

    pub fn with_stats(mode: NormalizerMode, stats: NormalizationStats, epsilon: f64) -> Self {
        Self {
            mode,
            stats,
            epsilon,
            clip: None,
            stats_path: None,
            stats_format: StatsFormat::Json,
        }
    }

    pub fn with_clip(mut self, clip: f64) -> Self {
        self.clip = Some(clip.abs());
        self
    }

    pub fn with_stats_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.stats_path = Some(path.into());
        self
    }

    pub fn with_stats_format(mut self, format: StatsFormat) -> Self {
        self.stats_format = format;
        self
    }

    /// Params: `mode` (required), `stats_path` (required when frozen),
    /// `stats_format` (`json` or `text`, default `json`), `epsilon`, `clip`.
    /// With `text`, `stats_path` names the directory holding `mean.txt`.
    ///
    /// A fitting normalizer whose `stats_path` already exists resumes from it.
    pub(crate) fn from_params(params: &StageParams<'_>, width: usize) -> PilotResult<Self> {
        let mode_raw = params.required_str("mode")?;
        let mode = NormalizerMode::parse(&mode_raw).ok_or_else(|| {
            PilotError::config(format!(
                "normalizer mode '{}' is not one of fitting, frozen",
                mode_raw
            ))
        })?;
        let epsilon = params.optional_f64("epsilon")?.unwrap_or(DEFAULT_EPSILON);
        if !(epsilon > 0.0) {
            return Err(PilotError::config("normalizer epsilon must be positive"));
        }
        let clip = params.optional_f64("clip")?;
        let stats_path = params.optional_str("stats_path")?.map(PathBuf::from);
        let stats_format = match params.optional_str("stats_format")? {
            None => StatsFormat::default(),
            Some(raw) => StatsFormat::parse(&raw).ok_or_else(|| {
                PilotError::config(format!(
                    "normalizer stats_format '{}' is not one of json, text",
                    raw
                ))
            })?,
        };

        let stats = match (mode, stats_path.as_deref()) {
            (NormalizerMode::Frozen, None) => {
                return Err(PilotError::config(
                    "frozen normalizer requires parameter 'stats_path'",
                ))
            }
            (NormalizerMode::Frozen, Some(path)) => NormalizationStats::load_as(path, stats_format)?,
            (NormalizerMode::Fitting, Some(path)) if stats_format.exists(path) => {
                let stats = NormalizationStats::load_as(path, stats_format)?;
                info!(
                    path = %path.display(),
                    samples = stats.sample_count(),
                    "resuming normalizer fit from saved stats"
                );
                stats
            }
            (NormalizerMode::Fitting, _) => NormalizationStats::new(width),
        };

        if stats.width() != width {
            return Err(PilotError::config(format!(
                "normalization stats have {} channels, pipeline position carries {}",
                stats.width(),
                width
            )));
        }

        let mut normalizer = Self::with_stats(mode, stats, epsilon).with_stats_format(stats_format);
        if let Some(c) = clip {
            normalizer = normalizer.with_clip(c);
        }
        if let Some(path) = stats_path {
            normalizer = normalizer.with_stats_path(path);
        }
        Ok(normalizer)
    }

    pub fn mode(&self) -> NormalizerMode {
        self.mode
    }

    pub fn stats(&self) -> &NormalizationStats {
        &self.stats
    }

    pub fn width(&self) -> usize {
        self.stats.width()
    }

    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }

    pub fn clip(&self) -> Option<f64> {
        self.clip
    }

    /// Normalize `values` in place.
    pub fn normalize(&mut self, values: &mut [f64]) -> PilotResult<()> {
        if values.len() != self.stats.width() {
            return Err(PilotError::ShapeMismatch {
                context: "normalizer input",
                expected: self.stats.width(),
                actual: values.len(),
            });
        }
        let fitting = self.mode == NormalizerMode::Fitting;
        for (x, moments) in values.iter_mut().zip(self.stats.channels.iter_mut()) {
            if fitting {
                moments.update(*x);
            }
            let mut z = moments.normalize(*x, self.epsilon);
            if let Some(c) = self.clip {
                z = z.clamp(-c, c);
            }
            *x = z;
        }
        Ok(())
    }

    /// Persist stats when fitting with a configured path. Frozen stats are
    /// never rewritten.
    pub fn checkpoint(&self) -> PilotResult<bool> {
        match (self.mode, self.stats_path.as_deref()) {
            (NormalizerMode::Fitting, Some(path)) => {
                self.stats.save_as(path, self.stats_format)?;
                debug!(
                    path = %path.display(),
                    samples = self.stats.sample_count(),
                    "normalizer stats checkpointed"
                );
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn frozen_unit_stats_are_near_identity() {
        let mut n = RunningNormalizer::frozen(NormalizationStats::new(3), DEFAULT_EPSILON);
        let mut v = vec![1.0, -2.0, 0.5];
        n.normalize(&mut v).unwrap();
        assert!((v[0] - 1.0).abs() < 1e-6);
        assert!((v[1] + 2.0).abs() < 1e-6);
        assert_eq!(n.stats().sample_count(), 0);
    }

    #[test]
    fn frozen_is_deterministic() {
        let stats = NormalizationStats::from_mean_var(&[10.0, 0.0], &[4.0, 1.0]).unwrap();
        let mut n = RunningNormalizer::frozen(stats, DEFAULT_EPSILON);
        let mut a = vec![12.0, 3.0];
        let mut b = vec![12.0, 3.0];
        n.normalize(&mut a).unwrap();
        n.normalize(&mut b).unwrap();
        assert_eq!(a, b);
        assert!((a[0] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn fitting_updates_before_normalizing() {
        let mut n = RunningNormalizer::fitting(1, DEFAULT_EPSILON);
        let mut v = vec![5.0];
        n.normalize(&mut v).unwrap();
        // First sample: mean == x, var == 0.
        assert_eq!(v[0], 0.0);
        assert_eq!(n.stats().sample_count(), 1);
        assert_eq!(n.stats().channels[0].mean, 5.0);
    }

    #[test]
    fn constant_input_drives_mean_to_it_and_variance_to_zero() {
        let c = [3.25, -1.5];
        let mut fresh = RunningNormalizer::fitting(2, DEFAULT_EPSILON);
        for _ in 0..50 {
            let mut v = c.to_vec();
            fresh.normalize(&mut v).unwrap();
            assert_eq!(v, vec![0.0, 0.0]);
        }
        for (m, want) in fresh.stats().channels.iter().zip(c) {
            assert_eq!(m.mean, want);
            assert_eq!(m.var, 0.0);
        }

        // Starting from unrelated stats the moments approach the constant.
        let seeded = NormalizationStats {
            channels: vec![
                RunningMoments {
                    mean: 0.0,
                    var: 1.0,
                    count: 10,
                };
                2
            ],
        };
        let mut n = RunningNormalizer::with_stats(NormalizerMode::Fitting, seeded, DEFAULT_EPSILON);
        let mut prev_gap = f64::INFINITY;
        let mut prev_var = f64::INFINITY;
        for _ in 0..20 {
            for _ in 0..500 {
                n.normalize(&mut c.to_vec()).unwrap();
            }
            let m = n.stats().channels[0];
            let gap = (m.mean - c[0]).abs();
            assert!(gap < prev_gap && m.var < prev_var);
            prev_gap = gap;
            prev_var = m.var;
        }
        let m = n.stats().channels[1];
        assert!((m.mean - c[1]).abs() < 0.01, "mean {}", m.mean);
        assert!(m.var < 0.01, "var {}", m.var);
    }

    #[test]
    fn frozen_stats_survive_varied_inputs_unchanged() {
        let stats = NormalizationStats::from_mean_var(&[21.0, 0.0, 5.0], &[4.0, 1.0, 0.25]).unwrap();
        let before = stats.clone();
        let mut n = RunningNormalizer::frozen(stats, DEFAULT_EPSILON);
        for v in [
            [21.0, 0.0, 5.0],
            [-40.0, 1e6, 0.0],
            [f64::MAX, -f64::MAX, 1e-300],
            [3.0, -7.5, 12.0],
        ] {
            n.normalize(&mut v.to_vec()).unwrap();
        }
        assert_eq!(n.stats(), &before);
        assert_eq!(n.stats().sample_count(), 0);
    }

    #[test]
    fn text_stats_load_with_and_without_count() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("mean.txt"), "2.100000000000000000e+01\n-3.0\n").unwrap();
        fs::write(dir.path().join("var.txt"), "4.0 0.25\n").unwrap();

        let stats = NormalizationStats::load_text(dir.path()).unwrap();
        assert_eq!(stats.width(), 2);
        assert_eq!(stats.channels[0].mean, 21.0);
        assert_eq!(stats.channels[1].var, 0.25);
        assert_eq!(stats.sample_count(), 10_000);

        fs::write(dir.path().join("count.txt"), "1234.0\n").unwrap();
        assert_eq!(NormalizationStats::load_text(dir.path()).unwrap().sample_count(), 1234);

        fs::write(dir.path().join("var.txt"), "4.0\n").unwrap();
        assert!(matches!(
            NormalizationStats::load_text(dir.path()),
            Err(PilotError::Configuration(_))
        ));
    }

    #[test]
    fn frozen_text_stats_selected_by_param() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("mean.txt"), "10.0\n0.0\n").unwrap();
        fs::write(dir.path().join("var.txt"), "4.0\n1.0\n").unwrap();

        let mut params = BTreeMap::new();
        params.insert("mode".to_string(), serde_yaml::Value::from("frozen"));
        params.insert(
            "stats_path".to_string(),
            serde_yaml::Value::from(dir.path().display().to_string()),
        );
        params.insert("stats_format".to_string(), serde_yaml::Value::from("text"));
        let mut n = RunningNormalizer::from_params(&StageParams::new("normalizer", &params), 2).unwrap();

        let mut v = vec![12.0, 3.0];
        n.normalize(&mut v).unwrap();
        assert!((v[0] - 1.0).abs() < 1e-6);
        assert!((v[1] - 3.0).abs() < 1e-6);

        params.insert("stats_format".to_string(), serde_yaml::Value::from("npy"));
        assert!(RunningNormalizer::from_params(&StageParams::new("normalizer", &params), 2).is_err());
    }

    #[test]
    fn fitting_text_stats_checkpoint_round_trips_through_directory() {
        let dir = tempfile::tempdir().unwrap();
        let stats_dir = dir.path().join("norm");
        let mut n = RunningNormalizer::fitting(1, DEFAULT_EPSILON)
            .with_stats_path(&stats_dir)
            .with_stats_format(StatsFormat::Text);
        n.normalize(&mut [2.0]).unwrap();
        n.normalize(&mut [4.0]).unwrap();
        assert!(n.checkpoint().unwrap());

        let loaded = NormalizationStats::load_text(&stats_dir).unwrap();
        assert_eq!(loaded.sample_count(), 2);
        assert_eq!(loaded.channels[0].mean, 3.0);
        assert_eq!(loaded.channels[0].var, 1.0);
    }

    #[test]
    fn clip_bounds_outliers() {
        let mut n = RunningNormalizer::frozen(NormalizationStats::new(1), DEFAULT_EPSILON)
            .with_clip(5.0);
        let mut v = vec![100.0];
        n.normalize(&mut v).unwrap();
        assert_eq!(v[0], 5.0);
    }

    #[test]
    fn width_mismatch_is_shape_error() {
        let mut n = RunningNormalizer::fitting(2, DEFAULT_EPSILON);
        let mut v = vec![1.0];
        assert!(matches!(
            n.normalize(&mut v),
            Err(PilotError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn fitting_resumes_and_checkpoints() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stats.json");

        let mut params = BTreeMap::new();
        params.insert("mode".to_string(), serde_yaml::Value::from("fitting"));
        params.insert(
            "stats_path".to_string(),
            serde_yaml::Value::from(path.display().to_string()),
        );
        let p = StageParams::new("normalizer", &params);

        let mut n = RunningNormalizer::from_params(&p, 2).unwrap();
        n.normalize(&mut [1.0, 2.0]).unwrap();
        n.normalize(&mut [3.0, 4.0]).unwrap();
        assert!(n.checkpoint().unwrap());

        let resumed = RunningNormalizer::from_params(&p, 2).unwrap();
        assert_eq!(resumed.stats().sample_count(), 2);
        assert_eq!(resumed.stats().channels[0].mean, 2.0);

        // Saved stats for a different width are rejected.
        assert!(RunningNormalizer::from_params(&p, 3).is_err());
    }

    #[test]
    fn frozen_never_writes_stats() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stats.json");
        NormalizationStats::new(1).save(&path).unwrap();

        let n = RunningNormalizer::frozen(NormalizationStats::load(&path).unwrap(), 1e-8)
            .with_stats_path(&path);
        assert!(!n.checkpoint().unwrap());
    }

    #[test]
    fn mode_parse_accepts_aliases() {
        assert_eq!(NormalizerMode::parse("Frozen"), Some(NormalizerMode::Frozen));
        assert_eq!(NormalizerMode::parse("train"), Some(NormalizerMode::Fitting));
        assert_eq!(NormalizerMode::parse("warm"), None);
        assert_eq!(NormalizerMode::Fitting.as_str(), "fitting");
    }
}
