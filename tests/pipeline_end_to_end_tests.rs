// tests/pipeline_end_to_end_tests.rs
//
// Observation pipeline assembled from stage specs and on-disk fixtures, the
// way a deployment config builds it.

use std::fs;
use std::path::Path;

use thermo_pilot::pipeline::{NormalizationStats, ObservationPipeline, StageSpec, TimeEncoder};
use thermo_pilot::{CalendarStamp, PilotError, RawObservation};

// Naive local timestamps, so the stages below key them with `hour_shift: 0`.
fn write_day_prices(dir: &Path) -> String {
    let mut text = String::from("datetime;value\n");
    for h in 0..24 {
        let price = if h == 10 { 41.45 } else { 30.0 + h as f64 };
        text.push_str(&format!("2024-01-15 {:02}:00:00;{}\n", h, price));
    }
    let path = dir.join("prices.csv");
    fs::write(&path, text).unwrap();
    path.to_str().unwrap().to_string()
}

fn write_unit_stats(dir: &Path, width: usize) -> String {
    let path = dir.join("stats.json");
    NormalizationStats::from_mean_var(&vec![0.0; width], &vec![1.0; width])
        .unwrap()
        .save(&path)
        .unwrap();
    path.to_str().unwrap().to_string()
}

fn raw_at(hour: u32) -> RawObservation {
    RawObservation::new(CalendarStamp::new(2024, 1, 15, hour), 0)
        .with_reading("t_in", 21.5)
        .with_reading("t_out", -2.0)
}

#[test]
fn time_encoding_normalization_and_price_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let prices = write_day_prices(dir.path());
    let stats = write_unit_stats(dir.path(), 7);

    let specs = vec![
        StageSpec::new("time_encoder"),
        StageSpec::new("normalizer")
            .with_param("mode", "frozen")
            .with_param("stats_path", stats),
        StageSpec::new("energy_cost")
            .with_param("path", prices)
            .with_param("hour_shift", 0),
    ];
    let mut pipeline = ObservationPipeline::from_specs(&specs, 5).unwrap();
    assert_eq!(pipeline.declared_length(), 8);

    let v = pipeline.build(&raw_at(10)).unwrap();
    assert_eq!(v.len(), 8);
    assert_eq!(*v.last().unwrap(), 41.45);

    let expected = TimeEncoder::encode(&CalendarStamp::new(2024, 1, 15, 10)).unwrap();
    assert_eq!(expected[2], 0.0, "2024-01-15 is a Monday");
    for (got, want) in v[..5].iter().zip(expected.iter()) {
        assert!((got - want).abs() < 1e-6, "got {got}, want {want}");
    }
    assert!((v[5] - 21.5).abs() < 1e-6);
    assert!((v[6] + 2.0).abs() < 1e-6);
}

#[test]
fn every_hour_of_the_priced_day_builds() {
    let dir = tempfile::tempdir().unwrap();
    let prices = write_day_prices(dir.path());
    let specs = vec![
        StageSpec::new("time_encoder"),
        StageSpec::new("energy_cost")
            .with_param("path", prices)
            .with_param("hour_shift", 0),
    ];
    let mut pipeline = ObservationPipeline::from_specs(&specs, 5).unwrap();
    for h in 0..24 {
        let v = pipeline.build(&raw_at(h)).unwrap();
        let want = if h == 10 { 41.45 } else { 30.0 + h as f64 };
        assert_eq!(v[7], want, "hour {h}");
    }

    let next_day = RawObservation::new(CalendarStamp::new(2024, 1, 16, 0), 0)
        .with_reading("t_in", 21.5)
        .with_reading("t_out", -2.0);
    assert!(matches!(
        pipeline.build(&next_day),
        Err(PilotError::LookupMiss(_))
    ));
}

#[test]
fn forecast_window_follows_step_index_and_runs_out() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("forecast.csv");
    fs::write(
        &path,
        "timestep,outdoor_temp,solar\n0,1.0,0.0\n1,2.0,10.0\n2,3.0,20.0\n3,4.0,30.0\n",
    )
    .unwrap();
    let specs = vec![
        StageSpec::new("time_encoder"),
        StageSpec::new("forecast")
            .with_param("path", path.to_str().unwrap())
            .with_param("horizon", 2),
    ];
    let mut pipeline = ObservationPipeline::from_specs(&specs, 5).unwrap();
    assert_eq!(pipeline.declared_length(), 11);

    let mut raw = raw_at(10);
    raw.step_index = 1;
    let v = pipeline.build(&raw).unwrap();
    assert_eq!(&v[7..], &[2.0, 10.0, 3.0, 20.0]);

    raw.step_index = 3;
    assert!(matches!(
        pipeline.build(&raw),
        Err(PilotError::DataExhausted { .. })
    ));
}

#[test]
fn fitting_normalizer_checkpoints_and_resumes() {
    let dir = tempfile::tempdir().unwrap();
    let stats_path = dir.path().join("fit.json");
    let specs = vec![
        StageSpec::new("time_encoder"),
        StageSpec::new("normalizer")
            .with_param("mode", "fitting")
            .with_param("stats_path", stats_path.to_str().unwrap()),
    ];

    let mut first = ObservationPipeline::from_specs(&specs, 5).unwrap();
    for h in 0..10 {
        first.build(&raw_at(h)).unwrap();
    }
    assert_eq!(first.checkpoint().unwrap(), 1);

    let resumed = ObservationPipeline::from_specs(&specs, 5).unwrap();
    let normalizer = resumed.normalizers().next().unwrap();
    assert_eq!(normalizer.stats().sample_count(), 10);
}

#[test]
fn stats_with_wrong_channel_count_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let stats = write_unit_stats(dir.path(), 5);
    let specs = vec![
        StageSpec::new("time_encoder"),
        StageSpec::new("normalizer")
            .with_param("mode", "frozen")
            .with_param("stats_path", stats),
    ];
    assert!(matches!(
        ObservationPipeline::from_specs(&specs, 5),
        Err(PilotError::Configuration(_))
    ));
}
