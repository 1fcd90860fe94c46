// src/main.rs
//
// Thin harness around the thermo_pilot library.
// All of the real logic lives in the lib crate (pipeline, gateways, loop).

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use thermo_pilot::{logging, Config, HttpBackend, MockBackend, TickOutcome};

#[derive(Parser, Debug)]
#[command(name = "thermo_pilot", about = "Serve a trained HVAC policy against a home-automation backend")]
struct Cli {
    /// YAML deployment config.
    #[arg(long, short, default_value = "thermo_pilot.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Validate the config and print the observation layout.
    Check,
    /// Run the control loop.
    Run {
        /// Use an in-memory backend instead of the configured one.
        #[arg(long)]
        dry_run: bool,
        /// Value every sensor reports in a dry run.
        #[arg(long, default_value_t = 20.0)]
        dry_run_value: f64,
        /// Stop after this many ticks.
        #[arg(long)]
        max_ticks: Option<u64>,
        /// Run a single tick immediately and print its record.
        #[arg(long)]
        once: bool,
    },
}

fn load_config(path: &Path) -> Result<Config> {
    let mut cfg = Config::from_yaml_file(path)
        .with_context(|| format!("loading config {}", path.display()))?;
    cfg.apply_env_overrides();
    cfg.validate().context("config invalid after environment overrides")?;
    Ok(cfg)
}

fn check(cfg: &Config) -> Result<()> {
    let pipeline = cfg.build_pipeline().context("building observation pipeline")?;
    println!("config_version={}", cfg.version);
    println!("base_width={}", pipeline.base_width());
    println!("stages={}", pipeline.stage_names().join(","));
    println!("declared_length={}", pipeline.declared_length());
    println!("layout_fingerprint={}", pipeline.layout_fingerprint());
    cfg.build_reward_engine().context("building reward engine")?;
    cfg.build_policy().context("building policy")?;
    Ok(())
}

async fn seed_dry_run(cfg: &Config, value: f64) -> MockBackend {
    let mock = MockBackend::new();
    for s in &cfg.sensors {
        mock.set_numeric(&s.entity_id, value).await;
    }
    if let Some(flag) = &cfg.control.sync_flag {
        mock.set_state(flag, "on").await;
    }
    mock
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init_tracing();
    let cli = Cli::parse();
    let cfg = load_config(&cli.config)?;

    match cli.command {
        Command::Check => check(&cfg),
        Command::Run {
            dry_run,
            dry_run_value,
            max_ticks,
            once,
        } => {
            let policy = cfg.build_policy().context("building policy")?;
            if dry_run {
                info!(value = dry_run_value, "dry run: in-memory backend");
                let backend = seed_dry_run(&cfg, dry_run_value).await;
                let mut control = cfg.build_control_loop(backend, policy)?;
                if once {
                    let report = control.tick().await?;
                    println!("{}", serde_json::to_string_pretty(&report.record)?);
                    return Ok(());
                }
                let summary = control.run(max_ticks).await?;
                println!("ticks={} applied={} held={}", summary.ticks, summary.applied, summary.held);
            } else {
                let backend: HttpBackend = cfg.build_http_backend()?;
                backend
                    .ping()
                    .await
                    .map_err(|e| anyhow::anyhow!("backend {} unreachable: {}", backend.base_url(), e))?;
                let mut control = cfg.build_control_loop(backend, policy)?;
                if once {
                    let report = control.tick().await?;
                    if let TickOutcome::Held(reason) = &report.outcome {
                        info!(?reason, "tick held");
                    }
                    println!("{}", serde_json::to_string_pretty(&report.record)?);
                    return Ok(());
                }
                let summary = control.run(max_ticks).await?;
                println!("ticks={} applied={} held={}", summary.ticks, summary.applied, summary.held);
            }
            Ok(())
        }
    }
}
