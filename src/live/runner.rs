// src/live/runner.rs
//
// Control loop: once per control interval
//   sensors -> raw observation -> pipeline -> policy -> decoder -> safety
//   -> actuators -> telemetry.
//
// Failure model:
// - Construction problems and step-time shape problems (pipeline errors,
//   wrong-length actions) end the run with an error.
// - Missing sensors follow the boundary policy (hold or abort).
// - A late tick, a slow or failing policy, or an unset sync flag holds the
//   previous commands. Failed writes keep that actuator's previous command.

use std::time::Duration;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::time::{sleep, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::actuators::ActuatorGateway;
use super::backend::{HomeBackend, ServiceCall};
use super::sensors::SensorGateway;
use crate::error::{PilotError, PilotResult};
use crate::loop_scheduler::LoopScheduler;
use crate::pipeline::ObservationPipeline;
use crate::policy::{ActionDecoder, Policy};
use crate::reward::{RewardBinding, RewardEngine};
use crate::safety::{SafetyConfig, SafetyLayer};
use crate::telemetry::{HoldReason, TelemetrySink, TickRecord};
use crate::types::{CalendarStamp, RawObservation};

/// What to do with a tick whose sensors cannot all be resolved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoundaryPolicy {
    /// Skip the tick and keep the previous commands.
    #[default]
    SkipAndHold,
    /// End the run with `SensorUnavailable`.
    Abort,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlSettings {
    pub interval_ms: u64,
    /// The tick must finish this long before the next one is due.
    pub safety_margin_ms: u64,
    pub policy_timeout_ms: u64,
    pub sensor_timeout_ms: u64,
    pub boundary: BoundaryPolicy,
    /// Flag entity that must be `on` before a tick reads sensors; turned
    /// `off` after the writes.
    pub sync_flag: Option<String>,
    pub flag_poll_ms: u64,
    /// 0 disables periodic normalizer checkpoints.
    pub checkpoint_interval_ms: u64,
    /// Added to the control slot index to form the forecast step index.
    /// Slots count scheduled intervals since the first tick, so ticks skipped
    /// after an overrun still advance the step.
    pub step_offset: i64,
}

impl Default for ControlSettings {
    fn default() -> Self {
        Self {
            interval_ms: 60_000,
            safety_margin_ms: 5_000,
            policy_timeout_ms: 2_000,
            sensor_timeout_ms: 2_000,
            boundary: BoundaryPolicy::SkipAndHold,
            sync_flag: None,
            flag_poll_ms: 1_000,
            checkpoint_interval_ms: 3_600_000,
            step_offset: 0,
        }
    }
}

impl ControlSettings {
    pub fn validate(&self) -> PilotResult<()> {
        if self.interval_ms == 0 {
            return Err(PilotError::config("control interval_ms must be positive"));
        }
        if self.safety_margin_ms >= self.interval_ms {
            return Err(PilotError::config(format!(
                "safety_margin_ms {} leaves no time in a {} ms interval",
                self.safety_margin_ms, self.interval_ms
            )));
        }
        if self.policy_timeout_ms == 0 || self.sensor_timeout_ms == 0 {
            return Err(PilotError::config("policy and sensor timeouts must be positive"));
        }
        if self.sync_flag.is_some() && self.flag_poll_ms == 0 {
            return Err(PilotError::config("flag_poll_ms must be positive when sync_flag is set"));
        }
        Ok(())
    }

    /// Hard deadline for one tick, measured from its start.
    pub fn tick_budget(&self) -> Duration {
        Duration::from_millis(self.interval_ms - self.safety_margin_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Fresh commands were sent (individual writes may still have failed).
    Applied,
    Held(HoldReason),
}

#[derive(Debug, Clone)]
pub struct TickReport {
    pub outcome: TickOutcome,
    pub record: TickRecord,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub ticks: u64,
    pub applied: u64,
    pub held: u64,
}

struct BoundReward {
    engine: RewardEngine,
    binding: RewardBinding,
    on_index: Option<usize>,
}

pub struct ControlLoop<B, P> {
    pipeline: ObservationPipeline,
    sensors: SensorGateway<B>,
    actuators: ActuatorGateway<B>,
    policy: P,
    decoder: ActionDecoder,
    safety: SafetyLayer,
    settings: ControlSettings,
    reward: Option<BoundReward>,
    telemetry: TelemetrySink,
    scheduler: Option<LoopScheduler>,
    tick_index: u64,
    next_slot: u64,
}

impl<B, P> ControlLoop<B, P>
where
    B: HomeBackend,
    P: Policy,
{
    pub fn new(
        pipeline: ObservationPipeline,
        sensors: SensorGateway<B>,
        actuators: ActuatorGateway<B>,
        policy: P,
        settings: ControlSettings,
    ) -> PilotResult<Self> {
        settings.validate()?;
        let expected_base = RawObservation::CALENDAR_WIDTH + sensors.sensors().len();
        if pipeline.base_width() != expected_base {
            return Err(PilotError::config(format!(
                "pipeline expects {} raw values but {} sensors are mapped (+{} calendar fields)",
                pipeline.base_width(),
                sensors.sensors().len(),
                RawObservation::CALENDAR_WIDTH
            )));
        }
        if actuators.actuators().is_empty() {
            return Err(PilotError::config("no actuators mapped"));
        }
        let decoder = ActionDecoder::new(actuators.actuators());
        let safety = SafetyLayer::new(actuators.actuators(), SafetyConfig::default());
        Ok(Self {
            pipeline,
            sensors,
            actuators,
            policy,
            decoder,
            safety,
            settings,
            reward: None,
            telemetry: TelemetrySink::off(),
            scheduler: None,
            tick_index: 0,
            next_slot: 0,
        })
    }

    pub fn with_safety(mut self, config: SafetyConfig) -> PilotResult<Self> {
        let names = self.sensor_names();
        if let Some(s) = config.zone_sensors.iter().find(|s| !names.contains(&s.as_str())) {
            return Err(PilotError::config(format!(
                "safety zone sensor '{}' is not mapped",
                s
            )));
        }
        self.safety = SafetyLayer::new(self.actuators.actuators(), config);
        Ok(self)
    }

    pub fn with_reward(mut self, engine: RewardEngine, binding: RewardBinding) -> PilotResult<Self> {
        let actuator_names: Vec<&str> = self
            .actuators
            .actuators()
            .iter()
            .map(|a| a.name.as_str())
            .collect();
        binding.validate(&self.sensor_names(), &actuator_names)?;
        let on_index = binding
            .on_actuator
            .as_ref()
            .and_then(|name| actuator_names.iter().position(|a| a == name));
        self.reward = Some(BoundReward {
            engine,
            binding,
            on_index,
        });
        Ok(self)
    }

    pub fn with_telemetry(mut self, telemetry: TelemetrySink) -> Self {
        self.telemetry = telemetry;
        self
    }

    fn sensor_names(&self) -> Vec<&str> {
        self.sensors
            .sensors()
            .iter()
            .map(|s| s.name.as_str())
            .collect()
    }

    pub fn pipeline(&self) -> &ObservationPipeline {
        &self.pipeline
    }

    pub fn sensors(&self) -> &SensorGateway<B> {
        &self.sensors
    }

    pub fn actuators(&self) -> &ActuatorGateway<B> {
        &self.actuators
    }

    pub fn settings(&self) -> &ControlSettings {
        &self.settings
    }

    pub fn ticks_run(&self) -> u64 {
        self.tick_index
    }

    /// Episode boundary: clears reward history and notifies the policy.
    pub fn reset_episode(&mut self) {
        if let Some(r) = self.reward.as_mut() {
            r.engine.reset();
        }
        self.policy.reset_episode();
    }

    /// Persist fitting normalizer stats now.
    pub fn checkpoint(&mut self, now_ms: i64) -> PilotResult<usize> {
        let written = self.pipeline.checkpoint()?;
        if written > 0 {
            info!(written, "normalizer stats checkpointed");
            self.telemetry
                .log_event(now_ms, "checkpoint", json!({ "written": written }));
        }
        Ok(written)
    }

    /// Run one tick stamped with the local wall clock.
    pub async fn tick(&mut self) -> PilotResult<TickReport> {
        self.tick_at(chrono::Local::now().naive_local()).await
    }

    /// Run one tick at site-local time `now`.
    pub async fn tick_at(&mut self, now: NaiveDateTime) -> PilotResult<TickReport> {
        let started = Instant::now();
        let deadline = started + self.settings.tick_budget();
        let tick = self.tick_index;
        self.tick_index += 1;
        let now_ms = now.and_utc().timestamp_millis();

        let scheduler = self.scheduler.get_or_insert_with(|| {
            LoopScheduler::new(
                now_ms,
                self.settings.interval_ms as i64,
                self.settings.checkpoint_interval_ms as i64,
            )
        });
        // Two ticks never share a slot, even when driven at the same instant.
        let slot = scheduler.slot_at(now_ms).max(self.next_slot);
        let missed = slot - self.next_slot;
        if missed > 0 {
            warn!(tick, missed, slot, "control slots missed");
        }
        self.next_slot = slot + 1;
        scheduler.catch_up(now_ms);
        scheduler.advance_control();

        let mut record = TickRecord::new(
            tick,
            now_ms,
            self.pipeline.layout_fingerprint(),
            self.policy.version(),
        );
        record.step_index = slot as i64 + self.settings.step_offset;
        let result = self.run_tick(now, deadline, &mut record).await;
        record.elapsed_ms = started.elapsed().as_millis() as u64;

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(err) => {
                record.error = Some(err.to_string());
                self.telemetry.log_tick(&record);
                self.telemetry.flush();
                warn!(tick, error = %err, kind = err.reason_label(), "tick failed, ending run");
                return Err(err);
            }
        };
        self.telemetry.log_tick(&record);

        let checkpoint_due = self
            .scheduler
            .as_ref()
            .map(|s| s.checkpoint_due(now_ms))
            .unwrap_or(false);
        if checkpoint_due {
            if let Err(err) = self.checkpoint(now_ms) {
                warn!(error = %err, "normalizer checkpoint failed");
            }
            if let Some(s) = self.scheduler.as_mut() {
                s.mark_checkpoint_ran();
            }
        }

        Ok(TickReport { outcome, record })
    }

    async fn run_tick(
        &mut self,
        now: NaiveDateTime,
        deadline: Instant,
        record: &mut TickRecord,
    ) -> PilotResult<TickOutcome> {
        let tick = record.tick;

        if let Some(flag) = self.settings.sync_flag.clone() {
            if !self.wait_for_flag(&flag, deadline).await {
                warn!(tick, flag = %flag, "sync flag not set before deadline, holding");
                return Ok(hold(record, HoldReason::SyncFlagNotSet, None));
            }
        }

        let readings = match self.sensors.read_all(record.now_ms).await {
            Ok(readings) => readings,
            Err(err @ PilotError::SensorUnavailable { .. }) => match self.settings.boundary {
                BoundaryPolicy::SkipAndHold => {
                    warn!(tick, error = %err, "tick skipped, holding previous commands");
                    return Ok(hold(
                        record,
                        HoldReason::SensorUnavailable,
                        Some(err.to_string()),
                    ));
                }
                BoundaryPolicy::Abort => return Err(err),
            },
            Err(err) => return Err(err),
        };

        let raw = RawObservation {
            calendar: CalendarStamp::from_datetime(&now),
            step_index: record.step_index,
            readings: readings.iter().map(|r| (r.name.clone(), r.value)).collect(),
        };
        record.readings = readings;

        record.zone_alerts = self.safety.zone_alerts(&raw);
        for alert in &record.zone_alerts {
            warn!(tick, sensor = %alert.sensor, value = alert.value, limit = alert.limit, too_cold = alert.too_cold, "zone temperature outside safe limits");
        }

        let observation = self.pipeline.build(&raw)?;
        record.observation = Some(observation.clone());

        if let Some(r) = self.reward.as_mut() {
            let last = self.actuators.last_commanded();
            let actuator_on = r
                .on_index
                .map(|i| last.get(i).copied().flatten().map(|v| v > 0.5).unwrap_or(false));
            let input = r.binding.input(&raw, actuator_on)?;
            record.reward = Some(r.engine.score_at(&input, &raw.calendar)?);
        }

        let now_instant = Instant::now();
        if now_instant >= deadline {
            warn!(tick, "tick deadline passed before inference, holding");
            return Ok(hold(record, HoldReason::DeadlineExceeded, None));
        }
        let budget = deadline
            .saturating_duration_since(now_instant)
            .min(Duration::from_millis(self.settings.policy_timeout_ms));

        let action = match timeout(budget, self.policy.act(&observation)).await {
            Err(_) => {
                let err = PilotError::PolicyInferenceTimeout {
                    timeout_ms: budget.as_millis() as u64,
                };
                warn!(tick, error = %err, "policy timed out, holding");
                return Ok(hold(record, HoldReason::PolicyTimeout, Some(err.to_string())));
            }
            Ok(Err(err)) if !err.is_fatal() => {
                warn!(tick, error = %err, "policy failed, holding");
                return Ok(hold(record, HoldReason::PolicyError, Some(err.to_string())));
            }
            Ok(Err(err)) => return Err(err),
            Ok(Ok(action)) => action,
        };

        let decoded = self.decoder.decode(&action)?;
        let safety = self.safety.apply(&decoded, self.actuators.last_commanded());
        if !safety.rejection_reasons.is_empty() {
            warn!(tick, reasons = ?safety.rejection_reasons, "safety layer adjusted commands");
        }
        record.action_raw = Some(action);
        record.commands_applied = Some(safety.applied.clone());
        record.safety_reasons = safety.rejection_reasons;

        record.writes = self.actuators.write_all(&safety.applied).await?;
        debug!(tick, commands = ?safety.applied, "commands written");

        if let Some(flag) = self.settings.sync_flag.as_deref() {
            if let Err(err) = self.actuators.send(flag, ServiceCall::turn_off(flag)).await {
                warn!(tick, flag = %flag, error = %err, "could not clear sync flag");
            }
        }

        Ok(TickOutcome::Applied)
    }

    async fn wait_for_flag(&self, flag: &str, deadline: Instant) -> bool {
        let poll = Duration::from_millis(self.settings.flag_poll_ms);
        loop {
            let read_timeout = Duration::from_millis(self.settings.sensor_timeout_ms)
                .min(deadline.saturating_duration_since(Instant::now()));
            match timeout(read_timeout, self.sensors.backend().get_state(flag)).await {
                Ok(Ok(state)) if state.is_on() => return true,
                Ok(Ok(_)) => {}
                Ok(Err(err)) => warn!(flag = %flag, error = %err, "sync flag read failed"),
                Err(_) => warn!(
                    flag = %flag,
                    timeout_ms = read_timeout.as_millis() as u64,
                    "sync flag read timed out"
                ),
            }
            if Instant::now() + poll >= deadline {
                return false;
            }
            sleep(poll).await;
        }
    }

    /// Tick on the control interval until `max_ticks` (forever when `None`)
    /// or a run-ending error. Fitting stats are checkpointed on exit.
    pub async fn run(&mut self, max_ticks: Option<u64>) -> PilotResult<RunSummary> {
        info!(
            interval_ms = self.settings.interval_ms,
            declared_length = self.pipeline.declared_length(),
            fingerprint = %self.pipeline.layout_fingerprint(),
            policy = %self.policy.version(),
            "control loop starting"
        );
        self.telemetry.log_event(
            chrono::Utc::now().timestamp_millis(),
            "startup",
            json!({
                "layout_fingerprint": self.pipeline.layout_fingerprint(),
                "declared_length": self.pipeline.declared_length(),
                "stages": self.pipeline.stage_names(),
                "policy_version": self.policy.version(),
            }),
        );

        let mut interval = tokio::time::interval(Duration::from_millis(self.settings.interval_ms));
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut summary = RunSummary::default();
        let result = loop {
            if max_ticks.map(|max| summary.ticks >= max).unwrap_or(false) {
                break Ok(());
            }
            interval.tick().await;
            match self.tick().await {
                Ok(report) => {
                    summary.ticks += 1;
                    match report.outcome {
                        TickOutcome::Applied => summary.applied += 1,
                        TickOutcome::Held(_) => summary.held += 1,
                    }
                }
                Err(err) => break Err(err),
            }
        };

        let now_ms = chrono::Utc::now().timestamp_millis();
        if let Err(err) = self.checkpoint(now_ms) {
            warn!(error = %err, "final normalizer checkpoint failed");
        }
        self.telemetry.log_event(
            now_ms,
            "shutdown",
            json!({ "ticks": summary.ticks, "applied": summary.applied, "held": summary.held }),
        );
        self.telemetry.flush();
        info!(ticks = summary.ticks, applied = summary.applied, held = summary.held, "control loop stopped");

        result.map(|_| summary)
    }
}

fn hold(record: &mut TickRecord, reason: HoldReason, error: Option<String>) -> TickOutcome {
    record.set_hold(reason.clone(), error);
    TickOutcome::Held(reason)
}
