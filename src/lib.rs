//! thermo_pilot core library.
//!
//! Serves a trained HVAC control policy against a live home-automation
//! backend: sensor readings become the exact observation vector the policy
//! was trained on, the policy's normalized action becomes physical actuator
//! commands, and every tick is logged. The binary (`src/main.rs`) is a thin
//! harness around these components.

pub mod config;
pub mod error;
pub mod live;
pub mod logging;
pub mod loop_scheduler;
pub mod numeric;
pub mod pipeline;
pub mod policy;
pub mod reward;
pub mod safety;
pub mod tables;
pub mod telemetry;
pub mod types;

// --- Re-exports for ergonomic external use ---------------------------------

pub use config::Config;
pub use error::{PilotError, PilotResult};

pub use live::{
    ActuatorGateway, ActuatorSpec, BoundaryPolicy, ControlLoop, ControlSettings, HomeBackend,
    HttpBackend, MockBackend, RetryPolicy, SensorFallback, SensorGateway, SensorSpec, TickOutcome,
    TickReport,
};

pub use pipeline::{
    EnergyCostInjector, ForecastInjector, ForecastTable, NormalizationStats, NormalizerMode,
    ObservationPipeline, PriceTable, RunningNormalizer, Stage, StageSpec, TimeEncoder,
};

pub use policy::{ActionDecoder, ConstantPolicy, FnPolicy, HttpPolicy, Policy};

pub use reward::{RewardBinding, RewardConfig, RewardEngine, RewardInput, RewardTerms, Tariff};

pub use safety::{SafetyConfig, SafetyLayer};

pub use telemetry::{HoldReason, TelemetryConfig, TelemetrySink, TickRecord};

pub use types::{CalendarStamp, ObservationVector, RawObservation, TimestampMs};
