//! Live I/O: home-automation backend, sensor and actuator gateways, and the
//! control loop that ties them to the observation pipeline and the policy.

pub mod actuators;
pub mod backend;
pub mod mock_backend;
pub mod runner;
pub mod sensors;

pub use actuators::{ActuatorGateway, ActuatorSpec, RetryPolicy, WriteOutcome};
pub use backend::{BackendError, EntityState, HomeBackend, HttpBackend, ServiceCall};
pub use mock_backend::MockBackend;
pub use runner::{BoundaryPolicy, ControlLoop, ControlSettings, RunSummary, TickOutcome, TickReport};
pub use sensors::{Reading, ReadingSource, SensorFallback, SensorGateway, SensorSpec};
