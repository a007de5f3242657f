pub mod env_vars;
pub mod graph;
pub mod health;
mod orchestrator;
mod registry;
pub mod resolver;
mod running;

pub use health::{HealthChecker, HealthOutcome};
pub use orchestrator::{HealthReport, Orchestrator, TeardownReport};
pub use registry::{ContainerRegistry, validate_exclusions};
pub use running::{EnvContainers, RunningEntry, RunningRegistry};
