pub mod cli;
pub mod domain;
pub mod infra;
pub mod plugin;
pub mod services;

// Exposed for the integration tests under tests/
pub mod test_support;

pub use domain::{
    ConfigError, ContainerEngine, ContainerSpec, EnvId, LifecycleError, RunningContainer,
    TestEnvironment,
};
pub use infra::DockerCli;
pub use plugin::{DockerPlugin, TestRunnerHooks};
pub use services::{ContainerRegistry, HealthReport, Orchestrator, RunningRegistry, TeardownReport};
