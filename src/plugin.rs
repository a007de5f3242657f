use crate::domain::{ConfigError, ContainerEngine, LifecycleError, TestEnvironment};
use crate::infra::DockerCli;
use crate::infra::config::{self, ConfigDocument, EngineSettings};
use crate::services::{
    ContainerRegistry, HealthReport, Orchestrator, RunningRegistry, TeardownReport,
    validate_exclusions,
};
use clap::{Arg, ArgAction, ArgMatches, Command};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Name of the repeatable option listing containers to leave running.
pub const DONT_STOP_ARG: &str = "docker-dont-stop";

/// The four points at which a test runner calls into container management.
pub trait TestRunnerHooks {
    /// Adds the options this integration understands to the runner's CLI.
    fn on_register_options(&self, command: Command) -> Command;

    /// Called once after the configuration and command line are parsed.
    fn on_configure(
        &mut self,
        document: &ConfigDocument,
        matches: &ArgMatches,
    ) -> Result<(), ConfigError>;

    /// Brings the environment's containers up and publishes their variables
    /// into `env.setenv`.
    fn on_before_run(&self, env: &mut TestEnvironment) -> Result<HealthReport, LifecycleError>;

    /// Stops the environment's containers. Never fails; problems are logged
    /// and reported.
    fn on_after_run(&self, env: &TestEnvironment) -> TeardownReport;
}

/// Container integration for the test runner.
#[derive(Debug, Default)]
pub struct DockerPlugin {
    engine: Option<Arc<dyn ContainerEngine>>,
    orchestrator: Option<Orchestrator>,
}

impl DockerPlugin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses `engine` instead of the CLI engine named in `[engine]`.
    pub fn with_engine(engine: Arc<dyn ContainerEngine>) -> Self {
        Self {
            engine: Some(engine),
            orchestrator: None,
        }
    }

    pub fn orchestrator(&self) -> Option<&Orchestrator> {
        self.orchestrator.as_ref()
    }

    fn engine_for(&self, document: &ConfigDocument) -> Result<Arc<dyn ContainerEngine>, ConfigError> {
        if let Some(engine) = &self.engine {
            return Ok(engine.clone());
        }
        let settings = EngineSettings::from_document(document)?;
        let cli = DockerCli::from_settings(&settings);
        debug!(program = cli.program(), "using container engine CLI");
        Ok(Arc::new(cli))
    }
}

impl TestRunnerHooks for DockerPlugin {
    fn on_register_options(&self, command: Command) -> Command {
        command.arg(
            Arg::new(DONT_STOP_ARG)
                .long(DONT_STOP_ARG)
                .value_name("CONTAINER")
                .action(ArgAction::Append)
                .global(true)
                .help("Leave CONTAINER running after the test run (repeatable)"),
        )
    }

    fn on_configure(
        &mut self,
        document: &ConfigDocument,
        matches: &ArgMatches,
    ) -> Result<(), ConfigError> {
        let names = config::discover(document)?;

        let requested: Vec<String> = match matches.try_get_many::<String>(DONT_STOP_ARG) {
            Ok(Some(values)) => values.cloned().collect(),
            Ok(None) => Vec::new(),
            Err(e) => {
                warn!("--{DONT_STOP_ARG} not registered on this command: {e}");
                Vec::new()
            }
        };
        let keep_running = validate_exclusions(&names, &requested)?;

        let registry = ContainerRegistry::from_names(document, &names)?;
        let engine = self.engine_for(document)?;

        if !keep_running.is_empty() {
            info!(containers = ?keep_running, "containers will be left running");
        }
        self.orchestrator = Some(Orchestrator::new(
            engine,
            Arc::new(registry),
            Arc::new(RunningRegistry::new()),
            keep_running,
        ));
        Ok(())
    }

    fn on_before_run(&self, env: &mut TestEnvironment) -> Result<HealthReport, LifecycleError> {
        let orchestrator = self
            .orchestrator
            .as_ref()
            .ok_or(LifecycleError::NotConfigured)?;
        orchestrator.bring_up(env)?.into_result()
    }

    fn on_after_run(&self, env: &TestEnvironment) -> TeardownReport {
        match &self.orchestrator {
            Some(orchestrator) => orchestrator.tear_down(&env.id),
            None => {
                warn!(env = %env.id, "teardown requested before configuration");
                TeardownReport::default()
            }
        }
    }
}
