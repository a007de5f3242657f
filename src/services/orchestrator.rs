use crate::domain::{
    ContainerEngine, ContainerSpec, EnvId, LifecycleError, LinkedContainer, RunningContainer,
    TestEnvironment,
};
use crate::services::env_vars::{container_env_vars, inject};
use crate::services::graph::start_order;
use crate::services::health::{HealthChecker, HealthOutcome};
use crate::services::resolver::resolve_container_set;
use crate::services::{ContainerRegistry, RunningRegistry};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Health-check results for one environment, in start order.
///
/// Checking stops at the first failure, so containers after it have no entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthReport {
    pub checks: Vec<(String, HealthOutcome)>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.failure().is_none()
    }

    /// Name and reason of the container that failed, if any.
    pub fn failure(&self) -> Option<(&str, &str)> {
        self.checks.iter().find_map(|(name, outcome)| match outcome {
            HealthOutcome::Failed(reason) => Some((name.as_str(), reason.as_str())),
            HealthOutcome::Healthy => None,
        })
    }

    pub fn healthy(&self) -> impl Iterator<Item = &str> {
        self.checks
            .iter()
            .filter(|(_, outcome)| outcome.is_healthy())
            .map(|(name, _)| name.as_str())
    }

    /// Turns a failed check into `HealthCheckFailed`.
    pub fn into_result(self) -> Result<Self, LifecycleError> {
        match self.failure() {
            Some((container, reason)) => Err(LifecycleError::HealthCheckFailed {
                container: container.to_string(),
                reason: reason.to_string(),
            }),
            None => Ok(self),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeardownReport {
    pub stopped: Vec<String>,
    pub kept: Vec<String>,
    pub failed: Vec<(String, String)>,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Drives pull, start, health check, variable injection and stop for the
/// containers of each test environment.
#[derive(Debug)]
pub struct Orchestrator {
    engine: Arc<dyn ContainerEngine>,
    specs: Arc<ContainerRegistry>,
    running: Arc<RunningRegistry>,
    health: HealthChecker,
    keep_running: BTreeSet<String>,
}

impl Orchestrator {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        specs: Arc<ContainerRegistry>,
        running: Arc<RunningRegistry>,
        keep_running: BTreeSet<String>,
    ) -> Self {
        Self {
            health: HealthChecker::new(engine.clone()),
            engine,
            specs,
            running,
            keep_running,
        }
    }

    pub fn specs(&self) -> &ContainerRegistry {
        &self.specs
    }

    pub fn running(&self) -> &RunningRegistry {
        &self.running
    }

    /// Validates the environment's containers and orders them for start.
    /// Never calls the engine.
    pub fn plan(&self, env: &TestEnvironment) -> Result<Vec<Arc<ContainerSpec>>, LifecycleError> {
        let specs = resolve_container_set(&env.id, &env.docker, &self.specs)?;
        Ok(start_order(&specs)?)
    }

    /// Brings the environment's containers up and injects their variables.
    ///
    /// A failed health check is reported in the returned [`HealthReport`]
    /// rather than as an error; everything started stays registered for
    /// [`Orchestrator::tear_down`].
    pub fn bring_up(&self, env: &mut TestEnvironment) -> Result<HealthReport, LifecycleError> {
        let specs = self.plan(env)?;
        if specs.is_empty() {
            return Ok(HealthReport::default());
        }

        self.pull_all(&specs)?;
        self.start_all(&env.id, &specs)?;

        let report = self.check_health(&env.id);
        if let Some((container, reason)) = report.failure() {
            error!(env = %env.id, container, "health check failed: {reason}");
        }

        self.inject_env_vars(env, &report);
        Ok(report)
    }

    pub fn pull_all(&self, specs: &[Arc<ContainerSpec>]) -> Result<(), LifecycleError> {
        for spec in specs {
            info!(container = %spec.name, image = %spec.image, "pulling image");
            self.engine
                .pull_image(&spec.image)
                .map_err(|e| LifecycleError::Pull {
                    image: spec.image.to_string(),
                    source: e.into(),
                })?;
        }
        Ok(())
    }

    /// Starts `specs` in order, registering each container as soon as it runs.
    pub fn start_all(&self, env: &EnvId, specs: &[Arc<ContainerSpec>]) -> Result<(), LifecycleError> {
        for spec in specs {
            let dependencies = self.running_dependencies(env, spec)?;
            let links: Vec<LinkedContainer<'_>> = spec
                .links
                .iter()
                .zip(&dependencies)
                .map(|(link, container)| LinkedContainer {
                    alias: &link.alias,
                    container,
                })
                .collect();

            info!(env = %env, container = %spec.name, "starting container");
            let container = self
                .engine
                .run_container(spec, env, &links)
                .map_err(|e| LifecycleError::Start {
                    container: spec.name.clone(),
                    source: e.into(),
                })?;

            debug!(
                env = %env,
                container = %spec.name,
                id = %container.short_id(),
                "container running"
            );
            self.running.register(env, Arc::clone(spec), container);
        }
        Ok(())
    }

    fn running_dependencies(
        &self,
        env: &EnvId,
        spec: &ContainerSpec,
    ) -> Result<Vec<RunningContainer>, LifecycleError> {
        spec.links
            .iter()
            .map(|link| {
                self.running
                    .get(env, &link.target)
                    .ok_or_else(|| LifecycleError::Start {
                        container: spec.name.clone(),
                        source: format!("dependency '{}' is not running", link.target).into(),
                    })
            })
            .collect()
    }

    /// Health-checks the environment's containers in start order, stopping at
    /// the first failure.
    pub fn check_health(&self, env: &EnvId) -> HealthReport {
        let mut report = HealthReport::default();

        for entry in self.running.all(env) {
            info!(env = %env, container = %entry.name(), "waiting for container to be healthy");
            let outcome = self.health.wait_healthy(&entry.spec, &entry.container);
            let failed = !outcome.is_healthy();
            report.checks.push((entry.name().to_string(), outcome));
            if failed {
                break;
            }
        }

        report
    }

    /// Sets the variables of every healthy container on the environment,
    /// leaving variables it already has untouched.
    pub fn inject_env_vars(&self, env: &mut TestEnvironment, report: &HealthReport) -> Vec<String> {
        let mut injected = Vec::new();

        for name in report.healthy() {
            let Some(entry) = self.running.all(&env.id).into_iter().find(|e| e.name() == name)
            else {
                continue;
            };
            let vars: BTreeMap<String, String> = container_env_vars(&entry.spec, &entry.container);
            for var in vars.keys().filter(|var| env.setenv.contains_key(*var)) {
                debug!(env = %env.id, var = %var, "keeping existing value");
            }
            injected.extend(inject(env, &vars));
        }

        injected
    }

    /// Stops everything registered for the environment except the containers
    /// in the keep-running set. Failures are logged and do not stop the
    /// remaining containers from being stopped.
    pub fn tear_down(&self, env: &EnvId) -> TeardownReport {
        let mut report = TeardownReport::default();

        for entry in self.running.all(env).into_iter().rev() {
            let name = entry.name().to_string();

            if self.keep_running.contains(&name) {
                info!(env = %env, container = %name, "leaving container running (--docker-dont-stop)");
                report.kept.push(name);
                continue;
            }

            info!(env = %env, container = %name, "stopping container");
            match self.engine.stop_container(&entry.container) {
                Ok(()) => report.stopped.push(name.clone()),
                Err(e) => {
                    warn!(env = %env, container = %name, "failed to stop container: {e:#}");
                    report.failed.push((name.clone(), format!("{e:#}")));
                }
            }
            self.running.remove(env, &name);
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::traits::ContainerHealthStatus;
    use crate::domain::{ConfigError, HealthCheckPolicy, HealthProbe, ImageRef};
    use crate::test_support::MockEngine;
    use std::time::Duration;

    fn spec(name: &str, links: &[&str], ports: &[&str]) -> ContainerSpec {
        let mut spec = ContainerSpec::new(name, ImageRef::parse(&format!("{name}:1")).unwrap());
        spec.links = links.iter().map(|l| l.parse().unwrap()).collect();
        spec.ports = ports.iter().map(|p| p.parse().unwrap()).collect();
        spec.healthcheck = HealthCheckPolicy {
            probe: HealthProbe::Command("check".into()),
            interval: Duration::from_millis(2),
            timeout: Duration::from_millis(5),
            retries: 1,
            start_period: Duration::ZERO,
        };
        spec
    }

    fn create_test_orchestrator(
        specs: Vec<ContainerSpec>,
        keep: &[&str],
    ) -> (Orchestrator, Arc<MockEngine>) {
        let mock = Arc::new(MockEngine::new());
        let mut registry = ContainerRegistry::new();
        for spec in specs {
            registry.insert(spec);
        }
        let orchestrator = Orchestrator::new(
            mock.clone(),
            Arc::new(registry),
            Arc::new(RunningRegistry::new()),
            keep.iter().map(|s| s.to_string()).collect(),
        );
        (orchestrator, mock)
    }

    fn web_and_db() -> Vec<ContainerSpec> {
        vec![
            spec("db", &[], &["5432/tcp"]),
            spec("web", &["db"], &["8080/tcp"]),
        ]
    }

    fn env(names: &[&str]) -> TestEnvironment {
        TestEnvironment::new("py311", names.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn brings_up_dependencies_first_and_injects_variables() {
        let (orchestrator, mock) = create_test_orchestrator(web_and_db(), &[]);
        let mut env = env(&["web", "db"]);

        let report = orchestrator.bring_up(&mut env).unwrap();

        assert!(report.is_healthy());
        assert!(mock.position("run:db") < mock.position("run:web"));
        assert!(mock.position("pull:web:1") < mock.position("run:db"));
        assert!(mock.position("pull:db:1") < mock.position("run:db"));

        let db_id = mock.container("db").unwrap().running.id;
        assert_eq!(
            mock.container("web").unwrap().links,
            vec![("db".to_string(), db_id)]
        );

        for var in ["DB_HOST", "DB_PORT", "WEB_HOST", "WEB_PORT"] {
            assert!(env.setenv.contains_key(var), "missing {var}");
        }
        assert_eq!(orchestrator.running().names(&env.id), vec!["db", "web"]);
    }

    #[test]
    fn tear_down_stops_everything() {
        let (orchestrator, mock) = create_test_orchestrator(web_and_db(), &[]);
        let mut env = env(&["web", "db"]);
        orchestrator.bring_up(&mut env).unwrap();

        let report = orchestrator.tear_down(&env.id);

        assert!(report.is_clean());
        assert_eq!(report.stopped, vec!["web", "db"]);
        assert!(!mock.is_running("db"));
        assert!(!mock.is_running("web"));
        assert!(orchestrator.running().is_empty(&env.id));
    }

    #[test]
    fn tear_down_leaves_excluded_containers_registered() {
        let (orchestrator, mock) = create_test_orchestrator(web_and_db(), &["db"]);
        let mut env = env(&["web", "db"]);
        orchestrator.bring_up(&mut env).unwrap();

        let report = orchestrator.tear_down(&env.id);

        assert_eq!(report.stopped, vec!["web"]);
        assert_eq!(report.kept, vec!["db"]);
        assert!(mock.is_running("db"));
        assert_eq!(mock.count_commands("stop:db"), 0);
        assert_eq!(orchestrator.running().names(&env.id), vec!["db"]);
    }

    #[test]
    fn unknown_container_fails_before_any_engine_call() {
        let (orchestrator, mock) = create_test_orchestrator(web_and_db(), &[]);
        let mut env = env(&["db", "ghost"]);

        let err = orchestrator.bring_up(&mut env).unwrap_err();

        assert!(matches!(
            err,
            LifecycleError::Config(ConfigError::UnknownContainer { ref name, .. }) if name == "ghost"
        ));
        assert!(mock.get_commands().is_empty());
    }

    #[test]
    fn cycle_fails_before_any_engine_call() {
        let (orchestrator, mock) = create_test_orchestrator(
            vec![spec("a", &["b"], &[]), spec("b", &["a"], &[])],
            &[],
        );
        let err = orchestrator.bring_up(&mut env(&["a", "b"])).unwrap_err();

        assert!(matches!(
            err,
            LifecycleError::Config(ConfigError::DependencyCycle { .. })
        ));
        assert!(mock.get_commands().is_empty());
    }

    #[test]
    fn pull_failure_aborts_before_start() {
        let (orchestrator, mock) = create_test_orchestrator(web_and_db(), &[]);
        mock.set_fail_on("pull:web:1");

        let err = orchestrator.bring_up(&mut env(&["web", "db"])).unwrap_err();

        assert!(matches!(err, LifecycleError::Pull { ref image, .. } if image == "web:1"));
        assert!(!mock.get_commands().iter().any(|c| c.starts_with("run:")));
    }

    #[test]
    fn start_failure_keeps_started_containers_registered() {
        let (orchestrator, mock) = create_test_orchestrator(web_and_db(), &[]);
        mock.set_fail_on("run:web");
        let mut env = env(&["web", "db"]);

        let err = orchestrator.bring_up(&mut env).unwrap_err();

        assert!(matches!(err, LifecycleError::Start { ref container, .. } if container == "web"));
        assert_eq!(orchestrator.running().names(&env.id), vec!["db"]);

        let report = orchestrator.tear_down(&env.id);
        assert_eq!(report.stopped, vec!["db"]);
        assert!(orchestrator.running().is_empty(&env.id));
    }

    #[test]
    fn health_failure_is_fail_fast() {
        let (orchestrator, mock) = create_test_orchestrator(
            vec![
                spec("db", &[], &["5432"]),
                spec("cache", &[], &["6379"]),
                spec("queue", &[], &["5672"]),
            ],
            &[],
        );
        let mut env = env(&["db", "cache", "queue"]);
        let order: Vec<String> = orchestrator
            .plan(&env)
            .unwrap()
            .iter()
            .map(|s| s.name.clone())
            .collect();
        let (first, second, third) = (&order[0], &order[1], &order[2]);
        mock.set_health_status(second, ContainerHealthStatus::Unhealthy);

        let report = orchestrator.bring_up(&mut env).unwrap();

        assert_eq!(report.failure().map(|(name, _)| name), Some(second.as_str()));
        assert_eq!(report.checks.len(), 2);
        assert_eq!(mock.count_commands(&format!("health:{third}")), 0);
        assert_eq!(orchestrator.running().names(&env.id).len(), 3);

        let first_prefix = first.to_uppercase();
        let third_prefix = third.to_uppercase();
        assert!(env.setenv.contains_key(&format!("{first_prefix}_HOST")));
        assert!(!env.setenv.contains_key(&format!("{third_prefix}_HOST")));

        assert!(matches!(
            report.into_result(),
            Err(LifecycleError::HealthCheckFailed { .. })
        ));
    }

    #[test]
    fn injection_does_not_clobber_declared_values() {
        let (orchestrator, _mock) = create_test_orchestrator(web_and_db(), &[]);
        let mut env = env(&["db"]).with_setenv("DB_HOST", "db.example");

        orchestrator.bring_up(&mut env).unwrap();

        assert_eq!(env.setenv["DB_HOST"], "db.example");
        assert!(env.setenv.contains_key("DB_PORT"));
    }

    #[test]
    fn stop_failures_do_not_prevent_other_stops() {
        let (orchestrator, mock) = create_test_orchestrator(web_and_db(), &[]);
        let mut env = env(&["web", "db"]);
        orchestrator.bring_up(&mut env).unwrap();
        mock.set_fail_on("stop:web");

        let report = orchestrator.tear_down(&env.id);

        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "web");
        assert_eq!(report.stopped, vec!["db"]);
        assert_eq!(mock.count_commands("stop:db"), 1);
        assert!(orchestrator.running().is_empty(&env.id));
    }

    #[test]
    fn environment_without_containers_is_a_no_op() {
        let (orchestrator, mock) = create_test_orchestrator(web_and_db(), &[]);
        let mut env = env(&[]);

        let report = orchestrator.bring_up(&mut env).unwrap();

        assert!(report.checks.is_empty());
        assert!(env.setenv.is_empty());
        assert!(orchestrator.tear_down(&env.id).stopped.is_empty());
        assert!(mock.get_commands().is_empty());
    }

    #[test]
    fn environments_do_not_share_containers() {
        let (orchestrator, _mock) = create_test_orchestrator(web_and_db(), &[]);
        let mut first = TestEnvironment::new("py311", vec!["db".into()]);
        let second = EnvId::from("py312");

        orchestrator.bring_up(&mut first).unwrap();

        assert!(orchestrator.tear_down(&second).stopped.is_empty());
        assert_eq!(orchestrator.running().names(&first.id), vec!["db"]);
    }
}
