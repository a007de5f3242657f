use crate::domain::{ContainerSpec, EnvId, RunningContainer};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::warn;

#[derive(Debug, Clone)]
pub struct RunningEntry {
    pub spec: Arc<ContainerSpec>,
    pub container: RunningContainer,
}

impl RunningEntry {
    pub fn name(&self) -> &str {
        &self.spec.name
    }
}

/// Containers started for one environment, in start order.
pub type EnvContainers = Vec<RunningEntry>;

/// Process-wide map from test environment to the containers started for it.
///
/// Each environment only ever reads and writes its own entry, so environments
/// orchestrated in parallel never see each other's containers.
#[derive(Debug, Default)]
pub struct RunningRegistry {
    envs: RwLock<HashMap<EnvId, EnvContainers>>,
}

impl RunningRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `f` on the environment's container list, creating it empty on
    /// first access.
    pub fn for_environment<R>(&self, env: &EnvId, f: impl FnOnce(&mut EnvContainers) -> R) -> R {
        let mut envs = self.envs.write().unwrap_or_else(PoisonError::into_inner);
        f(envs.entry(env.clone()).or_default())
    }

    /// Records a freshly started container. A previous entry with the same
    /// name (left running by an earlier run) is replaced.
    pub fn register(&self, env: &EnvId, spec: Arc<ContainerSpec>, container: RunningContainer) {
        self.for_environment(env, |containers| {
            if let Some(pos) = containers.iter().position(|e| e.spec.name == spec.name) {
                let previous = containers.remove(pos);
                warn!(
                    env = %env,
                    container = %spec.name,
                    previous = %previous.container.short_id(),
                    "replacing previously registered container"
                );
            }
            containers.push(RunningEntry { spec, container });
        });
    }

    pub fn get(&self, env: &EnvId, name: &str) -> Option<RunningContainer> {
        let envs = self.envs.read().unwrap_or_else(PoisonError::into_inner);
        envs.get(env)?
            .iter()
            .find(|e| e.name() == name)
            .map(|e| e.container.clone())
    }

    pub fn remove(&self, env: &EnvId, name: &str) -> Option<RunningEntry> {
        self.for_environment(env, |containers| {
            let pos = containers.iter().position(|e| e.name() == name)?;
            Some(containers.remove(pos))
        })
    }

    /// Snapshot of the environment's containers in start order.
    pub fn all(&self, env: &EnvId) -> Vec<RunningEntry> {
        let envs = self.envs.read().unwrap_or_else(PoisonError::into_inner);
        envs.get(env).cloned().unwrap_or_default()
    }

    pub fn names(&self, env: &EnvId) -> Vec<String> {
        self.all(env)
            .iter()
            .map(|e| e.name().to_string())
            .collect()
    }

    pub fn is_empty(&self, env: &EnvId) -> bool {
        let envs = self.envs.read().unwrap_or_else(PoisonError::into_inner);
        envs.get(env).is_none_or(|containers| containers.is_empty())
    }
}
