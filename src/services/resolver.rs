use crate::domain::{ConfigError, ContainerSpec, EnvId};
use crate::services::ContainerRegistry;
use std::collections::HashSet;
use std::sync::Arc;

/// Validates an environment's `docker` list and returns the specs in
/// declared order.
///
/// Every name must be registered, no name may repeat, and every link target
/// must be started by the same environment. Nothing here touches the engine,
/// so a bad list never leaves a partially started environment behind.
pub fn resolve_container_set(
    env: &EnvId,
    names: &[String],
    registry: &ContainerRegistry,
) -> Result<Vec<Arc<ContainerSpec>>, ConfigError> {
    let mut seen = HashSet::with_capacity(names.len());
    let mut specs = Vec::with_capacity(names.len());

    for name in names {
        let spec = registry
            .get(name)
            .ok_or_else(|| ConfigError::UnknownContainer {
                name: name.clone(),
                environment: env.to_string(),
            })?;
        if !seen.insert(name.as_str()) {
            return Err(ConfigError::DuplicateContainer {
                name: name.clone(),
                environment: env.to_string(),
            });
        }
        specs.push(Arc::clone(spec));
    }

    for spec in &specs {
        if let Some(missing) = spec.dependencies().find(|dep| !seen.contains(dep)) {
            return Err(ConfigError::DependencyOutsideEnvironment {
                container: spec.name.clone(),
                dependency: missing.to_string(),
                environment: env.to_string(),
            });
        }
    }

    Ok(specs)
}
