use crate::domain::EnvId;
use crate::infra::config::{self, ConfigDocument};
use crate::services::ContainerRegistry;
use crate::services::graph::start_order;
use crate::services::resolver::resolve_container_set;
use anyhow::{Context, Result};

/// Resolves one environment's container list and orders it for start,
/// without touching the engine.
pub fn start_order_for(
    env: &EnvId,
    containers: &[String],
    registry: &ContainerRegistry,
) -> Result<Vec<String>> {
    let specs = resolve_container_set(env, containers, registry)
        .with_context(|| format!("environment '{env}'"))?;
    let order = start_order(&specs).with_context(|| format!("environment '{env}'"))?;
    Ok(order.iter().map(|spec| spec.name.clone()).collect())
}

/// Validates every environment against the declared containers and returns
/// one `env: a -> b -> c` line per environment, in start order.
pub fn check(document: &ConfigDocument) -> Result<Vec<String>> {
    let registry = ContainerRegistry::from_document(document)?;
    let sections = config::environment_sections(document)?;

    let mut lines = Vec::with_capacity(sections.len());
    for (name, section) in &sections {
        let containers = match section.as_table() {
            Some(table) => config::environment_containers(name, table)?,
            None => anyhow::bail!("[env.{name}] must be a table"),
        };
        let order = start_order_for(&EnvId::new(name.as_str()), &containers, &registry)?;

        if order.is_empty() {
            lines.push(format!("{name}: (no containers)"));
        } else {
            lines.push(format!("{name}: {}", order.join(" -> ")));
        }
    }
    Ok(lines)
}

/// One line per declared container: name, image and exposed ports.
pub fn list(document: &ConfigDocument) -> Result<Vec<String>> {
    let registry = ContainerRegistry::from_document(document)?;

    Ok(registry
        .specs()
        .map(|spec| {
            let ports: Vec<String> = spec
                .ports
                .iter()
                .map(|p| format!("{}/{}", p.port, p.protocol))
                .collect();
            if ports.is_empty() {
                format!("{:<16} {}", spec.name, spec.image)
            } else {
                format!("{:<16} {} [{}]", spec.name, spec.image, ports.join(", "))
            }
        })
        .collect())
}
