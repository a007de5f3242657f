use crate::domain::{ContainerSpec, RunningContainer, TestEnvironment};
use std::collections::BTreeMap;

/// Upper-cases `name` and replaces anything that is not `[A-Z0-9]` with `_`.
pub fn escape_env_var(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// Variables describing how the test process reaches `container`.
///
/// - `<NAME>_HOST` (or the spec's `host_var`): address of the published ports
/// - `<NAME>_<PORT>_<PROTO>_PORT` (or the port's own variable): host port
/// - `<NAME>_PORT`: host port of the first exposed port
///
/// Ports the engine did not publish are left out.
pub fn container_env_vars(
    spec: &ContainerSpec,
    container: &RunningContainer,
) -> BTreeMap<String, String> {
    let prefix = escape_env_var(&spec.name);
    let mut vars = BTreeMap::new();

    let host_var = spec
        .host_var
        .clone()
        .unwrap_or_else(|| format!("{prefix}_HOST"));
    vars.insert(host_var, container.host.clone());

    for port in &spec.ports {
        let Some(host_port) = container.host_port(port.port, port.protocol) else {
            continue;
        };
        let var = port.var.clone().unwrap_or_else(|| {
            escape_env_var(&format!("{}_{}_{}_port", spec.name, port.port, port.protocol))
        });
        vars.insert(var, host_port.to_string());
    }

    if let Some(first) = spec.ports.first() {
        if let Some(host_port) = container.host_port(first.port, first.protocol) {
            vars.entry(format!("{prefix}_PORT"))
                .or_insert_with(|| host_port.to_string());
        }
    }

    vars
}

/// Merges `vars` into the environment without overwriting anything already
/// set. Returns the names that were actually injected.
pub fn inject(env: &mut TestEnvironment, vars: &BTreeMap<String, String>) -> Vec<String> {
    let mut injected = Vec::new();
    for (key, value) in vars {
        if env.set_if_absent(key, value) {
            injected.push(key.clone());
        }
    }
    injected
}
