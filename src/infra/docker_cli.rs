use crate::domain::traits::ContainerHealthStatus;
use crate::domain::{
    ContainerEngine, ContainerSpec, EnvId, HealthProbe, ImageRef, LinkedContainer, PortBinding,
    Protocol, RunningContainer,
};
use crate::infra::config::{DEFAULT_ENGINE_HOST, EngineSettings};
use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::collections::HashMap;
use std::ffi::OsStr;
use std::net::IpAddr;
use std::process::{Command, Output, Stdio};
use std::time::Duration;
use tracing::{debug, info, warn};

pub const LABEL_ENV: &str = "testdock.env";
pub const LABEL_CONTAINER: &str = "testdock.container";

/// Container engine driven through the `docker` (or compatible `podman`) CLI.
#[derive(Debug, Clone)]
pub struct DockerCli {
    program: String,
    host: String,
}

impl DockerCli {
    pub fn new(program: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            host: host.into(),
        }
    }

    pub fn from_settings(settings: &EngineSettings) -> Self {
        let host = settings.host.clone().unwrap_or_else(|| {
            docker_host_address(std::env::var("DOCKER_HOST").ok().as_deref())
        });
        Self::new(settings.program(), host)
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    fn output<I, S>(&self, args: I, context: &str) -> Result<Output>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .with_context(|| format!("{context} (running {})", self.program))
    }

    /// Runs the engine and returns its trimmed stdout, failing on non-zero exit.
    fn run_engine<I, S>(&self, args: I, context: &str) -> Result<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let output = self.output(args, context)?;
        if !output.status.success() {
            bail!(
                "{} returned {} ({context}): {}",
                self.program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn image_exists(&self, image: &str) -> Result<bool> {
        Ok(self
            .output(["image", "inspect", image], &format!("inspecting image {image}"))?
            .status
            .success())
    }

    fn inspect_network(&self, id: &str) -> Result<(Option<IpAddr>, Vec<PortBinding>)> {
        let json = self.run_engine(
            ["inspect", "--format", "{{json .NetworkSettings}}", id],
            &format!("inspecting container {id}"),
        )?;
        parse_network_settings(&json)
    }
}

impl ContainerEngine for DockerCli {
    fn pull_image(&self, image: &ImageRef) -> Result<()> {
        let image = image.to_string();
        if self.image_exists(&image)? {
            debug!(%image, "image already present, skipping pull");
            return Ok(());
        }

        info!(%image, "pulling image");
        self.run_engine(["pull", image.as_str()], &format!("pulling {image}"))?;
        Ok(())
    }

    fn run_container(
        &self,
        spec: &ContainerSpec,
        env: &EnvId,
        links: &[LinkedContainer<'_>],
    ) -> Result<RunningContainer> {
        let engine_name = engine_container_name(env, &spec.name);
        let args = run_args(spec, env, &engine_name, links);

        let id = self.run_engine(&args, &format!("starting container {}", spec.name))?;
        if id.is_empty() {
            bail!("{} run printed no container id for {}", self.program, spec.name);
        }

        let (ip_address, ports) = match self.inspect_network(&id) {
            Ok(network) => network,
            Err(e) => {
                warn!(container = %spec.name, "inspect failed, removing container");
                if let Err(rm) = self.run_engine(["rm", "-f", "-v", id.as_str()], "removing container")
                {
                    warn!(
                        container = %spec.name,
                        id = %id,
                        "failed to remove container, it may be left behind: {rm:#}"
                    );
                }
                return Err(e);
            }
        };

        Ok(RunningContainer {
            id,
            engine_name,
            host: self.host.clone(),
            ip_address,
            ports,
        })
    }

    fn health_status(&self, container: &RunningContainer) -> Result<ContainerHealthStatus> {
        let status = self.run_engine(
            [
                "inspect",
                "--format",
                "{{if .State.Health}}{{.State.Health.Status}}{{else}}none{{end}}",
                container.id.as_str(),
            ],
            &format!("checking health of {}", container.engine_name),
        )?;
        parse_health_status(&status)
    }

    fn stop_container(&self, container: &RunningContainer) -> Result<()> {
        self.run_engine(
            ["rm", "-f", "-v", container.id.as_str()],
            &format!("removing container {}", container.engine_name),
        )?;
        Ok(())
    }
}

/// Unique engine-side name: `testdock-<env>-<name>-<8 hex>`.
pub fn engine_container_name(env: &EnvId, name: &str) -> String {
    let env: String = env
        .as_str()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect();
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("testdock-{env}-{name}-{}", &suffix[..8])
}

/// Arguments for `<engine> run` starting `spec` detached.
pub fn run_args(
    spec: &ContainerSpec,
    env: &EnvId,
    engine_name: &str,
    links: &[LinkedContainer<'_>],
) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "run".into(),
        "-d".into(),
        "--name".into(),
        engine_name.into(),
        "--label".into(),
        format!("{LABEL_ENV}={env}"),
        "--label".into(),
        format!("{LABEL_CONTAINER}={}", spec.name),
    ];

    for (key, value) in &spec.environment {
        args.push("-e".into());
        args.push(format!("{key}={value}"));
    }

    for port in &spec.ports {
        args.push("-p".into());
        args.push(format!("{}/{}", port.port, port.protocol));
    }

    let policy = &spec.healthcheck;
    if let HealthProbe::Command(cmd) = &policy.probe {
        args.push("--health-cmd".into());
        args.push(cmd.clone());
        args.push("--health-interval".into());
        args.push(go_duration(policy.interval));
        args.push("--health-timeout".into());
        args.push(go_duration(policy.timeout));
        args.push("--health-retries".into());
        args.push(policy.retries.max(1).to_string());
        if !policy.start_period.is_zero() {
            args.push("--health-start-period".into());
            args.push(go_duration(policy.start_period));
        }
    }

    for mount in &spec.mounts {
        args.push("-v".into());
        let mode = if mount.read_only { ":ro" } else { "" };
        args.push(format!(
            "{}:{}{mode}",
            mount.source.display(),
            mount.target
        ));
    }

    for link in links {
        match link.container.ip_address {
            Some(ip) => {
                args.push("--add-host".into());
                args.push(format!("{}:{ip}", link.alias));
            }
            None => {
                args.push("--link".into());
                args.push(format!("{}:{}", link.container.engine_name, link.alias));
            }
        }
    }

    args.push(spec.image.to_string());
    args
}

/// Durations in a form the engine's Go duration parser accepts.
fn go_duration(duration: Duration) -> String {
    format!("{}ms", duration.as_millis())
}

/// Address published ports are reachable at, derived from `DOCKER_HOST`.
pub fn docker_host_address(docker_host: Option<&str>) -> String {
    docker_host
        .and_then(|url| url.strip_prefix("tcp://"))
        .and_then(|rest| {
            let authority = rest.split('/').next().unwrap_or(rest);
            let host = match authority.rsplit_once(':') {
                Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host,
                _ => authority,
            };
            let host = host.trim_start_matches('[').trim_end_matches(']');
            (!host.is_empty()).then(|| host.to_string())
        })
        .unwrap_or_else(|| DEFAULT_ENGINE_HOST.to_string())
}

pub fn parse_health_status(raw: &str) -> Result<ContainerHealthStatus> {
    Ok(match raw.trim() {
        "healthy" => ContainerHealthStatus::Healthy,
        "unhealthy" => ContainerHealthStatus::Unhealthy,
        "starting" => ContainerHealthStatus::Starting,
        "none" | "" => ContainerHealthStatus::NotApplicable,
        other => bail!("unknown health status '{other}'"),
    })
}

#[derive(Deserialize, Debug, Default)]
struct NetworkSettings {
    #[serde(rename = "Ports", default)]
    ports: Option<HashMap<String, Option<Vec<HostBinding>>>>,
    #[serde(rename = "IPAddress", default)]
    ip_address: Option<String>,
    #[serde(rename = "Networks", default)]
    networks: Option<HashMap<String, NetworkEndpoint>>,
}

#[derive(Deserialize, Debug)]
struct HostBinding {
    #[serde(rename = "HostPort")]
    host_port: String,
}

#[derive(Deserialize, Debug)]
struct NetworkEndpoint {
    #[serde(rename = "IPAddress", default)]
    ip_address: Option<String>,
}

/// Reads the container address and published ports from
/// `inspect --format '{{json .NetworkSettings}}'`.
pub fn parse_network_settings(json: &str) -> Result<(Option<IpAddr>, Vec<PortBinding>)> {
    let settings: NetworkSettings =
        serde_json::from_str(json).context("decoding container network settings")?;

    let ip_address = settings
        .ip_address
        .iter()
        .chain(
            settings
                .networks
                .iter()
                .flat_map(|networks| networks.values())
                .filter_map(|endpoint| endpoint.ip_address.as_ref()),
        )
        .find_map(|ip| ip.parse::<IpAddr>().ok());

    let mut ports = Vec::new();
    for (key, bindings) in settings.ports.unwrap_or_default() {
        let Some(binding) = bindings.and_then(|b| b.into_iter().next()) else {
            continue;
        };
        let (port, protocol) = match key.split_once('/') {
            Some((port, proto)) => (port, proto),
            None => (key.as_str(), "tcp"),
        };
        let container_port: u16 = port
            .parse()
            .with_context(|| format!("invalid container port '{key}'"))?;
        let protocol: Protocol = protocol.parse().map_err(anyhow::Error::msg)?;
        let host_port: u16 = binding
            .host_port
            .parse()
            .with_context(|| format!("invalid host port for '{key}'"))?;
        ports.push(PortBinding {
            container_port,
            protocol,
            host_port,
        });
    }
    ports.sort_by_key(|b| (b.container_port, b.protocol));

    Ok((ip_address, ports))
}
