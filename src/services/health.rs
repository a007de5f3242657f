use crate::domain::traits::ContainerHealthStatus;
use crate::domain::{ContainerEngine, ContainerSpec, HealthProbe, Protocol, RunningContainer};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Stand-in deadline when the policy's budget does not fit in an `Instant`.
const FAR_DEADLINE: Duration = Duration::from_secs(365 * 24 * 60 * 60);

fn deadline_from(started: Instant, budget: Duration) -> Instant {
    started
        .checked_add(budget)
        .unwrap_or_else(|| started + FAR_DEADLINE)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthOutcome {
    Healthy,
    Failed(String),
}

impl HealthOutcome {
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }
}

/// Waits for containers to become ready according to their health policy.
#[derive(Debug, Clone)]
pub struct HealthChecker {
    engine: Arc<dyn ContainerEngine>,
}

impl HealthChecker {
    pub fn new(engine: Arc<dyn ContainerEngine>) -> Self {
        Self { engine }
    }

    /// Polls until the container is healthy, its retries run out, or the
    /// policy deadline passes.
    pub fn wait_healthy(&self, spec: &ContainerSpec, container: &RunningContainer) -> HealthOutcome {
        match spec.healthcheck.probe {
            HealthProbe::Image | HealthProbe::Command(_) => self.poll_engine(spec, container),
            HealthProbe::Tcp(port) => probe_tcp(spec, container, port),
        }
    }

    fn poll_engine(&self, spec: &ContainerSpec, container: &RunningContainer) -> HealthOutcome {
        let policy = &spec.healthcheck;
        let started = Instant::now();
        let deadline = deadline_from(started, policy.deadline());
        let mut retries = policy.retries;

        loop {
            let in_start_period = started.elapsed() < policy.start_period;

            match self.engine.health_status(container) {
                Ok(ContainerHealthStatus::Healthy) => {
                    info!(container = %spec.name, "container is healthy");
                    return HealthOutcome::Healthy;
                }

                Ok(ContainerHealthStatus::NotApplicable) => {
                    debug!(container = %spec.name, "no health check applicable, proceeding");
                    return HealthOutcome::Healthy;
                }

                Ok(ContainerHealthStatus::Starting) => {
                    debug!(container = %spec.name, "container still starting");
                }

                Ok(ContainerHealthStatus::Unhealthy) => {
                    warn!(container = %spec.name, retries_left = retries, "container reported unhealthy");

                    if !in_start_period {
                        if retries == 0 {
                            return HealthOutcome::Failed(
                                "reported unhealthy after all retries".to_string(),
                            );
                        }
                        retries -= 1;
                    }
                }

                Err(e) => {
                    error!(container = %spec.name, "error checking health: {e:#}");

                    if !in_start_period {
                        if retries == 0 {
                            return HealthOutcome::Failed(format!("health probe kept failing: {e:#}"));
                        }
                        retries -= 1;
                    }
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return HealthOutcome::Failed(format!(
                    "not healthy within {}",
                    humantime::format_duration(policy.deadline())
                ));
            }
            thread::sleep(policy.interval.min(deadline - now));
        }
    }
}

fn probe_tcp(spec: &ContainerSpec, container: &RunningContainer, port: u16) -> HealthOutcome {
    let policy = &spec.healthcheck;
    let Some(host_port) = container.host_port(port, Protocol::Tcp) else {
        return HealthOutcome::Failed(format!("port {port}/tcp is not published"));
    };
    let addr = match resolve(&container.host, host_port) {
        Some(addr) => addr,
        None => {
            return HealthOutcome::Failed(format!(
                "cannot resolve {}:{host_port}",
                container.host
            ));
        }
    };

    let started = Instant::now();
    let deadline = deadline_from(started, policy.deadline());
    let mut retries = policy.retries;

    loop {
        match TcpStream::connect_timeout(&addr, policy.timeout) {
            Ok(_) => {
                info!(container = %spec.name, %addr, "port accepts connections");
                return HealthOutcome::Healthy;
            }
            Err(e) => {
                debug!(container = %spec.name, %addr, "port not ready: {e}");
                if started.elapsed() >= policy.start_period {
                    if retries == 0 {
                        return HealthOutcome::Failed(format!("{addr} refused connections: {e}"));
                    }
                    retries -= 1;
                }
            }
        }

        let now = Instant::now();
        if now >= deadline {
            return HealthOutcome::Failed(format!(
                "{addr} not reachable within {}",
                humantime::format_duration(policy.deadline())
            ));
        }
        thread::sleep(policy.interval.min(deadline - now));
    }
}

fn resolve(host: &str, port: u16) -> Option<SocketAddr> {
    (host, port).to_socket_addrs().ok()?.next()
}
