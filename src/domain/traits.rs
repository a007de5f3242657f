use super::{ContainerSpec, EnvId, ImageRef, RunningContainer};
use anyhow::Result;
use std::fmt::Debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerHealthStatus {
    Healthy,
    Unhealthy,
    Starting,
    NotApplicable, // No healthcheck configured
}

/// An already-started container a new container links to.
#[derive(Debug, Clone, Copy)]
pub struct LinkedContainer<'a> {
    pub alias: &'a str,
    pub container: &'a RunningContainer,
}

/// Trait for container engine operations
pub trait ContainerEngine: Send + Sync + Debug {
    /// Make the image available locally
    fn pull_image(&self, image: &ImageRef) -> Result<()>;

    /// Create and start a container for `spec`, owned by environment `env`
    fn run_container(
        &self,
        spec: &ContainerSpec,
        env: &EnvId,
        links: &[LinkedContainer<'_>],
    ) -> Result<RunningContainer>;

    /// Get the engine-reported health status of a container
    fn health_status(&self, container: &RunningContainer) -> Result<ContainerHealthStatus>;

    /// Stop and remove a container
    fn stop_container(&self, container: &RunningContainer) -> Result<()>;
}
