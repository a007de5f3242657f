use crate::domain::traits::ContainerHealthStatus;
use crate::domain::{
    ContainerEngine, ContainerSpec, EnvId, ImageRef, LinkedContainer, PortBinding,
    RunningContainer,
};
use anyhow::{Result, bail};
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::RwLock;

#[derive(Debug, Clone)]
pub struct MockContainer {
    pub env: EnvId,
    pub running: RunningContainer,
    pub links: Vec<(String, String)>,
    pub stopped: bool,
}

/// In-memory engine that records every call as `op:subject`.
#[derive(Debug)]
pub struct MockEngine {
    containers: RwLock<HashMap<String, MockContainer>>,
    commands: RwLock<Vec<String>>,
    fail_on: RwLock<HashSet<String>>,
    health: RwLock<HashMap<String, VecDeque<ContainerHealthStatus>>>,
    next_id: RwLock<u16>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self {
            containers: RwLock::new(HashMap::new()),
            commands: RwLock::new(Vec::new()),
            fail_on: RwLock::new(HashSet::new()),
            health: RwLock::new(HashMap::new()),
            next_id: RwLock::new(0),
        }
    }

    /// Fails every call matching `operation`: either a whole op (`"run"`) or
    /// one op/subject pair (`"run:web"`).
    pub fn set_fail_on(&self, operation: &str) {
        self.fail_on.write().unwrap().insert(operation.to_string());
    }

    pub fn set_health_status(&self, name: &str, status: ContainerHealthStatus) {
        self.set_health_sequence(name, vec![status]);
    }

    /// Statuses reported one per probe; the last one repeats.
    pub fn set_health_sequence(&self, name: &str, statuses: Vec<ContainerHealthStatus>) {
        self.health
            .write()
            .unwrap()
            .insert(name.to_string(), statuses.into());
    }

    pub fn get_commands(&self) -> Vec<String> {
        self.commands.read().unwrap().clone()
    }

    pub fn count_commands(&self, command: &str) -> usize {
        self.commands
            .read()
            .unwrap()
            .iter()
            .filter(|c| *c == command)
            .count()
    }

    /// Position of `command` in the call log.
    pub fn position(&self, command: &str) -> Option<usize> {
        self.commands.read().unwrap().iter().position(|c| c == command)
    }

    pub fn container(&self, name: &str) -> Option<MockContainer> {
        self.containers.read().unwrap().get(name).cloned()
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.container(name).is_some_and(|c| !c.stopped)
    }

    fn record_command(&self, cmd: &str) {
        self.commands.write().unwrap().push(cmd.to_string());
    }

    fn check_fail(&self, operation: &str, subject: &str) -> Result<()> {
        let fail_on = self.fail_on.read().unwrap();
        if fail_on.contains(operation) || fail_on.contains(&format!("{operation}:{subject}")) {
            bail!("Mock failure on: {}:{}", operation, subject);
        }
        Ok(())
    }
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ContainerEngine for MockEngine {
    fn pull_image(&self, image: &ImageRef) -> Result<()> {
        let image = image.to_string();
        self.record_command(&format!("pull:{}", image));
        self.check_fail("pull", &image)
    }

    fn run_container(
        &self,
        spec: &ContainerSpec,
        env: &EnvId,
        links: &[LinkedContainer<'_>],
    ) -> Result<RunningContainer> {
        self.record_command(&format!("run:{}", spec.name));
        self.check_fail("run", &spec.name)?;

        let n = {
            let mut next = self.next_id.write().unwrap();
            *next += 1;
            *next
        };
        let running = RunningContainer {
            id: format!("{:012x}{}", n, spec.name),
            engine_name: format!("testdock-{}-{}", env, spec.name),
            host: "127.0.0.1".to_string(),
            ip_address: Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, n as u8))),
            ports: spec
                .ports
                .iter()
                .enumerate()
                .map(|(i, p)| PortBinding {
                    container_port: p.port,
                    protocol: p.protocol,
                    host_port: 40000 + n * 10 + i as u16,
                })
                .collect(),
        };

        self.containers.write().unwrap().insert(
            spec.name.clone(),
            MockContainer {
                env: env.clone(),
                running: running.clone(),
                links: links
                    .iter()
                    .map(|l| (l.alias.to_string(), l.container.id.clone()))
                    .collect(),
                stopped: false,
            },
        );
        Ok(running)
    }

    fn health_status(&self, container: &RunningContainer) -> Result<ContainerHealthStatus> {
        let name = self.name_of(container);
        self.record_command(&format!("health:{}", name));
        self.check_fail("health", &name)?;

        let mut health = self.health.write().unwrap();
        let status = match health.get_mut(&name) {
            Some(queue) if queue.len() > 1 => queue.pop_front(),
            Some(queue) => queue.front().cloned(),
            None => None,
        };
        Ok(status.unwrap_or(ContainerHealthStatus::NotApplicable))
    }

    fn stop_container(&self, container: &RunningContainer) -> Result<()> {
        let name = self.name_of(container);
        self.record_command(&format!("stop:{}", name));
        self.check_fail("stop", &name)?;

        if let Some(c) = self.containers.write().unwrap().get_mut(&name) {
            c.stopped = true;
        }
        Ok(())
    }
}

impl MockEngine {
    fn name_of(&self, container: &RunningContainer) -> String {
        self.containers
            .read()
            .unwrap()
            .iter()
            .find(|(_, c)| c.running.id == container.id)
            .map(|(name, _)| name.clone())
            .unwrap_or_else(|| container.id.clone())
    }
}
