use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Image reference as `repository[:tag]` or `repository@digest`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageRef {
    pub repository: String,
    pub reference: ImageReference,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ImageReference {
    Tag(String),
    Digest(String),
}

impl ImageRef {
    /// Parses an image reference, defaulting the tag to `latest`.
    ///
    /// A `:` only counts as a tag separator after the last `/`, so
    /// `registry:5000/team/app` keeps its registry port.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }

        if let Some((repository, digest)) = raw.split_once('@') {
            if repository.is_empty() || digest.is_empty() {
                return None;
            }
            return Some(Self {
                repository: repository.to_string(),
                reference: ImageReference::Digest(digest.to_string()),
            });
        }

        let name_start = raw.rfind('/').map(|i| i + 1).unwrap_or(0);
        match raw[name_start..].rfind(':') {
            Some(offset) => {
                let split = name_start + offset;
                let (repository, tag) = (&raw[..split], &raw[split + 1..]);
                if repository.is_empty() || tag.is_empty() {
                    return None;
                }
                Some(Self {
                    repository: repository.to_string(),
                    reference: ImageReference::Tag(tag.to_string()),
                })
            }
            None => Some(Self {
                repository: raw.to_string(),
                reference: ImageReference::Tag("latest".to_string()),
            }),
        }
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.reference {
            ImageReference::Tag(tag) => write!(f, "{}:{}", self.repository, tag),
            ImageReference::Digest(digest) => write!(f, "{}@{}", self.repository, digest),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => write!(f, "tcp"),
            Self::Udp => write!(f, "udp"),
        }
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Self::Tcp),
            "udp" => Ok(Self::Udp),
            other => Err(format!("unsupported protocol '{other}'")),
        }
    }
}

/// A container port to publish, written as `[VAR=]PORT[/PROTO]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExposedPort {
    pub port: u16,
    pub protocol: Protocol,
    /// Explicit variable name for the published host port.
    pub var: Option<String>,
}

impl FromStr for ExposedPort {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (var, port_spec) = match s.split_once('=') {
            Some((var, rest)) => {
                let var = var.trim();
                if var.is_empty() {
                    return Err(format!("empty variable name in '{s}'"));
                }
                (Some(var.to_string()), rest.trim())
            }
            None => (None, s),
        };

        let (port, protocol) = match port_spec.split_once('/') {
            Some((port, proto)) => (port, proto.parse::<Protocol>()?),
            None => (port_spec, Protocol::Tcp),
        };

        let port: u16 = port
            .parse()
            .map_err(|_| format!("invalid port number '{port}'"))?;
        if port == 0 {
            return Err("port 0 cannot be exposed".to_string());
        }

        Ok(Self {
            port,
            protocol,
            var,
        })
    }
}

/// Dependency link on another container, written as `NAME[:ALIAS]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub target: String,
    pub alias: String,
}

impl FromStr for Link {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (target, alias) = match s.split_once(':') {
            Some((target, alias)) => (target.trim(), alias.trim()),
            None => (s, s),
        };
        if target.is_empty() || alias.is_empty() {
            return Err(format!("invalid link '{s}'"));
        }
        Ok(Self {
            target: target.to_string(),
            alias: alias.to_string(),
        })
    }
}

/// Bind mount `SOURCE:TARGET[:ro|rw]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub source: PathBuf,
    pub target: String,
    pub read_only: bool,
}

impl FromStr for Mount {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split(':').collect();
        let (source, target, read_only) = match parts.as_slice() {
            [source, target] => (*source, *target, false),
            [source, target, "ro"] => (*source, *target, true),
            [source, target, "rw"] => (*source, *target, false),
            [_, _, mode] => return Err(format!("unknown mount mode '{mode}'")),
            _ => return Err(format!("invalid mount '{s}', expected SOURCE:TARGET[:ro|rw]")),
        };
        if source.is_empty() || !target.starts_with('/') {
            return Err(format!("invalid mount '{s}', target must be an absolute path"));
        }
        Ok(Self {
            source: PathBuf::from(source),
            target: target.to_string(),
            read_only,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthProbe {
    /// Rely on the image's own HEALTHCHECK, if it has one.
    Image,
    /// Health command installed on the container at creation.
    Command(String),
    /// Host-side TCP connect to the published port of this container port.
    Tcp(u16),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthCheckPolicy {
    pub probe: HealthProbe,
    pub interval: Duration,
    pub timeout: Duration,
    pub retries: u32,
    pub start_period: Duration,
}

impl HealthCheckPolicy {
    pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);
    pub const DEFAULT_RETRIES: u32 = 30;

    /// Upper bound on the time spent waiting for this container. Saturates
    /// at `Duration::MAX` for very large retry counts or durations.
    pub fn deadline(&self) -> Duration {
        self.interval
            .saturating_add(self.timeout)
            .saturating_mul(self.retries.saturating_add(1))
            .saturating_add(self.start_period)
    }
}

impl Default for HealthCheckPolicy {
    fn default() -> Self {
        Self {
            probe: HealthProbe::Image,
            interval: Self::DEFAULT_INTERVAL,
            timeout: Self::DEFAULT_TIMEOUT,
            retries: Self::DEFAULT_RETRIES,
            start_period: Duration::ZERO,
        }
    }
}

/// Immutable declaration of one `[docker.NAME]` section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: ImageRef,
    pub ports: Vec<ExposedPort>,
    pub environment: BTreeMap<String, String>,
    pub healthcheck: HealthCheckPolicy,
    pub links: Vec<Link>,
    pub mounts: Vec<Mount>,
    pub host_var: Option<String>,
}

impl ContainerSpec {
    /// Minimal spec with defaults everywhere but the image.
    pub fn new(name: impl Into<String>, image: ImageRef) -> Self {
        Self {
            name: name.into(),
            image,
            ports: Vec::new(),
            environment: BTreeMap::new(),
            healthcheck: HealthCheckPolicy::default(),
            links: Vec::new(),
            mounts: Vec::new(),
            host_var: None,
        }
    }

    /// Names of the containers this one links to.
    pub fn dependencies(&self) -> impl Iterator<Item = &str> {
        self.links.iter().map(|link| link.target.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortBinding {
    pub container_port: u16,
    pub protocol: Protocol,
    pub host_port: u16,
}

/// Handle to a started container, as reported by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunningContainer {
    pub id: String,
    pub engine_name: String,
    /// Address published ports are reachable at from the test process.
    pub host: String,
    /// Address on the engine network, used by dependent containers.
    pub ip_address: Option<IpAddr>,
    pub ports: Vec<PortBinding>,
}

impl RunningContainer {
    pub fn host_port(&self, port: u16, protocol: Protocol) -> Option<u16> {
        self.ports
            .iter()
            .find(|b| b.container_port == port && b.protocol == protocol)
            .map(|b| b.host_port)
    }

    pub fn short_id(&self) -> &str {
        &self.id[..self.id.len().min(12)]
    }
}
