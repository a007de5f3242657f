use crate::domain::{
    ConfigError, ContainerSpec, ExposedPort, HealthCheckPolicy, HealthProbe, ImageRef, Link,
    Mount,
};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use toml::{Table, Value};
use tracing::debug;

/// Parsed configuration file, kept as a raw table so sections can be
/// discovered before they are parsed.
pub type ConfigDocument = Table;

pub const DEFAULT_CONFIG_NAME: &str = "testdock.toml";
pub const DEFAULT_ENGINE_PROGRAM: &str = "docker";
pub const DEFAULT_ENGINE_HOST: &str = "127.0.0.1";

const DOCKER_SECTION: &str = "docker";
const ENV_SECTION: &str = "env";

pub fn load_document(path: &Path) -> Result<ConfigDocument, ConfigError> {
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_document(&content, &path.display().to_string())
}

pub fn parse_document(content: &str, origin: &str) -> Result<ConfigDocument, ConfigError> {
    toml::from_str(content).map_err(|source| ConfigError::Parse {
        origin: origin.to_string(),
        source,
    })
}

/// Engine selection from the optional `[engine]` section.
#[derive(Deserialize, Debug, Default, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct EngineSettings {
    pub program: Option<String>,
    pub host: Option<String>,
}

impl EngineSettings {
    pub fn from_document(document: &ConfigDocument) -> Result<Self, ConfigError> {
        section(document, "engine")
    }

    pub fn program(&self) -> &str {
        self.program.as_deref().unwrap_or(DEFAULT_ENGINE_PROGRAM)
    }
}

/// Host runner settings from the optional `[runner]` section.
#[derive(Deserialize, Debug, Default, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RunnerSettings {
    #[serde(default)]
    pub envlist: Vec<String>,
}

impl RunnerSettings {
    pub fn from_document(document: &ConfigDocument) -> Result<Self, ConfigError> {
        section(document, "runner")
    }
}

fn section<T>(document: &ConfigDocument, name: &str) -> Result<T, ConfigError>
where
    T: Default + for<'de> Deserialize<'de>,
{
    match document.get(name) {
        Some(value) => value
            .clone()
            .try_into()
            .map_err(|e| ConfigError::InvalidSection {
                section: name.to_string(),
                message: e.to_string(),
            }),
        None => Ok(T::default()),
    }
}

/// Enumerates every container declared as `[docker.NAME]`.
pub fn discover(document: &ConfigDocument) -> Result<BTreeSet<String>, ConfigError> {
    let Some(value) = document.get(DOCKER_SECTION) else {
        return Ok(BTreeSet::new());
    };
    let table = value.as_table().ok_or_else(|| ConfigError::InvalidSection {
        section: DOCKER_SECTION.to_string(),
        message: "expected one table per container".to_string(),
    })?;

    let names: BTreeSet<String> = table.keys().cloned().collect();
    debug!(count = names.len(), "discovered container sections");
    Ok(names)
}

/// Raw `[docker.NAME]` section as written by the user.
#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields)]
struct ContainerSection {
    image: Option<String>,
    #[serde(default)]
    environment: EnvironmentList,
    #[serde(default, alias = "expose")]
    ports: Vec<String>,
    host_var: Option<String>,
    #[serde(default)]
    links: Vec<String>,
    #[serde(default)]
    volumes: Vec<String>,
    healthcheck: Option<HealthCheckSection>,
}

/// Container environment as a table or as a list of `KEY=VALUE` strings.
#[derive(Deserialize, Debug)]
#[serde(untagged)]
enum EnvironmentList {
    Map(BTreeMap<String, String>),
    List(Vec<String>),
}

impl Default for EnvironmentList {
    fn default() -> Self {
        Self::Map(BTreeMap::new())
    }
}

#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields)]
struct HealthCheckSection {
    cmd: Option<String>,
    tcp_port: Option<u16>,
    interval: Option<String>,
    timeout: Option<String>,
    retries: Option<u32>,
    start_period: Option<String>,
}

/// Builds the spec for `name`, resolving its links against `known_names`.
pub fn parse(
    document: &ConfigDocument,
    name: &str,
    known_names: &BTreeSet<String>,
) -> Result<ContainerSpec, ConfigError> {
    validate_name(name)?;

    let raw = document
        .get(DOCKER_SECTION)
        .and_then(Value::as_table)
        .and_then(|table| table.get(name))
        .ok_or_else(|| ConfigError::InvalidSection {
            section: format!("{DOCKER_SECTION}.{name}"),
            message: "section not found".to_string(),
        })?;

    let section: ContainerSection =
        raw.clone()
            .try_into()
            .map_err(|e| ConfigError::InvalidSection {
                section: format!("{DOCKER_SECTION}.{name}"),
                message: e.to_string(),
            })?;

    let image = section
        .image
        .as_deref()
        .filter(|image| !image.trim().is_empty())
        .ok_or_else(|| ConfigError::MissingField {
            container: name.to_string(),
            field: "image",
        })?;
    let image = ImageRef::parse(image).ok_or_else(|| invalid(name, "image", image))?;

    let mut spec = ContainerSpec::new(name, image);
    spec.environment = parse_environment(name, section.environment)?;
    spec.ports = parse_ports(name, &section.ports)?;
    spec.host_var = section.host_var.filter(|v| !v.trim().is_empty());
    spec.links = parse_links(name, &section.links, known_names)?;
    spec.mounts = parse_mounts(name, &section.volumes)?;
    spec.healthcheck = parse_healthcheck(name, section.healthcheck.unwrap_or_default())?;

    Ok(spec)
}

/// Container names are used in engine names and variable prefixes.
fn validate_name(name: &str) -> Result<(), ConfigError> {
    let Some(first) = name.chars().next() else {
        return Err(invalid(name, "name", "empty container name"));
    };
    if !first.is_ascii_alphanumeric() {
        return Err(invalid(name, "name", "must start with a letter or digit"));
    }
    if let Some(c) = name
        .chars()
        .find(|c| !c.is_ascii_alphanumeric() && !matches!(c, '_' | '.' | '-'))
    {
        return Err(ConfigError::InvalidValue {
            container: name.to_string(),
            field: "name",
            reason: format!("contains invalid character '{c}'"),
        });
    }
    Ok(())
}

fn parse_environment(
    name: &str,
    environment: EnvironmentList,
) -> Result<BTreeMap<String, String>, ConfigError> {
    match environment {
        EnvironmentList::Map(map) => Ok(map),
        EnvironmentList::List(entries) => entries
            .iter()
            .map(|entry| match entry.split_once('=') {
                Some((key, value)) if !key.trim().is_empty() => {
                    Ok((key.trim().to_string(), value.to_string()))
                }
                _ => Err(invalid(name, "environment", entry)),
            })
            .collect(),
    }
}

fn parse_ports(name: &str, ports: &[String]) -> Result<Vec<ExposedPort>, ConfigError> {
    let mut seen_vars = HashSet::new();
    let mut parsed = Vec::with_capacity(ports.len());

    for raw in ports {
        let port: ExposedPort = raw.parse().map_err(|reason| ConfigError::InvalidValue {
            container: name.to_string(),
            field: "ports",
            reason,
        })?;
        if let Some(var) = &port.var {
            if !seen_vars.insert(var.clone()) {
                return Err(ConfigError::InvalidValue {
                    container: name.to_string(),
                    field: "ports",
                    reason: format!("variable '{var}' assigned to more than one port"),
                });
            }
        }
        parsed.push(port);
    }

    Ok(parsed)
}

fn parse_links(
    name: &str,
    links: &[String],
    known_names: &BTreeSet<String>,
) -> Result<Vec<Link>, ConfigError> {
    links
        .iter()
        .map(|raw| {
            let link: Link = raw.parse().map_err(|reason| ConfigError::InvalidValue {
                container: name.to_string(),
                field: "links",
                reason,
            })?;
            if !known_names.contains(&link.target) {
                return Err(ConfigError::UnknownDependency {
                    container: name.to_string(),
                    dependency: link.target,
                });
            }
            Ok(link)
        })
        .collect()
}

fn parse_mounts(name: &str, volumes: &[String]) -> Result<Vec<Mount>, ConfigError> {
    volumes
        .iter()
        .map(|raw| {
            let mut mount: Mount = raw.parse().map_err(|reason| ConfigError::InvalidValue {
                container: name.to_string(),
                field: "volumes",
                reason,
            })?;
            let source = mount.source.to_string_lossy().into_owned();
            let expanded =
                shellexpand::full(&source).map_err(|e| ConfigError::InvalidValue {
                    container: name.to_string(),
                    field: "volumes",
                    reason: e.to_string(),
                })?;
            mount.source = PathBuf::from(expanded.into_owned());
            Ok(mount)
        })
        .collect()
}

fn parse_healthcheck(
    name: &str,
    section: HealthCheckSection,
) -> Result<HealthCheckPolicy, ConfigError> {
    let probe = match (section.cmd, section.tcp_port) {
        (Some(_), Some(_)) => {
            return Err(invalid(
                name,
                "healthcheck",
                "'cmd' and 'tcp_port' are mutually exclusive",
            ));
        }
        (Some(cmd), None) if cmd.trim().is_empty() => {
            return Err(invalid(name, "healthcheck", "empty 'cmd'"));
        }
        (Some(cmd), None) => HealthProbe::Command(cmd),
        (None, Some(0)) => return Err(invalid(name, "healthcheck", "'tcp_port' cannot be 0")),
        (None, Some(port)) => HealthProbe::Tcp(port),
        (None, None) => HealthProbe::Image,
    };

    let duration = |value: Option<String>, default: Duration| match value {
        Some(raw) => humantime::parse_duration(raw.trim()).map_err(|e| ConfigError::InvalidValue {
            container: name.to_string(),
            field: "healthcheck",
            reason: format!("invalid duration '{raw}': {e}"),
        }),
        None => Ok(default),
    };

    let timeout = duration(section.timeout, HealthCheckPolicy::DEFAULT_TIMEOUT)?;
    if timeout.is_zero() {
        return Err(invalid(name, "healthcheck", "'timeout' must be greater than zero"));
    }

    Ok(HealthCheckPolicy {
        probe,
        interval: duration(section.interval, HealthCheckPolicy::DEFAULT_INTERVAL)?,
        timeout,
        retries: section.retries.unwrap_or(HealthCheckPolicy::DEFAULT_RETRIES),
        start_period: duration(section.start_period, Duration::ZERO)?,
    })
}

fn invalid(container: &str, field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        container: container.to_string(),
        field,
        reason: reason.into(),
    }
}

/// Names of the `[env.NAME]` sections, sorted by name.
pub fn environment_names(document: &ConfigDocument) -> Result<Vec<String>, ConfigError> {
    Ok(environment_sections(document)?.keys().cloned().collect())
}

pub fn environment_sections(document: &ConfigDocument) -> Result<Table, ConfigError> {
    match document.get(ENV_SECTION) {
        Some(Value::Table(table)) => Ok(table.clone()),
        Some(_) => Err(ConfigError::InvalidSection {
            section: ENV_SECTION.to_string(),
            message: "expected one table per test environment".to_string(),
        }),
        None => Ok(Table::new()),
    }
}

/// Reads the `docker` attribute of one environment section: a list of
/// container names, or a string of names separated by newlines or commas.
pub fn environment_containers(env_name: &str, section: &Table) -> Result<Vec<String>, ConfigError> {
    let invalid_attribute = || ConfigError::InvalidSection {
        section: format!("{ENV_SECTION}.{env_name}"),
        message: "'docker' must be a list of container names".to_string(),
    };

    match section.get(DOCKER_SECTION) {
        None => Ok(Vec::new()),
        Some(Value::String(lines)) => Ok(lines
            .split(['\n', ','])
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect()),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(|name| name.trim().to_string())
                    .ok_or_else(invalid_attribute)
            })
            .collect(),
        Some(_) => Err(invalid_attribute()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn document(toml: &str) -> ConfigDocument {
        parse_document(toml, "test").unwrap()
    }

    fn parse_all(doc: &ConfigDocument) -> Result<Vec<ContainerSpec>, ConfigError> {
        let names = discover(doc)?;
        names.iter().map(|name| parse(doc, name, &names)).collect()
    }

    #[test]
    fn discovers_container_sections() {
        let doc = document(
            r#"
[docker.db]
image = "postgres:16"

[docker.web]
image = "nginx"
links = ["db"]

[env.py311]
docker = ["web", "db"]
"#,
        );

        let names = discover(&doc).unwrap();
        assert_eq!(
            names.into_iter().collect::<Vec<_>>(),
            vec!["db".to_string(), "web".to_string()]
        );
    }

    #[test]
    fn discover_without_docker_section_is_empty() {
        let doc = document("[runner]\nenvlist = [\"a\"]\n");
        assert!(discover(&doc).unwrap().is_empty());
    }

    #[test]
    fn discover_rejects_non_table_docker_value() {
        let doc = document("docker = \"db\"\n");
        assert!(matches!(
            discover(&doc),
            Err(ConfigError::InvalidSection { .. })
        ));
    }

    #[test]
    fn parses_full_container_section() {
        let doc = document(
            r#"
[docker.db]
image = "postgres:16-alpine"
environment = { POSTGRES_PASSWORD = "secret" }
ports = ["5432/tcp", "PG_ALT=5433"]
host_var = "PGHOST"
volumes = ["/tmp/seed:/docker-entrypoint-initdb.d:ro"]
healthcheck = { cmd = "pg_isready", interval = "500ms", timeout = "2s", retries = 5, start_period = "1s" }

[docker.cache]
image = "redis:7"
"#,
        );
        let names = discover(&doc).unwrap();
        let spec = parse(&doc, "db", &names).unwrap();

        assert_eq!(spec.image.to_string(), "postgres:16-alpine");
        assert_eq!(spec.environment["POSTGRES_PASSWORD"], "secret");
        assert_eq!(spec.ports.len(), 2);
        assert_eq!(spec.ports[1].var.as_deref(), Some("PG_ALT"));
        assert_eq!(spec.host_var.as_deref(), Some("PGHOST"));
        assert_eq!(spec.mounts[0].target, "/docker-entrypoint-initdb.d");
        assert!(spec.mounts[0].read_only);
        assert_eq!(
            spec.healthcheck.probe,
            HealthProbe::Command("pg_isready".into())
        );
        assert_eq!(spec.healthcheck.interval, Duration::from_millis(500));
        assert_eq!(spec.healthcheck.timeout, Duration::from_secs(2));
        assert_eq!(spec.healthcheck.retries, 5);
        assert_eq!(spec.healthcheck.start_period, Duration::from_secs(1));
    }

    #[test]
    fn parses_environment_list_form() {
        let doc = document(
            r#"
[docker.db]
image = "postgres"
environment = ["POSTGRES_USER=app", "POSTGRES_DB=app=test"]
"#,
        );
        let spec = &parse_all(&doc).unwrap()[0];
        assert_eq!(spec.environment["POSTGRES_USER"], "app");
        assert_eq!(spec.environment["POSTGRES_DB"], "app=test");
    }

    #[test]
    fn parses_service_with_minimal_fields() {
        let doc = document("[docker.minimal]\nimage = \"minimal:1\"\n");
        let spec = &parse_all(&doc).unwrap()[0];

        assert_eq!(spec.name, "minimal");
        assert!(spec.ports.is_empty());
        assert!(spec.links.is_empty());
        assert_eq!(spec.healthcheck, HealthCheckPolicy::default());
    }

    #[test]
    fn rejects_missing_image() {
        let doc = document("[docker.db]\nports = [\"5432\"]\n");
        let err = parse_all(&doc).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::MissingField { ref container, field: "image" } if container == "db"
        ));
    }

    #[test]
    fn rejects_blank_image() {
        let doc = document("[docker.db]\nimage = \"  \"\n");
        assert!(matches!(
            parse_all(&doc),
            Err(ConfigError::MissingField { .. })
        ));
    }

    #[test]
    fn rejects_unknown_link() {
        let doc = document("[docker.web]\nimage = \"nginx\"\nlinks = [\"db\"]\n");
        let err = parse_all(&doc).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::UnknownDependency { ref dependency, .. } if dependency == "db"
        ));
    }

    #[test]
    fn rejects_unknown_keys() {
        let doc = document("[docker.db]\nimage = \"postgres\"\nimagee = \"typo\"\n");
        assert!(matches!(
            parse_all(&doc),
            Err(ConfigError::InvalidSection { .. })
        ));
    }

    #[test]
    fn validates_container_name() {
        let doc = document("[docker._db]\nimage = \"postgres\"\n");
        assert!(matches!(
            parse_all(&doc),
            Err(ConfigError::InvalidValue { field: "name", .. })
        ));

        let doc = document("[docker.\"db cluster\"]\nimage = \"postgres\"\n");
        assert!(parse_all(&doc).is_err());
    }

    #[test]
    fn rejects_duplicate_port_variables() {
        let doc = document(
            "[docker.db]\nimage = \"postgres\"\nports = [\"P=5432\", \"P=5433\"]\n",
        );
        assert!(matches!(
            parse_all(&doc),
            Err(ConfigError::InvalidValue { field: "ports", .. })
        ));
    }

    #[test]
    fn rejects_conflicting_health_probes() {
        let doc = document(
            "[docker.db]\nimage = \"postgres\"\nhealthcheck = { cmd = \"true\", tcp_port = 5432 }\n",
        );
        assert!(matches!(
            parse_all(&doc),
            Err(ConfigError::InvalidValue { field: "healthcheck", .. })
        ));
    }

    #[test]
    fn rejects_bad_duration() {
        let doc = document(
            "[docker.db]\nimage = \"postgres\"\nhealthcheck = { interval = \"soon\" }\n",
        );
        assert!(parse_all(&doc).is_err());
    }

    #[test]
    fn rejects_zero_timeout() {
        let doc = document(
            "[docker.db]\nimage = \"postgres\"\nhealthcheck = { tcp_port = 5432, timeout = \"0s\" }\n",
        );
        match parse_all(&doc) {
            Err(ConfigError::InvalidValue { field, reason, .. }) => {
                assert_eq!(field, "healthcheck");
                assert!(reason.contains("timeout"), "got: {reason}");
            }
            other => panic!("expected invalid timeout, got {other:?}"),
        }
    }

    #[test]
    fn accepts_maximum_retries() {
        let doc = document(
            "[docker.db]\nimage = \"postgres\"\nhealthcheck = { cmd = \"true\", retries = 4294967295 }\n",
        );
        let spec = &parse_all(&doc).unwrap()[0];

        assert_eq!(spec.healthcheck.retries, u32::MAX);
        assert!(spec.healthcheck.deadline() >= Duration::from_secs(u64::from(u32::MAX)));
    }

    #[test]
    fn expands_volume_sources() {
        let doc = document("[docker.db]\nimage = \"postgres\"\nvolumes = [\"~/seed:/seed\"]\n");
        let spec = &parse_all(&doc).unwrap()[0];
        assert!(!spec.mounts[0].source.to_string_lossy().starts_with('~'));
    }

    #[test]
    fn reads_environment_docker_attribute() {
        let doc = document(
            r#"
[env.list]
docker = ["web", "db"]

[env.lines]
docker = """
web
db, cache
"""

[env.none]
commands = ["true"]

[env.bad]
docker = 3
"#,
        );
        let sections = environment_sections(&doc).unwrap();
        let table = |name: &str| sections[name].as_table().unwrap().clone();

        assert_eq!(
            environment_containers("list", &table("list")).unwrap(),
            vec!["web", "db"]
        );
        assert_eq!(
            environment_containers("lines", &table("lines")).unwrap(),
            vec!["web", "db", "cache"]
        );
        assert!(environment_containers("none", &table("none")).unwrap().is_empty());
        assert!(environment_containers("bad", &table("bad")).is_err());
    }

    #[test]
    fn reads_engine_and_runner_settings() {
        let doc = document(
            r#"
[engine]
program = "podman"

[runner]
envlist = ["py311", "lint"]
"#,
        );
        let engine = EngineSettings::from_document(&doc).unwrap();
        assert_eq!(engine.program(), "podman");
        assert_eq!(engine.host, None);

        let runner = RunnerSettings::from_document(&doc).unwrap();
        assert_eq!(runner.envlist, vec!["py311", "lint"]);

        let defaults = EngineSettings::from_document(&document("")).unwrap();
        assert_eq!(defaults.program(), DEFAULT_ENGINE_PROGRAM);
    }

    #[test]
    fn load_document_reports_missing_file() {
        let err = load_document(Path::new("/nonexistent/testdock.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
