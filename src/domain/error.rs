use std::path::PathBuf;

use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Mistakes in the configuration or command line. Always fatal and always
/// raised before any engine call.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading {}: {}", .path.display(), .source)]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("parsing {origin}: {source}")]
    Parse {
        origin: String,
        source: toml::de::Error,
    },

    #[error("invalid [{section}] section: {message}")]
    InvalidSection { section: String, message: String },

    #[error("container '{container}' is missing required field '{field}'")]
    MissingField {
        container: String,
        field: &'static str,
    },

    #[error("container '{container}' has invalid {field}: {reason}")]
    InvalidValue {
        container: String,
        field: &'static str,
        reason: String,
    },

    #[error("container '{container}' links to unknown container '{dependency}'")]
    UnknownDependency {
        container: String,
        dependency: String,
    },

    #[error(
        "container '{name}' not found: missing [docker.{name}] section (referenced by environment '{environment}')"
    )]
    UnknownContainer { name: String, environment: String },

    #[error("container '{name}' specified more than once in environment '{environment}'")]
    DuplicateContainer { name: String, environment: String },

    #[error("container '{name}' not found (from --docker-dont-stop)")]
    UnknownExclusion { name: String },

    #[error(
        "container '{container}' links to '{dependency}', which environment '{environment}' does not start"
    )]
    DependencyOutsideEnvironment {
        container: String,
        dependency: String,
        environment: String,
    },

    #[error("dependency cycle detected involving container '{container}'")]
    DependencyCycle { container: String },
}

/// Failures while bringing an environment's containers up.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("pulling image '{image}' failed")]
    Pull {
        image: String,
        #[source]
        source: BoxError,
    },

    #[error("starting container '{container}' failed")]
    Start {
        container: String,
        #[source]
        source: BoxError,
    },

    #[error("container '{container}' failed health check: {reason}")]
    HealthCheckFailed { container: String, reason: String },

    #[error("container lifecycle used before configuration")]
    NotConfigured,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_errors_name_the_offending_identifier() {
        let err = ConfigError::UnknownContainer {
            name: "ghost".into(),
            environment: "py311".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("'ghost'"), "got: {msg}");
        assert!(msg.contains("[docker.ghost]"), "got: {msg}");

        let err = ConfigError::UnknownExclusion { name: "cache".into() };
        assert!(err.to_string().contains("--docker-dont-stop"));
    }

    #[test]
    fn lifecycle_errors_keep_engine_cause() {
        let err = LifecycleError::Pull {
            image: "postgres:16".into(),
            source: anyhow::anyhow!("manifest unknown").into(),
        };
        let source = std::error::Error::source(&err).map(ToString::to_string);
        assert_eq!(source.as_deref(), Some("manifest unknown"));
    }
}
