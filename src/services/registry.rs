use crate::domain::{ConfigError, ContainerSpec};
use crate::infra::config::{self, ConfigDocument};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info};

/// Every declared container spec, keyed by name. Built once per run and
/// read-only afterwards.
#[derive(Debug, Default, Clone)]
pub struct ContainerRegistry {
    specs: BTreeMap<String, Arc<ContainerSpec>>,
}

impl ContainerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Discovers and parses every `[docker.NAME]` section of `document`.
    pub fn from_document(document: &ConfigDocument) -> Result<Self, ConfigError> {
        let names = config::discover(document)?;
        Self::from_names(document, &names)
    }

    /// Parses the already-discovered `names`.
    pub fn from_names(
        document: &ConfigDocument,
        names: &BTreeSet<String>,
    ) -> Result<Self, ConfigError> {
        let mut registry = Self::new();
        for name in names {
            let spec = config::parse(document, name, names)?;
            debug!(container = %name, image = %spec.image, "registered container spec");
            registry.insert(spec);
        }
        info!(count = registry.len(), "loaded container specs");
        Ok(registry)
    }

    pub fn insert(&mut self, spec: ContainerSpec) {
        self.specs.insert(spec.name.clone(), Arc::new(spec));
    }

    pub fn get(&self, name: &str) -> Option<&Arc<ContainerSpec>> {
        self.specs.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.specs.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.specs.keys().map(String::as_str)
    }

    pub fn specs(&self) -> impl Iterator<Item = &Arc<ContainerSpec>> {
        self.specs.values()
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}

/// Checks `--docker-dont-stop` values against the declared container names.
pub fn validate_exclusions(
    known_names: &BTreeSet<String>,
    requested: &[String],
) -> Result<BTreeSet<String>, ConfigError> {
    requested
        .iter()
        .map(|name| {
            if known_names.contains(name) {
                Ok(name.clone())
            } else {
                Err(ConfigError::UnknownExclusion { name: name.clone() })
            }
        })
        .collect()
}
