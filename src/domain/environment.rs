use std::collections::BTreeMap;
use std::fmt;

/// Identity of one test environment; keys all per-environment state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EnvId(String);

impl EnvId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EnvId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EnvId {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// The core's view of a host test environment: which containers it wants and
/// the variables its test process will see.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestEnvironment {
    pub id: EnvId,
    /// Container names from the environment's `docker` attribute, in order.
    pub docker: Vec<String>,
    pub setenv: BTreeMap<String, String>,
}

impl TestEnvironment {
    pub fn new(id: impl Into<EnvId>, docker: Vec<String>) -> Self {
        Self {
            id: id.into(),
            docker,
            setenv: BTreeMap::new(),
        }
    }

    pub fn with_setenv(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.setenv.insert(key.into(), value.into());
        self
    }

    /// Sets `key` only when nothing set it before. Returns whether it was set.
    pub fn set_if_absent(&mut self, key: &str, value: &str) -> bool {
        if self.setenv.contains_key(key) {
            return false;
        }
        self.setenv.insert(key.to_string(), value.to_string());
        true
    }
}
