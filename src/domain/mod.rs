mod container;
mod environment;
pub mod error;
pub mod traits;

pub use container::{
    ContainerSpec, ExposedPort, HealthCheckPolicy, HealthProbe, ImageRef, ImageReference, Link,
    Mount, PortBinding, Protocol, RunningContainer,
};
pub use environment::{EnvId, TestEnvironment};
pub use error::{ConfigError, LifecycleError};
pub use traits::{ContainerEngine, ContainerHealthStatus, LinkedContainer};
