pub mod config;
pub mod descriptor;
pub mod error;
pub mod proxy;
pub mod supervisor;

pub use config::{Config, Mode};
pub use descriptor::DescriptorBuilder;
pub use error::RelayError;
pub use proxy::{
    BackendLink, LocalHandlers, Listener, ListenerConfig, ListenerStats, RelayConfig, RelayEngine,
    StaticBackend,
};
pub use supervisor::{
    BackendCommand, BackendState, BackoffPolicy, ManagedBackend, RestartPolicy, Supervisor,
    SupervisorHandle,
};
