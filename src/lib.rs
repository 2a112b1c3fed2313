pub mod activation;
pub mod compiler;
pub mod config;
pub mod engine;
pub mod error;
pub mod install;
pub mod lock;
pub mod matcher;
pub mod model;
pub mod registry;
pub mod remote;
pub mod resolver;
pub mod runtime;
pub mod system;

pub use config::Config;
pub use engine::{Engine, RecoveryReport, SearchEntry, UseOptions};
pub use error::{LypError, Result};
pub use install::InstallOptions;
pub use model::{Entity, EntityId, Kind, ListEntry, Target, VersionRecord, VersionSpec};
