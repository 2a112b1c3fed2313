//! Error taxonomy of the engine.
//!
//! Every operation returns a [`LypError`] that names the offending
//! identifier or specifier. Collaborators (runtime, remote index, compiler)
//! report `anyhow::Error`s, which are wrapped here at the engine boundary.

use std::path::PathBuf;

use crate::lock::LockError;
use crate::model::Kind;

pub type Result<T, E = LypError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum LypError {
    /// No installed entity with this identity
    #[error("{0} is not installed")]
    NotFound(String),

    /// The specifier matched nothing, locally or remotely
    #[error("no {kind} version matches '{spec}'")]
    NoMatch { kind: Kind, spec: String },

    /// Install target already exists
    #[error("{0} is already installed")]
    Duplicate(String),

    /// Flag uniqueness or state machine violation
    #[error("{target}: {reason}")]
    Conflict { target: String, reason: String },

    /// Attempted mutation of a system-owned entity
    #[error("{0} is a system installation and cannot be modified by lyp")]
    Permission(String),

    #[error("failed to install {target}: {source:#}")]
    Install {
        target: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to uninstall {target}: {source:#}")]
    Uninstall {
        target: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("circular package dependency: {}", chain.join(" -> "))]
    CircularDependency { chain: Vec<String> },

    /// A declared dependency could not be satisfied
    #[error("could not resolve dependency '{specifier}': {source}")]
    Resolution {
        specifier: String,
        #[source]
        source: Box<LypError>,
    },

    #[error("invalid version specifier '{0}'")]
    InvalidSpecifier(String),

    #[error("installation of {0} was cancelled")]
    Cancelled(String),

    #[error("failed to read document {path:?}: {source:#}")]
    Document {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("registry at {path:?} is unreadable: {source:#}")]
    Registry {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("remote index error: {0:#}")]
    Remote(#[source] anyhow::Error),

    #[error("failed to invoke lilypond: {0:#}")]
    Compile(#[source] anyhow::Error),

    #[error(transparent)]
    Lock(#[from] LockError),
}

impl LypError {
    pub(crate) fn conflict(target: impl Into<String>, reason: impl Into<String>) -> Self {
        LypError::Conflict {
            target: target.into(),
            reason: reason.into(),
        }
    }

    /// The innermost engine error, looking through `Resolution` wrappers.
    pub fn root_cause(&self) -> &LypError {
        match self {
            LypError::Resolution { source, .. } => source.root_cause(),
            other => other,
        }
    }
}
