//! Environment and session information.

use std::env;
use std::path::PathBuf;

use super::RealRuntime;

impl RealRuntime {
    #[tracing::instrument(skip(self))]
    pub(crate) fn env_var_impl(&self, key: &str) -> Result<String, env::VarError> {
        env::var(key)
    }

    #[tracing::instrument(skip(self))]
    pub(crate) fn home_dir_impl(&self) -> Option<PathBuf> {
        dirs::home_dir()
    }

    #[tracing::instrument(skip(self))]
    pub(crate) fn session_id_impl(&self) -> Option<String> {
        #[cfg(unix)]
        return nix::unistd::getsid(None)
            .ok()
            .map(|sid| sid.as_raw().to_string());

        #[cfg(not(unix))]
        return None;
    }
}
