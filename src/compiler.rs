//! Handing a document over to the lilypond executable.

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::debug;
use std::path::{Path, PathBuf};

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Compiler: Send + Sync {
    /// Run `binary` with the package directories on its include path.
    /// Returns the process exit code.
    async fn invoke(&self, binary: &Path, package_paths: &[PathBuf], args: &[String]) -> Result<i32>;
}

/// Spawns the toolchain as a child process with inherited stdio.
pub struct ProcessCompiler;

/// `--include=<dir>` for every package, then the caller's arguments.
pub fn command_line(package_paths: &[PathBuf], args: &[String]) -> Vec<String> {
    package_paths
        .iter()
        .map(|p| format!("--include={}", p.display()))
        .chain(args.iter().cloned())
        .collect()
}

#[async_trait]
impl Compiler for ProcessCompiler {
    #[tracing::instrument(skip(self))]
    async fn invoke(&self, binary: &Path, package_paths: &[PathBuf], args: &[String]) -> Result<i32> {
        let argv = command_line(package_paths, args);
        debug!("Running {:?} {:?}", binary, argv);

        let status = tokio::process::Command::new(binary)
            .args(&argv)
            .status()
            .await
            .with_context(|| format!("Failed to run {:?}", binary))?;

        // Killed by a signal: report the shell convention
        Ok(status.code().unwrap_or(128 + signal_of(&status)))
    }
}

#[cfg(unix)]
fn signal_of(status: &std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status.signal().unwrap_or(1)
}

#[cfg(not(unix))]
fn signal_of(_status: &std::process::ExitStatus) -> i32 {
    1
}
