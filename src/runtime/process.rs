//! Executable lookup and command execution.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::process::Command;

use super::RealRuntime;

impl RealRuntime {
    #[tracing::instrument(skip(self))]
    pub(crate) fn which_all_impl(&self, binary: &str) -> Vec<PathBuf> {
        match which::which_all(binary) {
            Ok(paths) => paths.collect(),
            Err(_) => Vec::new(),
        }
    }

    #[tracing::instrument(skip(self))]
    pub(crate) fn command_output_impl(&self, program: &Path, args: &[String]) -> Result<String> {
        let output = Command::new(program)
            .args(args)
            .output()
            .with_context(|| format!("Failed to run {:?}", program))?;

        if !output.status.success() {
            anyhow::bail!("{:?} exited with {}", program, output.status);
        }

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(text)
    }
}
