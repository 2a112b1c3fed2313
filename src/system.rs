//! Discovery of pre-existing lilypond installations on `PATH`.

use log::{debug, warn};
use std::path::{Path, PathBuf};

use crate::model::VersionRecord;
use crate::runtime::Runtime;

/// Pull the version out of `lilypond --version` output,
/// e.g. `GNU LilyPond 2.18.2`.
pub fn parse_version_output(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let rest = line.trim().strip_prefix("GNU LilyPond")?;
        let version = rest.split_whitespace().next()?;
        crate::model::Version::parse(version).map(|_| version.to_string())
    })
}

/// Every `lilypond` executable on `PATH` with a recognizable version.
///
/// Executables that live under `managed_root` are lyp's own and skipped.
/// When two executables report the same version the first on `PATH` wins.
#[tracing::instrument(skip(runtime))]
pub fn discover<R: Runtime>(runtime: &R, managed_root: &Path) -> Vec<VersionRecord> {
    let mut found: Vec<VersionRecord> = Vec::new();
    for binary in runtime.which_all("lilypond") {
        if binary.starts_with(managed_root) {
            continue;
        }
        let output = match runtime.command_output(&binary, &["--version".to_string()]) {
            Ok(output) => output,
            Err(e) => {
                warn!("Ignoring {:?}: {:#}", binary, e);
                continue;
            }
        };
        let Some(version) = parse_version_output(&output) else {
            warn!("Ignoring {:?}: unrecognized version output", binary);
            continue;
        };
        if found.iter().any(|v| v.version == version) {
            continue;
        }
        debug!("Found system lilypond {} at {:?}", version, binary);
        found.push(VersionRecord {
            version,
            path: binary,
            system: true,
        });
    }
    found
}
