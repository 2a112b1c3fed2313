//! Private scratch directories under `<home>/staging`.
//!
//! Each area is `staging/<uuid>/` paired with an owner lock `staging/<uuid>.lock`
//! held for the lifetime of the [`StagingArea`]. Dropping the area removes
//! both. An area whose lock can be taken belongs to a dead process and is
//! swept by recovery.

use anyhow::{Context, Result};
use log::{debug, warn};
use std::fs;
use std::path::{Path, PathBuf};

use crate::lock::{self, LockGuard};
use crate::runtime::Runtime;

const LOCK_SUFFIX: &str = ".lock";

pub struct StagingArea {
    dir: PathBuf,
    lock_path: PathBuf,
    _owner: LockGuard,
}

impl StagingArea {
    #[tracing::instrument(skip(runtime))]
    pub fn create<R: Runtime>(runtime: &R, staging_root: &Path) -> Result<Self> {
        let name = uuid::Uuid::new_v4().to_string();
        let dir = staging_root.join(&name);
        let lock_path = staging_root.join(format!("{}{}", name, LOCK_SUFFIX));

        let owner = lock::try_exclusive(&lock_path)?
            .with_context(|| format!("Staging lock {:?} is already held", lock_path))?;
        runtime
            .create_dir_all(&dir)
            .with_context(|| format!("Failed to create staging directory {:?}", dir))?;
        debug!("Created staging area {:?}", dir);

        Ok(Self {
            dir,
            lock_path,
            _owner: owner,
        })
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Where an unpacked or evicted tree lives inside the area.
    pub fn tree(&self) -> PathBuf {
        self.dir.join("tree")
    }
}

impl Drop for StagingArea {
    fn drop(&mut self) {
        if self.dir.exists()
            && let Err(e) = fs::remove_dir_all(&self.dir)
        {
            warn!("Failed to remove staging directory {:?}: {}", self.dir, e);
            return;
        }
        let _ = fs::remove_file(&self.lock_path);
        debug!("Removed staging area {:?}", self.dir);
    }
}

/// Remove staging areas left behind by processes that are gone.
///
/// Returns the number of areas removed.
#[tracing::instrument(skip(runtime))]
pub fn sweep<R: Runtime>(runtime: &R, staging_root: &Path) -> Result<usize> {
    if !runtime.is_dir(staging_root) {
        return Ok(0);
    }

    let mut removed = 0;
    for path in runtime.read_dir(staging_root)? {
        let Some(name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            continue;
        };
        if name.ends_with(LOCK_SUFFIX) {
            continue;
        }

        let lock_path = staging_root.join(format!("{}{}", name, LOCK_SUFFIX));
        let Some(_guard) = lock::try_exclusive(&lock_path)? else {
            debug!("Staging area {:?} is in use", path);
            continue;
        };

        debug!("Sweeping stale staging area {:?}", path);
        if runtime.is_dir(&path) {
            runtime.remove_dir_all(&path)?;
        } else {
            runtime.remove_file(&path)?;
        }
        let _ = runtime.remove_file(&lock_path);
        removed += 1;
    }

    // Lock files whose area is already gone
    for path in runtime.read_dir(staging_root)? {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if let Some(stem) = name.strip_suffix(LOCK_SUFFIX)
            && !runtime.exists(&staging_root.join(stem))
            && let Some(_guard) = lock::try_exclusive(&path)?
        {
            let _ = runtime.remove_file(&path);
        }
    }

    Ok(removed)
}
