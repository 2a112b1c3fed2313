//! Unpacking downloaded artifacts into a staging tree.
//!
//! Archives usually wrap their content in a single top-level directory
//! (`lilypond-2.18.2/...`); that directory becomes the tree root.

use anyhow::{Context, Result, anyhow, bail};
use flate2::read::GzDecoder;
use log::debug;
use std::io::Read;
use std::path::{Component, Path, PathBuf};

use crate::model::Kind;
use crate::runtime::Runtime;

trait Extractor {
    fn can_handle(&self, archive_path: &Path) -> bool;

    /// Unpack every entry of the archive below `dest`.
    fn extract<R: Runtime>(&self, runtime: &R, archive_path: &Path, dest: &Path) -> Result<()>;
}

struct TarGzExtractor;

impl Extractor for TarGzExtractor {
    fn can_handle(&self, archive_path: &Path) -> bool {
        let name = archive_path.to_string_lossy().to_lowercase();
        name.ends_with(".tar.gz") || name.ends_with(".tgz")
    }

    fn extract<R: Runtime>(&self, runtime: &R, archive_path: &Path, dest: &Path) -> Result<()> {
        debug!("Extracting tar.gz archive to {:?}...", dest);
        let file = runtime
            .open(archive_path)
            .with_context(|| format!("Failed to open archive at {:?}", archive_path))?;
        let mut archive = tar::Archive::new(GzDecoder::new(file));

        let root = runtime.canonicalize(dest)?;
        for entry in archive.entries().context("Failed to read tar archive")? {
            let mut entry = entry.context("Failed to read tar entry")?;
            let entry_path = entry.path().context("Invalid path in tar entry")?.into_owned();
            let Some(relative) = sanitize(&entry_path) else {
                debug!("Skipping entry with unsafe path {:?}", entry_path);
                continue;
            };
            let full_path = dest.join(&relative);
            ensure_inside(runtime, &root, &full_path)?;

            match entry.header().entry_type() {
                tar::EntryType::Directory => runtime.create_dir_all(&full_path)?,
                tar::EntryType::Regular | tar::EntryType::Continuous => {
                    if let Some(parent) = full_path.parent() {
                        runtime.create_dir_all(parent)?;
                    }
                    let mut out = runtime.create_file(&full_path)?;
                    std::io::copy(&mut entry, &mut out)
                        .with_context(|| format!("Failed to extract file {:?}", full_path))?;

                    #[cfg(unix)]
                    if let Ok(mode) = entry.header().mode()
                        && let Err(e) = runtime.set_permissions(&full_path, mode)
                    {
                        debug!("Failed to set permissions on {:?}: {}", full_path, e);
                    }
                }
                kind @ (tar::EntryType::Symlink | tar::EntryType::Link) => {
                    let target = entry
                        .link_name()
                        .with_context(|| format!("Invalid link target in {:?}", entry_path))?
                        .map(|t| t.into_owned());
                    // Symlinks resolve from their directory, hard links from the root
                    let base = match kind {
                        tar::EntryType::Symlink => relative.parent().unwrap_or(Path::new("")),
                        _ => Path::new(""),
                    };
                    if !target.as_deref().is_some_and(|t| link_stays_inside(base, t)) {
                        debug!("Skipping link {:?} pointing outside the archive", entry_path);
                        continue;
                    }
                    entry
                        .unpack_in(dest)
                        .with_context(|| format!("Failed to extract {:?}", entry_path))?;
                    // Chains of relative links can still climb out
                    if let Ok(resolved) = runtime.canonicalize(&full_path)
                        && !resolved.starts_with(&root)
                    {
                        debug!("Removing link {:?} resolving outside the archive", entry_path);
                        runtime.remove_file(&full_path)?;
                    }
                }
                _ => debug!("Skipping special entry {:?}", entry_path),
            }
        }
        Ok(())
    }
}

/// Fail if writing `path` would go through a symlink leading out of `root`.
///
/// The deepest existing ancestor (or `path` itself) is resolved; anything
/// below it is created fresh and cannot redirect. A dangling link fails to
/// resolve and is refused too.
fn ensure_inside<R: Runtime>(runtime: &R, root: &Path, path: &Path) -> Result<()> {
    let Some(existing) = path
        .ancestors()
        .find(|p| runtime.is_symlink(p) || runtime.exists(p))
    else {
        return Ok(());
    };
    let resolved = runtime.canonicalize(existing).with_context(|| {
        format!("Archive entry {:?} goes through an unresolvable link", path)
    })?;
    if !resolved.starts_with(root) {
        bail!(
            "Archive entry {:?} resolves outside the extraction directory",
            path
        );
    }
    Ok(())
}

/// Whether a link placed in `base` (relative to the archive root) and
/// pointing at `target` stays within the archive.
fn link_stays_inside(base: &Path, target: &Path) -> bool {
    let mut depth = base.components().count();
    for component in target.components() {
        match component {
            Component::Normal(_) => depth += 1,
            Component::CurDir => {}
            Component::ParentDir => match depth.checked_sub(1) {
                Some(d) => depth = d,
                None => return false,
            },
            Component::RootDir | Component::Prefix(_) => return false,
        }
    }
    true
}

struct ZipExtractor;

impl Extractor for ZipExtractor {
    fn can_handle(&self, archive_path: &Path) -> bool {
        archive_path.to_string_lossy().to_lowercase().ends_with(".zip")
    }

    fn extract<R: Runtime>(&self, runtime: &R, archive_path: &Path, dest: &Path) -> Result<()> {
        debug!("Extracting zip archive to {:?}...", dest);
        // ZipArchive needs Seek; Runtime::open only gives Read
        let mut buffer = Vec::new();
        runtime
            .open(archive_path)
            .with_context(|| format!("Failed to open archive at {:?}", archive_path))?
            .read_to_end(&mut buffer)
            .with_context(|| format!("Failed to read archive {:?}", archive_path))?;
        let mut archive = zip::ZipArchive::new(std::io::Cursor::new(buffer))
            .context("Failed to parse ZIP archive")?;

        for i in 0..archive.len() {
            let mut entry = archive
                .by_index(i)
                .with_context(|| format!("Failed to read ZIP entry {}", i))?;
            let Some(relative) = entry.enclosed_name() else {
                debug!("Skipping entry with invalid path");
                continue;
            };
            let full_path = dest.join(relative);

            if entry.is_dir() {
                runtime.create_dir_all(&full_path)?;
                continue;
            }
            if let Some(parent) = full_path.parent() {
                runtime.create_dir_all(parent)?;
            }
            let mut out = runtime.create_file(&full_path)?;
            std::io::copy(&mut entry, &mut out)
                .with_context(|| format!("Failed to extract file {:?}", full_path))?;

            #[cfg(unix)]
            if let Some(mode) = entry.unix_mode()
                && let Err(e) = runtime.set_permissions(&full_path, mode)
            {
                debug!("Failed to set permissions on {:?}: {}", full_path, e);
            }
        }
        Ok(())
    }
}

/// Relative path with `.` dropped; `None` if it escapes the destination.
fn sanitize(path: &Path) -> Option<PathBuf> {
    let mut clean = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    (!clean.as_os_str().is_empty()).then_some(clean)
}

/// Unpack `artifact` inside `workdir` and move the result to `tree`.
///
/// Packages may also be published as a single `.ly` file, which becomes the
/// only file of the tree.
#[tracing::instrument(skip(runtime))]
pub fn unpack<R: Runtime>(
    runtime: &R,
    kind: Kind,
    artifact: &Path,
    workdir: &Path,
    tree: &Path,
) -> Result<()> {
    let name = artifact.to_string_lossy().to_lowercase();
    if kind == Kind::Package && name.ends_with(".ly") {
        let file_name = artifact
            .file_name()
            .ok_or_else(|| anyhow!("Artifact {:?} has no file name", artifact))?;
        runtime.create_dir_all(tree)?;
        runtime.copy(artifact, &tree.join(file_name))?;
        return Ok(());
    }

    let unpacked = workdir.join("unpacked");
    runtime.create_dir_all(&unpacked)?;

    let tar_gz = TarGzExtractor;
    let zip = ZipExtractor;
    if tar_gz.can_handle(artifact) {
        tar_gz.extract(runtime, artifact, &unpacked)?;
    } else if zip.can_handle(artifact) {
        zip.extract(runtime, artifact, &unpacked)?;
    } else {
        bail!("Unsupported archive format: {}", artifact.display());
    }

    let entries = runtime
        .read_dir(&unpacked)
        .context("Failed to read extraction directory")?;
    let root = match entries.as_slice() {
        [] => bail!("Archive {:?} is empty", artifact),
        [single] if runtime.is_dir(single) => single.clone(),
        _ => unpacked.clone(),
    };
    debug!("Using {:?} as tree root", root);
    runtime.rename(&root, tree)?;
    Ok(())
}

/// File name for a downloaded artifact, taken from the last URL segment.
pub fn artifact_name(url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.rsplit('/')
        .find(|s| !s.is_empty())
        .unwrap_or("artifact")
        .to_string()
}
