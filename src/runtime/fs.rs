//! File system operations backing the registry, staging and install trees.

use anyhow::{Context, Result};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use super::RealRuntime;

impl RealRuntime {
    /// Write to `<name>.tmp`, fsync, then rename over `path`.
    #[tracing::instrument(skip(self, contents))]
    pub(crate) fn write_atomic_impl(&self, path: &Path, contents: &[u8]) -> Result<()> {
        let file_name = path
            .file_name()
            .with_context(|| format!("Path {:?} has no file name", path))?;
        let tmp_path = path.with_file_name(format!("{}.tmp", file_name.to_string_lossy()));

        let mut file =
            fs::File::create(&tmp_path).with_context(|| format!("Failed to create {:?}", tmp_path))?;
        file.write_all(contents)
            .and_then(|()| file.sync_all())
            .with_context(|| format!("Failed to write {:?}", tmp_path))?;
        drop(file);

        if let Err(e) = fs::rename(&tmp_path, path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(e).with_context(|| format!("Failed to replace {:?}", path));
        }

        #[cfg(unix)]
        if let Some(parent) = path.parent()
            && let Ok(dir) = fs::File::open(parent)
        {
            let _ = dir.sync_all();
        }

        Ok(())
    }

    #[tracing::instrument(skip(self))]
    pub(crate) fn read_to_string_impl(&self, path: &Path) -> Result<String> {
        fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))
    }

    #[tracing::instrument(skip(self))]
    pub(crate) fn rename_impl(&self, from: &Path, to: &Path) -> Result<()> {
        fs::rename(from, to).with_context(|| format!("Failed to move {:?} to {:?}", from, to))
    }

    #[tracing::instrument(skip(self))]
    pub(crate) fn copy_impl(&self, from: &Path, to: &Path) -> Result<u64> {
        fs::copy(from, to).with_context(|| format!("Failed to copy {:?} to {:?}", from, to))
    }

    #[tracing::instrument(skip(self))]
    pub(crate) fn create_dir_all_impl(&self, path: &Path) -> Result<()> {
        fs::create_dir_all(path).with_context(|| format!("Failed to create directory {:?}", path))
    }

    #[tracing::instrument(skip(self))]
    pub(crate) fn remove_file_impl(&self, path: &Path) -> Result<()> {
        fs::remove_file(path).with_context(|| format!("Failed to remove {:?}", path))
    }

    #[tracing::instrument(skip(self))]
    pub(crate) fn remove_dir_all_impl(&self, path: &Path) -> Result<()> {
        fs::remove_dir_all(path).with_context(|| format!("Failed to remove tree {:?}", path))
    }

    pub(crate) fn exists_impl(&self, path: &Path) -> bool {
        path.exists()
    }

    pub(crate) fn is_dir_impl(&self, path: &Path) -> bool {
        path.is_dir()
    }

    pub(crate) fn is_symlink_impl(&self, path: &Path) -> bool {
        path.is_symlink()
    }

    #[tracing::instrument(skip(self))]
    pub(crate) fn read_dir_impl(&self, path: &Path) -> Result<Vec<PathBuf>> {
        let entries = fs::read_dir(path).with_context(|| format!("Failed to list {:?}", path))?;
        let mut paths = entries
            .map(|entry| entry.map(|e| e.path()))
            .collect::<std::io::Result<Vec<_>>>()
            .with_context(|| format!("Failed to list {:?}", path))?;
        paths.sort();
        Ok(paths)
    }

    #[tracing::instrument(skip(self))]
    pub(crate) fn canonicalize_impl(&self, path: &Path) -> Result<PathBuf> {
        fs::canonicalize(path).with_context(|| format!("Failed to resolve {:?}", path))
    }

    #[tracing::instrument(skip(self))]
    pub(crate) fn create_file_impl(&self, path: &Path) -> Result<Box<dyn Write + Send>> {
        let file = fs::File::create(path).with_context(|| format!("Failed to create {:?}", path))?;
        Ok(Box::new(file))
    }

    #[tracing::instrument(skip(self))]
    pub(crate) fn open_impl(&self, path: &Path) -> Result<Box<dyn std::io::Read + Send>> {
        let file = fs::File::open(path).with_context(|| format!("Failed to open {:?}", path))?;
        Ok(Box::new(file))
    }

    #[tracing::instrument(skip(self))]
    pub(crate) fn set_permissions_impl(&self, path: &Path, mode: u32) -> Result<()> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(mode))
                .with_context(|| format!("Failed to set mode {:o} on {:?}", mode, path))?;
        }
        #[cfg(not(unix))]
        let _ = (path, mode);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::runtime::{RealRuntime, Runtime};
    use std::io::{Read, Write};
    use std::path::Path;
    use tempfile::tempdir;

    #[test]
    fn test_promote_tree_by_rename() {
        let runtime = RealRuntime;
        let dir = tempdir().unwrap();
        let staged = dir.path().join("staging/abc/tree");
        runtime.create_dir_all(&staged.join("bin")).unwrap();
        runtime
            .write_atomic(&staged.join("bin/lilypond"), b"#!/bin/sh\n")
            .unwrap();
        runtime
            .copy(&staged.join("bin/lilypond"), &staged.join("bin/lilypond-book"))
            .unwrap();

        let target = dir.path().join("lilyponds/2.18.2");
        runtime.create_dir_all(target.parent().unwrap()).unwrap();
        runtime.rename(&staged, &target).unwrap();

        assert!(!runtime.exists(&staged));
        assert!(runtime.is_dir(&target.join("bin")));

        runtime.remove_dir_all(&target).unwrap();
        assert!(!runtime.exists(&target));
    }

    #[test]
    fn test_write_atomic_replaces_content_and_leaves_no_tmp() {
        let runtime = RealRuntime;
        let dir = tempdir().unwrap();
        let path = dir.path().join("registry.json");

        runtime.write_atomic(&path, b"first").unwrap();
        runtime.write_atomic(&path, b"second").unwrap();

        assert_eq!(runtime.read_to_string(&path).unwrap(), "second");
        assert!(!dir.path().join("registry.json.tmp").exists());
    }

    #[test]
    fn test_write_atomic_missing_parent_fails() {
        let runtime = RealRuntime;
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing/registry.json");

        assert!(runtime.write_atomic(&path, b"x").is_err());
        assert!(!path.exists());
    }

    #[test]
    fn test_read_dir_is_sorted() {
        let runtime = RealRuntime;
        let dir = tempdir().unwrap();
        for name in ["b", "a", "c.lock"] {
            runtime.create_dir_all(&dir.path().join(name)).unwrap();
        }

        let names: Vec<_> = runtime
            .read_dir(dir.path())
            .unwrap()
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a", "b", "c.lock"]);
    }

    #[test]
    fn test_streamed_artifact_round_trip() {
        let runtime = RealRuntime;
        let dir = tempdir().unwrap();
        let artifact = dir.path().join("lilypond-2.18.2.tar.gz");

        {
            let mut writer = runtime.create_file(&artifact).unwrap();
            writer.write_all(b"archive bytes").unwrap();
        }
        runtime.set_permissions(&artifact, 0o644).unwrap();

        let mut reader = runtime.open(&artifact).unwrap();
        let mut content = String::new();
        reader.read_to_string(&mut content).unwrap();
        assert_eq!(content, "archive bytes");
    }

    #[cfg(unix)]
    #[test]
    fn test_canonicalize_resolves_symlinks() {
        let runtime = RealRuntime;
        let dir = tempdir().unwrap();
        let real = dir.path().join("lilyponds/2.18.2");
        runtime.create_dir_all(&real).unwrap();
        let link = dir.path().join("current");
        std::os::unix::fs::symlink(&real, &link).unwrap();

        assert_eq!(
            runtime.canonicalize(&link).unwrap(),
            runtime.canonicalize(&real).unwrap()
        );
        assert!(runtime.is_symlink(&link));
        assert!(!runtime.is_symlink(&real));
        assert!(runtime.canonicalize(&dir.path().join("missing")).is_err());
    }

    #[test]
    fn test_errors_name_the_path() {
        let runtime = RealRuntime;
        let missing = Path::new("/nonexistent/lyp/registry.json");

        let err = runtime.read_to_string(missing).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/lyp/registry.json"));
        assert!(runtime.remove_file(missing).is_err());
    }
}
