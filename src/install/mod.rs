//! Installation and removal of toolchain versions and packages.
//!
//! An install runs fetch, verify, extract inside a private staging area
//! without touching the registry. Only the commit (promote by rename, then
//! record) happens under the registry write lock, with a journal entry
//! covering the window between the two.

mod archive;
mod staging;
mod verify;

pub use staging::{StagingArea, sweep};
pub use verify::{sha256_file, verify_checksum};

use anyhow::Context;
use log::{debug, info, warn};
use std::path::Path;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, Paths};
use crate::error::{LypError, Result};
use crate::matcher;
use crate::model::{Dependency, Entity, EntityId, Kind, PackageRecord, VersionRecord, VersionSpec};
use crate::registry::{Flag, JournalEntry, RegistryStore};
use crate::remote::{RemoteEntry, RemoteIndex};
use crate::runtime::Runtime;

#[derive(Debug, Clone, Default)]
pub struct InstallOptions {
    /// Also make the installed toolchain the default version
    pub default: bool,
}

pub struct Installer<'a, R: Runtime, I: RemoteIndex> {
    runtime: &'a R,
    index: &'a I,
    store: RegistryStore<'a, R>,
    paths: Paths,
    download_timeout: Duration,
    cancel: CancellationToken,
}

impl<'a, R: Runtime, I: RemoteIndex> Installer<'a, R, I> {
    pub fn new(runtime: &'a R, index: &'a I, config: &Config, cancel: CancellationToken) -> Self {
        let paths = config.paths();
        Self {
            runtime,
            index,
            store: RegistryStore::new(runtime, paths.clone(), config.lock_timeout),
            paths,
            download_timeout: config.download_timeout,
            cancel,
        }
    }

    /// The registry record for `id`, if installed.
    pub fn installed(&self, id: &EntityId) -> Result<Option<Entity>> {
        Ok(self.store.snapshot()?.get(id))
    }

    /// Installable remote entries of `kind`, restricted to package `name`.
    pub async fn candidates(&self, kind: Kind, name: Option<&str>) -> Result<Vec<RemoteEntry>> {
        let entries = self
            .index
            .list_available(kind)
            .await
            .map_err(LypError::Remote)?;
        Ok(entries
            .into_iter()
            .filter(|e| e.installable && name.is_none_or(|n| e.name == n))
            .collect())
    }

    /// Resolve `spec` against the remote index and install the match.
    #[tracing::instrument(skip(self, options))]
    pub async fn install(
        &self,
        kind: Kind,
        name: Option<&str>,
        spec: &VersionSpec,
        options: &InstallOptions,
    ) -> Result<Entity> {
        let candidates = self.candidates(kind, name).await?;
        let entry = matcher::resolve(spec, &candidates).ok_or_else(|| LypError::NoMatch {
            kind,
            spec: match name {
                Some(name) => Dependency::new(name, spec.clone()).to_string(),
                None => spec.to_string(),
            },
        })?;
        self.install_entry(entry, options).await
    }

    /// Install one concrete index entry.
    #[tracing::instrument(skip(self, entry, options), fields(name = %entry.name, version = %entry.version))]
    pub async fn install_entry(&self, entry: &RemoteEntry, options: &InstallOptions) -> Result<Entity> {
        let id = entity_id(entry);
        let target = id.to_string();
        if self.store.snapshot()?.contains(&id) {
            return Err(LypError::Duplicate(target));
        }

        let install_error = |source: anyhow::Error| LypError::Install {
            target: target.clone(),
            source,
        };

        let area = StagingArea::create(self.runtime, &self.paths.staging_dir()).map_err(install_error)?;
        let artifact = area.path().join(archive::artifact_name(&entry.url));

        info!("Installing {}", target);
        tokio::select! {
            _ = self.cancel.cancelled() => {
                return Err(LypError::Cancelled(target));
            }
            fetched = tokio::time::timeout(self.download_timeout, self.index.fetch(entry, &artifact)) => {
                let bytes = fetched
                    .map_err(|_| anyhow::anyhow!("download timed out after {}s", self.download_timeout.as_secs()))
                    .and_then(|r| r)
                    .map_err(install_error)?;
                debug!("Fetched {} bytes for {}", bytes, target);
            }
        }

        if let Some(expected) = &entry.sha256 {
            verify_checksum(self.runtime, &artifact, expected).map_err(install_error)?;
        }

        let tree = area.tree();
        archive::unpack(self.runtime, entry.kind, &artifact, area.path(), &tree).map_err(install_error)?;

        if self.cancel.is_cancelled() {
            return Err(LypError::Cancelled(target));
        }

        let final_path = self.paths.install_dir(&id);
        let entity = match entry.kind {
            Kind::Lilypond => Entity::Lilypond(VersionRecord {
                version: entry.version.clone(),
                path: final_path,
                system: false,
            }),
            Kind::Package => {
                let dependencies = entry
                    .dependencies
                    .iter()
                    .map(|d| d.parse::<Dependency>())
                    .collect::<Result<Vec<_>>>()?;
                Entity::Package(PackageRecord {
                    name: entry.name.clone(),
                    version: entry.version.clone(),
                    path: final_path,
                    dependencies,
                })
            }
        };

        let entity = self.commit(entity, &tree, options.default)?;
        // Staging area is removed when `area` drops
        info!("Installed {}", target);
        Ok(entity)
    }

    /// Promote `tree` to the entity's install path and record it.
    fn commit(&self, entity: Entity, tree: &Path, make_default: bool) -> Result<Entity> {
        let id = entity.id();
        let target = id.to_string();
        let final_path = entity.path().to_path_buf();
        let install_error = |source: anyhow::Error| LypError::Install {
            target: target.clone(),
            source,
        };

        let writer = self.store.lock_for_write()?;
        let mut registry = writer.load()?;
        if registry.contains(&id) {
            // Lost a race with another installer
            return Err(LypError::Duplicate(target));
        }

        let journal_entry = JournalEntry::new(&id, tree.to_path_buf(), final_path.clone());
        let journal_id = journal_entry.id.clone();
        writer.begin(journal_entry)?;

        let promoted = self.promote(tree, &final_path);
        if let Err(e) = promoted {
            writer.complete(&journal_id)?;
            return Err(install_error(e));
        }

        let recorded = registry.record(entity.clone()).and_then(|_| {
            if make_default {
                registry.set_flag(&id, Flag::Default, true, "")?;
            }
            writer.save(&registry)
        });
        if let Err(e) = recorded {
            if let Err(rollback) = self.runtime.rename(&final_path, tree) {
                warn!("Failed to roll back {:?}: {}", final_path, rollback);
            }
            writer.complete(&journal_id)?;
            return Err(e);
        }

        writer.complete(&journal_id)?;
        Ok(entity)
    }

    fn promote(&self, tree: &Path, final_path: &Path) -> anyhow::Result<()> {
        if self.runtime.exists(final_path) {
            // Unrecorded leftovers; the registry is authoritative
            warn!("Removing unregistered directory {:?}", final_path);
            self.runtime.remove_dir_all(final_path)?;
        }
        if let Some(parent) = final_path.parent() {
            self.runtime.create_dir_all(parent)?;
        }
        self.runtime
            .rename(tree, final_path)
            .with_context(|| format!("Failed to move {:?} into place", tree))
    }

    /// Remove an installed entity.
    ///
    /// The tree is first moved out of the installed tree into a staging area,
    /// then the registry is saved, then the moved tree is deleted.
    #[tracing::instrument(skip(self))]
    pub fn uninstall(&self, id: &EntityId) -> Result<Entity> {
        let target = id.to_string();
        let uninstall_error = |source: anyhow::Error| LypError::Uninstall {
            target: target.clone(),
            source,
        };

        let writer = self.store.lock_for_write()?;
        let mut registry = writer.load()?;
        let entity = registry
            .get(id)
            .ok_or_else(|| LypError::NotFound(target.clone()))?;

        if entity.is_system() {
            return Err(LypError::Permission(target));
        }
        if let Entity::Lilypond(record) = &entity {
            if registry.is_current_anywhere(&record.version) {
                return Err(LypError::conflict(target, "version is current; switch to another version first"));
            }
            if registry.is_default(&record.version) {
                return Err(LypError::conflict(target, "version is the default; make another version default first"));
            }
        }

        let trash = StagingArea::create(self.runtime, &self.paths.staging_dir()).map_err(uninstall_error)?;
        let moved = trash.tree();
        let path_exists = self.runtime.exists(entity.path());
        if path_exists {
            self.runtime
                .rename(entity.path(), &moved)
                .map_err(uninstall_error)?;
        }

        registry.remove(id)?;
        if let Err(e) = writer.save(&registry) {
            if path_exists && let Err(rollback) = self.runtime.rename(&moved, entity.path()) {
                warn!("Failed to restore {:?}: {}", entity.path(), rollback);
            }
            return Err(e);
        }
        drop(writer);
        drop(trash);

        info!("Uninstalled {}", target);
        Ok(entity)
    }
}

fn entity_id(entry: &RemoteEntry) -> EntityId {
    match entry.kind {
        Kind::Lilypond => EntityId::Lilypond(entry.version.clone()),
        Kind::Package => EntityId::Package {
            name: entry.name.clone(),
            version: entry.version.clone(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MockRemoteIndex;
    use crate::runtime::RealRuntime;
    use crate::test_utils::{lilypond_entry, package_entry, tar_gz_bytes};
    use std::path::PathBuf;

    fn config(home: &Path) -> Config {
        Config::with_home(home)
    }

    /// Index whose fetch writes a tar.gz with `bin/lilypond` inside.
    fn index_serving(entries: Vec<RemoteEntry>) -> MockRemoteIndex {
        let mut index = MockRemoteIndex::new();
        index
            .expect_list_available()
            .returning(move |kind| Ok(entries.iter().filter(|e| e.kind == kind).cloned().collect()));
        index.expect_fetch().returning(|entry, dest| {
            let binary = format!("{}-{}/bin/lilypond", entry.name, entry.version);
            let bytes = tar_gz_bytes(&[(binary.as_str(), "#!/bin/sh\n")]);
            std::fs::write(dest, &bytes)?;
            Ok(bytes.len() as u64)
        });
        index
    }

    fn staging_is_empty(home: &Path) -> bool {
        std::fs::read_dir(home.join("staging"))
            .map(|mut d| d.next().is_none())
            .unwrap_or(true)
    }

    #[tokio::test]
    async fn test_install_lilypond() {
        let dir = tempfile::tempdir().unwrap();
        let index = index_serving(vec![lilypond_entry("2.18.2"), lilypond_entry("2.19.0")]);
        let config = config(dir.path());
        let installer = Installer::new(&RealRuntime, &index, &config, CancellationToken::new());

        let spec: VersionSpec = "2.18.2".parse().unwrap();
        let entity = installer
            .install(Kind::Lilypond, None, &spec, &InstallOptions::default())
            .await
            .unwrap();

        let expected_path = dir.path().join("lilyponds/2.18.2");
        assert_eq!(entity.path(), expected_path.as_path());
        assert!(expected_path.join("bin/lilypond").is_file());
        assert!(staging_is_empty(dir.path()));
        assert!(!dir.path().join("journal.json").exists());

        let registry = installer.store.snapshot().unwrap();
        assert!(registry.default_version.is_none());
        assert!(registry.sessions.is_empty());
    }

    #[tokio::test]
    async fn test_install_with_default_flag() {
        let dir = tempfile::tempdir().unwrap();
        let index = index_serving(vec![lilypond_entry("2.18.2")]);
        let config = config(dir.path());
        let installer = Installer::new(&RealRuntime, &index, &config, CancellationToken::new());

        installer
            .install(Kind::Lilypond, None, &VersionSpec::Latest, &InstallOptions { default: true })
            .await
            .unwrap();
        let registry = installer.store.snapshot().unwrap();
        assert_eq!(registry.default_version.as_deref(), Some("2.18.2"));
    }

    #[tokio::test]
    async fn test_install_duplicate() {
        let dir = tempfile::tempdir().unwrap();
        let index = index_serving(vec![lilypond_entry("2.18.2")]);
        let config = config(dir.path());
        let installer = Installer::new(&RealRuntime, &index, &config, CancellationToken::new());
        let options = InstallOptions::default();

        installer.install(Kind::Lilypond, None, &VersionSpec::Latest, &options).await.unwrap();
        let err = installer
            .install(Kind::Lilypond, None, &VersionSpec::Latest, &options)
            .await
            .unwrap_err();
        assert!(matches!(err, LypError::Duplicate(ref s) if s == "lilypond@2.18.2"));
    }

    #[tokio::test]
    async fn test_install_no_match() {
        let dir = tempfile::tempdir().unwrap();
        let mut foreign = lilypond_entry("2.24.0");
        foreign.installable = false;
        let index = index_serving(vec![lilypond_entry("2.18.2"), foreign]);
        let config = config(dir.path());
        let installer = Installer::new(&RealRuntime, &index, &config, CancellationToken::new());

        let spec: VersionSpec = ">=2.20".parse().unwrap();
        let err = installer
            .install(Kind::Lilypond, None, &spec, &InstallOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, LypError::NoMatch { kind: Kind::Lilypond, .. }));
    }

    #[tokio::test]
    async fn test_checksum_failure_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let mut entry = lilypond_entry("2.18.2");
        entry.sha256 = Some("00".repeat(32));
        let index = index_serving(vec![entry]);
        let config = config(dir.path());
        let installer = Installer::new(&RealRuntime, &index, &config, CancellationToken::new());

        let err = installer
            .install(Kind::Lilypond, None, &VersionSpec::Latest, &InstallOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, LypError::Install { .. }));
        assert!(err.to_string().contains("Checksum mismatch"));
        assert!(!dir.path().join("lilyponds/2.18.2").exists());
        assert!(staging_is_empty(dir.path()));
        assert!(installer.store.snapshot().unwrap().lilyponds.is_empty());
    }

    #[tokio::test]
    async fn test_fetch_failure_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = MockRemoteIndex::new();
        index
            .expect_list_available()
            .returning(|_| Ok(vec![lilypond_entry("2.18.2")]));
        index
            .expect_fetch()
            .returning(|_, _| Err(anyhow::anyhow!("connection reset")));
        let config = config(dir.path());
        let installer = Installer::new(&RealRuntime, &index, &config, CancellationToken::new());

        let err = installer
            .install(Kind::Lilypond, None, &VersionSpec::Latest, &InstallOptions::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("connection reset"));
        assert!(staging_is_empty(dir.path()));
    }

    #[tokio::test]
    async fn test_cancelled_install_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let index = index_serving(vec![lilypond_entry("2.18.2")]);
        let config = config(dir.path());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let installer = Installer::new(&RealRuntime, &index, &config, cancel);

        let err = installer
            .install(Kind::Lilypond, None, &VersionSpec::Latest, &InstallOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, LypError::Cancelled(_)));
        assert!(staging_is_empty(dir.path()));
        assert!(!dir.path().join("lilyponds/2.18.2").exists());
    }

    #[tokio::test]
    async fn test_install_package_records_dependencies() {
        let dir = tempfile::tempdir().unwrap();
        let mut entry = package_entry("assert", "0.2.0");
        entry.dependencies = vec!["scale>=1.0".into()];
        let index = index_serving(vec![entry]);
        let config = config(dir.path());
        let installer = Installer::new(&RealRuntime, &index, &config, CancellationToken::new());

        let entity = installer
            .install(Kind::Package, Some("assert"), &VersionSpec::Latest, &InstallOptions::default())
            .await
            .unwrap();
        let package = entity.as_package().unwrap();
        assert_eq!(package.path, dir.path().join("packages/assert@0.2.0"));
        assert_eq!(package.dependencies[0].name, "scale");
    }

    #[tokio::test]
    async fn test_install_then_uninstall_restores_registry() {
        let dir = tempfile::tempdir().unwrap();
        let index = index_serving(vec![lilypond_entry("2.18.2"), lilypond_entry("2.19.0")]);
        let config = config(dir.path());
        let installer = Installer::new(&RealRuntime, &index, &config, CancellationToken::new());
        let options = InstallOptions { default: true };
        installer
            .install(Kind::Lilypond, None, &"2.18.2".parse().unwrap(), &options)
            .await
            .unwrap();
        let before = installer.store.snapshot().unwrap();

        installer
            .install(Kind::Lilypond, None, &"2.19.0".parse().unwrap(), &InstallOptions::default())
            .await
            .unwrap();
        installer.uninstall(&EntityId::Lilypond("2.19.0".into())).unwrap();

        assert_eq!(installer.store.snapshot().unwrap(), before);
        assert!(!dir.path().join("lilyponds/2.19.0").exists());
        assert!(staging_is_empty(dir.path()));
    }

    #[tokio::test]
    async fn test_uninstall_refuses_flagged_and_system() {
        let dir = tempfile::tempdir().unwrap();
        let index = index_serving(vec![lilypond_entry("2.18.2"), lilypond_entry("2.19.0")]);
        let config = config(dir.path());
        let installer = Installer::new(&RealRuntime, &index, &config, CancellationToken::new());
        for v in ["2.18.2", "2.19.0"] {
            installer
                .install(Kind::Lilypond, None, &v.parse().unwrap(), &InstallOptions::default())
                .await
                .unwrap();
        }
        installer
            .store
            .set_flag(&EntityId::Lilypond("2.18.2".into()), Flag::Current, true, "tty1")
            .unwrap();
        installer
            .store
            .set_flag(&EntityId::Lilypond("2.19.0".into()), Flag::Default, true, "tty1")
            .unwrap();
        installer
            .store
            .record(Entity::Lilypond(VersionRecord {
                version: "2.16.0".into(),
                path: PathBuf::from("/usr/bin/lilypond"),
                system: true,
            }))
            .unwrap();
        let before = installer.store.snapshot().unwrap();

        for (version, current_or_default) in [("2.18.2", true), ("2.19.0", true), ("2.16.0", false)] {
            let err = installer
                .uninstall(&EntityId::Lilypond(version.into()))
                .unwrap_err();
            if current_or_default {
                assert!(matches!(err, LypError::Conflict { .. }), "{}", version);
            } else {
                assert!(matches!(err, LypError::Permission(_)));
            }
        }
        assert_eq!(installer.store.snapshot().unwrap(), before);
        assert!(dir.path().join("lilyponds/2.18.2/bin/lilypond").exists());

        assert!(matches!(
            installer.uninstall(&EntityId::Lilypond("9.9".into())),
            Err(LypError::NotFound(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_installs_one_wins() {
        let dir = tempfile::tempdir().unwrap();
        let home = dir.path().to_path_buf();

        let attempt = |home: PathBuf| async move {
            let index = index_serving(vec![lilypond_entry("2.18.2")]);
            let config = Config::with_home(home);
            let installer = Installer::new(&RealRuntime, &index, &config, CancellationToken::new());
            let entry = lilypond_entry("2.18.2");
            installer.install_entry(&entry, &InstallOptions::default()).await
        };

        let (a, b) = tokio::join!(
            tokio::spawn(attempt(home.clone())),
            tokio::spawn(attempt(home.clone()))
        );
        let results = [a.unwrap(), b.unwrap()];

        let successes = results.iter().filter(|r| r.is_ok()).count();
        let duplicates = results
            .iter()
            .filter(|r| matches!(r, Err(LypError::Duplicate(_))))
            .count();
        assert_eq!(successes, 1);
        assert_eq!(duplicates, 1);

        let store = RegistryStore::new(&RealRuntime, Paths::new(home.clone()), Duration::from_secs(5));
        assert_eq!(store.snapshot().unwrap().lilyponds.len(), 1);
        assert!(staging_is_empty(&home));
    }
}
