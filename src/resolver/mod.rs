//! Package dependency resolution for a document.
//!
//! Resolution happens in two phases. Planning walks the whole dependency
//! graph against installed packages (and, when needed, the remote index)
//! without changing anything; a cycle or an unsatisfiable specifier aborts
//! here. Installation then fetches the missing packages in plan order.

mod document;

pub use document::parse_requires;

use log::{debug, info, warn};
use std::collections::HashMap;
use std::path::Path;

use crate::error::{LypError, Result};
use crate::install::{InstallOptions, Installer};
use crate::matcher;
use crate::model::{Dependency, Entity, EntityId, Kind, PackageRecord};
use crate::registry::Registry;
use crate::remote::{RemoteEntry, RemoteIndex};
use crate::runtime::Runtime;

#[derive(Debug, Clone)]
enum Source {
    Installed(PackageRecord),
    Remote(RemoteEntry),
}

#[derive(Debug, Clone)]
struct Planned {
    /// The declaration that first pulled this package in
    specifier: String,
    version: String,
    source: Source,
}

/// Outcome of one planning attempt.
enum PlanError {
    /// A package is not installed and the remote index was not consulted yet
    NeedRemote,
    Failed(LypError),
}

impl From<LypError> for PlanError {
    fn from(e: LypError) -> Self {
        PlanError::Failed(e)
    }
}

#[derive(Default)]
struct Plan {
    order: Vec<String>,
    resolved: HashMap<String, Planned>,
}

struct Planner<'p> {
    registry: &'p Registry,
    remote: Option<&'p [RemoteEntry]>,
    plan: Plan,
    visiting: Vec<String>,
}

impl Planner<'_> {
    fn visit(&mut self, dependency: &Dependency) -> std::result::Result<(), PlanError> {
        let name = &dependency.name;

        if let Some(pos) = self.visiting.iter().position(|n| n == name) {
            let mut chain = self.visiting[pos..].to_vec();
            chain.push(name.clone());
            return Err(LypError::CircularDependency { chain }.into());
        }

        if let Some(existing) = self.plan.resolved.get(name) {
            if dependency.spec.accepts(&existing.version) {
                return Ok(());
            }
            return Err(resolution(
                dependency,
                LypError::conflict(
                    format!("{}@{}", name, existing.version),
                    format!(
                        "required as '{}' and as '{}'",
                        existing.specifier, dependency
                    ),
                ),
            )
            .into());
        }

        let (version, source, children) = self.select(dependency)?;
        debug!("Planned {}@{} for '{}'", name, version, dependency);

        self.plan.order.push(name.clone());
        self.plan.resolved.insert(
            name.clone(),
            Planned {
                specifier: dependency.to_string(),
                version,
                source,
            },
        );

        self.visiting.push(name.clone());
        for child in &children {
            self.visit(child)?;
        }
        self.visiting.pop();
        Ok(())
    }

    /// Installed packages first, then the remote index.
    fn select(
        &self,
        dependency: &Dependency,
    ) -> std::result::Result<(String, Source, Vec<Dependency>), PlanError> {
        let installed = self.registry.package_versions(&dependency.name);
        if let Some(record) = matcher::resolve(&dependency.spec, &installed) {
            return Ok((
                record.version.clone(),
                Source::Installed(record.clone()),
                record.dependencies.clone(),
            ));
        }

        let Some(remote) = self.remote else {
            return Err(PlanError::NeedRemote);
        };
        let candidates: Vec<RemoteEntry> = remote
            .iter()
            .filter(|e| e.installable && e.name == dependency.name)
            .cloned()
            .collect();
        let Some(entry) = matcher::resolve(&dependency.spec, &candidates) else {
            return Err(resolution(
                dependency,
                LypError::NoMatch {
                    kind: Kind::Package,
                    spec: dependency.to_string(),
                },
            )
            .into());
        };

        let children = entry
            .dependencies
            .iter()
            .map(|d| d.parse::<Dependency>())
            .collect::<Result<Vec<_>>>()
            .map_err(|e| resolution(dependency, e))?;
        Ok((entry.version.clone(), Source::Remote(entry.clone()), children))
    }
}

fn resolution(dependency: &Dependency, cause: LypError) -> LypError {
    LypError::Resolution {
        specifier: dependency.to_string(),
        source: Box::new(cause),
    }
}

fn plan(
    dependencies: &[Dependency],
    registry: &Registry,
    remote: Option<&[RemoteEntry]>,
) -> std::result::Result<Plan, PlanError> {
    let mut planner = Planner {
        registry,
        remote,
        plan: Plan::default(),
        visiting: Vec::new(),
    };
    for dependency in dependencies {
        planner.visit(dependency)?;
    }
    Ok(planner.plan)
}

pub struct Resolver<'i, 'a, R: Runtime, I: RemoteIndex> {
    runtime: &'a R,
    installer: &'i Installer<'a, R, I>,
}

impl<'i, 'a, R: Runtime, I: RemoteIndex> Resolver<'i, 'a, R, I> {
    pub fn new(runtime: &'a R, installer: &'i Installer<'a, R, I>) -> Self {
        Self { runtime, installer }
    }

    /// Packages the document needs, installing missing ones.
    ///
    /// The result lists each declared package followed by its transitive
    /// dependencies not already listed.
    #[tracing::instrument(skip(self, registry))]
    pub async fn resolve_for_document(
        &self,
        path: &Path,
        registry: &Registry,
    ) -> Result<Vec<PackageRecord>> {
        let source = self
            .runtime
            .read_to_string(path)
            .map_err(|source| LypError::Document {
                path: path.to_path_buf(),
                source,
            })?;
        let dependencies = parse_requires(&source)?;
        debug!("{:?} declares {} dependencies", path, dependencies.len());
        self.resolve(&dependencies, registry).await
    }

    /// Resolve and install `dependencies` against `registry`.
    pub async fn resolve(
        &self,
        dependencies: &[Dependency],
        registry: &Registry,
    ) -> Result<Vec<PackageRecord>> {
        if dependencies.is_empty() {
            return Ok(vec![]);
        }

        let plan = match plan(dependencies, registry, None) {
            Ok(plan) => plan,
            Err(PlanError::Failed(e)) => return Err(e),
            Err(PlanError::NeedRemote) => {
                let remote = self.installer.candidates(Kind::Package, None).await?;
                match plan(dependencies, registry, Some(&remote)) {
                    Ok(plan) => plan,
                    Err(PlanError::Failed(e)) => return Err(e),
                    Err(PlanError::NeedRemote) => {
                        return Err(LypError::Remote(anyhow::anyhow!(
                            "package index could not be consulted"
                        )));
                    }
                }
            }
        };

        let mut packages = Vec::with_capacity(plan.order.len());
        let mut fresh = Vec::new();
        for name in &plan.order {
            let Some(planned) = plan.resolved.get(name) else {
                continue;
            };
            let record = match &planned.source {
                Source::Installed(record) => record.clone(),
                Source::Remote(entry) => match self.install(planned, entry).await {
                    Ok((record, installed_here)) => {
                        if installed_here {
                            fresh.push(record.id());
                        }
                        record
                    }
                    Err(e) => {
                        self.roll_back(&fresh);
                        return Err(e);
                    }
                },
            };
            packages.push(record);
        }
        Ok(packages)
    }

    /// Uninstall the packages this run installed, newest first.
    fn roll_back(&self, fresh: &[EntityId]) {
        for id in fresh.iter().rev() {
            info!("Rolling back {}", id);
            if let Err(e) = self.installer.uninstall(id) {
                warn!("Failed to roll back {}: {}", id, e);
            }
        }
    }

    /// Install one planned entry. The flag is false when another process
    /// installed it first.
    async fn install(&self, planned: &Planned, entry: &RemoteEntry) -> Result<(PackageRecord, bool)> {
        info!("Installing dependency {}@{}", entry.name, entry.version);
        let wrap = |e: LypError| LypError::Resolution {
            specifier: planned.specifier.clone(),
            source: Box::new(e),
        };

        match self
            .installer
            .install_entry(entry, &InstallOptions::default())
            .await
        {
            Ok(Entity::Package(record)) => Ok((record, true)),
            Ok(other) => Err(wrap(LypError::conflict(
                other.id().to_string(),
                "index returned a non-package entry",
            ))),
            // Installed concurrently by someone else
            Err(LypError::Duplicate(_)) => {
                let id = EntityId::Package {
                    name: entry.name.clone(),
                    version: entry.version.clone(),
                };
                match self.installer.installed(&id)? {
                    Some(Entity::Package(record)) => Ok((record, false)),
                    _ => Err(wrap(LypError::NotFound(id.to_string()))),
                }
            }
            Err(e) => Err(wrap(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::remote::MockRemoteIndex;
    use crate::runtime::RealRuntime;
    use crate::test_utils::{package_entry, tar_gz_bytes};
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_util::sync::CancellationToken;

    fn installed(name: &str, version: &str, deps: &[&str]) -> PackageRecord {
        PackageRecord {
            name: name.into(),
            version: version.into(),
            path: PathBuf::from(format!("/h/packages/{}@{}", name, version)),
            dependencies: deps.iter().map(|d| d.parse().unwrap()).collect(),
        }
    }

    fn deps(specs: &[&str]) -> Vec<Dependency> {
        specs.iter().map(|d| d.parse().unwrap()).collect()
    }

    fn remote(name: &str, version: &str, deps: &[&str]) -> RemoteEntry {
        let mut entry = package_entry(name, version);
        entry.dependencies = deps.iter().map(|d| d.to_string()).collect();
        entry
    }

    /// Index serving `entries`, counting fetches.
    fn index(entries: Vec<RemoteEntry>, fetches: Arc<AtomicUsize>) -> MockRemoteIndex {
        let mut index = MockRemoteIndex::new();
        index
            .expect_list_available()
            .returning(move |_| Ok(entries.clone()));
        index.expect_fetch().returning(move |entry, dest| {
            fetches.fetch_add(1, Ordering::SeqCst);
            let file = format!("{}/package.ly", entry.name);
            let bytes = tar_gz_bytes(&[(file.as_str(), "% package")]);
            std::fs::write(dest, &bytes)?;
            Ok(bytes.len() as u64)
        });
        index
    }

    fn registry_with(packages: Vec<PackageRecord>) -> Registry {
        Registry {
            packages,
            ..Registry::default()
        }
    }

    #[tokio::test]
    async fn test_installs_only_missing() {
        let dir = tempfile::tempdir().unwrap();
        let fetches = Arc::new(AtomicUsize::new(0));
        let index = index(
            vec![remote("A", "1.5", &[]), remote("B", "2.3", &[]), remote("B", "2.4", &[])],
            Arc::clone(&fetches),
        );
        let config = Config::with_home(dir.path());
        let installer = Installer::new(&RealRuntime, &index, &config, CancellationToken::new());
        let resolver = Resolver::new(&RealRuntime, &installer);
        let registry = registry_with(vec![installed("A", "1.2", &[])]);

        let packages = resolver
            .resolve(&deps(&["A>=1.0", "B==2.3"]), &registry)
            .await
            .unwrap();

        let ids: Vec<_> = packages.iter().map(|p| format!("{}@{}", p.name, p.version)).collect();
        assert_eq!(ids, vec!["A@1.2", "B@2.3"]);
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
        assert!(dir.path().join("packages/B@2.3/package.ly").is_file());
    }

    #[tokio::test]
    async fn test_cycle_installs_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let fetches = Arc::new(AtomicUsize::new(0));
        let index = index(
            vec![remote("A", "1.0", &["B"]), remote("B", "1.0", &["A"])],
            Arc::clone(&fetches),
        );
        let config = Config::with_home(dir.path());
        let installer = Installer::new(&RealRuntime, &index, &config, CancellationToken::new());
        let resolver = Resolver::new(&RealRuntime, &installer);

        let err = resolver
            .resolve(&deps(&["A"]), &Registry::default())
            .await
            .unwrap_err();

        match err {
            LypError::CircularDependency { chain } => assert_eq!(chain, vec!["A", "B", "A"]),
            other => panic!("expected cycle, got {:?}", other),
        }
        assert_eq!(fetches.load(Ordering::SeqCst), 0);
        assert!(!dir.path().join("packages").exists());
    }

    #[test]
    fn test_pre_order_output() {
        let registry = registry_with(vec![
            installed("A", "1.0", &["C", "D"]),
            installed("B", "1.0", &["C"]),
            installed("C", "1.0", &["E"]),
            installed("D", "1.0", &[]),
            installed("E", "1.0", &[]),
        ]);
        let plan = match plan(&deps(&["A", "B"]), &registry, None) {
            Ok(plan) => plan,
            Err(_) => panic!("planning failed"),
        };
        assert_eq!(plan.order, vec!["A", "C", "E", "D", "B"]);
    }

    #[test]
    fn test_incompatible_requirements_conflict() {
        let registry = registry_with(vec![
            installed("A", "1.0", &["C@2.0"]),
            installed("C", "1.0", &[]),
            installed("C", "2.0", &[]),
        ]);
        let result = plan(&deps(&["C@1.0", "A"]), &registry, None);
        let Err(PlanError::Failed(err)) = result else {
            panic!("expected a conflict");
        };
        match &err {
            LypError::Resolution { specifier, source } => {
                assert_eq!(specifier, "C@2.0");
                assert!(matches!(**source, LypError::Conflict { .. }));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_no_match_is_wrapped() {
        let dir = tempfile::tempdir().unwrap();
        let index = index(vec![remote("A", "1.0", &[])], Arc::new(AtomicUsize::new(0)));
        let config = Config::with_home(dir.path());
        let installer = Installer::new(&RealRuntime, &index, &config, CancellationToken::new());
        let resolver = Resolver::new(&RealRuntime, &installer);

        let err = resolver
            .resolve(&deps(&["A>=2.0"]), &Registry::default())
            .await
            .unwrap_err();
        assert!(matches!(err, LypError::Resolution { ref specifier, .. } if specifier == "A>=2.0"));
        assert!(matches!(err.root_cause(), LypError::NoMatch { .. }));
    }

    #[tokio::test]
    async fn test_install_failure_is_wrapped() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = MockRemoteIndex::new();
        index
            .expect_list_available()
            .returning(|_| Ok(vec![package_entry("A", "1.0")]));
        index
            .expect_fetch()
            .returning(|_, _| Err(anyhow::anyhow!("HTTP 500")));
        let config = Config::with_home(dir.path());
        let installer = Installer::new(&RealRuntime, &index, &config, CancellationToken::new());
        let resolver = Resolver::new(&RealRuntime, &installer);

        let err = resolver
            .resolve(&deps(&["A"]), &Registry::default())
            .await
            .unwrap_err();
        assert!(matches!(err, LypError::Resolution { .. }));
        assert!(matches!(err.root_cause(), LypError::Install { .. }));
    }

    #[tokio::test]
    async fn test_later_failure_uninstalls_earlier_packages() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = MockRemoteIndex::new();
        index
            .expect_list_available()
            .returning(|_| Ok(vec![package_entry("A", "1.0"), package_entry("B", "1.0")]));
        index.expect_fetch().returning(|entry, dest| {
            if entry.name == "B" {
                anyhow::bail!("HTTP 500");
            }
            let bytes = tar_gz_bytes(&[("A/package.ly", "% package")]);
            std::fs::write(dest, &bytes)?;
            Ok(bytes.len() as u64)
        });
        let config = Config::with_home(dir.path());
        let installer = Installer::new(&RealRuntime, &index, &config, CancellationToken::new());
        let resolver = Resolver::new(&RealRuntime, &installer);

        let err = resolver
            .resolve(&deps(&["A", "B"]), &Registry::default())
            .await
            .unwrap_err();

        assert!(matches!(err, LypError::Resolution { ref specifier, .. } if specifier == "B"));
        let id = EntityId::Package {
            name: "A".into(),
            version: "1.0".into(),
        };
        assert!(installer.installed(&id).unwrap().is_none());
        assert!(!dir.path().join("packages/A@1.0").exists());
    }

    #[tokio::test]
    async fn test_document_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let index = MockRemoteIndex::new();
        let config = Config::with_home(dir.path());
        let installer = Installer::new(&RealRuntime, &index, &config, CancellationToken::new());
        let resolver = Resolver::new(&RealRuntime, &installer);

        let err = resolver
            .resolve_for_document(&dir.path().join("missing.ly"), &Registry::default())
            .await
            .unwrap_err();
        assert!(matches!(err, LypError::Document { .. }));
    }

    #[tokio::test]
    async fn test_document_without_requires() {
        let dir = tempfile::tempdir().unwrap();
        let doc = dir.path().join("score.ly");
        std::fs::write(&doc, "\\version \"2.18.2\"\n{ c'4 }\n").unwrap();
        let index = MockRemoteIndex::new();
        let config = Config::with_home(dir.path());
        let installer = Installer::new(&RealRuntime, &index, &config, CancellationToken::new());
        let resolver = Resolver::new(&RealRuntime, &installer);

        let packages = resolver
            .resolve_for_document(&doc, &Registry::default())
            .await
            .unwrap();
        assert!(packages.is_empty());
    }
}
