//! The engine: the single entry point the CLI talks to.
//!
//! Every operation returns a [`LypError`] on failure; nothing here prints to
//! the terminal or terminates the process.

use log::{debug, info, warn};
use std::path::Path;
use tokio_util::sync::CancellationToken;

use crate::activation::Activation;
use crate::compiler::Compiler;
use crate::config::Config;
use crate::error::{LypError, Result};
use crate::install::{self, InstallOptions, Installer};
use crate::matcher;
use crate::model::{
    Dependency, Entity, EntityId, Kind, ListEntry, Target, VersionRecord, VersionSpec,
};
use crate::registry::{Journal, RegistryStore};
use crate::remote::{RemoteEntry, RemoteIndex};
use crate::resolver::Resolver;
use crate::runtime::Runtime;
use crate::system;

#[derive(Debug, Clone, Default)]
pub struct UseOptions {
    /// Also make the version the default
    pub default: bool,
}

/// A remote entry annotated with local state.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchEntry {
    pub entry: RemoteEntry,
    pub installed: bool,
}

/// What `recover` cleaned up.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecoveryReport {
    /// Promoted trees whose registry record was never written
    pub rolled_back: usize,
    /// Staging areas left by dead processes
    pub swept: usize,
    /// Records whose install path vanished
    pub pruned: Vec<EntityId>,
}

impl RecoveryReport {
    pub fn is_empty(&self) -> bool {
        self.rolled_back == 0 && self.swept == 0 && self.pruned.is_empty()
    }
}

pub struct Engine<R: Runtime, I: RemoteIndex, C: Compiler> {
    runtime: R,
    index: I,
    compiler: C,
    config: Config,
    cancel: CancellationToken,
}

impl<R: Runtime, I: RemoteIndex, C: Compiler> Engine<R, I, C> {
    pub fn new(runtime: R, index: I, compiler: C, config: Config) -> Self {
        Self {
            runtime,
            index,
            compiler,
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Create the engine, bootstrapping the home directory on first use and
    /// recovering from interrupted operations.
    pub fn open(runtime: R, index: I, compiler: C, config: Config) -> Result<Self> {
        let engine = Self::new(runtime, index, compiler, config);
        if !engine.runtime.exists(&engine.config.paths().registry_file()) {
            engine.bootstrap()?;
        }
        let report = engine.recover()?;
        if !report.is_empty() {
            info!("Recovered: {:?}", report);
        }
        Ok(engine)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Cancelling this token aborts running installs.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn store(&self) -> RegistryStore<'_, R> {
        RegistryStore::new(&self.runtime, self.config.paths(), self.config.lock_timeout)
    }

    fn installer(&self) -> Installer<'_, R, I> {
        Installer::new(&self.runtime, &self.index, &self.config, self.cancel.clone())
    }

    /// Create the home layout and record system lilypond installations.
    ///
    /// Returns the system versions that were newly recorded.
    #[tracing::instrument(skip(self))]
    pub fn bootstrap(&self) -> Result<Vec<VersionRecord>> {
        let paths = self.config.paths();
        for dir in paths.layout() {
            self.runtime
                .create_dir_all(&dir)
                .map_err(|source| LypError::Install {
                    target: "self".to_string(),
                    source,
                })?;
        }

        let discovered = system::discover(&self.runtime, paths.home());
        let added = self.store().transaction(|registry| {
            let mut added = Vec::new();
            for record in discovered {
                if registry.lilypond(&record.version).is_some() {
                    continue;
                }
                registry.record(Entity::Lilypond(record.clone()))?;
                added.push(record);
            }
            Ok(added)
        })?;

        info!(
            "Initialized {:?} ({} system versions)",
            paths.home(),
            added.len()
        );
        Ok(added)
    }

    /// Remove the whole lyp home directory.
    #[tracing::instrument(skip(self))]
    pub fn teardown(&self) -> Result<()> {
        let home = self.config.paths().home().to_path_buf();
        if !self.runtime.exists(&home) {
            return Ok(());
        }
        let _writer = self.store().lock_for_write()?;
        self.runtime
            .remove_dir_all(&home)
            .map_err(|source| LypError::Uninstall {
                target: "self".to_string(),
                source,
            })?;
        info!("Removed {:?}", home);
        Ok(())
    }

    /// Roll back interrupted commits, sweep dead staging areas and drop
    /// records whose files are gone.
    #[tracing::instrument(skip(self))]
    pub fn recover(&self) -> Result<RecoveryReport> {
        let paths = self.config.paths();
        let store = self.store();
        let writer = store.lock_for_write()?;
        let mut registry = writer.load()?;
        let mut report = RecoveryReport::default();

        let journal = writer.journal()?;
        for entry in &journal.entries {
            let id = entry.entity();
            if !registry.contains(&id) && self.runtime.exists(&entry.target) {
                warn!("Rolling back interrupted install of {}", id);
                self.runtime
                    .remove_dir_all(&entry.target)
                    .map_err(|source| LypError::Install {
                        target: id.to_string(),
                        source,
                    })?;
                report.rolled_back += 1;
            }
            if self.runtime.exists(&entry.staged) {
                let _ = self.runtime.remove_dir_all(&entry.staged);
            }
        }
        if !journal.is_empty() {
            writer.save_journal(&Journal::default())?;
        }

        let staging = paths.staging_dir();
        report.swept = install::sweep(&self.runtime, &staging).map_err(|source| LypError::Registry {
            path: staging.clone(),
            source,
        })?;

        let vanished: Vec<EntityId> = registry
            .entities(Kind::Lilypond)
            .into_iter()
            .chain(registry.entities(Kind::Package))
            .filter(|e| !self.runtime.exists(e.path()))
            .map(|e| e.id())
            .collect();
        for id in &vanished {
            warn!("{} is recorded but missing on disk; forgetting it", id);
            registry.remove(id)?;
        }
        report.pruned = vanished;

        let before = registry.clone();
        registry.clear_dangling_flags();
        if !report.pruned.is_empty() || registry != before {
            writer.save(&registry)?;
        }

        debug!("Recovery report: {:?}", report);
        Ok(report)
    }

    /// Installed entries of `kind` matching the glob `pattern`.
    pub fn list(&self, kind: Kind, pattern: Option<&str>) -> Result<Vec<ListEntry>> {
        self.store().list(kind, pattern, &self.config.session)
    }

    /// Entries available from the remote index.
    ///
    /// For lilypond the pattern is a version specifier; for packages it is a
    /// glob on the package name.
    #[tracing::instrument(skip(self))]
    pub async fn search(&self, kind: Kind, pattern: Option<&str>) -> Result<Vec<SearchEntry>> {
        let mut entries = self
            .index
            .list_available(kind)
            .await
            .map_err(LypError::Remote)?;

        match (kind, pattern) {
            (_, None) => {}
            (Kind::Lilypond, Some(spec)) => {
                let spec: VersionSpec = spec.parse()?;
                entries.retain(|e| spec.accepts(&e.version));
            }
            (Kind::Package, Some(glob)) => {
                let pattern = glob::Pattern::new(glob)
                    .map_err(|_| LypError::InvalidSpecifier(glob.to_string()))?;
                entries.retain(|e| pattern.matches(&e.name));
            }
        }

        entries.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| matcher::compare(a, b)));

        let registry = self.store().snapshot()?;
        Ok(entries
            .into_iter()
            .map(|entry| {
                let id = match kind {
                    Kind::Lilypond => EntityId::Lilypond(entry.version.clone()),
                    Kind::Package => EntityId::Package {
                        name: entry.name.clone(),
                        version: entry.version.clone(),
                    },
                };
                SearchEntry {
                    installed: registry.contains(&id),
                    entry,
                }
            })
            .collect())
    }

    /// Install a toolchain version or a package (with its dependencies).
    #[tracing::instrument(skip(self, options))]
    pub async fn install(&self, target: &Target, options: &InstallOptions) -> Result<Entity> {
        let installer = self.installer();
        match target {
            Target::Lyp => Err(LypError::InvalidSpecifier(
                "'self' is installed by bootstrap".to_string(),
            )),
            Target::Lilypond(spec) => installer.install(Kind::Lilypond, None, spec, options).await,
            Target::Package { name, spec } => {
                if options.default {
                    return Err(LypError::conflict(
                        target.to_string(),
                        "packages cannot be made default",
                    ));
                }
                let candidates = installer.candidates(Kind::Package, Some(name.as_str())).await?;
                let entry = matcher::resolve(spec, &candidates).ok_or_else(|| LypError::NoMatch {
                    kind: Kind::Package,
                    spec: target.to_string(),
                })?;
                let root = Dependency::new(name.clone(), VersionSpec::Exact(entry.version.clone()));
                let registry = self.store().snapshot()?;
                if registry.contains(&EntityId::Package {
                    name: name.clone(),
                    version: entry.version.clone(),
                }) {
                    return Err(LypError::Duplicate(root.to_string()));
                }

                // The root and its dependencies are planned together, so a
                // cycle or an unsatisfiable dependency installs nothing.
                let packages = Resolver::new(&self.runtime, &installer)
                    .resolve(std::slice::from_ref(&root), &registry)
                    .await
                    .map_err(|e| match e {
                        LypError::Resolution { specifier, source } if specifier == root.to_string() => {
                            *source
                        }
                        other => other,
                    })?;
                packages
                    .into_iter()
                    .next()
                    .map(Entity::Package)
                    .ok_or_else(|| LypError::NotFound(root.to_string()))
            }
        }
    }

    /// Remove an installed toolchain version or package.
    #[tracing::instrument(skip(self))]
    pub fn uninstall(&self, target: &Target) -> Result<Entity> {
        let registry = self.store().snapshot()?;
        let id = match target {
            Target::Lyp => {
                return Err(LypError::InvalidSpecifier(
                    "'self' is removed by teardown".to_string(),
                ));
            }
            Target::Lilypond(spec) => matcher::resolve(spec, &registry.lilyponds)
                .map(VersionRecord::id),
            Target::Package { name, spec } => {
                matcher::resolve(spec, &registry.package_versions(name)).map(|p| p.id())
            }
        }
        .ok_or_else(|| LypError::NotFound(target.to_string()))?;

        self.installer().uninstall(&id)
    }

    /// Switch the current version of this session, and the default if asked.
    #[tracing::instrument(skip(self))]
    pub fn use_version(&self, spec: &VersionSpec, options: &UseOptions) -> Result<VersionRecord> {
        let store = self.store();
        let registry = store.snapshot()?;
        let record = matcher::resolve(spec, &registry.lilyponds)
            .cloned()
            .ok_or_else(|| LypError::NoMatch {
                kind: Kind::Lilypond,
                spec: spec.to_string(),
            })?;

        Activation::new(&store, &self.config.session).activate(&record.id(), options.default)?;
        Ok(record)
    }

    /// The version `compile` would use: current, else default.
    pub fn active_lilypond(&self) -> Result<VersionRecord> {
        let registry = self.store().snapshot()?;
        registry
            .current(&self.config.session)
            .or_else(|| registry.default_lilypond())
            .cloned()
            .ok_or_else(|| LypError::NotFound("lilypond (no current or default version)".to_string()))
    }

    /// Resolve the document's packages and run lilypond on it.
    #[tracing::instrument(skip(self))]
    pub async fn compile(&self, document: &Path, extra_args: &[String]) -> Result<i32> {
        let lilypond = self.active_lilypond()?;
        let registry = self.store().snapshot()?;
        let installer = self.installer();
        let packages = Resolver::new(&self.runtime, &installer)
            .resolve_for_document(document, &registry)
            .await?;

        let package_paths: Vec<_> = packages.iter().map(|p| p.path.clone()).collect();
        let mut args = extra_args.to_vec();
        args.push(document.display().to_string());

        info!(
            "Compiling {:?} with lilypond {} and {} packages",
            document,
            lilypond.version,
            package_paths.len()
        );
        self.compiler
            .invoke(&lilypond.binary(), &package_paths, &args)
            .await
            .map_err(LypError::Compile)
    }
}
