//! Engine configuration and on-disk layout.

use anyhow::{Context, Result};
use log::debug;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::model::EntityId;
use crate::runtime::Runtime;

pub const DEFAULT_INDEX_URL: &str = "https://lyp.github.io/index";

/// Session scope used when the platform has no session notion.
pub const GLOBAL_SESSION: &str = "global";

const DEFAULT_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(300);
const DEFAULT_INDEX_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct Config {
    pub home: PathBuf,
    pub index_url: String,
    /// Scope of the "current" version
    pub session: String,
    pub download_timeout: Duration,
    pub index_timeout: Duration,
    pub lock_timeout: Duration,
}

impl Config {
    /// Build the configuration from explicit overrides, then the environment,
    /// then defaults.
    #[tracing::instrument(skip(runtime))]
    pub fn load<R: Runtime>(
        runtime: &R,
        home: Option<PathBuf>,
        index_url: Option<String>,
    ) -> Result<Self> {
        let home = match home.or_else(|| runtime.env_var("LYP_HOME").ok().map(PathBuf::from)) {
            Some(path) => path,
            None => runtime
                .home_dir()
                .context("Could not find home directory")?
                .join(".lyp"),
        };

        let index_url = index_url
            .or_else(|| runtime.env_var("LYP_INDEX_URL").ok())
            .unwrap_or_else(|| DEFAULT_INDEX_URL.to_string());

        let session = runtime
            .env_var("LYP_SESSION")
            .ok()
            .filter(|s| !s.is_empty())
            .or_else(|| runtime.session_id())
            .unwrap_or_else(|| GLOBAL_SESSION.to_string());

        let download_timeout = match runtime.env_var("LYP_TIMEOUT") {
            Ok(value) => {
                let secs: u64 = value
                    .trim()
                    .parse()
                    .with_context(|| format!("Invalid LYP_TIMEOUT value: {}", value))?;
                Duration::from_secs(secs)
            }
            Err(_) => DEFAULT_DOWNLOAD_TIMEOUT,
        };

        debug!(
            "Config: home={}, index={}, session={}",
            home.display(),
            index_url,
            session
        );

        Ok(Self {
            home,
            index_url,
            session,
            download_timeout,
            index_timeout: DEFAULT_INDEX_TIMEOUT,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        })
    }

    /// Configuration rooted at `home` with default settings.
    pub fn with_home(home: impl Into<PathBuf>) -> Self {
        Self {
            home: home.into(),
            index_url: DEFAULT_INDEX_URL.to_string(),
            session: GLOBAL_SESSION.to_string(),
            download_timeout: DEFAULT_DOWNLOAD_TIMEOUT,
            index_timeout: DEFAULT_INDEX_TIMEOUT,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    pub fn paths(&self) -> Paths {
        Paths::new(self.home.clone())
    }
}

/// Locations inside the lyp home directory.
///
/// ```text
/// <home>/
///   lilyponds/<version>/
///   packages/<name>@<version>/
///   staging/
///   registry.json
///   registry.lock
///   journal.json
/// ```
#[derive(Debug, Clone)]
pub struct Paths {
    home: PathBuf,
}

impl Paths {
    pub fn new(home: PathBuf) -> Self {
        Self { home }
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    pub fn lilyponds_dir(&self) -> PathBuf {
        self.home.join("lilyponds")
    }

    pub fn packages_dir(&self) -> PathBuf {
        self.home.join("packages")
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.home.join("staging")
    }

    pub fn registry_file(&self) -> PathBuf {
        self.home.join("registry.json")
    }

    pub fn lock_file(&self) -> PathBuf {
        self.home.join("registry.lock")
    }

    pub fn journal_file(&self) -> PathBuf {
        self.home.join("journal.json")
    }

    /// Final install location of an entity.
    ///
    /// Package names may contain `/`, which is flattened so every package
    /// lives directly under `packages/`.
    pub fn install_dir(&self, id: &EntityId) -> PathBuf {
        match id {
            EntityId::Lilypond(version) => self.lilyponds_dir().join(version),
            EntityId::Package { name, version } => self
                .packages_dir()
                .join(format!("{}@{}", name.replace('/', "+"), version)),
        }
    }

    /// Every directory `bootstrap` creates.
    pub fn layout(&self) -> [PathBuf; 3] {
        [
            self.lilyponds_dir(),
            self.packages_dir(),
            self.staging_dir(),
        ]
    }
}
