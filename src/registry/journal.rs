//! Write-ahead journal for install and uninstall commits.
//!
//! An entry is appended before a staged tree is promoted into the installed
//! tree and removed once the registry has been saved. Whatever is left in the
//! journal at startup describes a commit that was interrupted.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::model::{EntityId, Kind};
use crate::runtime::Runtime;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub id: String,
    pub kind: Kind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub version: String,
    /// Where the tree sat before the move
    pub staged: PathBuf,
    /// Where the tree is being moved to
    pub target: PathBuf,
}

impl JournalEntry {
    pub fn new(entity: &EntityId, staged: PathBuf, target: PathBuf) -> Self {
        let (name, version) = match entity {
            EntityId::Lilypond(version) => (None, version.clone()),
            EntityId::Package { name, version } => (Some(name.clone()), version.clone()),
        };
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind: entity.kind(),
            name,
            version,
            staged,
            target,
        }
    }

    pub fn entity(&self) -> EntityId {
        match (self.kind, &self.name) {
            (Kind::Package, Some(name)) => EntityId::Package {
                name: name.clone(),
                version: self.version.clone(),
            },
            _ => EntityId::Lilypond(self.version.clone()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Journal {
    #[serde(default)]
    pub entries: Vec<JournalEntry>,
}

impl Journal {
    /// Load the journal. A missing file is an empty journal.
    #[tracing::instrument(skip(runtime))]
    pub fn load<R: Runtime>(runtime: &R, path: &Path) -> Result<Self> {
        if !runtime.exists(path) {
            return Ok(Self::default());
        }
        let content = runtime
            .read_to_string(path)
            .with_context(|| format!("Failed to read journal {:?}", path))?;
        serde_json::from_str(&content).with_context(|| format!("Failed to parse journal {:?}", path))
    }

    #[tracing::instrument(skip(self, runtime))]
    pub fn save<R: Runtime>(&self, runtime: &R, path: &Path) -> Result<()> {
        if self.entries.is_empty() {
            if runtime.exists(path) {
                runtime.remove_file(path)?;
            }
            return Ok(());
        }
        let json = serde_json::to_string_pretty(self)?;
        runtime.write_atomic(path, json.as_bytes())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
