//! In-memory registry state and its pure transitions.
//!
//! `default_version` and the per-session `sessions` map are single pointers,
//! so there can never be two defaults, or two currents in one session.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{LypError, Result};
use crate::matcher;
use crate::model::{Entity, EntityId, Kind, ListEntry, PackageRecord, VersionRecord};

/// Activation flags held by toolchain versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flag {
    Current,
    Default,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Registry {
    #[serde(default)]
    pub lilyponds: Vec<VersionRecord>,
    #[serde(default)]
    pub packages: Vec<PackageRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_version: Option<String>,
    /// session id -> current version
    #[serde(default)]
    pub sessions: BTreeMap<String, String>,
}

impl Registry {
    pub fn get(&self, id: &EntityId) -> Option<Entity> {
        match id {
            EntityId::Lilypond(version) => self
                .lilypond(version)
                .cloned()
                .map(Entity::Lilypond),
            EntityId::Package { name, version } => self
                .packages
                .iter()
                .find(|p| &p.name == name && &p.version == version)
                .cloned()
                .map(Entity::Package),
        }
    }

    pub fn contains(&self, id: &EntityId) -> bool {
        self.get(id).is_some()
    }

    pub fn lilypond(&self, version: &str) -> Option<&VersionRecord> {
        self.lilyponds.iter().find(|v| v.version == version)
    }

    /// Installed versions of package `name`.
    pub fn package_versions(&self, name: &str) -> Vec<PackageRecord> {
        self.packages
            .iter()
            .filter(|p| p.name == name)
            .cloned()
            .collect()
    }

    /// All entities of a kind.
    pub fn entities(&self, kind: Kind) -> Vec<Entity> {
        match kind {
            Kind::Lilypond => self.lilyponds.iter().cloned().map(Entity::Lilypond).collect(),
            Kind::Package => self.packages.iter().cloned().map(Entity::Package).collect(),
        }
    }

    pub fn current(&self, session: &str) -> Option<&VersionRecord> {
        self.sessions
            .get(session)
            .and_then(|version| self.lilypond(version))
    }

    pub fn default_lilypond(&self) -> Option<&VersionRecord> {
        self.default_version
            .as_deref()
            .and_then(|version| self.lilypond(version))
    }

    /// Whether any session has `version` as its current version.
    pub fn is_current_anywhere(&self, version: &str) -> bool {
        self.sessions.values().any(|v| v == version)
    }

    pub fn is_default(&self, version: &str) -> bool {
        self.default_version.as_deref() == Some(version)
    }

    /// Add a new entity. Fails with `Duplicate` if it is already recorded.
    pub fn record(&mut self, entity: Entity) -> Result<()> {
        let id = entity.id();
        if self.contains(&id) {
            return Err(LypError::Duplicate(id.to_string()));
        }
        match entity {
            Entity::Lilypond(v) => self.lilyponds.push(v),
            Entity::Package(p) => self.packages.push(p),
        }
        Ok(())
    }

    /// Remove an entity and clear any flag pointing at it.
    pub fn remove(&mut self, id: &EntityId) -> Result<Entity> {
        let entity = self
            .get(id)
            .ok_or_else(|| LypError::NotFound(id.to_string()))?;
        match id {
            EntityId::Lilypond(version) => {
                self.lilyponds.retain(|v| &v.version != version);
                self.sessions.retain(|_, v| v != version);
                if self.is_default(version) {
                    self.default_version = None;
                }
            }
            EntityId::Package { name, version } => {
                self.packages
                    .retain(|p| !(&p.name == name && &p.version == version));
            }
        }
        Ok(entity)
    }

    /// Set or clear an activation flag on a toolchain version.
    ///
    /// Setting a flag moves the single pointer, which clears it from the
    /// previous holder in the same step.
    pub fn set_flag(&mut self, id: &EntityId, flag: Flag, value: bool, session: &str) -> Result<()> {
        let version = match id {
            EntityId::Lilypond(version) => version,
            EntityId::Package { .. } => {
                return Err(LypError::conflict(
                    id.to_string(),
                    "packages cannot be made current or default",
                ));
            }
        };
        let record = self
            .lilypond(version)
            .ok_or_else(|| LypError::NotFound(id.to_string()))?;

        match (flag, value) {
            (Flag::Default, true) if record.system => {
                return Err(LypError::Permission(id.to_string()));
            }
            (Flag::Default, true) => self.default_version = Some(version.clone()),
            (Flag::Default, false) => {
                if self.is_default(version) {
                    self.default_version = None;
                }
            }
            (Flag::Current, true) => {
                self.sessions.insert(session.to_string(), version.clone());
            }
            (Flag::Current, false) => {
                if self.sessions.get(session) == Some(version) {
                    self.sessions.remove(session);
                }
            }
        }
        Ok(())
    }

    /// Entries of `kind` whose name (packages) or version (lilypond) matches
    /// the optional glob `pattern`, in listing order.
    pub fn list(&self, kind: Kind, pattern: Option<&glob::Pattern>, session: &str) -> Vec<ListEntry> {
        let current = self.sessions.get(session);
        match kind {
            Kind::Lilypond => {
                let mut versions: Vec<VersionRecord> = self
                    .lilyponds
                    .iter()
                    .filter(|v| pattern.is_none_or(|p| p.matches(&v.version)))
                    .cloned()
                    .collect();
                matcher::sort_descending(&mut versions);
                versions.reverse();
                versions
                    .into_iter()
                    .map(|v| ListEntry {
                        current: current == Some(&v.version),
                        default: self.is_default(&v.version),
                        entity: Entity::Lilypond(v),
                    })
                    .collect()
            }
            Kind::Package => {
                let mut packages: Vec<PackageRecord> = self
                    .packages
                    .iter()
                    .filter(|p| pattern.is_none_or(|pat| pat.matches(&p.name)))
                    .cloned()
                    .collect();
                packages.sort_by(|a, b| {
                    a.name
                        .cmp(&b.name)
                        .then_with(|| matcher::compare(a, b))
                });
                packages
                    .into_iter()
                    .map(|p| ListEntry {
                        entity: Entity::Package(p),
                        current: false,
                        default: false,
                    })
                    .collect()
            }
        }
    }

    /// Drop flags that point at versions no longer recorded.
    pub fn clear_dangling_flags(&mut self) {
        let installed: Vec<String> = self.lilyponds.iter().map(|v| v.version.clone()).collect();
        self.sessions.retain(|_, v| installed.contains(v));
        if let Some(default) = &self.default_version
            && !installed.contains(default)
        {
            self.default_version = None;
        }
    }
}
