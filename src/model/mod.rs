//! Records kept in the registry and the identities used to address them.

mod spec;
mod target;
mod version;

pub use spec::{Clause, Op, VersionSpec, versions_match};
pub use target::Target;
pub use version::Version;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::LypError;

/// The two kinds of things lyp manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    Lilypond,
    Package,
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Kind::Lilypond => f.write_str("lilypond"),
            Kind::Package => f.write_str("package"),
        }
    }
}

/// An installed toolchain version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionRecord {
    pub version: String,
    /// Install directory for managed versions, the executable for system ones
    pub path: PathBuf,
    /// Pre-existing installation found on `PATH`; read-only for lyp
    #[serde(default)]
    pub system: bool,
}

impl VersionRecord {
    /// Path of the `lilypond` executable for this version.
    pub fn binary(&self) -> PathBuf {
        if self.system {
            self.path.clone()
        } else {
            self.path.join("bin").join("lilypond")
        }
    }

    pub fn id(&self) -> EntityId {
        EntityId::Lilypond(self.version.clone())
    }
}

/// A package dependency as declared by a package or a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Dependency {
    pub name: String,
    pub spec: VersionSpec,
}

impl Dependency {
    pub fn new(name: impl Into<String>, spec: VersionSpec) -> Self {
        Self {
            name: name.into(),
            spec,
        }
    }
}

impl std::str::FromStr for Dependency {
    type Err = LypError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.parse::<Target>()? {
            Target::Package { name, spec } => Ok(Dependency { name, spec }),
            _ => Err(LypError::InvalidSpecifier(s.to_string())),
        }
    }
}

impl fmt::Display for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.spec {
            VersionSpec::Latest => f.write_str(&self.name),
            VersionSpec::Exact(v) => write!(f, "{}@{}", self.name, v),
            VersionSpec::Range(_) => write!(f, "{}{}", self.name, self.spec),
        }
    }
}

impl TryFrom<String> for Dependency {
    type Error = LypError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Dependency> for String {
    fn from(dep: Dependency) -> Self {
        dep.to_string()
    }
}

/// An installed package version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageRecord {
    pub name: String,
    pub version: String,
    pub path: PathBuf,
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
}

impl PackageRecord {
    pub fn id(&self) -> EntityId {
        EntityId::Package {
            name: self.name.clone(),
            version: self.version.clone(),
        }
    }
}

/// Anything the registry can hold.
#[derive(Debug, Clone, PartialEq)]
pub enum Entity {
    Lilypond(VersionRecord),
    Package(PackageRecord),
}

impl Entity {
    pub fn id(&self) -> EntityId {
        match self {
            Entity::Lilypond(v) => v.id(),
            Entity::Package(p) => p.id(),
        }
    }

    pub fn kind(&self) -> Kind {
        match self {
            Entity::Lilypond(_) => Kind::Lilypond,
            Entity::Package(_) => Kind::Package,
        }
    }

    pub fn version(&self) -> &str {
        match self {
            Entity::Lilypond(v) => &v.version,
            Entity::Package(p) => &p.version,
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            Entity::Lilypond(v) => &v.path,
            Entity::Package(p) => &p.path,
        }
    }

    pub fn is_system(&self) -> bool {
        matches!(self, Entity::Lilypond(v) if v.system)
    }

    pub fn as_package(&self) -> Option<&PackageRecord> {
        match self {
            Entity::Package(p) => Some(p),
            Entity::Lilypond(_) => None,
        }
    }
}

/// Identity of a registry entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityId {
    Lilypond(String),
    Package { name: String, version: String },
}

impl EntityId {
    pub fn kind(&self) -> Kind {
        match self {
            EntityId::Lilypond(_) => Kind::Lilypond,
            EntityId::Package { .. } => Kind::Package,
        }
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityId::Lilypond(version) => write!(f, "lilypond@{}", version),
            EntityId::Package { name, version } => write!(f, "{}@{}", name, version),
        }
    }
}

/// One line of `list` output.
#[derive(Debug, Clone, PartialEq)]
pub struct ListEntry {
    pub entity: Entity,
    pub current: bool,
    pub default: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binary_path() {
        let managed = VersionRecord {
            version: "2.18.2".into(),
            path: PathBuf::from("/home/u/.lyp/lilyponds/2.18.2"),
            system: false,
        };
        assert_eq!(
            managed.binary(),
            PathBuf::from("/home/u/.lyp/lilyponds/2.18.2/bin/lilypond")
        );

        let system = VersionRecord {
            version: "2.18.2".into(),
            path: PathBuf::from("/usr/bin/lilypond"),
            system: true,
        };
        assert_eq!(system.binary(), PathBuf::from("/usr/bin/lilypond"));
    }

    #[test]
    fn test_entity_id_display() {
        assert_eq!(EntityId::Lilypond("2.19.0".into()).to_string(), "lilypond@2.19.0");
        let id = EntityId::Package {
            name: "assert".into(),
            version: "0.2.0".into(),
        };
        assert_eq!(id.to_string(), "assert@0.2.0");
    }

    #[test]
    fn test_dependency_serde() {
        let deps: Vec<Dependency> =
            serde_json::from_str(r#"["assert", "b@2.3", "c>=1.0,<2"]"#).unwrap();
        assert_eq!(deps[0], Dependency::new("assert", VersionSpec::Latest));
        assert_eq!(deps[1].spec, VersionSpec::Exact("2.3".into()));
        assert!(matches!(deps[2].spec, VersionSpec::Range(_)));

        let json = serde_json::to_string(&deps).unwrap();
        assert_eq!(json, r#"["assert","b@2.3","c>=1.0,<2"]"#);
    }

    #[test]
    fn test_system_flag_defaults_to_false() {
        let record: VersionRecord =
            serde_json::from_str(r#"{"version":"2.18.2","path":"/x"}"#).unwrap();
        assert!(!record.system);
    }
}
