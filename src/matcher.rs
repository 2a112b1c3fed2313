//! Version matching: pick the one candidate a specifier refers to.
//!
//! All functions are pure and operate on slices of candidates.

use std::cmp::Ordering;

use crate::model::{Entity, PackageRecord, Version, VersionRecord, VersionSpec, versions_match};
use crate::remote::RemoteEntry;

/// Something that carries a version string and may be system-owned.
pub trait Versioned {
    fn version_str(&self) -> &str;

    fn is_system(&self) -> bool {
        false
    }
}

impl Versioned for VersionRecord {
    fn version_str(&self) -> &str {
        &self.version
    }

    fn is_system(&self) -> bool {
        self.system
    }
}

impl Versioned for PackageRecord {
    fn version_str(&self) -> &str {
        &self.version
    }
}

impl Versioned for Entity {
    fn version_str(&self) -> &str {
        self.version()
    }

    fn is_system(&self) -> bool {
        Entity::is_system(self)
    }
}

impl Versioned for RemoteEntry {
    fn version_str(&self) -> &str {
        &self.version
    }
}

/// Resolve `spec` against `candidates`.
///
/// Returns `None` when nothing satisfies the specifier; callers turn that
/// into a `NoMatch` error. There is no fallback to a "close" version.
pub fn resolve<'a, T: Versioned>(spec: &VersionSpec, candidates: &'a [T]) -> Option<&'a T> {
    match spec {
        VersionSpec::Exact(version) => find_exact(candidates, version),
        VersionSpec::Range(clauses) => {
            let satisfying: Vec<(&T, Version)> = parsed(candidates)
                .filter(|(_, v)| clauses.iter().all(|c| c.matches(v)))
                .collect();
            prefer_stable(satisfying, |_| true)
        }
        VersionSpec::Latest => prefer_stable(parsed(candidates).collect(), |c| !c.is_system()),
    }
}

/// Literal match; a managed installation wins over a system one.
pub fn find_exact<'a, T: Versioned>(candidates: &'a [T], version: &str) -> Option<&'a T> {
    candidates
        .iter()
        .filter(|c| versions_match(c.version_str(), version))
        .min_by_key(|c| c.is_system())
}

/// Highest candidate first, by version precedence.
pub fn sort_descending<T: Versioned>(candidates: &mut [T]) {
    candidates.sort_by(|a, b| compare(b, a));
}

/// Order by version precedence; unparseable versions sort first, by string.
pub fn compare<T: Versioned>(a: &T, b: &T) -> Ordering {
    match (Version::parse(a.version_str()), Version::parse(b.version_str())) {
        (Some(va), Some(vb)) => va.cmp(&vb),
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        (None, None) => a.version_str().cmp(b.version_str()),
    }
}

fn parsed<T: Versioned>(candidates: &[T]) -> impl Iterator<Item = (&T, Version)> {
    candidates
        .iter()
        .filter_map(|c| Version::parse(c.version_str()).map(|v| (c, v)))
}

/// Pick the highest stable candidate that passes `eligible`; fall back to the
/// whole set only when no such candidate exists.
fn prefer_stable<'a, T: Versioned>(
    pool: Vec<(&'a T, Version)>,
    eligible: impl Fn(&T) -> bool,
) -> Option<&'a T> {
    let stable = pool
        .iter()
        .filter(|(c, v)| !v.is_prerelease() && eligible(c));
    if let Some(best) = highest(stable) {
        return Some(best);
    }
    highest(pool.iter())
}

fn highest<'a, 'b, T: Versioned + 'a>(
    iter: impl Iterator<Item = &'b (&'a T, Version)>,
) -> Option<&'a T>
where
    'a: 'b,
{
    iter.max_by(|(ca, va), (cb, vb)| {
        va.cmp(vb)
            // Equal precedence: the non-system candidate is "greater"
            .then_with(|| cb.is_system().cmp(&ca.is_system()))
    })
    .map(|(c, _)| *c)
}
