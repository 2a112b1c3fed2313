//! Version specifiers: exact versions, ranges and the `latest` sentinel.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::Version;
use crate::error::LypError;

/// Comparison operator of a range clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    /// `~>`: at least this version, below the next "minor" boundary
    Pessimistic,
}

impl Op {
    fn symbol(self) -> &'static str {
        match self {
            Op::Eq => "=",
            Op::Ne => "!=",
            Op::Gt => ">",
            Op::Ge => ">=",
            Op::Lt => "<",
            Op::Le => "<=",
            Op::Pessimistic => "~>",
        }
    }

    /// Split a leading operator off `s`. Longest operators are tried first.
    fn split_prefix(s: &str) -> Option<(Op, &str)> {
        const OPS: [(&str, Op); 8] = [
            (">=", Op::Ge),
            ("<=", Op::Le),
            ("==", Op::Eq),
            ("!=", Op::Ne),
            ("~>", Op::Pessimistic),
            (">", Op::Gt),
            ("<", Op::Lt),
            ("=", Op::Eq),
        ];
        OPS.iter()
            .find_map(|(symbol, op)| s.strip_prefix(symbol).map(|rest| (*op, rest)))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Clause {
    pub op: Op,
    pub version: Version,
}

impl Clause {
    pub fn matches(&self, candidate: &Version) -> bool {
        match self.op {
            Op::Eq => candidate == &self.version,
            Op::Ne => candidate != &self.version,
            Op::Gt => candidate > &self.version,
            Op::Ge => candidate >= &self.version,
            Op::Lt => candidate < &self.version,
            Op::Le => candidate <= &self.version,
            Op::Pessimistic => {
                candidate >= &self.version && candidate < &self.version.pessimistic_upper_bound()
            }
        }
    }
}

impl fmt::Display for Clause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.op.symbol(), self.version)
    }
}

/// What the user asked for when naming a version.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum VersionSpec {
    /// Highest stable candidate
    #[default]
    Latest,
    /// Literal version string
    Exact(String),
    /// All clauses must hold; highest satisfying candidate wins
    Range(Vec<Clause>),
}

impl VersionSpec {
    pub fn is_latest(&self) -> bool {
        matches!(self, VersionSpec::Latest)
    }

    /// Whether a version string satisfies this specifier on its own, without
    /// considering other candidates.
    pub fn accepts(&self, version: &str) -> bool {
        match self {
            VersionSpec::Latest => true,
            VersionSpec::Exact(expected) => versions_match(expected, version),
            VersionSpec::Range(clauses) => match Version::parse(version) {
                Some(parsed) => clauses.iter().all(|c| c.matches(&parsed)),
                None => false,
            },
        }
    }
}

/// Literal comparison that ignores a leading `v` on either side.
pub fn versions_match(v1: &str, v2: &str) -> bool {
    let n1 = v1.strip_prefix('v').unwrap_or(v1);
    let n2 = v2.strip_prefix('v').unwrap_or(v2);
    n1 == n2
}

impl FromStr for VersionSpec {
    type Err = LypError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() || s.eq_ignore_ascii_case("latest") {
            return Ok(VersionSpec::Latest);
        }

        if Op::split_prefix(s).is_none() {
            return match Version::parse(s) {
                Some(_) => Ok(VersionSpec::Exact(s.to_string())),
                None => Err(LypError::InvalidSpecifier(s.to_string())),
            };
        }

        let mut clauses = Vec::new();
        for part in s.split(',') {
            let part = part.trim();
            let (op, rest) =
                Op::split_prefix(part).ok_or_else(|| LypError::InvalidSpecifier(s.to_string()))?;
            let version = Version::parse(rest.trim())
                .ok_or_else(|| LypError::InvalidSpecifier(s.to_string()))?;
            clauses.push(Clause { op, version });
        }

        // A lone equality is an exact request
        if let [Clause { op: Op::Eq, version }] = clauses.as_slice() {
            return Ok(VersionSpec::Exact(version.as_str().to_string()));
        }

        Ok(VersionSpec::Range(clauses))
    }
}

impl fmt::Display for VersionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionSpec::Latest => f.write_str("latest"),
            VersionSpec::Exact(v) => f.write_str(v),
            VersionSpec::Range(clauses) => {
                let text = clauses
                    .iter()
                    .map(|c| c.to_string())
                    .collect::<Vec<_>>()
                    .join(",");
                f.write_str(&text)
            }
        }
    }
}

impl TryFrom<String> for VersionSpec {
    type Error = LypError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<VersionSpec> for String {
    fn from(spec: VersionSpec) -> Self {
        spec.to_string()
    }
}
