use std::fmt;
use std::str::FromStr;

use super::VersionSpec;
use crate::error::LypError;

const OPERATOR_CHARS: &[char] = &['<', '>', '=', '!', '~'];

/// A command-line install/uninstall/use target, classified once.
///
/// - `self` addresses lyp itself
/// - `lilypond`, `lilypond@<spec>` or a bare version/range address a toolchain
/// - anything else is a package: `name`, `name@<spec>` or `name<op><version>`
#[derive(Debug, Clone, PartialEq)]
pub enum Target {
    Lilypond(VersionSpec),
    Package { name: String, spec: VersionSpec },
    Lyp,
}

fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '/' | '-'))
}

impl FromStr for Target {
    type Err = LypError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s == "self" {
            return Ok(Target::Lyp);
        }
        if s.is_empty() {
            return Err(LypError::InvalidSpecifier(s.to_string()));
        }

        // Bare versions and ranges name a toolchain
        if s.starts_with(|c: char| c.is_ascii_digit() || OPERATOR_CHARS.contains(&c))
            || s == "latest"
        {
            return Ok(Target::Lilypond(s.parse()?));
        }

        let (name, spec) = match s.split_once('@') {
            Some((name, spec)) => (name, spec.parse::<VersionSpec>()?),
            None => match s.find(OPERATOR_CHARS) {
                Some(idx) => (&s[..idx], s[idx..].parse::<VersionSpec>()?),
                None => (s, VersionSpec::Latest),
            },
        };

        if name == "lilypond" {
            return Ok(Target::Lilypond(spec));
        }
        if !is_valid_name(name) {
            return Err(LypError::InvalidSpecifier(s.to_string()));
        }

        Ok(Target::Package {
            name: name.to_string(),
            spec,
        })
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Lyp => f.write_str("self"),
            Target::Lilypond(VersionSpec::Latest) => f.write_str("lilypond"),
            Target::Lilypond(spec) => write!(f, "lilypond@{}", spec),
            Target::Package {
                name,
                spec: VersionSpec::Latest,
            } => f.write_str(name),
            Target::Package { name, spec } => write!(f, "{}@{}", name, spec),
        }
    }
}
