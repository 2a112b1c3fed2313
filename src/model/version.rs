//! Version identifiers and their precedence.
//!
//! A version is a sequence of numeric dot-separated components with an
//! optional pre-release tag after a `-` (e.g. `2.20.0-rc1`). Components are
//! compared by numeric value, missing trailing components count as zero, and
//! a tagged version sorts below the same untagged one.

use std::cmp::Ordering;
use std::fmt;

#[derive(Debug, Clone)]
pub struct Version {
    raw: String,
    components: Vec<u64>,
    pre: Option<String>,
}

impl Version {
    /// Parse a version string. A leading `v` is accepted.
    ///
    /// Returns `None` if any numeric component is missing or non-numeric.
    pub fn parse(s: &str) -> Option<Self> {
        let trimmed = s.trim();
        let body = trimmed.strip_prefix('v').unwrap_or(trimmed);
        let (numeric, pre) = match body.split_once('-') {
            Some((numeric, pre)) if !pre.is_empty() => (numeric, Some(pre.to_string())),
            Some(_) => return None,
            None => (body, None),
        };

        let components = numeric
            .split('.')
            .map(|c| c.parse::<u64>().ok())
            .collect::<Option<Vec<_>>>()?;
        if components.is_empty() {
            return None;
        }

        Some(Self {
            raw: trimmed.to_string(),
            components,
            pre,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn is_prerelease(&self) -> bool {
        self.pre.is_some()
    }

    /// Upper bound for a `~>` requirement: `~>2.18` allows `<3`, `~>2.18.1`
    /// allows `<2.19`.
    pub(crate) fn pessimistic_upper_bound(&self) -> Version {
        let mut components = self.components.clone();
        if components.len() > 1 {
            components.pop();
        }
        if let Some(last) = components.last_mut() {
            *last = last.saturating_add(1);
        }
        let raw = components
            .iter()
            .map(|c| c.to_string())
            .collect::<Vec<_>>()
            .join(".");
        Version {
            raw,
            components,
            pre: None,
        }
    }
}

fn compare_components(a: &[u64], b: &[u64]) -> Ordering {
    let len = a.len().max(b.len());
    for i in 0..len {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        match x.cmp(&y) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

/// Compare pre-release tags so that `rc10` sorts after `rc2`.
fn compare_pre(a: &str, b: &str) -> Ordering {
    let split = |s: &str| {
        let idx = s
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(s.len());
        let (alpha, digits) = s.split_at(idx);
        (alpha.to_string(), digits.parse::<u64>().ok())
    };
    let (alpha_a, num_a) = split(a);
    let (alpha_b, num_b) = split(b);
    alpha_a
        .cmp(&alpha_b)
        .then_with(|| num_a.cmp(&num_b))
        .then_with(|| a.cmp(b))
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_components(&self.components, &other.components).then_with(|| {
            match (&self.pre, &other.pre) {
                (None, None) => Ordering::Equal,
                (None, Some(_)) => Ordering::Greater,
                (Some(_), None) => Ordering::Less,
                (Some(a), Some(b)) => compare_pre(a, b),
            }
        })
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> Version {
        Version::parse(s).unwrap()
    }

    #[test]
    fn test_numeric_not_lexicographic() {
        assert!(v("1.10") > v("1.9"));
        assert!(v("2.18.2") > v("2.9.30"));
    }

    #[test]
    fn test_missing_components_are_zero() {
        assert_eq!(v("2.18"), v("2.18.0"));
        assert!(v("2.18.1") > v("2.18"));
    }

    #[test]
    fn test_prerelease_sorts_below_release() {
        assert!(v("2.20.0-rc1") < v("2.20.0"));
        assert!(v("2.20.0-rc1") > v("2.19.99"));
        assert!(v("2.20.0-rc10") > v("2.20.0-rc2"));
        assert!(v("2.20.0-beta1") < v("2.20.0-rc1"));
    }

    #[test]
    fn test_v_prefix_accepted() {
        assert_eq!(v("v1.2.3"), v("1.2.3"));
        assert_eq!(v("v1.2.3").as_str(), "v1.2.3");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(Version::parse("").is_none());
        assert!(Version::parse("latest").is_none());
        assert!(Version::parse("1..2").is_none());
        assert!(Version::parse("1.2-").is_none());
        assert!(Version::parse("1.x").is_none());
    }

    #[test]
    fn test_pessimistic_upper_bound() {
        assert_eq!(v("2.18").pessimistic_upper_bound().as_str(), "3");
        assert_eq!(v("2.18.1").pessimistic_upper_bound().as_str(), "2.19");
        assert_eq!(v("4").pessimistic_upper_bound().as_str(), "5");
    }

    #[test]
    fn test_pessimistic_upper_bound_saturates() {
        let max = u64::MAX.to_string();
        assert_eq!(v(&max).pessimistic_upper_bound().as_str(), max);
        assert_eq!(
            v(&format!("2.{}.0", max)).pessimistic_upper_bound().as_str(),
            format!("2.{}", max)
        );
    }
}
