//! Scanning a document for `\require` declarations.

use crate::error::{LypError, Result};
use crate::model::Dependency;

const REQUIRE: &str = "\\require";

/// Declared dependencies in declaration order.
///
/// Recognizes `\require "name"`, `\require "name@spec"` and
/// `\require "name<op>version"`. Everything after an unquoted `%` is a
/// comment.
pub fn parse_requires(source: &str) -> Result<Vec<Dependency>> {
    let mut dependencies = Vec::new();
    for line in source.lines() {
        let code = strip_comment(line);
        let mut rest = code;
        while let Some(idx) = rest.find(REQUIRE) {
            rest = &rest[idx + REQUIRE.len()..];
            // `\requirements` and the like are other commands
            if rest.starts_with(|c: char| c.is_ascii_alphabetic()) {
                continue;
            }
            let trimmed = rest.trim_start();
            let Some(quoted) = trimmed.strip_prefix('"') else {
                continue;
            };
            let Some(end) = quoted.find('"') else {
                return Err(LypError::InvalidSpecifier(trimmed.to_string()));
            };
            dependencies.push(quoted[..end].trim().parse::<Dependency>()?);
            rest = &quoted[end + 1..];
        }
    }
    Ok(dependencies)
}

fn strip_comment(line: &str) -> &str {
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in line.char_indices() {
        match c {
            _ if escaped => escaped = false,
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '%' if !in_string => return &line[..i],
            _ => {}
        }
    }
    line
}
