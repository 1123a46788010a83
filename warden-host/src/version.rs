//! Version parsing and requirement matching
//!
//! Requirements use a constrained range grammar: one or more comparators
//! separated by whitespace or commas, e.g. `>=1.0.0 <2.0.0`, `^1.2`, `~0.3.1`
//! or `*`. Versions with fewer than three components are padded with zeros.

use semver::{Version, VersionReq};
use thiserror::Error;

/// Errors produced while parsing versions or requirements
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum VersionError {
    #[error("Invalid version '{input}': {reason}")]
    InvalidVersion { input: String, reason: String },

    #[error("Invalid version requirement '{input}': {reason}")]
    InvalidRequirement { input: String, reason: String },
}

/// Parse a semver-like version string
pub fn parse_version(input: &str) -> Result<Version, VersionError> {
    let trimmed = input.trim().trim_start_matches('v');
    let padded = pad_version(trimmed);
    Version::parse(&padded).map_err(|e| VersionError::InvalidVersion {
        input: input.to_string(),
        reason: e.to_string(),
    })
}

/// Parse a requirement in the range grammar
pub fn parse_requirement(input: &str) -> Result<VersionReq, VersionError> {
    let trimmed = input.trim();
    if trimmed.is_empty() || trimmed == "*" {
        return Ok(VersionReq::STAR);
    }

    let invalid = |reason: &str| VersionError::InvalidRequirement {
        input: input.to_string(),
        reason: reason.to_string(),
    };

    let mut comparators = Vec::new();
    let mut pending_op = String::new();
    for token in trimmed
        .split(|c: char| c.is_whitespace() || c == ',')
        .filter(|t| !t.is_empty())
    {
        // Operators written apart from their version (`>= 1.0.0`)
        if token.chars().all(|c| matches!(c, '>' | '<' | '=' | '~' | '^')) {
            if !pending_op.is_empty() {
                return Err(invalid("consecutive operators"));
            }
            pending_op = token.to_string();
            continue;
        }
        comparators.push(format!("{}{}", std::mem::take(&mut pending_op), token));
    }
    if !pending_op.is_empty() {
        return Err(invalid("operator without a version"));
    }

    VersionReq::parse(&comparators.join(", ")).map_err(|e| invalid(&e.to_string()))
}

/// Check whether `version` satisfies `requirement`
pub fn satisfies(version: &str, requirement: &str) -> Result<bool, VersionError> {
    let version = parse_version(version)?;
    let requirement = parse_requirement(requirement)?;
    Ok(requirement.matches(&version))
}

fn pad_version(input: &str) -> String {
    let (core, rest) = match input.find(['-', '+']) {
        Some(idx) => input.split_at(idx),
        None => (input, ""),
    };
    let parts = core.split('.').count();
    match parts {
        1 => format!("{core}.0.0{rest}"),
        2 => format!("{core}.0{rest}"),
        _ => input.to_string(),
    }
}
