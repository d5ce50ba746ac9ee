//! Semver comparison helpers used for unit-config and update-item
//! versions. Full semver ordering including pre-release tags.

use std::cmp::Ordering;

use semver::Version;
use thiserror::Error;

/// Version string failed to parse as semver.
#[derive(Debug, Error)]
#[error("invalid version {0:?}: {1}")]
pub struct VersionError(pub String, #[source] pub semver::Error);

/// Compare two semver strings.
pub fn compare(a: &str, b: &str) -> Result<Ordering, VersionError> {
    let a = Version::parse(a).map_err(|e| VersionError(a.to_string(), e))?;
    let b = Version::parse(b).map_err(|e| VersionError(b.to_string(), e))?;
    Ok(a.cmp(&b))
}
