//! Semantic Versions
//!
//! Module versions are `MAJOR.MINOR.PATCH` triples compared component-wise.
//! Strings outside that grammar are treated as unknown: an unknown version
//! never equals a valid triple and is never offered as an upgrade target,
//! but any valid manifest version supersedes it.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error for version strings outside the `MAJOR.MINOR.PATCH` grammar.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid semantic version: {0:?}")]
pub struct InvalidVersion(pub String);

/// A `MAJOR.MINOR.PATCH` triple. Ordering is component-wise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SemVer {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl SemVer {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// The baseline version assumed for modules the device has never seen.
    pub const BASELINE: Self = Self::new(0, 0, 0);

    /// Parse a version string, tolerating a single leading `v`.
    ///
    /// Returns `None` for anything outside the strict triple grammar; the
    /// caller decides whether that means "unknown" or a hard error.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.strip_prefix('v').unwrap_or(s);
        let mut parts = s.split('.');
        let major = parse_component(parts.next()?)?;
        let minor = parse_component(parts.next()?)?;
        let patch = parse_component(parts.next()?)?;
        if parts.next().is_some() {
            return None;
        }
        Some(Self::new(major, minor, patch))
    }
}

fn parse_component(s: &str) -> Option<u32> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

impl fmt::Display for SemVer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for SemVer {
    type Err = InvalidVersion;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| InvalidVersion(s.to_string()))
    }
}

impl Serialize for SemVer {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SemVer {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// True when `latest` should be installed over the currently tracked version.
///
/// `None` means the tracked version is unknown (or the module is untracked);
/// any valid manifest version supersedes it.
pub fn is_upgrade(current: Option<SemVer>, latest: SemVer) -> bool {
    match current {
        Some(current) => latest > current,
        None => true,
    }
}

/// In-memory mapping from module name to the currently active version.
///
/// Mutated only by the orchestrator as the last step of a successful
/// (re)load; read by the host's version query.
#[derive(Debug, Default)]
pub struct VersionTracker {
    versions: BTreeMap<String, Option<SemVer>>,
}

impl VersionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the active version for a module. `None` records a module that
    /// is loaded but reports a version outside the triple grammar.
    pub fn set(&mut self, name: &str, version: Option<SemVer>) {
        self.versions.insert(name.to_string(), version);
    }

    /// Forget a module entirely (it is no longer loaded).
    pub fn remove(&mut self, name: &str) {
        self.versions.remove(name);
    }

    /// The tracked version, if the module is tracked and the version parsed.
    pub fn get(&self, name: &str) -> Option<SemVer> {
        self.versions.get(name).copied().flatten()
    }

    /// Whether the module is tracked at all (even with an unknown version).
    pub fn is_tracked(&self, name: &str) -> bool {
        self.versions.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.versions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<SemVer>)> {
        self.versions.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_and_prefixed() {
        assert_eq!(SemVer::parse("1.2.3"), Some(SemVer::new(1, 2, 3)));
        assert_eq!(SemVer::parse("v1.2.3"), Some(SemVer::new(1, 2, 3)));
        assert_eq!(SemVer::parse("0.0.0"), Some(SemVer::BASELINE));
    }

    #[test]
    fn test_parse_rejects_bad_grammar() {
        assert_eq!(SemVer::parse(""), None);
        assert_eq!(SemVer::parse("1.2"), None);
        assert_eq!(SemVer::parse("1.2.3.4"), None);
        assert_eq!(SemVer::parse("1.2.x"), None);
        assert_eq!(SemVer::parse("1..3"), None);
        assert_eq!(SemVer::parse("-1.2.3"), None);
        assert_eq!(SemVer::parse("vv1.2.3"), None);
    }

    #[test]
    fn test_ordering_is_componentwise() {
        assert!(SemVer::new(0, 2, 0) > SemVer::new(0, 1, 9));
        assert!(SemVer::new(1, 0, 0) > SemVer::new(0, 9, 9));
        assert!(SemVer::new(0, 1, 1) > SemVer::new(0, 1, 0));
        assert!(SemVer::new(0, 10, 0) > SemVer::new(0, 9, 0));
        assert_eq!(SemVer::new(1, 2, 3), SemVer::new(1, 2, 3));
    }

    #[test]
    fn test_upgrade_rules() {
        let v1 = SemVer::new(1, 0, 0);
        let v11 = SemVer::new(1, 1, 0);
        assert!(is_upgrade(Some(v1), v11));
        assert!(!is_upgrade(Some(v11), v1));
        assert!(!is_upgrade(Some(v1), v1));
        // unknown tracked version: any valid manifest version supersedes it
        assert!(is_upgrade(None, v1));
    }

    #[test]
    fn test_tracker_roundtrip() {
        let mut tracker = VersionTracker::new();
        assert!(!tracker.is_tracked("sg"));

        tracker.set("sg", Some(SemVer::new(1, 0, 0)));
        assert_eq!(tracker.get("sg"), Some(SemVer::new(1, 0, 0)));
        assert!(tracker.is_tracked("sg"));

        tracker.set("ds", None);
        assert!(tracker.is_tracked("ds"));
        assert_eq!(tracker.get("ds"), None);

        tracker.remove("sg");
        assert!(!tracker.is_tracked("sg"));
    }

    #[test]
    fn test_serde_as_string() {
        let v: SemVer = serde_json::from_str("\"v2.1.0\"").unwrap();
        assert_eq!(v, SemVer::new(2, 1, 0));
        assert_eq!(serde_json::to_string(&v).unwrap(), "\"2.1.0\"");
        assert!(serde_json::from_str::<SemVer>("\"2.1\"").is_err());
    }
}
