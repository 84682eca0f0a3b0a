//! Update Manifest
//!
//! The manifest is the catalog's single source of truth: per module it names
//! the latest version, the expected SHA-256 of the artifact, its size and an
//! optional signature. Verification inputs come from here and nowhere else;
//! metadata files that ship next to an artifact are never consulted.

use std::collections::BTreeMap;

use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::version::SemVer;

/// Longest accepted module name, in bytes.
pub const MAX_MODULE_NAME_LEN: usize = 31;

/// Errors raised while parsing or validating a manifest document.
#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("manifest is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("manifest has no module map")]
    NoModuleMap,
    #[error("module {module}: invalid name")]
    InvalidName { module: String },
    #[error("module {module}: bad version {version:?}")]
    BadVersion { module: String, version: String },
    #[error("module {module}: sha256 is not 64 hex characters")]
    BadDigest { module: String },
    #[error("module {module}: signature is not valid base64")]
    BadSignature { module: String },
}

/// Update priority. Higher priorities drain first; critical updates may
/// bypass the host's safe-window gate if the host policy permits it.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Hash,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    Critical,
}

/// A validated manifest entry for one module.
#[derive(Debug, Clone)]
pub struct ManifestEntry {
    pub latest_version: SemVer,
    pub sha256: [u8; 32],
    pub file_size: u64,
    pub signature: Option<Vec<u8>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub priority: Priority,
}

/// The wire shape of one entry, before validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawEntry {
    latest_version: String,
    sha256: String,
    file_size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    priority: Option<Priority>,
}

/// A validated manifest document.
#[derive(Debug, Clone, Default)]
pub struct Manifest {
    pub modules: BTreeMap<String, ManifestEntry>,
}

impl Manifest {
    /// Parse a manifest from raw bytes.
    ///
    /// Accepts both the current shape (`{"modules": {name: entry, ...}}`)
    /// and the legacy flat shape (`{name: entry, ...}`).
    pub fn parse(bytes: &[u8]) -> Result<Self, ManifestError> {
        let value: serde_json::Value = serde_json::from_slice(bytes)?;
        let serde_json::Value::Object(mut doc) = value else {
            return Err(ManifestError::NoModuleMap);
        };
        let map = match doc.remove("modules") {
            Some(modules) => modules,
            None => serde_json::Value::Object(doc),
        };
        let raw: BTreeMap<String, RawEntry> = serde_json::from_value(map)?;

        let mut modules = BTreeMap::new();
        for (name, entry) in raw {
            if !valid_module_name(&name) {
                return Err(ManifestError::InvalidName { module: name });
            }
            modules.insert(name.clone(), validate_entry(&name, entry)?);
        }
        Ok(Self { modules })
    }

    pub fn get(&self, name: &str) -> Option<&ManifestEntry> {
        self.modules.get(name)
    }
}

fn validate_entry(name: &str, raw: RawEntry) -> Result<ManifestEntry, ManifestError> {
    let latest_version =
        SemVer::parse(&raw.latest_version).ok_or_else(|| ManifestError::BadVersion {
            module: name.to_string(),
            version: raw.latest_version.clone(),
        })?;

    let mut sha256 = [0u8; 32];
    let decoded = hex::decode(&raw.sha256).map_err(|_| ManifestError::BadDigest {
        module: name.to_string(),
    })?;
    if decoded.len() != 32 {
        return Err(ManifestError::BadDigest {
            module: name.to_string(),
        });
    }
    sha256.copy_from_slice(&decoded);

    let signature = match raw.signature {
        Some(b64) => Some(
            base64::engine::general_purpose::STANDARD
                .decode(b64.as_bytes())
                .map_err(|_| ManifestError::BadSignature {
                    module: name.to_string(),
                })?,
        ),
        None => None,
    };

    Ok(ManifestEntry {
        latest_version,
        sha256,
        file_size: raw.file_size,
        signature,
        updated_at: raw.updated_at,
        priority: raw.priority.unwrap_or_default(),
    })
}

/// Module names are short ASCII: `[A-Za-z0-9_-]+`, at most 31 bytes.
///
/// The same check guards staging paths, so a manifest can never name a
/// module that escapes the store's directory.
pub fn valid_module_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_MODULE_NAME_LEN
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

/// Catalog path of the immutable artifact for a specific version:
/// `<name>/<name>-v<MAJOR.MINOR.PATCH>.bin`.
pub fn artifact_path(name: &str, version: SemVer) -> String {
    format!("{name}/{name}-v{version}.bin")
}

/// Catalog path of the mutable latest pointer, used only when the manifest
/// does not yet list the module.
pub fn latest_artifact_path(name: &str) -> String {
    format!("{name}/latest.bin")
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIGEST_HEX: &str = "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

    fn nested_doc() -> String {
        format!(
            r#"{{"modules": {{
                "sg": {{"latest_version": "v1.1.0", "sha256": "{DIGEST_HEX}",
                         "file_size": 1024, "priority": "critical",
                         "updated_at": "2026-03-01T12:00:00Z"}},
                "ds": {{"latest_version": "1.0.0", "sha256": "{DIGEST_HEX}",
                         "file_size": 2048}}
            }}}}"#
        )
    }

    #[test]
    fn test_parse_nested_shape() {
        let manifest = Manifest::parse(nested_doc().as_bytes()).unwrap();
        assert_eq!(manifest.modules.len(), 2);

        let sg = manifest.get("sg").unwrap();
        assert_eq!(sg.latest_version, SemVer::new(1, 1, 0));
        assert_eq!(sg.priority, Priority::Critical);
        assert_eq!(hex::encode(sg.sha256), DIGEST_HEX);
        assert!(sg.updated_at.is_some());

        let ds = manifest.get("ds").unwrap();
        assert_eq!(ds.priority, Priority::Normal);
        assert_eq!(ds.file_size, 2048);
        assert!(ds.signature.is_none());
    }

    #[test]
    fn test_parse_legacy_flat_shape() {
        let doc = format!(
            r#"{{"sg": {{"latest_version": "v2.0.0", "sha256": "{DIGEST_HEX}", "file_size": 10}}}}"#
        );
        let manifest = Manifest::parse(doc.as_bytes()).unwrap();
        assert_eq!(
            manifest.get("sg").unwrap().latest_version,
            SemVer::new(2, 0, 0)
        );
    }

    #[test]
    fn test_signature_decoded_from_base64() {
        let doc = format!(
            r#"{{"sg": {{"latest_version": "1.0.0", "sha256": "{DIGEST_HEX}",
                          "file_size": 10, "signature": "AAEC"}}}}"#
        );
        let manifest = Manifest::parse(doc.as_bytes()).unwrap();
        assert_eq!(
            manifest.get("sg").unwrap().signature.as_deref(),
            Some(&[0u8, 1, 2][..])
        );
    }

    #[test]
    fn test_rejects_bad_version_and_digest() {
        let doc = format!(
            r#"{{"sg": {{"latest_version": "1.0", "sha256": "{DIGEST_HEX}", "file_size": 10}}}}"#
        );
        assert!(matches!(
            Manifest::parse(doc.as_bytes()),
            Err(ManifestError::BadVersion { .. })
        ));

        let doc = r#"{"sg": {"latest_version": "1.0.0", "sha256": "abcd", "file_size": 10}}"#;
        assert!(matches!(
            Manifest::parse(doc.as_bytes()),
            Err(ManifestError::BadDigest { .. })
        ));
    }

    #[test]
    fn test_rejects_bad_names() {
        let doc = format!(
            r#"{{"../etc": {{"latest_version": "1.0.0", "sha256": "{DIGEST_HEX}", "file_size": 1}}}}"#
        );
        assert!(matches!(
            Manifest::parse(doc.as_bytes()),
            Err(ManifestError::InvalidName { .. })
        ));
    }

    #[test]
    fn test_module_name_grammar() {
        assert!(valid_module_name("speed_governor"));
        assert!(valid_module_name("ds-2"));
        assert!(!valid_module_name(""));
        assert!(!valid_module_name("a/b"));
        assert!(!valid_module_name("a.b"));
        assert!(!valid_module_name(&"x".repeat(32)));
        assert!(valid_module_name(&"x".repeat(31)));
    }

    #[test]
    fn test_artifact_paths() {
        assert_eq!(
            artifact_path("sg", SemVer::new(1, 2, 3)),
            "sg/sg-v1.2.3.bin"
        );
        assert_eq!(latest_artifact_path("sg"), "sg/latest.bin");
    }
}
