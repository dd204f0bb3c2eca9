//! Signed update manifest
//!
//! External wire contract: a JSON document with the target version, a
//! platform-to-URL artifact map, the artifact content hash, and a
//! base64 detached signature. The signature covers the canonical byte
//! form of the document, which is the JSON serialization of every
//! field except `signature`, in declaration order.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A fetched update manifest. Immutable once parsed; discarded after
/// staging or rejection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateManifest {
    /// Target version identifier, e.g. "1.4.2"
    pub version: String,

    /// Platform identifier -> artifact URL
    pub platforms: BTreeMap<String, String>,

    /// Hex SHA-256 of the artifact payload
    pub sha256: String,

    /// Base64 ed25519 signature over the canonical bytes
    pub signature: String,
}

/// The signed portion of the manifest. Field order here defines the
/// canonical byte form; publishers must sign exactly this layout.
#[derive(Serialize)]
struct SignedFields<'a> {
    version: &'a str,
    platforms: &'a BTreeMap<String, String>,
    sha256: &'a str,
}

impl UpdateManifest {
    /// Parse manifest bytes. No signature math happens here.
    pub fn parse(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Canonical bytes the detached signature covers
    pub fn signed_bytes(&self) -> Vec<u8> {
        let fields = SignedFields {
            version: &self.version,
            platforms: &self.platforms,
            sha256: &self.sha256,
        };
        // Serializing a struct of already-valid JSON values cannot fail
        serde_json::to_vec(&fields).unwrap_or_default()
    }

    /// Artifact URL for a platform identifier, if the manifest has one
    pub fn artifact_url(&self, platform: &str) -> Option<&str> {
        self.platforms.get(platform).map(String::as_str)
    }
}

/// Platform identifier for the running host, e.g. "linux-x86_64"
pub fn current_platform() -> String {
    format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH)
}

/// Compare dotted version strings. Fails closed: any segment that does
/// not parse as a number makes the result `false` ("no update"), never
/// "force update". Missing segments count as zero, and a leading `v`
/// is tolerated on either side.
pub fn is_newer_version(latest: &str, current: &str) -> bool {
    let parse = |v: &str| -> Option<Vec<u64>> {
        v.trim_start_matches('v')
            .split('.')
            .map(|seg| seg.parse::<u64>().ok())
            .collect()
    };

    let (latest, current) = match (parse(latest), parse(current)) {
        (Some(l), Some(c)) => (l, c),
        _ => return false,
    };

    let len = latest.len().max(current.len());
    for i in 0..len {
        let l = latest.get(i).copied().unwrap_or(0);
        let c = current.get(i).copied().unwrap_or(0);
        if l != c {
            return l > c;
        }
    }
    false
}
