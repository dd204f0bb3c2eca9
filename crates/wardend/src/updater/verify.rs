//! Manifest signature verification
//!
//! Pure and deterministic: same bytes, signature, and key always give
//! the same answer. Malformed input is rejected before any signature
//! math runs, so attacker-controlled bytes never reach the verifier.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use ed25519_dalek::{Signature, VerifyingKey};
use thiserror::Error;
use warden_common::manifest::UpdateManifest;

/// A manifest that failed verification is never retried; a fresh check
/// may legitimately fetch a different manifest later.
#[derive(Debug, Error)]
pub enum VerifyError {
    /// The bytes are not a well-formed manifest
    #[error("malformed manifest: {0}")]
    Malformed(String),

    /// The signature does not match the canonical bytes under our key
    #[error("manifest signature mismatch")]
    BadSignature,
}

/// Process-wide manifest signing key; built once at startup from the
/// configured hex string and never mutated.
#[derive(Debug, Clone)]
pub struct SignaturePublicKey(VerifyingKey);

impl SignaturePublicKey {
    pub fn from_hex(hex_key: &str) -> anyhow::Result<Self> {
        let bytes = hex::decode(hex_key)?;
        let bytes: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| anyhow::anyhow!("public key must be 32 bytes, got {}", bytes.len()))?;
        let key = VerifyingKey::from_bytes(&bytes)?;
        Ok(Self(key))
    }
}

/// Parse and verify manifest bytes against the embedded public key.
/// Only a successfully verified manifest may trigger any download.
pub fn verify(
    manifest_bytes: &[u8],
    key: &SignaturePublicKey,
) -> Result<UpdateManifest, VerifyError> {
    let manifest = UpdateManifest::parse(manifest_bytes)
        .map_err(|e| VerifyError::Malformed(e.to_string()))?;

    let sig_bytes = BASE64
        .decode(&manifest.signature)
        .map_err(|e| VerifyError::Malformed(format!("signature not base64: {e}")))?;
    let signature = Signature::from_slice(&sig_bytes)
        .map_err(|_| VerifyError::Malformed("signature has wrong length".to_string()))?;

    key.0
        .verify_strict(&manifest.signed_bytes(), &signature)
        .map_err(|_| VerifyError::BadSignature)?;

    Ok(manifest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signer, SigningKey};
    use std::collections::BTreeMap;

    fn signed_manifest() -> (Vec<u8>, SignaturePublicKey) {
        let signing = SigningKey::from_bytes(&[7u8; 32]);
        let key = SignaturePublicKey(signing.verifying_key());

        let mut platforms = BTreeMap::new();
        platforms.insert(
            "linux-x86_64".to_string(),
            "https://example.org/app-2.0.0".to_string(),
        );
        let mut manifest = UpdateManifest {
            version: "2.0.0".to_string(),
            platforms,
            sha256: "cd".repeat(32),
            signature: String::new(),
        };
        let sig = signing.sign(&manifest.signed_bytes());
        manifest.signature = BASE64.encode(sig.to_bytes());

        (serde_json::to_vec(&manifest).unwrap(), key)
    }

    #[test]
    fn test_valid_manifest_verifies() {
        let (bytes, key) = signed_manifest();
        let manifest = verify(&bytes, &key).unwrap();
        assert_eq!(manifest.version, "2.0.0");
    }

    #[test]
    fn test_verification_is_deterministic() {
        let (bytes, key) = signed_manifest();
        for _ in 0..3 {
            assert!(verify(&bytes, &key).is_ok());
        }
    }

    #[test]
    fn test_any_flipped_signature_byte_fails() {
        let (bytes, key) = signed_manifest();
        let manifest = UpdateManifest::parse(&bytes).unwrap();
        let sig = BASE64.decode(&manifest.signature).unwrap();

        for i in 0..sig.len() {
            let mut tampered_sig = sig.clone();
            tampered_sig[i] ^= 0x01;
            let mut tampered = manifest.clone();
            tampered.signature = BASE64.encode(&tampered_sig);
            let tampered_bytes = serde_json::to_vec(&tampered).unwrap();
            assert!(
                matches!(verify(&tampered_bytes, &key), Err(VerifyError::BadSignature)),
                "flip at byte {i} went undetected"
            );
        }
    }

    #[test]
    fn test_tampered_content_fails() {
        let (bytes, key) = signed_manifest();
        let mut manifest = UpdateManifest::parse(&bytes).unwrap();
        manifest.version = "9.9.9".to_string();
        let tampered = serde_json::to_vec(&manifest).unwrap();
        assert!(matches!(verify(&tampered, &key), Err(VerifyError::BadSignature)));
    }

    #[test]
    fn test_malformed_never_reaches_signature_math() {
        let (_, key) = signed_manifest();
        assert!(matches!(
            verify(b"{ not json", &key),
            Err(VerifyError::Malformed(_))
        ));
        assert!(matches!(
            verify(b"{\"version\":\"1.0\"}", &key),
            Err(VerifyError::Malformed(_))
        ));

        // Well-formed manifest with a non-base64 signature
        let (bytes, _) = signed_manifest();
        let mut manifest = UpdateManifest::parse(&bytes).unwrap();
        manifest.signature = "!!! not base64 !!!".to_string();
        let bad = serde_json::to_vec(&manifest).unwrap();
        assert!(matches!(verify(&bad, &key), Err(VerifyError::Malformed(_))));
    }
}
