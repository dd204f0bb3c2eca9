//! Artifact and manifest downloading with mirror fallback
//!
//! Endpoints are tried strictly in listed order; the first complete,
//! hash-matching payload wins and no endpoint is tried twice within
//! one call. Artifact bodies stream into a named temp file, hashed
//! incrementally, so a multi-hundred-megabyte download never lives in
//! memory. If the fetch fails or its future is dropped (cancellation),
//! the temp file handle goes with it and the partial download is
//! unlinked.

use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::Path;
use std::time::Duration;
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("all {attempts} endpoints exhausted")]
    AllEndpointsExhausted { attempts: usize },
}

/// Why one endpoint was skipped; drives the advance to the next mirror
#[derive(Debug, Error)]
enum EndpointError {
    #[error("http status {0}")]
    Status(u16),

    #[error("transfer failed: {0}")]
    Transfer(#[from] reqwest::Error),

    #[error("truncated body: expected {expected} bytes, got {got}")]
    Truncated { expected: u64, got: u64 },

    #[error("hash mismatch: expected {expected}, got {got}")]
    HashMismatch { expected: String, got: String },

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// A complete, hash-verified download. Owns its temp file until handed
/// off as a staged update.
pub struct Artifact {
    pub file: NamedTempFile,
    pub sha256: String,
    pub len: u64,
}

/// Downloads manifests and artifacts from a ranked mirror list
pub struct ArtifactFetcher {
    client: reqwest::Client,
}

impl ArtifactFetcher {
    pub fn new(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .user_agent(format!("Warden/{}", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self { client }
    }

    /// Fetch the raw manifest document from the first endpoint that
    /// answers with a 2xx body.
    pub async fn fetch_manifest_bytes(&self, endpoints: &[String]) -> Result<Vec<u8>, FetchError> {
        for url in endpoints {
            match self.try_manifest(url).await {
                Ok(bytes) => {
                    debug!("manifest fetched from {url} ({} bytes)", bytes.len());
                    return Ok(bytes);
                }
                Err(e) => warn!("manifest endpoint {url} failed: {e}"),
            }
        }
        Err(FetchError::AllEndpointsExhausted {
            attempts: endpoints.len(),
        })
    }

    async fn try_manifest(&self, url: &str) -> Result<Vec<u8>, EndpointError> {
        let resp = self.client.get(url).send().await?;
        if !resp.status().is_success() {
            return Err(EndpointError::Status(resp.status().as_u16()));
        }
        Ok(resp.bytes().await?.to_vec())
    }

    /// Download an artifact, trying each URL once in order until one
    /// yields a complete payload whose SHA-256 matches `expected_sha256`.
    /// `on_progress` is called with a 0..=100 percentage when the
    /// server advertises a content length.
    pub async fn fetch(
        &self,
        urls: &[String],
        expected_sha256: &str,
        staging_dir: &Path,
        mut on_progress: impl FnMut(u8),
    ) -> Result<Artifact, FetchError> {
        for url in urls {
            match self
                .try_endpoint(url, expected_sha256, staging_dir, &mut on_progress)
                .await
            {
                Ok(artifact) => {
                    info!("artifact fetched from {url} ({} bytes)", artifact.len);
                    return Ok(artifact);
                }
                // Non-2xx, truncated transfer, and hash mismatch all
                // count as this endpoint's failure; move on
                Err(e) => warn!("artifact endpoint {url} failed: {e}"),
            }
        }
        Err(FetchError::AllEndpointsExhausted {
            attempts: urls.len(),
        })
    }

    async fn try_endpoint(
        &self,
        url: &str,
        expected_sha256: &str,
        staging_dir: &Path,
        on_progress: &mut impl FnMut(u8),
    ) -> Result<Artifact, EndpointError> {
        let mut resp = self.client.get(url).send().await?;
        if !resp.status().is_success() {
            return Err(EndpointError::Status(resp.status().as_u16()));
        }

        let total = resp.content_length();
        let mut file = NamedTempFile::new_in(staging_dir)?;
        let mut hasher = Sha256::new();
        let mut written: u64 = 0;
        let mut last_percent: u8 = 0;

        while let Some(chunk) = resp.chunk().await? {
            hasher.update(&chunk);
            file.as_file_mut().write_all(&chunk)?;
            written += chunk.len() as u64;

            if let Some(total) = total.filter(|t| *t > 0) {
                let percent = ((written * 100) / total).min(100) as u8;
                if percent != last_percent {
                    last_percent = percent;
                    on_progress(percent);
                }
            }
        }

        // reqwest surfaces most truncations as transfer errors; a short
        // body under an honest content-length lands here
        if let Some(total) = total {
            if written != total {
                return Err(EndpointError::Truncated {
                    expected: total,
                    got: written,
                });
            }
        }

        file.as_file_mut().flush()?;

        let got = hex::encode(hasher.finalize());
        if !got.eq_ignore_ascii_case(expected_sha256) {
            return Err(EndpointError::HashMismatch {
                expected: expected_sha256.to_string(),
                got,
            });
        }

        Ok(Artifact {
            file,
            sha256: got,
            len: written,
        })
    }
}
