//! Proxied-connection latency probe
//!
//! Measures the round-trip latency of small HTTP requests routed
//! through the engine's inbound proxy port. Several samples are taken
//! and averaged; one failed sample fails the whole probe, since a
//! half-working proxy is not a working proxy.

use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info};

/// Samples averaged per measurement
const SAMPLES: u32 = 3;
/// Per-request time budget
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("invalid proxy address: {0}")]
    BadProxy(reqwest::Error),

    #[error("probe request failed: {0}")]
    Transfer(#[from] reqwest::Error),
}

/// Issues probe requests through the engine's local proxy port
pub struct LatencyProbe {
    client: reqwest::Client,
}

impl LatencyProbe {
    pub fn new(proxy_addr: &str) -> Result<Self, ProbeError> {
        let proxy =
            reqwest::Proxy::all(format!("http://{proxy_addr}")).map_err(ProbeError::BadProxy)?;
        let client = reqwest::Client::builder()
            .proxy(proxy)
            .timeout(REQUEST_TIMEOUT)
            .user_agent(format!("Warden/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(ProbeError::BadProxy)?;
        Ok(Self { client })
    }

    /// Average round-trip latency of `SAMPLES` requests to `url`,
    /// routed through the proxy. The body is drained so the sample
    /// covers the full exchange, not just the response head.
    pub async fn measure(&self, url: &str) -> Result<Duration, ProbeError> {
        let mut total = Duration::ZERO;
        for sample in 0..SAMPLES {
            let started = Instant::now();
            let resp = self.client.get(url).send().await?;
            let _ = resp.bytes().await?;
            let rtt = started.elapsed();
            debug!("latency sample {sample}: {rtt:?}");
            total += rtt;
        }
        let latency = total / SAMPLES;
        info!("proxied latency to {url}: {latency:?}");
        Ok(latency)
    }
}
