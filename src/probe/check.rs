//! Single liveness check against an instance's health endpoint.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Url};

use crate::error::ProbeError;
use crate::image::ImageManifest;

/// Result of one probe attempt.
///
/// A check passes when the request completes without a transport-level error;
/// the HTTP status is recorded but any received response counts as reachable.
/// Status-code policy belongs to the endpoint's own semantics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// A response was received
    Pass { status: u16 },
    /// Transport-level failure: connection refused, timeout, DNS
    Fail { reason: String },
}

impl ProbeOutcome {
    pub fn is_pass(&self) -> bool {
        matches!(self, ProbeOutcome::Pass { .. })
    }
}

/// Issues liveness checks. The supervisor only sees outcomes, so probing can
/// be scripted in tests.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn check(&self) -> ProbeOutcome;
}

/// HTTP prober targeting `http://localhost:<port><path>` from inside the
/// running instance's network namespace.
pub struct HttpProber {
    client: Client,
    url: Url,
}

impl HttpProber {
    pub fn new(port: u16, path: &str, timeout: Duration) -> Result<Self, ProbeError> {
        let raw = format!("http://localhost:{}{}", port, path);
        let url = Url::parse(&raw).map_err(|e| ProbeError::InvalidTarget {
            url: raw,
            reason: e.to_string(),
        })?;

        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self { client, url })
    }

    /// Prober configured from an image manifest's health-check declaration.
    pub fn for_manifest(manifest: &ImageManifest) -> Result<Self, ProbeError> {
        Self::new(
            manifest.exposed_port,
            &manifest.healthcheck.path,
            Duration::from_secs(manifest.healthcheck.timeout_seconds),
        )
    }

    pub fn url(&self) -> &str {
        self.url.as_str()
    }
}

#[async_trait]
impl Prober for HttpProber {
    async fn check(&self) -> ProbeOutcome {
        match self.client.get(self.url.clone()).send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                tracing::debug!(url = %self.url, status, "Probe completed");
                ProbeOutcome::Pass { status }
            }
            Err(e) => {
                // without_url keeps the reason stable for logs and thresholds
                let reason = e.without_url().to_string();
                tracing::debug!(url = %self.url, reason = %reason, "Probe failed");
                ProbeOutcome::Fail { reason }
            }
        }
    }
}
