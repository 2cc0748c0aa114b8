use tokio::time::timeout;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::http::{HttpClient, HttpRequest, HttpResponse};

/// What the server told us about the resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeResult {
    /// Resource size in bytes, `0` when unknown.
    pub size: u64,
    pub accept_ranges: bool,
}

impl ProbeResult {
    pub fn unknown() -> Self {
        Self {
            size: 0,
            accept_ranges: false,
        }
    }

    pub fn is_segmentable(&self) -> bool {
        self.size > 0 && self.accept_ranges
    }
}

/// Determines size and range support with a HEAD request, then a
/// `Range: bytes=0-0` GET. Never fails: when nothing usable comes back the
/// result is [`ProbeResult::unknown`] and the transfer runs on one connection.
pub async fn probe(client: &dyn HttpClient, url: &str, config: &EngineConfig) -> ProbeResult {
    match send(client, HttpRequest::head(url).following_redirects(), config).await {
        Ok(response) => match response.content_length.filter(|len| *len > 0) {
            Some(size) => {
                debug!(url, size, "HEAD reported content length");
                return ProbeResult {
                    size,
                    accept_ranges: true,
                };
            }
            None => debug!(url, "HEAD response carried no content length"),
        },
        Err(e) => warn!(url, error = %e, "HEAD probe failed"),
    }

    let ranged = HttpRequest::get(url)
        .with_range(0, Some(0))
        .following_redirects();
    match send(client, ranged, config).await {
        Ok(response) => {
            if let Some(size) = response.content_range_total() {
                debug!(url, size, "ranged GET reported content range");
                return ProbeResult {
                    size,
                    accept_ranges: true,
                };
            }
            // The server ignored the range and is sending the whole body.
            if let Some(size) = response.content_length.filter(|len| *len > 0) {
                debug!(url, size, "ranged GET fell back to content length");
                return ProbeResult {
                    size,
                    accept_ranges: false,
                };
            }
            warn!(url, "ranged GET carried neither content range nor length");
        }
        Err(e) => warn!(url, error = %e, "ranged GET probe failed"),
    }

    warn!(url, "could not determine size, falling back to a single connection");
    ProbeResult::unknown()
}

async fn send(
    client: &dyn HttpClient,
    request: HttpRequest,
    config: &EngineConfig,
) -> Result<HttpResponse> {
    let response = timeout(config.probe_timeout, client.send(request))
        .await
        .map_err(|_| EngineError::Timeout(config.probe_timeout))??;
    if !(200..300).contains(&response.status) {
        return Err(EngineError::Status(response.status));
    }
    Ok(response)
}
