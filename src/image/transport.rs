//! HTTP plumbing shared by every registry call

use crate::image::pull::PullOptions;
use crate::{PullError, Result, APP_NAME, VERSION};
use reqwest::header::HeaderMap;
use reqwest::{Response, StatusCode};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Statuses the registry may return transiently
const RETRY_STATUSES: &[StatusCode] = &[
    StatusCode::TOO_MANY_REQUESTS,
    StatusCode::INTERNAL_SERVER_ERROR,
    StatusCode::BAD_GATEWAY,
    StatusCode::SERVICE_UNAVAILABLE,
    StatusCode::GATEWAY_TIMEOUT,
];

const PROXY_VARS: &[&str] = &["HTTP_PROXY", "http_proxy", "HTTPS_PROXY", "https_proxy"];

/// Pooled HTTP client with the retry policy applied to every GET
#[derive(Debug, Clone)]
pub struct Transport {
    client: reqwest::Client,
    retries: u32,
    backoff: Duration,
    timeout: Duration,
}

impl Transport {
    /// Create a transport from pull options
    pub fn new(options: &PullOptions) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .user_agent(format!("{}/{}", APP_NAME, VERSION))
            .connect_timeout(options.timeout);

        if options.insecure {
            warn!("TLS certificate verification is disabled");
            builder = builder.danger_accept_invalid_certs(true);
        }

        if options.no_proxy {
            builder = builder.no_proxy();
        } else if PROXY_VARS.iter().any(|v| std::env::var_os(v).is_some()) {
            info!("Using proxy settings from environment");
        }

        let client = builder.build()?;

        Ok(Self {
            client,
            retries: options.retries,
            backoff: options.backoff,
            timeout: options.timeout,
        })
    }

    /// Deadline for one request, or for one read of a streamed body
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// GET a small document, bounded by the per-request deadline
    pub async fn get(&self, url: &str, headers: &HeaderMap) -> Result<Response> {
        self.send(url, headers, Some(self.timeout)).await
    }

    /// GET a blob whose body is streamed
    ///
    /// Only the response headers are bounded here; body reads are bounded by
    /// the caller so large blobs are not cut off.
    pub async fn get_stream(&self, url: &str, headers: &HeaderMap) -> Result<Response> {
        self.send(url, headers, None).await
    }

    async fn send(
        &self,
        url: &str,
        headers: &HeaderMap,
        timeout: Option<Duration>,
    ) -> Result<Response> {
        let mut attempt = 0;
        loop {
            let mut request = self.client.get(url).headers(headers.clone());
            if let Some(timeout) = timeout {
                request = request.timeout(timeout);
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    debug!("GET {} -> {}", url, status);
                    if attempt < self.retries && RETRY_STATUSES.contains(&status) {
                        warn!("GET {} returned {}, retrying", url, status);
                    } else {
                        return Ok(response);
                    }
                }
                Err(e) if attempt < self.retries && !e.is_builder() => {
                    warn!("GET {} failed: {}, retrying", url, e);
                }
                Err(e) => return Err(connection_error(url, e)),
            }

            tokio::time::sleep(self.backoff * 2u32.pow(attempt)).await;
            attempt += 1;
        }
    }
}

fn connection_error(url: &str, e: reqwest::Error) -> PullError {
    PullError::Connection(format!("{}: {}", url, e))
}
