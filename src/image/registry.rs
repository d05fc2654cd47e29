//! Docker Registry HTTP API V2 client

use crate::image::auth::Authenticator;
use crate::image::oci::{
    media_types, select_platform, short_digest, ImageIndex, ImageManifest, ImageReference,
    Platform,
};
use crate::image::progress::{BlobProgress, StepCounter};
use crate::image::pull::PullOptions;
use crate::image::transport::Transport;
use crate::{PullError, Result};
use futures_util::{stream, StreamExt};
use reqwest::header::HeaderMap;
use reqwest::{Response, StatusCode};
use serde_json::Value;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::io::{InspectReader, StreamReader};
use tracing::{debug, info, warn};

/// Longest slice of an error body echoed into a diagnostic
const BODY_SNIPPET: usize = 512;

/// Registry session for one image: transport, endpoint and token minting
pub struct RegistryClient {
    transport: Transport,
    endpoint: String,
    reference: ImageReference,
    auth: Authenticator,
}

impl RegistryClient {
    /// Probe the registry and set up authentication for `reference`
    pub async fn connect(reference: &ImageReference, options: &PullOptions) -> Result<Self> {
        let transport = Transport::new(options)?;
        let endpoint = options
            .registry_url
            .clone()
            .unwrap_or_else(|| reference.registry_url())
            .trim_end_matches('/')
            .to_string();
        let auth = Authenticator::probe(&transport, &endpoint, &reference.repository).await?;

        Ok(Self::with_parts(transport, endpoint, reference.clone(), auth))
    }

    /// Assemble a client from already negotiated parts
    pub fn with_parts(
        transport: Transport,
        endpoint: String,
        reference: ImageReference,
        auth: Authenticator,
    ) -> Self {
        Self {
            transport,
            endpoint,
            reference,
            auth,
        }
    }

    fn manifest_url(&self, reference: &str) -> String {
        format!(
            "{}/v2/{}/manifests/{}",
            self.endpoint, self.reference.repository, reference
        )
    }

    fn blob_url(&self, digest: &str) -> String {
        format!(
            "{}/v2/{}/blobs/{}",
            self.endpoint, self.reference.repository, digest
        )
    }

    /// Fetch the image manifest, resolving manifest lists for `platform`
    pub async fn fetch_manifest(&self, platform: &Platform) -> Result<ImageManifest> {
        info!("Trying to fetch manifest for {}", self.reference.repository);

        let mut json = self
            .manifest_json(self.reference.reference(), &media_types::manifest_or_list())
            .await?;

        if json.get("manifests").is_some() {
            let index: ImageIndex = serde_json::from_value(json).map_err(|e| {
                PullError::Manifest(format!("Failed to parse manifest list: {}", e))
            })?;

            info!("This is a multi-arch image. Available platforms:");
            for m in &index.manifests {
                match &m.platform {
                    Some(p) => info!("    - {} ({})", p, m.digest),
                    None => info!("    - unknown ({})", m.digest),
                }
            }

            let selected = select_platform(&index.manifests, platform).ok_or_else(|| {
                PullError::Manifest("Manifest list has no entries".to_string())
            })?;
            let selected_platform = selected
                .platform
                .as_ref()
                .map(|p| p.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            if selected
                .platform
                .as_ref()
                .map_or(true, |p| !p.matches(&platform.os, &platform.architecture))
            {
                warn!(
                    "No manifest for {}, falling back to {}",
                    platform, selected_platform
                );
            }
            info!("Selected platform: {}", selected_platform);

            json = self
                .manifest_json(&selected.digest, &media_types::single_manifest())
                .await?;
        }

        parse_manifest(json)
    }

    /// GET a manifest document with a fresh token
    async fn manifest_json(&self, reference: &str, accept: &str) -> Result<Value> {
        let headers = self.auth.mint(&self.transport, accept).await?;
        let url = self.manifest_url(reference);
        let response = self.transport.get(&url, &headers).await?;

        debug!("Response headers: {:?}", response.headers());
        if response.status() != StatusCode::OK {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(PullError::Manifest(format!(
                "Cannot fetch manifest for {} [HTTP {}]: {}",
                self.reference.repository,
                status,
                snippet(&body)
            )));
        }

        if let Some(content_type) = response.headers().get(reqwest::header::CONTENT_TYPE) {
            debug!("Content type: {:?}", content_type);
        }

        let body = response.bytes().await?;
        serde_json::from_slice(&body).map_err(|e| {
            PullError::Manifest(format!(
                "Manifest for {} is not valid JSON: {}",
                self.reference.repository, e
            ))
        })
    }

    /// Stream a blob into `sink`, trying foreign `urls` if the registry refuses it
    ///
    /// Returns the number of bytes written.
    pub async fn fetch_blob<W>(
        &self,
        digest: &str,
        urls: &[String],
        sink: &mut W,
        progress: &mut dyn BlobProgress,
    ) -> Result<u64>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let headers = self.auth.mint(&self.transport, "").await?;
        let response = self
            .transport
            .get_stream(&self.blob_url(digest), &headers)
            .await?;

        let response = if response.status().is_success() {
            response
        } else {
            self.fetch_foreign(digest, urls, response.status()).await?
        };

        stream_body(response, sink, progress, self.transport.timeout())
            .await
            .map_err(|e| match e {
                PullError::Connection(msg) => {
                    PullError::Connection(format!("Blob {}: {}", short_digest(digest), msg))
                }
                other => other,
            })
    }

    async fn fetch_foreign(
        &self,
        digest: &str,
        urls: &[String],
        mut status: StatusCode,
    ) -> Result<Response> {
        debug!(
            "Blob {} not served by the registry [HTTP {}], trying {} foreign url(s)",
            short_digest(digest),
            status,
            urls.len()
        );

        // Registry tokens are not sent to third-party hosts
        for url in urls {
            match self.transport.get_stream(url, &HeaderMap::new()).await {
                Ok(response) if response.status().is_success() => {
                    info!("Found blob {} at foreign url {}", short_digest(digest), url);
                    return Ok(response);
                }
                Ok(response) => {
                    status = response.status();
                    debug!("Foreign url {} returned {}", url, status);
                }
                Err(e) => warn!("Foreign url {} failed: {}", url, e),
            }
        }

        Err(PullError::Blob {
            digest: digest.to_string(),
            status: status.as_u16(),
        })
    }
}

/// Check the required keys and decode a concrete manifest
pub fn parse_manifest(json: Value) -> Result<ImageManifest> {
    let obj = json
        .as_object()
        .ok_or_else(|| PullError::Manifest("Manifest is not a JSON object".to_string()))?;

    for key in ["layers", "config"] {
        if !obj.contains_key(key) {
            let keys: Vec<&str> = obj.keys().map(String::as_str).collect();
            return Err(PullError::Manifest(format!(
                "No {} found in manifest (available keys: {})",
                key,
                keys.join(", ")
            )));
        }
    }

    serde_json::from_value(json)
        .map_err(|e| PullError::Manifest(format!("Failed to parse manifest: {}", e)))
}

/// Copy a response body into `sink`, failing when no data arrives for `idle`
async fn stream_body<W>(
    response: Response,
    sink: &mut W,
    progress: &mut dyn BlobProgress,
    idle: Duration,
) -> Result<u64>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut counter = StepCounter::new(response.content_length());
    progress.start(counter.total());

    let body = Box::pin(response.bytes_stream());
    let stream = stream::try_unfold(body, move |mut body| async move {
        match tokio::time::timeout(idle, body.next()).await {
            Ok(Some(chunk)) => chunk
                .map(|chunk| Some((chunk, body)))
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e)),
            Ok(None) => Ok(None),
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("no data received for {}s", idle.as_secs_f32()),
            )),
        }
    });
    let mut reader = InspectReader::new(StreamReader::new(Box::pin(stream)), |chunk: &[u8]| {
        match counter.record(chunk.len() as u64) {
            Some(steps) => progress.update(steps),
            None if counter.is_indeterminate() => progress.tick(),
            None => {}
        }
    });

    let written = tokio::io::copy(&mut reader, sink)
        .await
        .map_err(|e| match e.kind() {
            io::ErrorKind::TimedOut => PullError::Connection(e.to_string()),
            _ => PullError::Io(e),
        })?;
    sink.flush().await?;
    Ok(written)
}

fn snippet(body: &str) -> &str {
    match body.char_indices().nth(BODY_SNIPPET) {
        Some((end, _)) => &body[..end],
        None => body,
    }
}
