//! Pull orchestration: manifest, config, layers, archive

use crate::image::layer::{layer_metadata, legacy_chain, LayerAssembler, LegacyLayer};
use crate::image::oci::{digest_hex, ImageReference, Platform};
use crate::image::progress::{NoProgress, ProgressFactory};
use crate::image::registry::RegistryClient;
use crate::storage::archive::ArchiveBuilder;
use crate::storage::paths::StagingTree;
use crate::{PullError, Result};
use futures_util::{stream, StreamExt, TryStreamExt};
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

/// Knobs for a pull
#[derive(Debug, Clone)]
pub struct PullOptions {
    /// Platform picked out of manifest lists
    pub platform: Platform,
    /// Directory the archive is written to
    pub output_dir: PathBuf,
    /// Registry base URL overriding the one derived from the reference
    pub registry_url: Option<String>,
    /// Accept invalid TLS certificates
    pub insecure: bool,
    /// Ignore proxy environment variables
    pub no_proxy: bool,
    /// Deadline for small requests, and connect timeout for all of them
    pub timeout: Duration,
    /// Retries on transport failures and 429/5xx responses
    pub retries: u32,
    /// First retry delay, doubled on each further attempt
    pub backoff: Duration,
    /// Layers fetched at once
    pub concurrency: usize,
}

impl Default for PullOptions {
    fn default() -> Self {
        Self {
            platform: Platform::default(),
            output_dir: PathBuf::from("."),
            registry_url: None,
            insecure: false,
            no_proxy: false,
            timeout: Duration::from_secs(30),
            retries: 3,
            backoff: Duration::from_secs(1),
            concurrency: 1,
        }
    }
}

/// What a finished pull produced
#[derive(Debug, Clone)]
pub struct PullReport {
    pub archive: PathBuf,
    pub config_digest: String,
    pub layer_ids: Vec<String>,
}

/// Pulls one image into a legacy archive
pub struct Puller<'a> {
    options: PullOptions,
    progress: &'a dyn ProgressFactory,
}

impl<'a> Puller<'a> {
    pub fn new(options: PullOptions, progress: &'a dyn ProgressFactory) -> Self {
        Self { options, progress }
    }

    /// Pull `reference` and write its archive into the output directory
    pub async fn pull(&self, reference: &ImageReference) -> Result<PullReport> {
        let client = RegistryClient::connect(reference, &self.options).await?;
        let manifest = client.fetch_manifest(&self.options.platform).await?;
        if manifest.layers.is_empty() {
            return Err(PullError::Manifest(format!(
                "Manifest for {} lists no layers",
                reference
            )));
        }

        if reference.is_digest_only() {
            warn!(
                "{} has no tag; the archive is tagged {}, which `docker load` will \
                 move off any existing image with that tag",
                reference,
                reference.repo_tag()
            );
        }

        std::fs::create_dir_all(&self.options.output_dir)?;
        let staging = StagingTree::create_in(&self.options.output_dir)?;
        let paths = staging.paths();

        let config_digest = manifest.config.digest.clone();
        let config_hex = digest_hex(&config_digest).to_string();
        let mut raw_config = Vec::new();
        client
            .fetch_blob(
                &config_digest,
                manifest.config.foreign_urls(),
                &mut raw_config,
                &mut NoProgress,
            )
            .await?;
        tokio::fs::write(paths.config_file(&config_hex), &raw_config).await?;
        let config: Value = serde_json::from_slice(&raw_config)?;

        // Ids depend only on the digest list, so the chain is known before any layer I/O
        let layers = legacy_chain(&manifest.layers);
        let metadata = layers_metadata(&layers, &config)?;
        info!(
            "Pulling {} layer(s) for {}",
            layers.len(),
            reference.repo_tag()
        );

        let assembler = LayerAssembler::new(&client, paths, self.progress);
        stream::iter(layers.iter().zip(&metadata))
            .map(|(layer, metadata)| assembler.materialize(layer, metadata))
            .buffer_unordered(self.options.concurrency.max(1))
            .try_collect::<Vec<()>>()
            .await?;

        let output = self.options.output_dir.join(reference.archive_name());
        let archive = ArchiveBuilder::new(reference, &config_hex, &layers)
            .finalize(staging, &output)
            .await?;

        Ok(PullReport {
            archive,
            config_digest,
            layer_ids: layers.into_iter().map(|l| l.id).collect(),
        })
    }
}

/// The `json` of every layer; the top one is derived from the image config
fn layers_metadata(layers: &[LegacyLayer], config: &Value) -> Result<Vec<Value>> {
    let top = layers.len().saturating_sub(1);
    layers
        .iter()
        .enumerate()
        .map(|(i, layer)| layer_metadata(layer, (i == top).then_some(config)))
        .collect()
}

/// Pull with default progress (none)
pub async fn pull(reference: &ImageReference, options: &PullOptions) -> Result<PullReport> {
    Puller::new(options.clone(), &NoProgress).pull(reference).await
}
