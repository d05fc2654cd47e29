//! Legacy layer identifiers and per-layer staging directories

use crate::image::oci::{short_digest, Descriptor};
use crate::image::progress::ProgressFactory;
use crate::image::registry::RegistryClient;
use crate::storage::paths::StagingPaths;
use crate::{PullError, Result, GZIP_MAGIC};
use async_compression::tokio::bufread::GzipDecoder;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use std::path::Path;
use tokio::fs::{self, File};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, info};

/// Content of every layer's `VERSION` file
pub const LAYER_VERSION: &str = "1.0";

/// A manifest layer with its legacy archive identity
#[derive(Debug, Clone)]
pub struct LegacyLayer {
    pub id: String,
    pub parent: Option<String>,
    pub descriptor: Descriptor,
}

/// Legacy id of a layer: sha256 over `parent\ndigest\n`, hex encoded
///
/// `parent` is empty for the bottom layer.
pub fn legacy_id(parent: &str, digest: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(parent.as_bytes());
    hasher.update(b"\n");
    hasher.update(digest.as_bytes());
    hasher.update(b"\n");
    hex::encode(hasher.finalize())
}

/// Chain legacy ids over the manifest layers, bottom to top
pub fn legacy_chain(layers: &[Descriptor]) -> Vec<LegacyLayer> {
    let mut parent: Option<String> = None;
    layers
        .iter()
        .map(|descriptor| {
            let id = legacy_id(parent.as_deref().unwrap_or(""), &descriptor.digest);
            LegacyLayer {
                id: id.clone(),
                parent: parent.replace(id),
                descriptor: descriptor.clone(),
            }
        })
        .collect()
}

/// Metadata of a layer that carries no image config
pub fn empty_layer_config() -> Map<String, Value> {
    let mut config = Map::new();
    config.insert(
        "created".to_string(),
        Value::String(DateTime::<Utc>::UNIX_EPOCH.to_rfc3339_opts(SecondsFormat::Secs, true)),
    );
    config.insert(
        "container_config".to_string(),
        json!({
            "Hostname": "",
            "Domainname": "",
            "User": "",
            "AttachStdin": false,
            "AttachStdout": false,
            "AttachStderr": false,
            "Tty": false,
            "OpenStdin": false,
            "StdinOnce": false,
            "Env": null,
            "Cmd": null,
            "Image": "",
            "Volumes": null,
            "WorkingDir": "",
            "Entrypoint": null,
            "OnBuild": null,
            "Labels": null
        }),
    );
    config
}

/// Image config with `history` and the root filesystem removed
///
/// The root filesystem key is matched without regard to case since some
/// registries spell it `rootfS`.
pub fn strip_image_config(config: &Value) -> Result<Map<String, Value>> {
    let mut config = config
        .as_object()
        .cloned()
        .ok_or_else(|| PullError::Layer("Image config is not a JSON object".to_string()))?;

    config.retain(|key, _| key != "history" && !key.eq_ignore_ascii_case("rootfs"));
    Ok(config)
}

/// The `json` file of a layer directory
///
/// `config` is the image config and must be given for the top layer only.
pub fn layer_metadata(layer: &LegacyLayer, config: Option<&Value>) -> Result<Value> {
    let mut metadata = match config {
        Some(config) => strip_image_config(config)?,
        None => empty_layer_config(),
    };

    metadata.insert("id".to_string(), Value::String(layer.id.clone()));
    if let Some(parent) = &layer.parent {
        metadata.insert("parent".to_string(), Value::String(parent.clone()));
    }
    Ok(Value::Object(metadata))
}

/// Decompress `src` into `dst`, copying as-is when it is not gzip
pub async fn decompress_layer(src: &Path, dst: &Path) -> Result<u64> {
    let mut reader = BufReader::new(File::open(src).await?);
    let mut output = File::create(dst).await?;

    let gzipped = reader.fill_buf().await?.starts_with(&GZIP_MAGIC);
    let written = if gzipped {
        let mut decoder = GzipDecoder::new(reader);
        decoder.multiple_members(true);
        tokio::io::copy(&mut decoder, &mut output).await
    } else {
        debug!("{} is not gzip compressed, copying", src.display());
        tokio::io::copy(&mut reader, &mut output).await
    }
    .map_err(|e| PullError::Layer(format!("Failed to extract {}: {}", src.display(), e)))?;

    output.flush().await?;
    Ok(written)
}

/// Fetches layers into their staging directories
pub struct LayerAssembler<'a> {
    client: &'a RegistryClient,
    paths: &'a StagingPaths,
    progress: &'a dyn ProgressFactory,
}

impl<'a> LayerAssembler<'a> {
    pub fn new(
        client: &'a RegistryClient,
        paths: &'a StagingPaths,
        progress: &'a dyn ProgressFactory,
    ) -> Self {
        Self {
            client,
            paths,
            progress,
        }
    }

    /// Download, decompress and describe one layer
    ///
    /// Only the layer's own directory is written to.
    pub async fn materialize(&self, layer: &LegacyLayer, metadata: &Value) -> Result<()> {
        let digest = &layer.descriptor.digest;
        let dir = self.paths.layer_dir(&layer.id);
        fs::create_dir_all(&dir).await?;
        fs::write(self.paths.layer_version(&layer.id), LAYER_VERSION).await?;

        let mut progress = self.progress.blob(digest);
        let compressed = self.paths.layer_compressed(&layer.id);
        let size = {
            let mut file = File::create(&compressed).await?;
            self.client
                .fetch_blob(
                    digest,
                    layer.descriptor.foreign_urls(),
                    &mut file,
                    progress.as_mut(),
                )
                .await?
        };

        progress.message("Extracting");
        decompress_layer(&compressed, &self.paths.layer_tar(&layer.id)).await?;
        fs::remove_file(&compressed).await?;

        fs::write(
            self.paths.layer_json(&layer.id),
            serde_json::to_vec(metadata)?,
        )
        .await?;

        progress.finish(&format!("Pull complete [{}]", size));
        info!("{}: Pull complete", short_digest(digest));
        Ok(())
    }
}
