//! Legacy `docker save` archive: index files and tar packing

use crate::image::layer::LegacyLayer;
use crate::image::oci::ImageReference;
use crate::storage::paths::{config_file_name, layer_tar_entry, StagingPaths, StagingTree};
use crate::{PullError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// One entry of the archive's `manifest.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ArchiveManifest {
    pub config: String,
    pub repo_tags: Vec<String>,
    pub layers: Vec<String>,
}

impl ArchiveManifest {
    pub fn new(reference: &ImageReference, config_hex: &str, layers: &[LegacyLayer]) -> Self {
        Self {
            config: config_file_name(config_hex),
            repo_tags: vec![reference.repo_tag()],
            layers: layers.iter().map(|l| layer_tar_entry(&l.id)).collect(),
        }
    }
}

/// Content of the `repositories` file: name -> tag -> top layer id
pub type Repositories = BTreeMap<String, BTreeMap<String, String>>;

pub fn repositories(reference: &ImageReference, top_layer_id: &str) -> Repositories {
    let mut tags = BTreeMap::new();
    tags.insert(reference.tag.clone(), top_layer_id.to_string());

    let mut repositories = BTreeMap::new();
    repositories.insert(reference.tag_name.clone(), tags);
    repositories
}

/// Writes the index files and packs a finished staging tree
pub struct ArchiveBuilder<'a> {
    reference: &'a ImageReference,
    config_hex: &'a str,
    layers: &'a [LegacyLayer],
}

impl<'a> ArchiveBuilder<'a> {
    pub fn new(
        reference: &'a ImageReference,
        config_hex: &'a str,
        layers: &'a [LegacyLayer],
    ) -> Self {
        Self {
            reference,
            config_hex,
            layers,
        }
    }

    /// Write `repositories` and `manifest.json` at the tree root
    pub fn write_indices(&self, paths: &StagingPaths) -> Result<()> {
        let top = self
            .layers
            .last()
            .ok_or_else(|| PullError::Layer("Image has no layers".to_string()))?;

        let repositories = repositories(self.reference, &top.id);
        fs::write(paths.repositories(), serde_json::to_vec(&repositories)?)?;

        let manifest = vec![ArchiveManifest::new(
            self.reference,
            self.config_hex,
            self.layers,
        )];
        fs::write(paths.manifest_index(), serde_json::to_vec(&manifest)?)?;

        Ok(())
    }

    /// Write the indices, pack the tree into `output` and delete the tree
    pub async fn finalize(&self, staging: StagingTree, output: &Path) -> Result<PathBuf> {
        self.write_indices(staging.paths())?;

        info!("Creating archive {}", output.display());
        let root = staging.paths().root().to_path_buf();
        let target = output.to_path_buf();
        tokio::task::spawn_blocking(move || pack(&root, &target))
            .await
            .map_err(|e| PullError::Layer(format!("Archive task failed: {}", e)))??;

        staging.close()?;
        Ok(output.to_path_buf())
    }
}

/// Pack every entry under `root` into a tar at `output`
///
/// Entry names are relative to `root`. The archive is written next to
/// `output` first and moved into place once complete.
pub fn pack(root: &Path, output: &Path) -> Result<()> {
    let dir = output
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let tmp = tempfile::Builder::new()
        .prefix(".imgpull-")
        .suffix(".tar.partial")
        .tempfile_in(dir)?;

    {
        let mut builder = tar::Builder::new(BufWriter::new(tmp.as_file()));
        builder.mode(tar::HeaderMode::Deterministic);

        let mut entries = fs::read_dir(root)?.collect::<std::io::Result<Vec<_>>>()?;
        entries.sort_by_key(|e| e.file_name());

        for entry in entries {
            let name = entry.file_name();
            debug!("Adding {:?} to archive", name);
            if entry.file_type()?.is_dir() {
                builder.append_dir_all(&name, entry.path())?;
            } else {
                builder.append_path_with_name(entry.path(), &name)?;
            }
        }

        builder.into_inner()?.into_inner().map_err(|e| e.into_error())?;
    }

    tmp.persist(output).map_err(|e| e.error)?;
    Ok(())
}

/// List the entry names of a tar archive
pub fn list_entries(archive: &Path) -> Result<Vec<String>> {
    let mut archive = tar::Archive::new(File::open(archive)?);
    let mut names = Vec::new();
    for entry in archive.entries()? {
        let entry = entry?;
        names.push(entry.path()?.to_string_lossy().trim_end_matches('/').to_string());
    }
    Ok(names)
}
