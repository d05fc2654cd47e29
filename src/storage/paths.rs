//! Layout of the staging tree an archive is assembled in

use crate::Result;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Per-layer file holding the decompressed filesystem diff
pub const LAYER_TAR: &str = "layer.tar";

/// Names of the files inside the staging tree
#[derive(Debug, Clone)]
pub struct StagingPaths {
    root: PathBuf,
}

impl StagingPaths {
    /// Create a new StagingPaths instance rooted at `root`
    pub fn with_root(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Get the root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Raw image config, named after its digest
    pub fn config_file(&self, config_hex: &str) -> PathBuf {
        self.root.join(config_file_name(config_hex))
    }

    /// Archive manifest index
    pub fn manifest_index(&self) -> PathBuf {
        self.root.join("manifest.json")
    }

    /// Repository-tag index
    pub fn repositories(&self) -> PathBuf {
        self.root.join("repositories")
    }

    /// Directory for a specific layer
    pub fn layer_dir(&self, layer_id: &str) -> PathBuf {
        self.root.join(layer_id)
    }

    /// Layer format version marker
    pub fn layer_version(&self, layer_id: &str) -> PathBuf {
        self.layer_dir(layer_id).join("VERSION")
    }

    /// Layer metadata
    pub fn layer_json(&self, layer_id: &str) -> PathBuf {
        self.layer_dir(layer_id).join("json")
    }

    /// Decompressed layer tar file
    pub fn layer_tar(&self, layer_id: &str) -> PathBuf {
        self.layer_dir(layer_id).join(LAYER_TAR)
    }

    /// Compressed blob while it downloads; removed after extraction
    pub fn layer_compressed(&self, layer_id: &str) -> PathBuf {
        self.layer_dir(layer_id).join("layer_gzip.tar")
    }
}

/// Name of the config file relative to the archive root
pub fn config_file_name(config_hex: &str) -> String {
    format!("{}.json", config_hex)
}

/// Name of a layer tar relative to the archive root
pub fn layer_tar_entry(layer_id: &str) -> String {
    format!("{}/{}", layer_id, LAYER_TAR)
}

/// Scratch directory that is deleted when dropped
///
/// The tree is removed on success and on every failure path alike.
#[derive(Debug)]
pub struct StagingTree {
    dir: TempDir,
    paths: StagingPaths,
}

impl StagingTree {
    /// Create an empty staging tree under `parent`
    pub fn create_in(parent: impl AsRef<Path>) -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix(".imgpull-")
            .tempdir_in(parent)?;
        let paths = StagingPaths::with_root(dir.path());
        Ok(Self { dir, paths })
    }

    pub fn paths(&self) -> &StagingPaths {
        &self.paths
    }

    /// Delete the tree now, reporting failures instead of ignoring them
    pub fn close(self) -> Result<()> {
        self.dir.close()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_structure() {
        let tmp = TempDir::new().unwrap();
        let paths = StagingPaths::with_root(tmp.path());

        assert_eq!(paths.root(), tmp.path());
        assert_eq!(paths.manifest_index(), tmp.path().join("manifest.json"));
        assert_eq!(paths.repositories(), tmp.path().join("repositories"));
        assert_eq!(paths.config_file("abc"), tmp.path().join("abc.json"));
    }

    #[test]
    fn test_layer_paths() {
        let tmp = TempDir::new().unwrap();
        let paths = StagingPaths::with_root(tmp.path());

        let id = "f00d";
        assert_eq!(paths.layer_version(id), tmp.path().join("f00d/VERSION"));
        assert_eq!(paths.layer_json(id), tmp.path().join("f00d/json"));
        assert_eq!(paths.layer_tar(id), tmp.path().join("f00d/layer.tar"));
        assert_eq!(layer_tar_entry(id), "f00d/layer.tar");
    }

    #[test]
    fn test_staging_tree_removed_on_drop() {
        let tmp = TempDir::new().unwrap();
        let root = {
            let tree = StagingTree::create_in(tmp.path()).unwrap();
            std::fs::create_dir_all(tree.paths().layer_dir("abc")).unwrap();
            std::fs::write(tree.paths().layer_version("abc"), "1.0").unwrap();
            tree.paths().root().to_path_buf()
        };
        assert!(!root.exists());
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_staging_tree_close() {
        let tmp = TempDir::new().unwrap();
        let tree = StagingTree::create_in(tmp.path()).unwrap();
        let root = tree.paths().root().to_path_buf();
        assert!(root.exists());
        tree.close().unwrap();
        assert!(!root.exists());
    }
}
