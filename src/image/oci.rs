//! Image reference parsing and registry manifest types

use crate::{PullError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Registry used when the reference names no host
pub const DEFAULT_REGISTRY: &str = "registry-1.docker.io";

/// Namespace of official images on the default registry
pub const DEFAULT_NAMESPACE: &str = "library";

/// Tag used when the reference carries none
pub const DEFAULT_TAG: &str = "latest";

/// Host names that are spelled differently by users but served by the default registry
const REGISTRY_ALIASES: &[&str] = &["docker.io", "index.docker.io", "registry.hub.docker.com"];

/// Docker/OCI image reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    /// Registry host, with port if any (e.g., "registry-1.docker.io", "myregistry.io:5000")
    pub registry: String,
    /// Repository path (e.g., "library/alpine", "team/app")
    pub repository: String,
    /// Tag (e.g., "latest", "3.18")
    pub tag: String,
    /// Digest (optional, e.g., "sha256:...")
    pub digest: Option<String>,
    /// Repository path without the image name (e.g., "library", "team")
    pub namespace: String,
    /// Last path segment of the reference
    pub name: String,
    /// Name as the user typed it, minus tag and digest
    pub tag_name: String,
    /// Whether `tag` was spelled out rather than defaulted
    pub explicit_tag: bool,
}

impl ImageReference {
    /// Parse an image reference string
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(PullError::InvalidReference(
                "Empty image reference".to_string(),
            ));
        }

        let mut segments: Vec<&str> = reference.split('/').collect();
        if segments.iter().any(|s| s.is_empty()) {
            return Err(PullError::InvalidReference(format!(
                "Empty path segment in {}",
                reference
            )));
        }

        // Split the trailing segment into name, tag and digest
        let last = segments.pop().unwrap_or_default();
        let (name_and_tag, digest) = match last.split_once('@') {
            Some((lhs, digest)) => (lhs, Some(digest)),
            None => (last, None),
        };
        let (name, tag) = match name_and_tag.split_once(':') {
            Some((name, tag)) => (name, Some(tag)),
            None => (name_and_tag, None),
        };

        if name.is_empty() {
            return Err(PullError::InvalidReference(format!(
                "Missing image name in {}",
                reference
            )));
        }
        if tag == Some("") || digest == Some("") {
            return Err(PullError::InvalidReference(format!(
                "Empty tag or digest in {}",
                reference
            )));
        }

        let tag_name = segments
            .iter()
            .copied()
            .chain(std::iter::once(name))
            .collect::<Vec<_>>()
            .join("/");

        // The first segment is a host only if it looks like one
        let mut registry = DEFAULT_REGISTRY.to_string();
        if let Some(first) = segments.first() {
            if first.contains('.') || first.contains(':') || *first == "localhost" {
                registry = if REGISTRY_ALIASES.contains(first) {
                    DEFAULT_REGISTRY.to_string()
                } else {
                    first.to_string()
                };
                segments.remove(0);
            }
        }

        let mut namespace = segments.join("/");
        if namespace.is_empty() && registry == DEFAULT_REGISTRY {
            namespace = DEFAULT_NAMESPACE.to_string();
        }

        let repository = if namespace.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", namespace, name)
        };

        Ok(Self {
            registry,
            repository,
            tag: tag.unwrap_or(DEFAULT_TAG).to_string(),
            digest: digest.map(str::to_string),
            namespace,
            name: name.to_string(),
            tag_name,
            explicit_tag: tag.is_some(),
        })
    }

    /// The tag or digest used to address the manifest; a digest wins
    pub fn reference(&self) -> &str {
        self.digest.as_deref().unwrap_or(&self.tag)
    }

    /// Pinned by digest alone, so `RepoTags` falls back to the default tag
    pub fn is_digest_only(&self) -> bool {
        self.digest.is_some() && !self.explicit_tag
    }

    /// Entry written to `RepoTags` in the archive manifest
    pub fn repo_tag(&self) -> String {
        format!("{}:{}", self.tag_name, self.tag)
    }

    /// File name of the archive produced for this image
    ///
    /// Derived from the repository path only, so pulling another tag of the
    /// same image overwrites the previous archive.
    pub fn archive_name(&self) -> String {
        if self.namespace.is_empty() {
            format!("{}.tar", self.name)
        } else {
            format!("{}_{}.tar", self.namespace.replace('/', "_"), self.name)
        }
    }

    /// Get the API URL for the registry
    pub fn registry_url(&self) -> String {
        if self.registry.starts_with("localhost") || self.registry.starts_with("127.0.0.1") {
            format!("http://{}", self.registry)
        } else {
            format!("https://{}", self.registry)
        }
    }
}

impl FromStr for ImageReference {
    type Err = PullError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.digest {
            Some(digest) => write!(f, "{}/{}@{}", self.registry, self.repository, digest),
            None => write!(f, "{}/{}:{}", self.registry, self.repository, self.tag),
        }
    }
}

/// Platform specification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Platform {
    pub architecture: String,
    pub os: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

impl Platform {
    pub fn new(os: &str, architecture: &str) -> Self {
        Self {
            architecture: architecture.to_string(),
            os: os.to_string(),
            variant: None,
        }
    }

    /// Whether os and architecture match; the variant is not compared
    pub fn matches(&self, os: &str, architecture: &str) -> bool {
        self.os == os && self.architecture == architecture
    }
}

impl Default for Platform {
    fn default() -> Self {
        Self::new("linux", "amd64")
    }
}

impl FromStr for Platform {
    type Err = PullError;

    /// Parses `os/arch` or `os/arch/variant`
    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.trim().split('/').collect();
        match parts.as_slice() {
            [os, arch] if !os.is_empty() && !arch.is_empty() => Ok(Self::new(os, arch)),
            [os, arch, variant] if !os.is_empty() && !arch.is_empty() && !variant.is_empty() => {
                Ok(Self {
                    variant: Some(variant.to_string()),
                    ..Self::new(os, arch)
                })
            }
            _ => Err(PullError::InvalidPlatform(format!(
                "{} (expected os/arch, e.g. linux/amd64)",
                s
            ))),
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.os, self.architecture)?;
        if let Some(variant) = &self.variant {
            write!(f, "/{}", variant)?;
        }
        Ok(())
    }
}

/// Image manifest (Docker schema 2 or OCI)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageManifest {
    #[serde(default)]
    pub schema_version: i32,
    pub media_type: Option<String>,
    pub config: Descriptor,
    pub layers: Vec<Descriptor>,
}

/// Content descriptor of a config or layer blob
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    #[serde(default)]
    pub media_type: String,
    pub digest: String,
    #[serde(default)]
    pub size: i64,
    pub urls: Option<Vec<String>>,
}

impl Descriptor {
    /// Hex part of the digest, without the algorithm prefix
    pub fn hex(&self) -> &str {
        digest_hex(&self.digest)
    }

    /// Foreign locations the blob may also be served from
    pub fn foreign_urls(&self) -> &[String] {
        self.urls.as_deref().unwrap_or_default()
    }
}

/// Manifest list / image index (multi-platform images)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageIndex {
    #[serde(default)]
    pub schema_version: i32,
    pub media_type: Option<String>,
    pub manifests: Vec<ManifestDescriptor>,
}

/// Manifest descriptor with platform info
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestDescriptor {
    #[serde(default)]
    pub media_type: String,
    pub digest: String,
    #[serde(default)]
    pub size: i64,
    pub platform: Option<Platform>,
}

impl ManifestDescriptor {
    fn platform_is(&self, os: &str, architecture: &str) -> bool {
        self.platform
            .as_ref()
            .map(|p| p.matches(os, architecture))
            .unwrap_or(false)
    }
}

/// Pick the manifest to pull out of a manifest list
///
/// An exact os/architecture match wins, then windows/amd64, then whatever is
/// listed first. Returns `None` only for an empty list.
pub fn select_platform<'a>(
    manifests: &'a [ManifestDescriptor],
    wanted: &Platform,
) -> Option<&'a ManifestDescriptor> {
    manifests
        .iter()
        .find(|m| m.platform_is(&wanted.os, &wanted.architecture))
        .or_else(|| manifests.iter().find(|m| m.platform_is("windows", "amd64")))
        .or_else(|| manifests.first())
}

/// Strip the algorithm prefix off a digest
pub fn digest_hex(digest: &str) -> &str {
    digest.split_once(':').map(|(_, hex)| hex).unwrap_or(digest)
}

/// Twelve-character form of a digest used in console output
pub fn short_digest(digest: &str) -> &str {
    let hex = digest_hex(digest);
    hex.char_indices().nth(12).map_or(hex, |(end, _)| &hex[..end])
}

/// Media types
pub mod media_types {
    pub const OCI_IMAGE_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
    pub const OCI_IMAGE_INDEX: &str = "application/vnd.oci.image.index.v1+json";

    pub const DOCKER_MANIFEST_V2: &str = "application/vnd.docker.distribution.manifest.v2+json";
    pub const DOCKER_MANIFEST_LIST: &str =
        "application/vnd.docker.distribution.manifest.list.v2+json";

    /// Accept header for the first manifest request, lists included
    pub fn manifest_or_list() -> String {
        [
            DOCKER_MANIFEST_V2,
            DOCKER_MANIFEST_LIST,
            OCI_IMAGE_MANIFEST,
            OCI_IMAGE_INDEX,
        ]
        .join(",")
    }

    /// Accept header once a concrete manifest is wanted
    pub fn single_manifest() -> String {
        [DOCKER_MANIFEST_V2, OCI_IMAGE_MANIFEST].join(",")
    }
}
