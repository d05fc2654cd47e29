//! imgpull - pull a container image into a legacy `docker save` archive
//!
//! This crate talks to a registry over the distribution HTTP API, negotiates
//! bearer tokens and manifests, and rebuilds the image as the tarball layout
//! `docker load` understands, without a daemon or a local image store.

pub mod cli;
pub mod image;
pub mod storage;

use thiserror::Error;

/// Main error type for imgpull operations
#[derive(Error, Debug)]
pub enum PullError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid image reference: {0}")]
    InvalidReference(String),

    #[error("Invalid platform: {0}")]
    InvalidPlatform(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Manifest error: {0}")]
    Manifest(String),

    #[error("Cannot download blob {digest} [HTTP {status}]")]
    Blob { digest: String, status: u16 },

    #[error("Layer error: {0}")]
    Layer(String),
}

impl PullError {
    /// Whether the failure happened before any registry answered
    pub fn is_connection(&self) -> bool {
        matches!(self, PullError::Connection(_))
    }
}

pub type Result<T> = std::result::Result<T, PullError>;

/// Application version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "imgpull";

/// Leading bytes of a gzip stream
pub const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
