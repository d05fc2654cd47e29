//! Registry access and image reconstruction

pub mod auth;
pub mod layer;
pub mod oci;
pub mod progress;
pub mod pull;
pub mod registry;
pub mod transport;
