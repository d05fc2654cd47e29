//! CLI definition

pub mod pull;

use clap::Parser;

/// imgpull - download an image from a registry as a `docker load`-able tar
#[derive(Parser, Debug)]
#[command(name = "imgpull")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub pull: pull::PullArgs,
}

/// Printed after a connection failure
pub const TROUBLESHOOTING: &[&str] = &[
    "1. Check your internet connection",
    "2. If you are behind a proxy, set HTTP_PROXY and HTTPS_PROXY environment variables",
    "3. Try using a VPN if the registry is blocked",
    "4. Verify the registry is accessible from your network",
];
