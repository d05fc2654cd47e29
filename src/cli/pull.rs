//! `imgpull` pull arguments and execution

use crate::image::oci::{ImageReference, Platform};
use crate::image::progress::ConsoleProgress;
use crate::image::pull::{PullOptions, PullReport, Puller};
use clap::Args;
use std::path::PathBuf;
use std::time::Duration;

/// Arguments for pulling an image
#[derive(Args, Debug)]
pub struct PullArgs {
    /// Image to pull (e.g. hello-world, library/ubuntu:22.04, myregistry.io:5000/team/app:v2)
    #[arg(long)]
    pub image: String,

    /// Platform picked from multi-arch images, as os/arch
    #[arg(long, default_value = "linux/amd64")]
    pub platform: Platform,

    /// Directory the archive is written to
    #[arg(short, long, default_value = ".")]
    pub output: PathBuf,

    /// Registry base URL to use instead of the one in the image name
    #[arg(long)]
    pub registry_url: Option<String>,

    /// Accept invalid TLS certificates
    #[arg(long)]
    pub insecure: bool,

    /// Ignore HTTP_PROXY/HTTPS_PROXY
    #[arg(long)]
    pub no_proxy: bool,

    /// Per-request timeout in seconds
    #[arg(long, default_value_t = 30)]
    pub timeout: u64,

    /// Retries on connection failures and 429/5xx responses
    #[arg(long, default_value_t = 3)]
    pub retries: u32,

    /// Number of layers downloaded at once
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u16).range(1..))]
    pub concurrency: u16,

    /// Suppress progress bars
    #[arg(short, long)]
    pub quiet: bool,
}

impl PullArgs {
    /// Pull options described by these arguments
    pub fn options(&self) -> PullOptions {
        PullOptions {
            platform: self.platform.clone(),
            output_dir: self.output.clone(),
            registry_url: self.registry_url.clone(),
            insecure: self.insecure,
            no_proxy: self.no_proxy,
            timeout: Duration::from_secs(self.timeout),
            retries: self.retries,
            concurrency: usize::from(self.concurrency),
            ..PullOptions::default()
        }
    }
}

/// Execute a pull
pub async fn execute(args: PullArgs) -> anyhow::Result<PullReport> {
    let reference = ImageReference::parse(&args.image)?;
    let progress = ConsoleProgress::new(!args.quiet);

    let puller = Puller::new(args.options(), &progress);
    let report = puller.pull(&reference).await?;

    Ok(report)
}
