//! imgpull CLI entry point
//!
//! Pulls an image from a registry into a legacy `docker save` archive.

use clap::Parser;
use imgpull::cli::{Cli, TROUBLESHOOTING};
use imgpull::PullError;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match imgpull::cli::pull::execute(cli.pull).await {
        Ok(report) => {
            println!("Docker image pulled: {}", report.archive.display());
            ExitCode::SUCCESS
        }
        Err(e) => {
            println!("[-] {:#}", e);
            let connection = e
                .downcast_ref::<PullError>()
                .map(PullError::is_connection)
                .unwrap_or(false);
            if connection {
                println!("[*] Troubleshooting tips:");
                for tip in TROUBLESHOOTING {
                    println!("    {}", tip);
                }
            }
            ExitCode::FAILURE
        }
    }
}
