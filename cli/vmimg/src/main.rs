//! vmimg - manage virtual machine images on this host.
//!
//! Thin command-line surface over `vmimg-engine`. Output meant for scripts
//! goes to stdout; logs and errors go to stderr. Exit status is 0 on
//! success, 3 when the requested image is not installed, and 1 otherwise.

use clap::Parser;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod commands;
mod error;
mod output;

use commands::Cli;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.json_logs);

    let verbose = cli.verbose;
    if let Err(e) = cli.run().await {
        let status = error::print_error(&e, verbose);
        std::process::exit(status);
    }
}

/// `VMIMG_LOG_LEVEL` wins when it parses; otherwise `-v` means debug.
fn init_tracing(verbose: bool, json: bool) {
    let fallback = if verbose { "debug" } else { "warn" };
    let filter = std::env::var("VMIMG_LOG_LEVEL")
        .ok()
        .and_then(|level| EnvFilter::try_new(level).ok())
        .unwrap_or_else(|| EnvFilter::new(fallback));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}
