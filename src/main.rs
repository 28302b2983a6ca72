use clap::Parser;
use mxrestore::cli::{dispatch, Cli};
use std::process::exit;
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("MXR_LOG").unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(e) = dispatch(cli) {
        eprintln!("Error: {e:#}");
        exit(1);
    }
}
