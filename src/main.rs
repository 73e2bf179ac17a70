//
// main.rs
// Dicom-Intake-rs
//
// Tokio entry point: installs the tracing subscriber, then hands off execution to the CLI layer.
//
// Thales Matheus Mendonça Santos - November 2025

use dicom_intake::cli;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // RUST_LOG wins; otherwise lifecycle events at info.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    cli::run().await
}
