// =============================================================================
// Signal-to-execution engine -- entry point.
//
// Thin by design: every decision lives in `lifecycle::run`. This mirrors the
// teacher's main.rs shape (dotenv + tracing init, then hand off to the rest
// of the system) without the teacher's multi-symbol market-data fan-out,
// which this single-symbol engine has no use for.
// =============================================================================

mod config;
mod gateway;
mod health;
mod instrument;
mod lifecycle;
mod notifier;
mod price_stream;
mod strategy;
mod types;
mod venue;

use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if let Err(err) = lifecycle::run().await {
        tracing::error!(error = %err, "fatal startup or runtime error");
        std::process::exit(1);
    }

    Ok(())
}
