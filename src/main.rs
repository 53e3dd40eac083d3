//! queue-director binary: runs a director against a Redis queue, seeds demo
//! items or prints store statistics.
//!
//! Sets up `tracing` output, then hands the parsed subcommand to `cli`.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --log-level is needed before the subscriber exists
    let cli = queue_director::cli::parse_cli();

    // Priority: RUST_LOG env var > --log-level CLI arg > default "info"
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| cli.log_level.clone());

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log_filter)))
        .init();

    queue_director::cli::run_with_cli(cli).await
}
