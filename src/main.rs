//! Docmill - document processing orchestrator.
//!
//! A service core that ingests heterogeneous documents and transforms each
//! into searchable, structured records through a staged processing pipeline.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    // Load .env file if present (before anything else)
    let _ = dotenvy::dotenv();

    // Initialize logging based on verbosity
    let default_filter = if docmill::cli::is_verbose() {
        "docmill=info"
    } else {
        "docmill=warn"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Run CLI; exit codes: 0 success, 2 bad usage (clap), 3 config error,
    // 4 transient infra error, 5 fatal.
    let code = docmill::cli::run().await;
    std::process::exit(code);
}
