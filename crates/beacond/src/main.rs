//! beacond - CRUD API with CDC-driven live updates
//!
//! Usage:
//!   # All defaults (localhost postgres, ports 3000/3001)
//!   beacond
//!
//!   # Custom database and bind address
//!   beacond --bind 0.0.0.0:8080 \
//!     --pg-host db.internal \
//!     --pg-database myapp \
//!     --publication myapp_cdc \
//!     --slot myapp_cdc_slot

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = beacond::Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level)),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = cli.validate() {
        eprintln!("configuration error: {e}");
        std::process::exit(1);
    }

    beacond::run(cli).await
}
