//! Vetta - automated technical interview orchestrator
//!
//! Binary entry point: loads `.env` for developer workflows, initializes
//! structured logging, and dispatches the CLI. All subcommands exit 0 on
//! success, 1 on user error, 2 on internal error.

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use vetta_agent::cli::{self, Cli};

#[tokio::main]
async fn main() {
    // Existing process environment takes precedence over .env values.
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let default_filter = cli
        .log_level
        .as_deref()
        .map(|level| level.to_lowercase())
        .unwrap_or_else(|| "info".to_string());
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match cli::execute(cli).await {
        Ok(()) => {}
        Err(error) => {
            let code = cli::exit_code_for(&error);
            eprintln!("error: {error:#}");
            std::process::exit(code);
        }
    }
}
