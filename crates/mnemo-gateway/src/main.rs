use clap::Parser;
use tracing::{error, info};

use mnemo_core::config::MnemoConfig;
use mnemo_core::error::exit;
use mnemo_pipeline::{App, InitError};

/// Mnemo server: chat-agent core with tiered memory.
///
/// The chat transport connects through the library's `handle` entry point;
/// this binary owns configuration, singleton lifecycle, and exit codes.
#[derive(Parser)]
#[command(name = "mnemo", version)]
struct Args {
    /// Path to mnemo.toml (defaults to ~/.mnemo/mnemo.toml).
    #[arg(long, env = "MNEMO_CONFIG")]
    config: Option<String>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mnemo=info".into()),
        )
        .init();

    let config = match MnemoConfig::load(args.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            error!("{e}");
            std::process::exit(exit::CONFIG);
        }
    };

    let app = match App::init(config).await {
        Ok(app) => app,
        Err(e @ InitError::Config(_)) => {
            error!("{e}");
            std::process::exit(exit::CONFIG);
        }
        Err(e @ InitError::Unavailable(_)) => {
            error!("{e}");
            std::process::exit(exit::UNAVAILABLE);
        }
    };

    info!("mnemo running; press ctrl-c to stop");
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("signal handling failed: {e}");
        app.close().await;
        std::process::exit(exit::RUNTIME);
    }

    info!("shutting down");
    app.close().await;
    std::process::exit(exit::OK);
}
