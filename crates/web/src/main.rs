//! Playdeck
//!
//! Runs Playwright suites on request and serves their progress and history.

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use playdeck_orchestrator::{OrchestratorConfig, RunController};

#[derive(Parser)]
#[command(name = "playdeck")]
#[command(about = "Playdeck - Playwright suite runner with live logs and run history")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "playdeck.toml")]
    config: PathBuf,

    /// HTTP listen address
    #[arg(short, long, env = "PLAYDECK_ADDR", default_value = "127.0.0.1:8080")]
    listen: SocketAddr,

    /// Data directory (history and archived reports)
    #[arg(long, env = "PLAYDECK_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Playwright project root
    #[arg(short, long)]
    suite_dir: Option<PathBuf>,

    /// Enable debug logging, including suite output
    #[arg(short, long)]
    debug: bool,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let registry = tracing_subscriber::registry().with(filter);
    if cli.log_json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    }

    info!("Playdeck v{}", playdeck_common::VERSION);

    let mut config = OrchestratorConfig::load(&cli.config)?;
    if let Some(data_dir) = cli.data_dir {
        config.data_dir = data_dir;
    }
    if let Some(suite_dir) = cli.suite_dir {
        config.suite.working_dir = suite_dir;
    }
    info!(
        "Suite: {} {} (in {})",
        config.suite.command,
        config.suite.args.join(" "),
        config.suite.working_dir.display()
    );

    let controller = RunController::new(config)?;
    playdeck_web::serve(cli.listen, controller).await
}
