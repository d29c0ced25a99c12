use std::env;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use facegate::{api, config, ingest, AppState};
use log::info;

#[derive(Parser)]
#[command(name = "facegate")]
#[command(
    version,
    about = "Chunked camera image intake and face verification service"
)]
struct Cli {
    /// Config file (defaults to $FACEGATE_CONFIG or /usr/local/etc/facegate/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the MQTT listeners and the HTTP API
    Serve,
    /// Enroll a new identity from an image file
    Enroll {
        /// Image containing exactly the face to enroll
        image: PathBuf,
    },
    /// Match an image file against enrolled faces
    Test {
        /// Image to match
        image: PathBuf,
    },
    /// Open config file in editor
    Config,
}

fn main() -> Result<()> {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .format_target(false)
        .format_timestamp(None)
        .parse_default_env()
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(cli.config.as_deref())?;

    let runtime = tokio::runtime::Runtime::new().context("failed to create Tokio runtime")?;
    match cli.command {
        Commands::Serve => runtime.block_on(serve(cfg)),
        Commands::Enroll { image } => runtime.block_on(enroll(&cfg, &image)),
        Commands::Test { image } => runtime.block_on(test(&cfg, &image)),
        Commands::Config => open_config(cli.config.as_deref()),
    }
}

async fn serve(cfg: config::Config) -> Result<()> {
    let state = AppState::from_config(&cfg)?;
    info!("Images directory: {}", state.artifacts.root().display());

    let chunks = ingest::spawn_chunk_listener(&cfg.chunks, state.reassembler.clone());
    let metadata = ingest::spawn_meta_listener(&cfg.metadata, state.tracker.clone());
    let sweeper = state.spawn_sweeper(
        cfg.verification.sweep_interval(),
        cfg.verification.assembly_ttl(),
        cfg.verification.outcome_ttl(),
    );

    let addr: SocketAddr = format!("{}:{}", cfg.http.host, cfg.http.port)
        .parse()
        .context("Invalid listen address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("HTTP API listening on http://{addr}");

    axum::serve(listener, api::router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down");
        })
        .await
        .context("HTTP server error")?;

    chunks.abort();
    metadata.abort();
    sweeper.abort();
    Ok(())
}

async fn enroll(cfg: &config::Config, image: &Path) -> Result<()> {
    let state = AppState::from_config(cfg)?;
    let bytes = std::fs::read(image).with_context(|| format!("reading {}", image.display()))?;

    let record = state
        .enroller
        .enroll(&bytes)
        .await
        .context("Failed to enroll face")?;

    info!("✓ Face enrolled as user: {}", record.user_id);
    Ok(())
}

async fn test(cfg: &config::Config, image: &Path) -> Result<()> {
    let state = AppState::from_config(cfg)?;
    let bytes = std::fs::read(image).with_context(|| format!("reading {}", image.display()))?;

    let result = state
        .matcher
        .match_image(&bytes)
        .await
        .context("Failed to match face")?;

    info!(
        "Match score: {:.3} (threshold: {:.3})",
        result.score,
        state.matcher.threshold()
    );
    match result.best_user_id {
        Some(user) => {
            info!("✓ Matched user: {}", user);
            Ok(())
        }
        None => anyhow::bail!("No matching face"),
    }
}

fn open_config(path: Option<&Path>) -> Result<()> {
    let config_path = path.unwrap_or(config::CONFIG_PATH.as_path());
    let editor = env::var("EDITOR").unwrap_or_else(|_| "vi".to_string());

    info!("Opening config file: {:?}", config_path);

    let status = std::process::Command::new(editor)
        .arg(config_path)
        .status()
        .context("Failed to open editor")?;

    if !status.success() {
        anyhow::bail!("Editor exited with non-zero status");
    }

    Ok(())
}
