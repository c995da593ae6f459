//! Command-line interface for the portfolio media pipeline

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use portfolio_media_core::{
    init, version, ConfigManager, DisplayState, EntityType, ImageAsset, ImageRole,
    MediaPipeline, PipelineConfig, StatusSnapshot,
};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "portfolio-media")]
#[command(about = "Background image optimization for portfolio projects and services")]
#[command(version = version())]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file path (defaults to the user config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the worker pool until Ctrl-C
    Run {
        /// Process everything currently queued, then exit
        #[arg(long)]
        drain: bool,
    },

    /// Queue optimization of an entity's images
    Enqueue {
        /// Entity type (project or service)
        entity_type: EntityType,

        /// Entity id
        id: u64,

        /// Entity title, used for the folder name
        #[arg(short, long)]
        title: String,

        /// Primary image
        #[arg(short, long)]
        image: Option<PathBuf>,

        /// Album image (repeatable)
        #[arg(short, long)]
        album: Vec<PathBuf>,
    },

    /// Move an entity folder after a title change
    Rename {
        entity_type: EntityType,
        id: u64,

        #[arg(long)]
        from: String,

        #[arg(long)]
        to: String,
    },

    /// Cancel pending work and remove an entity folder
    Delete {
        entity_type: EntityType,
        id: u64,

        #[arg(short, long)]
        title: String,
    },

    /// Show queue and worker status
    Status {
        /// Print the snapshot as JSON
        #[arg(long)]
        json: bool,

        /// List recorded failures
        #[arg(long)]
        failures: bool,
    },

    /// Show configuration and system information
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = config_path(cli.config);
    let mut config = ConfigManager::load(config_path.as_deref())
        .context("Failed to load configuration")?;
    if cli.verbose {
        config.logging.level = "debug".to_string();
    }
    let _log_guard = init(&config.logging)?;

    info!("Portfolio media CLI v{} starting", version());

    match cli.command {
        Commands::Run { drain } => run(config, drain).await?,

        Commands::Enqueue {
            entity_type,
            id,
            title,
            image,
            album,
        } => {
            let pipeline = MediaPipeline::open(config).await?;
            let assets: Vec<ImageAsset> = image
                .into_iter()
                .map(ImageAsset::primary)
                .chain(album.into_iter().map(|p| ImageAsset::new(p, ImageRole::Album)))
                .collect();
            let count = assets.len();
            let task_id = pipeline
                .notify_image_changed(entity_type.with_id(id), &title, assets)
                .await?;
            println!("Queued task {} ({} images)", task_id, count);
        }

        Commands::Rename {
            entity_type,
            id,
            from,
            to,
        } => {
            let pipeline = MediaPipeline::open(config).await?;
            let handle = pipeline
                .notify_entity_renamed(entity_type.with_id(id), &from, &to)
                .await?;
            println!("Folder now at {}", handle.entity_dir().display());
        }

        Commands::Delete {
            entity_type,
            id,
            title,
        } => {
            let pipeline = MediaPipeline::open(config).await?;
            pipeline
                .notify_entity_deleted(entity_type.with_id(id), &title)
                .await?;
            println!("Removed media for {}", entity_type.with_id(id));
        }

        Commands::Status { json, failures } => {
            let pipeline = MediaPipeline::open(config).await?;
            let snapshot = pipeline.get_status();
            if json {
                println!("{}", serde_json::to_string_pretty(&snapshot)?);
            } else {
                print_status(&snapshot);
            }

            if failures {
                for record in pipeline.queue().failures().await? {
                    let asset = record
                        .asset
                        .as_ref()
                        .map(|p| p.display().to_string())
                        .unwrap_or_else(|| "-".to_string());
                    println!(
                        "{} {} {} [{}] {}",
                        record.failed_at.to_rfc3339(),
                        record.entity,
                        asset,
                        record.kind,
                        record.message
                    );
                }
            }
        }

        Commands::Info => print_info(&config, config_path.as_deref()),
    }

    Ok(())
}

/// Explicit `--config`, else the per-user default location
fn config_path(explicit: Option<PathBuf>) -> Option<PathBuf> {
    explicit.or_else(|| match ConfigManager::default_config_path() {
        Ok(path) => Some(path),
        Err(e) => {
            warn!(error = %e, "No default config location, using built-in defaults");
            None
        }
    })
}

async fn run(config: PipelineConfig, drain: bool) -> Result<()> {
    let pipeline = MediaPipeline::open(config).await?;

    if drain {
        let processed = pipeline.drain().await?;
        println!("Processed {} tasks", processed);
        let snapshot = pipeline.get_status();
        if snapshot.has_warning() {
            warn!(failed = snapshot.failed_count, "Failures recorded");
        }
        return Ok(());
    }

    pipeline.start().await?;
    println!(
        "Workers running ({}), press Ctrl-C to stop",
        pipeline.config().workers.count
    );
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    info!("Shutting down");
    pipeline.shutdown().await;
    Ok(())
}

fn print_status(snapshot: &StatusSnapshot) {
    let state = match snapshot.display_state() {
        DisplayState::Idle => "idle",
        DisplayState::Processing => "processing",
    };
    println!("State:      {}", state);
    println!("Queued:     {}", snapshot.queued_count);
    println!("Processing: {}", snapshot.processing_count);
    println!("Failed:     {}", snapshot.failed_count);
    if snapshot.has_warning() {
        println!("Run `status --failures` to list failed images");
    }
}

fn print_info(config: &PipelineConfig, config_path: Option<&Path>) {
    println!("Portfolio Media v{}", version());
    println!("Background image optimization pipeline");
    println!("\nConfiguration:");
    match config_path {
        Some(path) if path.is_file() => println!("  Config file: {}", path.display()),
        Some(path) => println!("  Config file: {} (not present)", path.display()),
        None => println!("  Config file: (none)"),
    }
    println!("  Media root: {}", config.storage.media_root.display());
    println!("  Queue dir: {}", config.storage.queue_dir.display());
    match &config.storage.database_path {
        Some(path) => println!("  Database: {}", path.display()),
        None => println!("  Database: (in memory)"),
    }
    println!("  Target format: {}", config.optimization.target_format);
    println!("  Quality: {:?}", config.optimization.quality_tier);
    for tier in &config.optimization.size_tiers {
        println!(
            "  Size tier {}: {}x{}",
            tier.name, tier.max_width, tier.max_height
        );
    }
    println!("  Workers: {}", config.workers.count);
    println!("\nSystem Information:");
    println!("  Platform: {}", std::env::consts::OS);
    println!("  Architecture: {}", std::env::consts::ARCH);
}
