//! CLI commands.

mod images;
mod import;
mod sources;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::debug;
use uuid::Uuid;
use vmimg_engine::{EngineConfig, ImageEngine, ImgError};

/// vmimg - Manage virtual machine images on this host.
#[derive(Debug, Parser)]
#[command(name = "vmimg")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Verbose logging and full error causes.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// List and edit image sources.
    Sources(sources::SourcesCommand),

    /// List images available from the configured sources.
    Avail(images::AvailCommand),

    /// Show the source manifest for an image.
    Show(images::ShowCommand),

    /// List installed images.
    List(images::ListCommand),

    /// Show an installed image (exit 3 if not installed).
    Get(images::GetCommand),

    /// Import an image and its missing ancestors from a source.
    Import(import::ImportCommand),

    /// Install an image from a local manifest and file.
    Install(import::InstallCommand),

    /// Refresh cached metadata for installed images.
    Update(images::UpdateCommand),

    /// Delete an installed image.
    Delete(images::DeleteCommand),
}

impl Cli {
    /// Run the CLI command.
    pub async fn run(self) -> Result<()> {
        let ctx = CommandContext::open().await?;

        match self.command {
            Commands::Sources(cmd) => cmd.run(ctx).await,
            Commands::Avail(cmd) => cmd.run(ctx).await,
            Commands::Show(cmd) => cmd.run(ctx).await,
            Commands::List(cmd) => cmd.run(ctx).await,
            Commands::Get(cmd) => cmd.run(ctx).await,
            Commands::Import(cmd) => cmd.run(ctx).await,
            Commands::Install(cmd) => cmd.run(ctx).await,
            Commands::Update(cmd) => cmd.run(ctx).await,
            Commands::Delete(cmd) => cmd.run(ctx).await,
        }
    }
}

/// Shared command context.
pub struct CommandContext {
    pub engine: ImageEngine,
}

impl CommandContext {
    /// Open the engine from environment configuration.
    async fn open() -> Result<Self> {
        let config = EngineConfig::from_env()?;
        debug!(
            db_dir = %config.db_dir.display(),
            storage = ?config.storage,
            "Opening image engine"
        );
        let storage = config.storage.open();
        let engine = ImageEngine::open(config, storage).await?;
        Ok(Self { engine })
    }

    /// The pool from `-P`, or the configured default.
    pub fn pool(&self, flag: Option<String>) -> String {
        flag.unwrap_or_else(|| self.engine.config().default_pool.clone())
    }
}

/// Parse a uuid argument, rejecting anything but the canonical form.
pub fn parse_uuid(arg: &str) -> Result<Uuid, ImgError> {
    if !vmimg_manifest::is_canonical_uuid(arg) {
        return Err(ImgError::InvalidUuid(arg.to_string()));
    }
    arg.parse()
        .map_err(|_| ImgError::InvalidUuid(arg.to_string()))
}
