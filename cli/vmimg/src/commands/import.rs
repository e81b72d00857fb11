//! Import and install commands.

use std::path::PathBuf;

use anyhow::Result;
use clap::Args;
use vmimg_engine::{ImportOutcome, ImportStatus};

use crate::output::{print_info, print_success, print_warning};

use super::CommandContext;

#[derive(Debug, Args)]
pub struct ImportCommand {
    /// Pool to import into.
    #[arg(short = 'P', long = "pool")]
    pool: Option<String>,

    /// No progress bars.
    #[arg(short = 'q', long = "quiet")]
    quiet: bool,

    /// Image uuid, or a registry reference such as `busybox:latest`.
    arg: String,
}

#[derive(Debug, Args)]
pub struct InstallCommand {
    /// Path to the image manifest.
    #[arg(short = 'm', long = "manifest")]
    manifest: PathBuf,

    /// Path to the image file.
    #[arg(short = 'f', long = "file")]
    file: PathBuf,

    /// Pool to install into.
    #[arg(short = 'P', long = "pool")]
    pool: Option<String>,

    /// No progress bars.
    #[arg(short = 'q', long = "quiet")]
    quiet: bool,
}

impl ImportCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        let pool = ctx.pool(self.pool);
        let outcomes = ctx.engine.import(&self.arg, &pool, self.quiet).await?;
        for outcome in &outcomes {
            report(outcome);
        }
        Ok(())
    }
}

impl InstallCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        let pool = ctx.pool(self.pool);
        let outcome = ctx
            .engine
            .install(&self.manifest, &self.file, &pool, self.quiet)
            .await?;
        report(&outcome);
        Ok(())
    }
}

fn report(outcome: &ImportOutcome) {
    match outcome.status {
        ImportStatus::Imported => print_success(&format!(
            "Imported image {} into pool \"{}\"",
            outcome.uuid, outcome.pool
        )),
        ImportStatus::AlreadyInstalled => print_info(&format!(
            "Image {} is already installed on pool \"{}\"",
            outcome.uuid, outcome.pool
        )),
    }
    if let Some(warning) = &outcome.db_warning {
        print_warning(&format!(
            "Image {} is installed but its metadata was not recorded: {warning}",
            outcome.uuid
        ));
    }
}
