//! Source commands.
//!
//! Without an action flag the configured sources are listed in priority
//! order.

use std::path::Path;

use anyhow::{bail, Context, Result};
use clap::Args;
use serde::Serialize;
use tabled::Tabled;
use vmimg_engine::source::{SourceRecord, SourceType};
use vmimg_engine::ImgError;

use crate::output::{print_info, print_output, print_success, OutputFormat};

use super::CommandContext;

/// List, add, delete or edit image sources.
#[derive(Debug, Args)]
pub struct SourcesCommand {
    /// Add a source.
    #[arg(short = 'a', long = "add", value_name = "URL", conflicts_with_all = ["del", "edit"])]
    add: Option<String>,

    /// Type of the source being added (imgapi, dsapi or docker).
    #[arg(short = 't', long = "type", value_name = "TYPE", requires = "add")]
    source_type: Option<String>,

    /// Delete a source.
    #[arg(short = 'd', long = "del", value_name = "URL", conflicts_with = "edit")]
    del: Option<String>,

    /// Edit the source list in $EDITOR.
    #[arg(short = 'e', long = "edit")]
    edit: bool,

    /// Skip the reachability check for new sources.
    #[arg(short = 'f', long = "force")]
    force: bool,

    /// Accept invalid TLS certificates from the added source.
    #[arg(short = 'k', long = "insecure", requires = "add")]
    insecure: bool,

    /// Output as JSON.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Serialize, Tabled)]
struct SourceRow {
    #[tabled(rename = "URL")]
    url: String,

    #[tabled(rename = "TYPE")]
    #[serde(rename = "type")]
    source_type: SourceType,

    #[tabled(rename = "INSECURE")]
    insecure: bool,
}

impl From<SourceRecord> for SourceRow {
    fn from(record: SourceRecord) -> Self {
        Self {
            url: record.url,
            source_type: record.source_type,
            insecure: record.insecure,
        }
    }
}

impl SourcesCommand {
    pub async fn run(self, mut ctx: CommandContext) -> Result<()> {
        if let Some(url) = self.add.as_deref() {
            let source_type = self
                .source_type
                .as_deref()
                .map(str::parse::<SourceType>)
                .transpose()?;
            return add_source(&mut ctx, url, source_type, self.insecure, self.force).await;
        }
        if let Some(url) = self.del.as_deref() {
            return del_source(&mut ctx, url).await;
        }
        if self.edit {
            return edit_sources(&mut ctx, self.force).await;
        }
        list_sources(&ctx, OutputFormat::from_json_flag(self.json));
        Ok(())
    }
}

fn list_sources(ctx: &CommandContext, format: OutputFormat) {
    let rows: Vec<SourceRow> = ctx
        .engine
        .registry()
        .records()
        .into_iter()
        .map(SourceRow::from)
        .collect();
    print_output(&rows, format);
}

async fn add_source(
    ctx: &mut CommandContext,
    url: &str,
    source_type: Option<SourceType>,
    insecure: bool,
    force: bool,
) -> Result<()> {
    let registry = ctx.engine.registry_mut();
    if registry.add(url, source_type, insecure, force).await? {
        if let Some(added) = registry.records().last() {
            print_success(&format!(
                "Added \"{}\" image source \"{}\"",
                added.source_type, added.url
            ));
        }
    } else {
        print_info(&format!("Already have image source \"{url}\", no change"));
    }
    Ok(())
}

async fn del_source(ctx: &mut CommandContext, url: &str) -> Result<()> {
    if ctx.engine.registry_mut().del(url).await? {
        print_success(&format!("Deleted image source \"{url}\""));
    } else {
        print_info(&format!("Do not have image source \"{url}\", no change"));
    }
    Ok(())
}

async fn edit_sources(ctx: &mut CommandContext, force: bool) -> Result<()> {
    let before = render_source_list(&ctx.engine.registry().records());
    let path = std::env::temp_dir().join(format!("vmimg-sources-{}.txt", std::process::id()));
    tokio::fs::write(&path, &before)
        .await
        .with_context(|| format!("could not write {}", path.display()))?;

    let edited = run_editor(&path).await;
    let after = tokio::fs::read_to_string(&path).await;
    let _ = tokio::fs::remove_file(&path).await;
    edited?;
    let after = after.with_context(|| format!("could not read {}", path.display()))?;

    if after == before {
        print_info("Image sources unchanged");
        return Ok(());
    }

    let desired = parse_source_list(&after)?;
    let changes = ctx.engine.registry_mut().update_urls(desired, force).await?;
    if changes.is_empty() {
        print_info("Image sources unchanged");
    }
    for change in &changes {
        print_success(&change.to_string());
    }
    Ok(())
}

async fn run_editor(path: &Path) -> Result<()> {
    let editor = std::env::var("EDITOR")
        .ok()
        .filter(|e| !e.trim().is_empty())
        .unwrap_or_else(|| "vi".to_string());
    let mut parts = editor.split_whitespace();
    let Some(program) = parts.next() else {
        bail!("EDITOR is empty");
    };

    let status = tokio::process::Command::new(program)
        .args(parts)
        .arg(path)
        .status()
        .await
        .with_context(|| format!("could not run editor \"{editor}\""))?;
    if !status.success() {
        bail!("editor \"{editor}\" exited with {status}");
    }
    Ok(())
}

/// One `URL TYPE` line per source.
fn render_source_list(records: &[SourceRecord]) -> String {
    let mut out = String::from("# One source per line: URL [TYPE]\n");
    for record in records {
        out.push_str(&format!("{} {}\n", record.url, record.source_type));
    }
    out
}

/// Blank lines and `#` comments are skipped. A missing type is inferred.
fn parse_source_list(text: &str) -> Result<Vec<(String, Option<SourceType>)>, ImgError> {
    let mut desired = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut words = line.split_whitespace();
        let (Some(url), source_type, None) = (words.next(), words.next(), words.next()) else {
            return Err(ImgError::Usage(format!(
                "invalid source line \"{line}\" (expected \"URL [TYPE]\")"
            )));
        };
        let source_type = source_type.map(str::parse::<SourceType>).transpose()?;
        desired.push((url.to_string(), source_type));
    }
    Ok(desired)
}
