//! Commands over available and installed images.

use anyhow::Result;
use clap::Args;
use serde::Serialize;
use serde_json::Value;
use tabled::Tabled;
use vmimg_engine::{AvailableImage, ImageInfo, ImgError, UpdateStatus};
use vmimg_manifest::Manifest;

use crate::output::{
    field_table, print_info, print_json, print_output, print_success, print_warning, OutputFormat,
};

use super::{parse_uuid, CommandContext};

const DEFAULT_AVAIL_FIELDS: &[&str] = &["uuid", "name", "version", "os", "type", "pub"];

#[derive(Debug, Args)]
pub struct AvailCommand {
    /// Comma-separated columns (any manifest field, plus `source` and `pub`).
    #[arg(short = 'o', long = "output", value_delimiter = ',')]
    fields: Vec<String>,

    /// Output as JSON.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct ShowCommand {
    /// Image uuid.
    uuid: String,
}

#[derive(Debug, Args)]
pub struct ListCommand {
    /// Output as JSON.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct GetCommand {
    /// Pool holding the image.
    #[arg(short = 'P', long = "pool")]
    pool: Option<String>,

    /// Include snapshots and dependent clones.
    #[arg(short = 'r', long = "children")]
    children: bool,

    /// Image uuid.
    uuid: String,
}

#[derive(Debug, Args)]
pub struct UpdateCommand {}

#[derive(Debug, Args)]
pub struct DeleteCommand {
    /// Pool holding the image.
    #[arg(short = 'P', long = "pool")]
    pool: Option<String>,

    /// Image uuid.
    uuid: String,
}

/// Installed image row.
#[derive(Debug, Serialize, Tabled)]
struct InstalledRow {
    #[tabled(rename = "UUID")]
    uuid: String,

    #[tabled(rename = "NAME")]
    name: String,

    #[tabled(rename = "VERSION")]
    version: String,

    #[tabled(rename = "OS")]
    os: String,

    #[tabled(rename = "TYPE")]
    image_type: String,

    #[tabled(rename = "PUB")]
    published: String,

    #[tabled(rename = "POOL")]
    pool: String,

    #[tabled(rename = "CLONES")]
    clones: usize,
}

impl From<&ImageInfo> for InstalledRow {
    fn from(info: &ImageInfo) -> Self {
        let manifest = info.manifest.as_ref();
        let text = |f: fn(&Manifest) -> String| manifest.map(f).unwrap_or_else(|| "-".to_string());
        Self {
            uuid: info.uuid.to_string(),
            name: text(|m| m.name.clone()),
            version: text(|m| m.version.clone()),
            os: text(|m| m.os.clone()),
            image_type: text(|m| m.image_type.clone()),
            published: text(|m| published_date(m.published_at.as_deref())),
            pool: info.pool.clone(),
            clones: info.clones,
        }
    }
}

/// Date part of an RFC 3339 timestamp.
fn published_date(published_at: Option<&str>) -> String {
    match published_at {
        Some(ts) => ts.get(..10).unwrap_or(ts).to_string(),
        None => "-".to_string(),
    }
}

/// Flatten an available image into one JSON object for field lookup.
fn avail_row(image: &AvailableImage) -> Value {
    let mut row = serde_json::to_value(&image.manifest).unwrap_or(Value::Null);
    if let Value::Object(map) = &mut row {
        map.insert("source".to_string(), Value::String(image.source.clone()));
        map.insert(
            "pub".to_string(),
            Value::String(published_date(image.manifest.published_at.as_deref())),
        );
    }
    row
}

impl AvailCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        let (mut images, err) = ctx.engine.sources_list().await?;
        images.sort_by(|a, b| {
            (a.manifest.published_at.as_deref(), &a.manifest.name)
                .cmp(&(b.manifest.published_at.as_deref(), &b.manifest.name))
        });

        match OutputFormat::from_json_flag(self.json) {
            OutputFormat::Json => print_json(&images),
            OutputFormat::Table => {
                let fields: Vec<String> = if self.fields.is_empty() {
                    DEFAULT_AVAIL_FIELDS.iter().map(|f| f.to_string()).collect()
                } else {
                    self.fields
                };
                let rows: Vec<Value> = images.iter().map(avail_row).collect();
                println!("{}", field_table(&rows, &fields));
            }
        }

        // Partial results are still printed before any source failure.
        match err {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }
}

impl ShowCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        let uuid = parse_uuid(&self.uuid)?;
        let manifest = ctx.engine.show(uuid).await?;
        print_json(&manifest);
        Ok(())
    }
}

impl ListCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        let mut images = ctx.engine.list_installed().await?;
        images.sort_by(|a, b| {
            let key = |i: &ImageInfo| {
                i.manifest
                    .as_ref()
                    .map(|m| (m.published_at.clone(), m.name.clone()))
            };
            key(a).cmp(&key(b))
        });

        match OutputFormat::from_json_flag(self.json) {
            OutputFormat::Json => print_json(&images),
            OutputFormat::Table => {
                let rows: Vec<InstalledRow> = images.iter().map(InstalledRow::from).collect();
                print_output(&rows, OutputFormat::Table);
            }
        }
        Ok(())
    }
}

impl GetCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        let uuid = parse_uuid(&self.uuid)?;
        let pool = ctx.pool(self.pool);
        match ctx.engine.get_installed(&pool, uuid, self.children).await? {
            Some(info) => {
                print_json(&info);
                Ok(())
            }
            None => Err(ImgError::ImageNotInstalled { pool, uuid }.into()),
        }
    }
}

impl UpdateCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        let results = ctx.engine.update_installed().await?;
        if results.is_empty() {
            print_info("All installed images have metadata, nothing to update");
        }
        for result in &results {
            match (result.status, result.source.as_deref()) {
                (UpdateStatus::Updated, Some(source)) => print_success(&format!(
                    "Updated image {} ({}) from \"{source}\"",
                    result.uuid, result.pool
                )),
                _ => print_warning(&format!(
                    "Could not find image {} ({}) in any source",
                    result.uuid, result.pool
                )),
            }
        }
        Ok(())
    }
}

impl DeleteCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        let uuid = parse_uuid(&self.uuid)?;
        let pool = ctx.pool(self.pool);
        ctx.engine.delete(&pool, uuid).await?;
        print_success(&format!("Deleted image {uuid} from pool \"{pool}\""));
        Ok(())
    }
}
