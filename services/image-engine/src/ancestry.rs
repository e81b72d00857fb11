//! Find an image across sources and work out which of its ancestors still
//! need importing.

use std::sync::Arc;

use tracing::{debug, info};
use vmimg_manifest::is_canonical_uuid;

use crate::error::ImgError;
use crate::source::{AncestryEntry, ImageSource, ImportInfo, ImportOptions};
use crate::storage::Storage;

/// The source that answered for an argument, with what it answered.
pub struct Resolved {
    pub source: Arc<dyn ImageSource>,
    pub info: ImportInfo,
}

/// Ancestry chain split into what is present and what is not.
pub struct ImportPlan {
    pub source: Arc<dyn ImageSource>,
    pub leaf: ImportInfo,
    /// Entries to import, base first.
    pub missing: Vec<AncestryEntry>,
}

pub struct AncestryResolver<'a> {
    storage: &'a dyn Storage,
}

impl<'a> AncestryResolver<'a> {
    pub fn new(storage: &'a dyn Storage) -> Self {
        Self { storage }
    }

    /// Ask each source in order; the first hit wins.
    ///
    /// A source error does not stop the search. If no source answers, every
    /// collected error is returned, or a not-found error if there were none.
    pub async fn find(
        &self,
        sources: &[Arc<dyn ImageSource>],
        arg: &str,
    ) -> Result<Resolved, ImgError> {
        if sources.is_empty() {
            return Err(ImgError::NoSources);
        }

        let opts = ImportOptions {
            ensure_active: true,
            err_on_404: false,
        };
        let mut errors = Vec::new();
        for source in sources {
            match source.get_import_info(arg, opts).await {
                Ok(Some(info)) => {
                    debug!(arg = %arg, source = %source, uuid = %info.uuid, "Found image");
                    return Ok(Resolved {
                        source: Arc::clone(source),
                        info,
                    });
                }
                Ok(None) => {}
                Err(err) => {
                    debug!(arg = %arg, source = %source, error = %err, "Source lookup failed");
                    errors.push(err);
                }
            }
        }

        if let Some(err) = ImgError::from_many(errors) {
            return Err(err);
        }
        if is_canonical_uuid(arg) {
            Err(ImgError::ActiveImageNotFound {
                arg: arg.to_string(),
            })
        } else {
            Err(ImgError::ImageNotFound {
                arg: arg.to_string(),
            })
        }
    }

    /// Full chain for `resolved`, keeping only entries not yet in `pool`.
    pub async fn plan(&self, resolved: Resolved, pool: &str) -> Result<ImportPlan, ImgError> {
        let Resolved { source, info } = resolved;
        let chain = source.get_img_ancestry(&info).await?;

        let mut missing = Vec::with_capacity(chain.len());
        for entry in chain {
            if self.storage.exists(pool, entry.uuid).await? {
                debug!(pool = %pool, uuid = %entry.uuid, "Ancestor already installed");
            } else {
                missing.push(entry);
            }
        }
        info!(
            pool = %pool,
            uuid = %info.uuid,
            missing = missing.len(),
            "Resolved image ancestry"
        );

        Ok(ImportPlan {
            source,
            leaf: info,
            missing,
        })
    }
}
