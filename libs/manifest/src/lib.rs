//! # vmimg-manifest
//!
//! Image manifest model for vmimg.
//!
//! A manifest describes one image: its identity, classification, lifecycle
//! state, visibility, optional origin (for incremental images), and the
//! single content file that materializes it.
//!
//! ## Schema versions
//!
//! Manifests carry a `v` field. Older catalogs serve version 1 records with a
//! different field set; every manifest must go through [`upgrade_manifest`]
//! before any other field is trusted. Upgrading is idempotent.
//!
//! ## Identifiers
//!
//! - Image identifiers are canonical lowercase UUID strings
//!   (see [`is_canonical_uuid`])
//! - Layered-registry images have no catalog UUID; one is derived from the
//!   ordered layer digests with [`layer_chain_uuid`]

mod error;
mod ids;
mod types;
mod upgrade;
mod validate;

pub use error::{FieldError, ManifestError};
pub use ids::{is_canonical_uuid, layer_chain_uuid, LAYER_CHAIN_NAMESPACE};
pub use types::*;
pub use upgrade::{upgrade_manifest, MANIFEST_V};

/// Re-export uuid for consumers that build manifests by hand.
pub use uuid::Uuid;
