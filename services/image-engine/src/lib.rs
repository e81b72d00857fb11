//! # vmimg-engine
//!
//! Host-side image management: finds images across remote sources, imports
//! them into snapshot/clone storage with verified integrity, and keeps a
//! local database describing what is installed.
//!
//! ## Layout
//!
//! - [`source`]: the three source backends behind one trait
//! - [`registry`]: the ordered, persisted source list
//! - [`ancestry`]: locating an image and its missing ancestors
//! - [`pipeline`]: the transactional stage/verify/commit import
//! - [`database`]: one JSON record per installed image
//! - [`storage`]: the storage contract with ZFS and directory backends
//! - [`upgrade`]: schema migrations run at startup
//! - [`engine`]: the facade the CLI drives

pub mod ancestry;
pub mod config;
pub mod database;
pub mod engine;
pub mod error;
pub mod pipeline;
pub mod registry;
pub mod source;
pub mod storage;
pub mod upgrade;

pub use config::{DbWritePolicy, EngineConfig};
pub use engine::{AvailableImage, ImageEngine, ImageInfo, UpdateResult, UpdateStatus};
pub use error::{ImgError, MultiError, EXIT_NOT_INSTALLED};
pub use pipeline::{ImportOutcome, ImportStatus};
