//! Error taxonomy for the image engine.
//!
//! Every fatal error has a stable kind string ([`ImgError::code`]) used in
//! user-facing output and a process exit status ([`ImgError::exit_status`]).

use std::fmt;
use std::io;

use thiserror::Error;
use uuid::Uuid;
use vmimg_manifest::{FieldError, ImageState, ManifestError};

use crate::storage::StorageError;

/// Boxed cause carried by errors that wrap a lower-level failure.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Exit status reserved for "the requested image is not installed".
pub const EXIT_NOT_INSTALLED: i32 = 3;

/// Errors from image engine operations.
#[derive(Debug, Error)]
pub enum ImgError {
    #[error("{message}")]
    Config {
        message: String,
        #[source]
        cause: Option<BoxError>,
    },

    #[error("unexpected ping error with {desc}: {message}")]
    SourcePing {
        desc: String,
        message: String,
        #[source]
        cause: Option<BoxError>,
    },

    #[error("no image sources are configured")]
    NoSources,

    #[error("image \"{arg}\" was not found in any source")]
    ImageNotFound { arg: String },

    #[error("an active image \"{arg}\" was not found in any source")]
    ActiveImageNotFound { arg: String },

    #[error("image {uuid} is not active (state is \"{state}\")")]
    ImageNotActive { uuid: Uuid, state: ImageState },

    #[error("image {uuid} is not installed on pool \"{pool}\"")]
    ImageNotInstalled { pool: String, uuid: Uuid },

    #[error("origin image {origin} is not installed on pool \"{pool}\"")]
    OriginNotInstalled { pool: String, origin: Uuid },

    #[error("image {uuid} has dependent clones: {}", .clones.join(", "))]
    ImageHasDependentClones { uuid: Uuid, clones: Vec<String> },

    #[error("invalid manifest: {message}")]
    InvalidManifest {
        message: String,
        #[source]
        cause: Option<BoxError>,
    },

    #[error("manifest validation failed: {}", join_fields(.errors))]
    ManifestValidation { errors: Vec<FieldError> },

    #[error("{message}")]
    Download {
        message: String,
        #[source]
        cause: Option<BoxError>,
    },

    #[error("{message}")]
    Uncompression { message: String },

    #[error("{message}")]
    Internal {
        message: String,
        #[source]
        cause: Option<BoxError>,
    },

    #[error("{message}")]
    Upgrade {
        message: String,
        #[source]
        cause: Option<BoxError>,
    },

    #[error(transparent)]
    Multi(#[from] MultiError),

    #[error("{desc} does not support {operation}")]
    Unsupported {
        operation: &'static str,
        desc: String,
    },

    #[error("expected one snapshot on \"{name}\" after receive, found {count}")]
    UnexpectedNumberOfSnapshots { name: String, count: usize },

    #[error("\"{0}\" is not a uuid")]
    InvalidUuid(String),

    #[error("{0}")]
    Usage(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl ImgError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            cause: None,
        }
    }

    pub fn config_with(message: impl Into<String>, cause: impl Into<BoxError>) -> Self {
        Self::Config {
            message: message.into(),
            cause: Some(cause.into()),
        }
    }

    pub fn download(message: impl Into<String>) -> Self {
        Self::Download {
            message: message.into(),
            cause: None,
        }
    }

    pub fn download_with(message: impl Into<String>, cause: impl Into<BoxError>) -> Self {
        Self::Download {
            message: message.into(),
            cause: Some(cause.into()),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
            cause: None,
        }
    }

    pub fn internal_with(message: impl Into<String>, cause: impl Into<BoxError>) -> Self {
        Self::Internal {
            message: message.into(),
            cause: Some(cause.into()),
        }
    }

    pub fn invalid_manifest(message: impl Into<String>) -> Self {
        Self::InvalidManifest {
            message: message.into(),
            cause: None,
        }
    }

    /// Collapse a list of independent failures: none, one, or a [`MultiError`].
    pub fn from_many(mut errors: Vec<ImgError>) -> Option<ImgError> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(ImgError::Multi(MultiError { errors })),
        }
    }

    /// Stable kind string shown as `error (<code>)`.
    pub fn code(&self) -> &'static str {
        match self {
            ImgError::Config { .. } => "ConfigError",
            ImgError::SourcePing { .. } => "SourcePingError",
            ImgError::NoSources => "NoSourcesError",
            ImgError::ImageNotFound { .. } => "ImageNotFound",
            ImgError::ActiveImageNotFound { .. } => "ActiveImageNotFound",
            ImgError::ImageNotActive { .. } => "ImageNotActive",
            ImgError::ImageNotInstalled { .. } => "ImageNotInstalled",
            ImgError::OriginNotInstalled { .. } => "OriginNotInstalled",
            ImgError::ImageHasDependentClones { .. } => "ImageHasDependentClones",
            ImgError::InvalidManifest { .. } => "InvalidManifest",
            ImgError::ManifestValidation { .. } => "ManifestValidation",
            ImgError::Download { .. } => "DownloadError",
            ImgError::Uncompression { .. } => "UncompressionError",
            ImgError::Internal { .. } | ImgError::Storage(_) | ImgError::Io(_) => "InternalError",
            ImgError::Upgrade { .. } => "UpgradeError",
            ImgError::Multi(_) => "MultiError",
            ImgError::Unsupported { .. } => "Unsupported",
            ImgError::UnexpectedNumberOfSnapshots { .. } => "UnexpectedNumberOfSnapshots",
            ImgError::InvalidUuid(_) => "InvalidUUID",
            ImgError::Usage(_) => "UsageError",
            ImgError::Http(_) => "HttpError",
        }
    }

    /// Process exit status for this error.
    pub fn exit_status(&self) -> i32 {
        match self {
            ImgError::ImageNotInstalled { .. } | ImgError::OriginNotInstalled { .. } => {
                EXIT_NOT_INSTALLED
            }
            _ => 1,
        }
    }
}

impl From<ManifestError> for ImgError {
    fn from(err: ManifestError) -> Self {
        match err {
            ManifestError::Validation(errors) => ImgError::ManifestValidation { errors },
            other => ImgError::InvalidManifest {
                message: other.to_string(),
                cause: Some(Box::new(other)),
            },
        }
    }
}

/// Independent failures collected from a fan-out over several sources.
#[derive(Debug)]
pub struct MultiError {
    pub errors: Vec<ImgError>,
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} errors", self.errors.len())?;
        for (i, err) in self.errors.iter().enumerate() {
            let sep = if i == 0 { ": " } else { "; " };
            write!(f, "{sep}({}) {err}", err.code())?;
        }
        Ok(())
    }
}

impl std::error::Error for MultiError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.errors
            .first()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

fn join_fields(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_installed_errors_exit_three() {
        let uuid = Uuid::nil();
        let err = ImgError::ImageNotInstalled {
            pool: "zones".to_string(),
            uuid,
        };
        assert_eq!(err.exit_status(), EXIT_NOT_INSTALLED);
        assert_eq!(err.code(), "ImageNotInstalled");

        let err = ImgError::OriginNotInstalled {
            pool: "zones".to_string(),
            origin: uuid,
        };
        assert_eq!(err.exit_status(), EXIT_NOT_INSTALLED);

        assert_eq!(ImgError::NoSources.exit_status(), 1);
        assert_eq!(ImgError::download("bad digest").exit_status(), 1);
    }

    #[test]
    fn from_many_collapses() {
        assert!(ImgError::from_many(vec![]).is_none());

        let one = ImgError::from_many(vec![ImgError::NoSources]).unwrap();
        assert!(matches!(one, ImgError::NoSources));

        let many =
            ImgError::from_many(vec![ImgError::NoSources, ImgError::download("x")]).unwrap();
        assert_eq!(many.code(), "MultiError");
        assert_eq!(
            many.to_string(),
            "2 errors: (NoSourcesError) no image sources are configured; (DownloadError) x"
        );
    }

    #[test]
    fn manifest_validation_maps_to_its_own_kind() {
        let err: ImgError =
            ManifestError::Validation(vec![FieldError::missing("name")]).into();
        assert_eq!(err.code(), "ManifestValidation");

        let err: ImgError = ManifestError::NotAnObject.into();
        assert_eq!(err.code(), "InvalidManifest");
    }
}
