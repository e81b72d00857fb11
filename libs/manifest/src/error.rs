//! Error types for manifest parsing, upgrade, and validation.

use std::fmt;

use thiserror::Error;

/// A single field-level validation failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    /// Dotted path of the offending field (e.g. `files.0.sha1`).
    pub field: String,
    /// Short machine-readable code (`Missing`, `Invalid`, `TooMany`).
    pub code: &'static str,
    /// Human-readable description.
    pub message: String,
}

impl FieldError {
    pub fn missing(field: impl Into<String>) -> Self {
        let field = field.into();
        Self {
            message: format!("\"{field}\" is required"),
            field,
            code: "Missing",
        }
    }

    pub fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            code: "Invalid",
            message: message.into(),
        }
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.field, self.code, self.message)
    }
}

/// Errors that can occur when reading or checking a manifest.
#[derive(Debug, Error)]
pub enum ManifestError {
    /// The manifest is not a JSON object.
    #[error("manifest is not an object")]
    NotAnObject,

    /// The `v` field is present but unusable.
    #[error("invalid manifest version: {0}")]
    InvalidVersion(String),

    /// The manifest was written by a newer schema than this crate knows.
    #[error("unsupported manifest version {found} (newest supported is {supported})")]
    UnsupportedVersion { found: u64, supported: u32 },

    /// The upgraded manifest does not deserialize.
    #[error("malformed manifest: {0}")]
    Malformed(#[from] serde_json::Error),

    /// The manifest deserialized but failed field validation.
    #[error("manifest validation failed: {}", join_errors(.0))]
    Validation(Vec<FieldError>),
}

impl ManifestError {
    /// Returns the field errors if this is a validation failure.
    pub fn field_errors(&self) -> &[FieldError] {
        match self {
            ManifestError::Validation(errors) => errors,
            _ => &[],
        }
    }
}

fn join_errors(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
