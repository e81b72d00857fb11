//! Field validation for upgraded manifests.

use crate::error::{FieldError, ManifestError};
use crate::ids::is_canonical_uuid;
use crate::types::{Checksum, Manifest};

impl Manifest {
    /// Check the constraints the import path relies on.
    ///
    /// Every failing field is reported, not just the first.
    pub fn validate(&self) -> Result<(), ManifestError> {
        let mut errors = Vec::new();

        if self.uuid.is_nil() {
            errors.push(FieldError::invalid("uuid", "uuid must not be nil"));
        }
        if self.name.trim().is_empty() {
            errors.push(FieldError::missing("name"));
        }
        if self.version.trim().is_empty() {
            errors.push(FieldError::missing("version"));
        }
        if self.origin == Some(self.uuid) {
            errors.push(FieldError::invalid("origin", "image cannot be its own origin"));
        }
        if self.files.len() > 1 {
            errors.push(FieldError {
                field: "files".to_string(),
                code: "TooMany",
                message: format!("at most one file is allowed, got {}", self.files.len()),
            });
        }

        for (i, file) in self.files.iter().enumerate() {
            if let Some(sha1) = &file.sha1 {
                if sha1.len() != 40 || !sha1.chars().all(|c| c.is_ascii_hexdigit()) {
                    errors.push(FieldError::invalid(
                        format!("files.{i}.sha1"),
                        "sha1 must be 40 hex characters",
                    ));
                }
            }
            if let Some(digest) = &file.digest {
                if let Err(message) = digest.parse::<Checksum>() {
                    errors.push(FieldError::invalid(format!("files.{i}.digest"), message));
                }
            }
        }

        if let Some(acl) = &self.acl {
            for (i, entry) in acl.iter().enumerate() {
                if !is_canonical_uuid(entry) {
                    errors.push(FieldError::invalid(
                        format!("acl.{i}"),
                        format!("\"{entry}\" is not a uuid"),
                    ));
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ManifestError::Validation(errors))
        }
    }
}
