//! Manifest schema upgrade.
//!
//! Version 1 is the legacy catalog format (`urn`, `creator_uuid`,
//! `restricted_to_uuid`, no `state`). Version 2 is current.

use serde_json::{Map, Value};

use crate::error::ManifestError;
use crate::types::{Compression, Manifest};

/// Current manifest schema version.
pub const MANIFEST_V: u32 = 2;

/// Fields that only ever existed in version 1 records.
const V1_ONLY_FIELDS: &[&str] = &["urn", "creator_name", "platform_type", "cloud_name"];

/// Upgrade a raw manifest to the current schema and parse it.
///
/// Running this on an already-current manifest changes nothing, so
/// `upgrade(upgrade(m)) == upgrade(m)`.
pub fn upgrade_manifest(raw: Value) -> Result<Manifest, ManifestError> {
    let Value::Object(mut obj) = raw else {
        return Err(ManifestError::NotAnObject);
    };

    let version = schema_version(&obj)?;
    if version > u64::from(MANIFEST_V) {
        return Err(ManifestError::UnsupportedVersion {
            found: version,
            supported: MANIFEST_V,
        });
    }

    if version < 2 {
        upgrade_v1_to_v2(&mut obj);
    }
    fill_state(&mut obj);
    obj.insert("v".to_string(), Value::from(MANIFEST_V));

    Manifest::from_value(Value::Object(obj))
}

fn schema_version(obj: &Map<String, Value>) -> Result<u64, ManifestError> {
    match obj.get("v") {
        None | Some(Value::Null) => Ok(1),
        Some(Value::Number(n)) => n
            .as_u64()
            .ok_or_else(|| ManifestError::InvalidVersion(n.to_string())),
        Some(Value::String(s)) => s
            .parse()
            .map_err(|_| ManifestError::InvalidVersion(s.clone())),
        Some(other) => Err(ManifestError::InvalidVersion(other.to_string())),
    }
}

fn upgrade_v1_to_v2(obj: &mut Map<String, Value>) {
    for field in V1_ONLY_FIELDS {
        obj.remove(*field);
    }

    if let Some(creator) = obj.remove("creator_uuid") {
        obj.entry("owner").or_insert(creator);
    }

    match obj.remove("restricted_to_uuid") {
        Some(Value::String(owner)) => {
            obj.insert("public".to_string(), Value::Bool(false));
            obj.insert("acl".to_string(), Value::Array(vec![Value::String(owner)]));
        }
        _ => {
            obj.entry("public").or_insert(Value::Bool(true));
        }
    }

    if !obj.contains_key("published_at") {
        if let Some(created) = obj.get("created_at").cloned() {
            obj.insert("published_at".to_string(), created);
        }
    }

    obj.entry("type")
        .or_insert_with(|| Value::String("zone-dataset".to_string()));

    if let Some(Value::Array(files)) = obj.get_mut("files") {
        for file in files.iter_mut().filter_map(Value::as_object_mut) {
            if file.contains_key("compression") {
                continue;
            }
            let path = file
                .get("path")
                .or_else(|| file.get("url"))
                .and_then(Value::as_str)
                .unwrap_or_default();
            let compression = Compression::from_path(path);
            file.insert(
                "compression".to_string(),
                Value::String(compression.as_str().to_string()),
            );
        }
    }
}

/// Derive `state` from `disabled`/`activated` when the record lacks one.
fn fill_state(obj: &mut Map<String, Value>) {
    if obj.contains_key("state") {
        return;
    }
    let disabled = obj.get("disabled").and_then(Value::as_bool).unwrap_or(false);
    let activated = obj.get("activated").and_then(Value::as_bool).unwrap_or(true);
    let state = if disabled {
        "disabled"
    } else if !activated {
        "unactivated"
    } else {
        "active"
    };
    obj.insert("state".to_string(), Value::String(state.to_string()));
}
