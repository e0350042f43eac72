//! `pack.json`: the declarative metadata every pack archive carries at its root.

use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;

use jsonschema::{Draft, Validator};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::{PackError, PackResult};
use crate::permissions::{Limits, Permissions, check_relative_path, is_valid_network_grant};

pub const MANIFEST_FILE: &str = "pack.json";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackType {
    Wasm,
    Workflow,
}

impl fmt::Display for PackType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PackType::Wasm => f.write_str("wasm"),
            PackType::Workflow => f.write_str("workflow"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PackManifest {
    pub id: String,
    pub name: String,
    pub version: String,
    #[serde(rename = "type")]
    pub pack_type: PackType,
    pub entry: String,
    pub permissions: Permissions,
    pub limits: Limits,
    pub build: Value,
    #[serde(default)]
    pub required_env: Vec<String>,
}

static MANIFEST_SCHEMA: Lazy<Value> = Lazy::new(|| {
    json!({
        "type": "object",
        "required": ["id", "name", "version", "type", "entry", "permissions", "limits", "build"],
        "properties": {
            "id": { "type": "string", "minLength": 1 },
            "name": { "type": "string", "minLength": 1 },
            "version": { "type": "string", "minLength": 1 },
            "type": { "enum": ["wasm", "workflow"] },
            "entry": { "type": "string", "minLength": 1 },
            "permissions": {
                "type": "object",
                "required": ["filesystem", "network"],
                "properties": {
                    "filesystem": {
                        "type": "object",
                        "required": ["read", "write"],
                        "properties": {
                            "read": { "type": "array", "items": { "type": "string" } },
                            "write": { "type": "array", "items": { "type": "string" } }
                        }
                    },
                    "network": {
                        "type": "object",
                        "required": ["connect", "listen_localhost"],
                        "properties": {
                            "connect": { "type": "array", "items": { "type": "string" } },
                            "listen_localhost": { "type": "boolean" }
                        }
                    }
                }
            },
            "limits": {
                "type": "object",
                "required": ["memory_mb", "cpu_ms_per_sec"],
                "properties": {
                    "memory_mb": { "type": "integer", "minimum": 1 },
                    "cpu_ms_per_sec": { "type": "integer", "minimum": 1, "maximum": 1000 }
                }
            },
            "build": { "type": "object" },
            "required_env": { "type": "array", "items": { "type": "string", "minLength": 1 } }
        }
    })
});

static MANIFEST_VALIDATOR: Lazy<Result<Validator, String>> = Lazy::new(|| {
    jsonschema::options()
        .with_draft(Draft::Draft7)
        .build(&MANIFEST_SCHEMA)
        .map_err(|err| err.to_string())
});

impl PackManifest {
    /// Parse and validate a manifest document without looking at the pack tree.
    pub fn from_json_str(raw: &str) -> PackResult<Self> {
        let value: Value = serde_json::from_str(raw)
            .map_err(|err| PackError::ManifestValidation(format!("{MANIFEST_FILE} is not JSON: {err}")))?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> PackResult<Self> {
        let issues = schema_issues(&value);
        if !issues.is_empty() {
            return Err(PackError::ManifestValidation(issues.join("; ")));
        }
        let manifest: PackManifest = serde_json::from_value(value)
            .map_err(|err| PackError::ManifestValidation(err.to_string()))?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Read `pack.json` from an extracted pack root and check the entry exists.
    pub fn load_from_root(root: &Path) -> PackResult<Self> {
        let path = root.join(MANIFEST_FILE);
        let raw = std::fs::read_to_string(&path).map_err(|err| {
            PackError::ManifestValidation(format!("cannot read {MANIFEST_FILE}: {err}"))
        })?;
        let manifest = Self::from_json_str(&raw)?;
        manifest.validate_against_root(root)?;
        Ok(manifest)
    }

    pub fn validate(&self) -> PackResult<()> {
        let mut issues = Vec::new();
        if !is_valid_pack_id(&self.id) {
            issues.push(format!(
                "`id` `{}` may only contain [A-Za-z0-9._-] and must not start with `.`",
                self.id
            ));
        }
        for (field, value) in [("id", &self.id), ("name", &self.name), ("version", &self.version)] {
            if value.trim().is_empty() {
                issues.push(format!("`{field}` must not be blank"));
            }
        }
        if let Err(reason) = check_relative_path(&self.entry) {
            issues.push(format!("entry: {reason}"));
        }
        for path in &self.permissions.filesystem.read {
            if let Err(reason) = check_relative_path(path) {
                issues.push(format!("permissions.filesystem.read: {reason}"));
            }
        }
        for path in &self.permissions.filesystem.write {
            if let Err(reason) = check_relative_path(path) {
                issues.push(format!("permissions.filesystem.write: {reason}"));
            }
        }
        for grant in &self.permissions.network.connect {
            if !is_valid_network_grant(grant) {
                issues.push(format!(
                    "permissions.network.connect: `{grant}` is neither an http(s) URL prefix nor a hostname"
                ));
            }
        }
        let mut seen = BTreeSet::new();
        for name in &self.required_env {
            if name.trim().is_empty() {
                issues.push("required_env entries must not be blank".to_string());
            } else if !seen.insert(name.as_str()) {
                issues.push(format!("required_env lists `{name}` twice"));
            }
        }
        if issues.is_empty() {
            Ok(())
        } else {
            Err(PackError::ManifestValidation(issues.join("; ")))
        }
    }

    pub fn validate_against_root(&self, root: &Path) -> PackResult<()> {
        let entry = root.join(&self.entry);
        if !entry.is_file() {
            return Err(PackError::ManifestValidation(format!(
                "declared entry `{}` does not exist in the pack",
                self.entry
            )));
        }
        Ok(())
    }
}

fn is_valid_pack_id(id: &str) -> bool {
    !id.is_empty()
        && !id.starts_with('.')
        && id
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '.' | '-' | '_'))
}

fn schema_issues(instance: &Value) -> Vec<String> {
    let validator = match MANIFEST_VALIDATOR.as_ref() {
        Ok(validator) => validator,
        Err(err) => return vec![format!("manifest schema is invalid: {err}")],
    };
    validator
        .iter_errors(instance)
        .map(|err| {
            let path = err.instance_path().to_string();
            let path = if path.is_empty() { "/".to_string() } else { path };
            format!("{path}: {err}")
        })
        .collect()
}
