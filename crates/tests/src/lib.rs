//! Shared fixtures for the end-to-end tests: pack archives built in memory.

use std::io::{Cursor, Write};

use chrono::Utc;
use pack_core::checksum::sha256_hex;
use pack_core::{ChecksumSet, InstallRequest, InstallSource, PackIndex, ReleaseVerification};
use serde_json::{Value, json};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

/// Builder for a pack archive: `pack.json` plus arbitrary files.
#[derive(Clone, Debug)]
pub struct PackArchive {
    manifest: Value,
    files: Vec<(String, Vec<u8>)>,
}

impl PackArchive {
    /// A workflow pack whose `workflow.json` is `steps`.
    pub fn workflow(id: &str, steps: Value) -> Self {
        let workflow = json!({ "workflow_version": 1, "id": format!("{id}-flow"), "steps": steps });
        Self {
            manifest: json!({
                "id": id,
                "name": id,
                "version": "1.0.0",
                "type": "workflow",
                "entry": "workflow.json",
                "permissions": {
                    "filesystem": { "read": [], "write": [] },
                    "network": { "connect": [], "listen_localhost": false }
                },
                "limits": { "memory_mb": 32, "cpu_ms_per_sec": 100 },
                "build": { "commit": "0000000" }
            }),
            files: Vec::new(),
        }
        .file("workflow.json", workflow.to_string())
    }

    pub fn manifest_field(mut self, key: &str, value: Value) -> Self {
        self.manifest[key] = value;
        self
    }

    pub fn connect(mut self, grants: &[&str]) -> Self {
        self.manifest["permissions"]["network"]["connect"] = json!(grants);
        self
    }

    pub fn required_env(self, names: &[&str]) -> Self {
        self.manifest_field("required_env", json!(names))
    }

    /// Add a file verbatim, including unsafe names such as `../x`.
    pub fn file(mut self, name: &str, contents: impl Into<Vec<u8>>) -> Self {
        self.files.push((name.to_string(), contents.into()));
        self
    }

    pub fn without_manifest(mut self) -> Self {
        self.manifest = Value::Null;
        self
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
        if !self.manifest.is_null() {
            zip.start_file("pack.json", options).expect("zip entry");
            zip.write_all(self.manifest.to_string().as_bytes())
                .expect("zip write");
        }
        for (name, contents) in &self.files {
            zip.start_file(name.as_str(), options).expect("zip entry");
            zip.write_all(contents).expect("zip write");
        }
        zip.finish().expect("zip finish").into_inner()
    }
}

pub fn dev_source() -> InstallSource {
    InstallSource::Dev {
        branch: "main".into(),
        artifact_url: "https://github.com/acme/packs/actions/runs/1/artifacts/2".into(),
        fetched_at: Utc::now(),
    }
}

pub fn prod_source(tag: &str) -> InstallSource {
    InstallSource::Prod {
        tag: tag.into(),
        release_url: format!("https://github.com/acme/packs/releases/tag/{tag}"),
        fetched_at: Utc::now(),
    }
}

/// Index with one variant that ships `android-arm64` and `universal` builds.
pub fn release_index(variant: &str) -> PackIndex {
    let raw = json!({
        "default_variant": variant,
        "targets": {
            "android": { "preferred": ["android-arm64", "universal"] },
            "linux": { "preferred": ["universal"] }
        },
        "variants": {
            variant: {
                "targets": {
                    "android-arm64": { "asset": format!("pack-{variant}-android-arm64-{{version}}.zip") },
                    "universal": { "asset": format!("pack-{variant}-universal-{{version}}.zip") }
                }
            }
        }
    });
    PackIndex::from_json_str(&raw.to_string()).expect("valid index")
}

/// `checksums.sha256` text for the given assets.
pub fn checksum_file(entries: &[(&str, &[u8])]) -> String {
    entries
        .iter()
        .map(|(name, bytes)| format!("{}  {name}\n", sha256_hex(bytes)))
        .collect()
}

pub fn prod_request(
    file_name: &str,
    bytes: Vec<u8>,
    index: Option<PackIndex>,
    checksums: Option<ChecksumSet>,
) -> InstallRequest {
    InstallRequest {
        file_name: file_name.to_string(),
        bytes,
        source: prod_source("v1.0.0"),
        verification: ReleaseVerification { index, checksums },
    }
}
