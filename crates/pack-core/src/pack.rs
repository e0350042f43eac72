use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::manifest::{PackManifest, PackType};
use crate::naming::PackFileName;
use crate::permissions::{Limits, Permissions};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstallMode {
    Dev,
    Prod,
}

impl fmt::Display for InstallMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstallMode::Dev => f.write_str("dev"),
            InstallMode::Prod => f.write_str("prod"),
        }
    }
}

/// Where the installed bytes came from. The variant fixes the install mode.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum InstallSource {
    /// Workflow build artifact for a branch.
    Dev {
        branch: String,
        artifact_url: String,
        fetched_at: DateTime<Utc>,
    },
    /// Asset attached to an immutable tagged release.
    Prod {
        tag: String,
        release_url: String,
        fetched_at: DateTime<Utc>,
    },
}

impl InstallSource {
    pub fn mode(&self) -> InstallMode {
        match self {
            InstallSource::Dev { .. } => InstallMode::Dev,
            InstallSource::Prod { .. } => InstallMode::Prod,
        }
    }
}

/// Committed pack record. Reinstalling replaces the record wholesale.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Pack {
    pub id: String,
    pub name: String,
    pub version: String,
    #[serde(rename = "type")]
    pub pack_type: PackType,
    pub entry: String,
    pub install_mode: InstallMode,
    pub install_source: InstallSource,
    pub file_name: PackFileName,
    pub permissions: Permissions,
    pub limits: Limits,
    pub required_secrets: Vec<String>,
    pub install_path: PathBuf,
    pub installed_at: DateTime<Utc>,
}

impl Pack {
    pub fn from_manifest(
        manifest: PackManifest,
        file_name: PackFileName,
        source: InstallSource,
        install_path: PathBuf,
    ) -> Self {
        Self {
            id: manifest.id,
            name: manifest.name,
            version: manifest.version,
            pack_type: manifest.pack_type,
            entry: manifest.entry,
            install_mode: source.mode(),
            install_source: source,
            file_name,
            permissions: manifest.permissions,
            limits: manifest.limits,
            required_secrets: manifest.required_env,
            install_path,
            installed_at: Utc::now(),
        }
    }

    pub fn entry_path(&self) -> PathBuf {
        self.install_path.join(&self.entry)
    }
}
