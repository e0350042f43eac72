//! Download-to-installed pipeline.
//!
//! Stages run in a fixed order and each one short-circuits: filename grammar,
//! release verification (prod only), sandboxed extraction into a private
//! staging directory, manifest validation, then a serialized commit that
//! swaps the staging directory into place and writes the store record. A
//! failure at any stage deletes the staging directory and leaves the store
//! untouched.

use std::fs;
use std::io::{self, Cursor};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, info_span, warn};
use uuid::Uuid;
use zip::ZipArchive;

use crate::checksum::{self, ChecksumSet};
use crate::error::{PackError, PackResult};
use crate::index::{INDEX_FILE, PackIndex};
use crate::manifest::PackManifest;
use crate::naming::{self, PackFileName};
use crate::pack::{InstallMode, InstallSource, Pack};
use crate::store::PackStore;

const STAGING_DIR: &str = ".staging";
const TRASH_DIR: &str = ".trash";
const CHECKSUMS_FILE: &str = "checksums.sha256";

/// Companion documents published next to a tagged release.
#[derive(Clone, Debug, Default)]
pub struct ReleaseVerification {
    pub index: Option<PackIndex>,
    pub checksums: Option<ChecksumSet>,
}

#[derive(Clone, Debug)]
pub struct InstallRequest {
    pub file_name: String,
    pub bytes: Vec<u8>,
    pub source: InstallSource,
    pub verification: ReleaseVerification,
}

impl InstallRequest {
    pub fn dev(file_name: impl Into<String>, bytes: Vec<u8>, source: InstallSource) -> Self {
        Self {
            file_name: file_name.into(),
            bytes,
            source,
            verification: ReleaseVerification::default(),
        }
    }
}

pub struct PackInstaller {
    packs_root: PathBuf,
    store: Arc<dyn PackStore>,
    commit_lock: Mutex<()>,
}

impl PackInstaller {
    pub fn new(packs_root: PathBuf, store: Arc<dyn PackStore>) -> Self {
        Self {
            packs_root,
            store,
            commit_lock: Mutex::new(()),
        }
    }

    pub fn packs_root(&self) -> &Path {
        &self.packs_root
    }

    pub fn get(&self, id: &str) -> PackResult<Option<Pack>> {
        self.store.get(id)
    }

    pub fn list(&self) -> PackResult<Vec<Pack>> {
        self.store.list()
    }

    pub fn install(&self, request: InstallRequest) -> PackResult<Pack> {
        let span = info_span!(
            "install",
            file = %request.file_name,
            mode = %request.source.mode()
        );
        let _guard = span.enter();

        let file_name = naming::parse(&request.file_name).ok_or_else(|| {
            PackError::NamingConvention(format!(
                "`{}` does not match pack-<variant>-<target>-<version>.zip",
                request.file_name
            ))
        })?;

        match request.source.mode() {
            InstallMode::Prod => verify_release(&request, &file_name)?,
            InstallMode::Dev => debug!("dev install; release verification skipped"),
        }

        let staging = self.create_staging_dir()?;
        let outcome = extract_archive(&request.bytes, &staging)
            .and_then(|written| {
                debug!(entries = written, "archive extracted");
                PackManifest::load_from_root(&staging)
            })
            .and_then(|manifest| {
                if manifest.version != file_name.version {
                    warn!(
                        manifest_version = %manifest.version,
                        file_version = %file_name.version,
                        "manifest version differs from filename version"
                    );
                }
                self.commit(manifest, file_name, request.source, &staging)
            });
        if outcome.is_err() && staging.exists() {
            if let Err(err) = fs::remove_dir_all(&staging) {
                warn!(error = %err, path = %staging.display(), "failed to clean staging directory");
            }
        }
        outcome
    }

    /// Remove a committed pack; returns the removed record.
    pub fn uninstall(&self, id: &str) -> PackResult<Option<Pack>> {
        let _guard = self.commit_lock.lock();
        let Some(pack) = self.store.remove(id)? else {
            return Ok(None);
        };
        if pack.install_path.starts_with(&self.packs_root) && pack.install_path.exists() {
            fs::remove_dir_all(&pack.install_path)?;
        }
        info!(pack_id = %pack.id, "pack uninstalled");
        Ok(Some(pack))
    }

    fn create_staging_dir(&self) -> PackResult<PathBuf> {
        let staging = self
            .packs_root
            .join(STAGING_DIR)
            .join(Uuid::new_v4().to_string());
        fs::create_dir_all(&staging)?;
        Ok(staging)
    }

    fn commit(
        &self,
        manifest: PackManifest,
        file_name: PackFileName,
        source: InstallSource,
        staging: &Path,
    ) -> PackResult<Pack> {
        let _guard = self.commit_lock.lock();
        let install_path = self.packs_root.join(&manifest.id);
        let previous = if install_path.exists() {
            let trash = self
                .packs_root
                .join(TRASH_DIR)
                .join(Uuid::new_v4().to_string());
            fs::create_dir_all(trash.parent().unwrap_or(&self.packs_root))?;
            fs::rename(&install_path, &trash)?;
            Some(trash)
        } else {
            None
        };

        if let Err(err) = fs::rename(staging, &install_path) {
            restore_previous(previous.as_deref(), &install_path);
            return Err(err.into());
        }

        let pack = Pack::from_manifest(manifest, file_name, source, install_path.clone());
        if let Err(err) = self.store.commit(&pack) {
            let _ = fs::remove_dir_all(&install_path);
            restore_previous(previous.as_deref(), &install_path);
            return Err(err);
        }
        if let Some(trash) = previous {
            let _ = fs::remove_dir_all(trash);
        }
        info!(
            pack_id = %pack.id,
            version = %pack.version,
            path = %pack.install_path.display(),
            "pack installed"
        );
        Ok(pack)
    }
}

fn restore_previous(previous: Option<&Path>, install_path: &Path) {
    if let Some(previous) = previous
        && let Err(err) = fs::rename(previous, install_path)
    {
        warn!(error = %err, "failed to restore previous pack install");
    }
}

fn verify_release(request: &InstallRequest, file_name: &PackFileName) -> PackResult<()> {
    let index = request.verification.index.as_ref().ok_or_else(|| {
        PackError::MissingVerificationArtifact(format!("{INDEX_FILE} is required for prod installs"))
    })?;
    let checksums = request.verification.checksums.as_ref().ok_or_else(|| {
        PackError::MissingVerificationArtifact(format!(
            "{CHECKSUMS_FILE} is required for prod installs"
        ))
    })?;

    let expected_asset =
        index.resolve_asset(&file_name.variant, &file_name.target, &file_name.version)?;
    if expected_asset != request.file_name {
        return Err(PackError::IndexResolution(format!(
            "index maps {}/{} to `{expected_asset}`, not `{}`",
            file_name.variant, file_name.target, request.file_name
        )));
    }

    let expected = checksums.get(&request.file_name).ok_or_else(|| {
        PackError::MissingVerificationArtifact(format!(
            "{CHECKSUMS_FILE} has no entry for `{}`",
            request.file_name
        ))
    })?;
    let actual = checksum::sha256_hex(&request.bytes);
    if !checksum::digests_match(&actual, expected) {
        return Err(PackError::ChecksumMismatch {
            file: request.file_name.clone(),
            expected: expected.to_string(),
            actual,
        });
    }
    debug!(sha256 = %actual, "release checksum verified");
    Ok(())
}

/// Extract every entry under `root`, refusing anything that would land outside it.
fn extract_archive(bytes: &[u8], root: &Path) -> PackResult<usize> {
    let mut archive = ZipArchive::new(Cursor::new(bytes))
        .map_err(|err| PackError::InvalidArchive(err.to_string()))?;
    let mut written = 0usize;
    for idx in 0..archive.len() {
        let mut entry = archive
            .by_index(idx)
            .map_err(|err| PackError::InvalidArchive(err.to_string()))?;
        let name = entry.name().to_string();
        let relative = safe_entry_path(&name)?;
        if entry.enclosed_name().is_none() {
            return Err(PackError::UnsafeArchiveEntry(name));
        }
        let out_path = root.join(&relative);
        if !out_path.starts_with(root) {
            return Err(PackError::UnsafeArchiveEntry(name));
        }
        if entry.is_dir() {
            fs::create_dir_all(&out_path)?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut outfile = fs::File::create(&out_path)?;
        io::copy(&mut entry, &mut outfile)?;
        written += 1;
    }
    Ok(written)
}

fn safe_entry_path(name: &str) -> PackResult<PathBuf> {
    let unsafe_entry = || PackError::UnsafeArchiveEntry(name.to_string());
    if name.is_empty() || name.starts_with('/') || name.starts_with('\\') {
        return Err(unsafe_entry());
    }
    let bytes = name.as_bytes();
    if bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' {
        return Err(unsafe_entry());
    }
    if name.split(['/', '\\']).any(|segment| segment == "..") {
        return Err(unsafe_entry());
    }
    let mut relative = PathBuf::new();
    for component in Path::new(name).components() {
        match component {
            Component::Normal(part) => relative.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(unsafe_entry());
            }
        }
    }
    if relative.as_os_str().is_empty() {
        return Err(unsafe_entry());
    }
    Ok(relative)
}
