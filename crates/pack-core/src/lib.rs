//! Pack installation core for the pack runner.
//!
//! This crate provides the building blocks required to turn a downloaded pack
//! archive into a trusted, installed pack: filename grammar, SHA-256 checksum
//! handling, production index resolution, manifest validation, permission
//! checks and the atomic install pipeline. It does not execute packs; use
//! `pack-runner-host`, which wraps these helpers with the workflow engine and
//! instance lifecycle.

pub mod checksum;
pub mod error;
pub mod index;
pub mod installer;
pub mod manifest;
pub mod naming;
pub mod pack;
pub mod permissions;
pub mod store;

pub use checksum::ChecksumSet;
pub use error::{PackError, PackResult};
pub use index::{DeviceProfile, PackIndex, ResolvedAsset, TargetProbe};
pub use installer::{InstallRequest, PackInstaller, ReleaseVerification};
pub use manifest::{PackManifest, PackType};
pub use naming::PackFileName;
pub use pack::{InstallMode, InstallSource, Pack};
pub use permissions::{
    Decision, FilesystemGrants, FsMode, Limits, NetworkGrants, PermissionEnforcer, Permissions,
};
pub use store::{FsPackStore, MemoryPackStore, PackStore};
