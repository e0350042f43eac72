use std::sync::Arc;

use pack_core::{InstallRequest, MemoryPackStore, PackError};
use pack_runner_host::{RunnerConfig, RunnerHost};
use pack_runner_tests::{PackArchive, dev_source};
use serde_json::json;
use tempfile::TempDir;
use walkdir::WalkDir;

fn host(temp: &TempDir) -> RunnerHost {
    RunnerHost::builder(RunnerConfig::with_home(temp.path().join("home")))
        .pack_store(Arc::new(MemoryPackStore::new()))
        .build()
        .expect("host builds")
}

fn files_under(root: &std::path::Path) -> Vec<String> {
    WalkDir::new(root)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.path().display().to_string())
        .collect()
}

fn steps() -> serde_json::Value {
    json!([{ "id": "say", "type": "log", "message": "hi" }])
}

#[test]
fn zip_slip_entries_are_rejected_without_residue() {
    let temp = TempDir::new().unwrap();
    let host = host(&temp);
    for evil in ["../../escaped.txt", "/abs/escaped.txt", "nested/../../escaped.txt", "C:\\escaped.txt"] {
        let archive = PackArchive::workflow("dev.acme.evil", steps()).file(evil, "owned");
        let err = host
            .install(InstallRequest::dev(
                "pack-evil-universal-1.0.0.zip",
                archive.to_bytes(),
                dev_source(),
            ))
            .unwrap_err();
        assert!(
            matches!(err, PackError::UnsafeArchiveEntry(_)),
            "{evil}: unexpected {err:?}"
        );
    }
    assert!(host.packs().unwrap().is_empty());
    assert!(!temp.path().join("escaped.txt").exists());
    assert!(files_under(&host.config().packs_dir).is_empty());
    assert_eq!(
        host.logs()
            .entries()
            .iter()
            .filter(|entry| entry.source == "unsafe_archive_entry")
            .count(),
        4
    );
}

#[test]
fn bad_filenames_are_rejected_before_reading_bytes() {
    let temp = TempDir::new().unwrap();
    let host = host(&temp);
    for name in [
        "pack.zip",
        "greeter-universal-1.0.0.zip",
        "pack-greeter-1.0.0.zip",
        "pack-greeter-universal-1.0.0.tar.gz",
        "pack-Greeter-universal-1.0.0.zip",
    ] {
        let err = host
            .install(InstallRequest::dev(name, b"not a zip".to_vec(), dev_source()))
            .unwrap_err();
        assert_eq!(err.code(), "naming_convention", "{name}");
    }
}

#[test]
fn corrupt_archive_and_bad_manifest_are_rejected() {
    let temp = TempDir::new().unwrap();
    let host = host(&temp);

    let err = host
        .install(InstallRequest::dev(
            "pack-greeter-universal-1.0.0.zip",
            b"definitely not a zip".to_vec(),
            dev_source(),
        ))
        .unwrap_err();
    assert!(matches!(err, PackError::InvalidArchive(_)));

    let no_manifest = PackArchive::workflow("dev.acme.x", steps()).without_manifest();
    let err = host
        .install(InstallRequest::dev(
            "pack-greeter-universal-1.0.0.zip",
            no_manifest.to_bytes(),
            dev_source(),
        ))
        .unwrap_err();
    assert!(matches!(err, PackError::ManifestValidation(_)));

    let bad_grant = PackArchive::workflow("dev.acme.x", steps()).connect(&["ftp://files.example.com"]);
    let err = host
        .install(InstallRequest::dev(
            "pack-greeter-universal-1.0.0.zip",
            bad_grant.to_bytes(),
            dev_source(),
        ))
        .unwrap_err();
    assert!(matches!(err, PackError::ManifestValidation(_)));

    let escaping_entry = PackArchive::workflow("dev.acme.x", steps())
        .manifest_field("entry", json!("../workflow.json"));
    let err = host
        .install(InstallRequest::dev(
            "pack-greeter-universal-1.0.0.zip",
            escaping_entry.to_bytes(),
            dev_source(),
        ))
        .unwrap_err();
    assert!(matches!(err, PackError::ManifestValidation(_)));

    assert!(host.packs().unwrap().is_empty());
    assert!(files_under(&host.config().packs_dir).is_empty());
}
