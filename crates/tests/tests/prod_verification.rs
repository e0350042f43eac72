use std::sync::Arc;

use pack_core::checksum::parse_checksum_file;
use pack_core::{DeviceProfile, InstallMode, InstallSource, MemoryPackStore, PackError};
use pack_runner_host::{RunnerConfig, RunnerHost};
use pack_runner_tests::{PackArchive, checksum_file, prod_request, release_index};
use serde_json::json;
use tempfile::TempDir;

const ASSET: &str = "pack-greeter-universal-1.2.0.zip";

fn host(temp: &TempDir) -> RunnerHost {
    RunnerHost::builder(RunnerConfig::with_home(temp.path().join("home")))
        .pack_store(Arc::new(MemoryPackStore::new()))
        .build()
        .expect("host builds")
}

fn archive_bytes() -> Vec<u8> {
    PackArchive::workflow(
        "prod.acme.greeter",
        json!([{ "id": "say", "type": "log", "message": "hi" }]),
    )
    .manifest_field("version", json!("1.2.0"))
    .to_bytes()
}

#[test]
fn verified_release_installs() {
    let temp = TempDir::new().unwrap();
    let host = host(&temp);
    let bytes = archive_bytes();
    let checksums = parse_checksum_file(&checksum_file(&[(ASSET, &bytes)]));

    let pack = host
        .install(prod_request(ASSET, bytes, Some(release_index("greeter")), Some(checksums)))
        .expect("verified install");
    assert_eq!(pack.install_mode, InstallMode::Prod);
    assert!(matches!(pack.install_source, InstallSource::Prod { ref tag, .. } if tag == "v1.0.0"));
}

#[test]
fn release_without_verification_artifacts_is_rejected() {
    let temp = TempDir::new().unwrap();
    let host = host(&temp);
    let bytes = archive_bytes();
    let checksums = parse_checksum_file(&checksum_file(&[(ASSET, &bytes)]));

    for (index, sums) in [
        (None, Some(checksums.clone())),
        (Some(release_index("greeter")), None),
        (
            Some(release_index("greeter")),
            Some(parse_checksum_file(&checksum_file(&[("pack-other-universal-1.2.0.zip", &bytes)]))),
        ),
    ] {
        let err = host
            .install(prod_request(ASSET, bytes.clone(), index, sums))
            .unwrap_err();
        assert!(matches!(err, PackError::MissingVerificationArtifact(_)), "{err:?}");
    }
    assert!(host.packs().unwrap().is_empty());
}

#[test]
fn checksum_mismatch_is_rejected() {
    let temp = TempDir::new().unwrap();
    let host = host(&temp);
    let bytes = archive_bytes();
    let mut tampered = bytes.clone();
    tampered.push(0);
    let checksums = parse_checksum_file(&checksum_file(&[(ASSET, &bytes)]));

    let err = host
        .install(prod_request(ASSET, tampered, Some(release_index("greeter")), Some(checksums)))
        .unwrap_err();
    match err {
        PackError::ChecksumMismatch { file, expected, actual } => {
            assert_eq!(file, ASSET);
            assert_ne!(expected, actual);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(host.packs().unwrap().is_empty());
}

#[test]
fn asset_the_index_does_not_map_is_rejected() {
    let temp = TempDir::new().unwrap();
    let host = host(&temp);
    let bytes = archive_bytes();
    let name = "pack-greeter-windows-x64-1.2.0.zip";
    let checksums = parse_checksum_file(&checksum_file(&[(name, &bytes)]));

    let err = host
        .install(prod_request(name, bytes, Some(release_index("greeter")), Some(checksums)))
        .unwrap_err();
    assert_eq!(err.code(), "index_resolution");
}

#[test]
fn device_resolution_walks_preferences() {
    let index = release_index("greeter");
    let arm = DeviceProfile::new("android", ["arm64-v8a"]);
    let resolved = index.resolve(None, "android", &arm, "1.2.0").unwrap();
    assert_eq!(resolved.target, "android-arm64");
    assert_eq!(resolved.asset, "pack-greeter-android-arm64-1.2.0.zip");

    let x86 = DeviceProfile::new("android", ["x86"]);
    let resolved = index.resolve(None, "android", &x86, "1.2.0").unwrap();
    assert_eq!(resolved.asset, "pack-greeter-universal-1.2.0.zip");

    let err = index
        .resolve(Some("missing"), "android", &arm, "1.2.0")
        .unwrap_err();
    assert_eq!(err.code(), "index_resolution");
    assert!(index.resolve(None, "ios", &arm, "1.2.0").is_err());
}
