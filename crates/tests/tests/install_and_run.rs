use std::sync::Arc;
use std::time::Duration;

use pack_core::{InstallMode, InstallRequest, PackType};
use pack_runner_host::host::MemorySecretStore;
use pack_runner_host::{InstanceState, RunnerConfig, RunnerHost, StopReason};
use pack_runner_tests::{PackArchive, dev_source};
use serde_json::json;
use tempfile::TempDir;

fn host(home: &std::path::Path, secrets: Arc<MemorySecretStore>) -> RunnerHost {
    RunnerHost::builder(RunnerConfig::with_home(home.to_path_buf()))
        .secrets(secrets)
        .build()
        .expect("host builds")
}

#[tokio::test]
async fn dev_install_then_run_to_completion() -> anyhow::Result<()> {
    let temp = TempDir::new()?;
    let secrets = Arc::new(MemorySecretStore::with_values([("GREETING", "hello")]));
    let host = host(temp.path(), secrets.clone());

    let archive = PackArchive::workflow(
        "dev.acme.greeter",
        json!([
            { "id": "save", "type": "kv.put", "key": "who", "value": "world" },
            { "id": "who", "type": "kv.get", "key": "who" },
            { "id": "say", "type": "log", "message": "greeting {{who.response}}" },
            { "id": "done", "type": "emit.event", "name": "greeted", "payload": { "who": "{{who.response}}" } }
        ]),
    )
    .required_env(&["GREETING"]);
    let pack = host.install(InstallRequest::dev(
        "pack-greeter-universal-1.0.0.zip",
        archive.to_bytes(),
        dev_source(),
    ))?;
    assert_eq!(pack.id, "dev.acme.greeter");
    assert_eq!(pack.pack_type, PackType::Workflow);
    assert_eq!(pack.install_mode, InstallMode::Dev);
    assert_eq!(pack.file_name.variant, "greeter");
    assert_eq!(pack.required_secrets, vec!["GREETING".to_string()]);
    assert!(pack.install_path.starts_with(&host.config().packs_dir));

    let mut events = host.subscribe_events();
    let instance = host.instances().create(&pack.id)?;
    host.instances().start(&instance.id)?;
    let stopped = tokio::time::timeout(
        Duration::from_secs(10),
        host.instances().wait_stopped(&instance.id),
    )
    .await??;
    assert_eq!(stopped.state, InstanceState::Stopped);
    assert_eq!(stopped.stop_reason, Some(StopReason::Completed));

    let event = events.try_recv()?;
    assert_eq!(event.name, "greeted");
    assert_eq!(event.payload, json!({ "who": "world" }));

    let logs = host.logs().for_instance(&instance.id);
    assert!(logs.iter().any(|entry| entry.message == "greeting world"));
    assert!(
        host.logs()
            .entries()
            .iter()
            .all(|entry| !entry.message.contains("hello")),
        "secret value leaked into logs"
    );
    Ok(())
}

#[tokio::test]
async fn installed_packs_survive_a_restart() -> anyhow::Result<()> {
    let temp = TempDir::new()?;
    let archive = PackArchive::workflow(
        "dev.acme.persisted",
        json!([{ "id": "say", "type": "log", "message": "hi" }]),
    );
    {
        let host = host(temp.path(), Arc::new(MemorySecretStore::new()));
        host.install(InstallRequest::dev(
            "pack-persisted-universal-2.0.0.zip",
            archive.to_bytes(),
            dev_source(),
        ))?;
    }

    let host = host(temp.path(), Arc::new(MemorySecretStore::new()));
    let packs = host.packs()?;
    assert_eq!(packs.len(), 1);
    assert_eq!(packs[0].id, "dev.acme.persisted");
    assert_eq!(packs[0].file_name.version, "2.0.0");

    let removed = host.delete_pack("dev.acme.persisted").await?;
    assert!(removed.is_some());
    assert!(host.packs()?.is_empty());
    assert!(!temp.path().join("packs").join("dev.acme.persisted").exists());
    Ok(())
}

#[tokio::test]
async fn reinstall_replaces_the_previous_version() -> anyhow::Result<()> {
    let temp = TempDir::new()?;
    let host = host(temp.path(), Arc::new(MemorySecretStore::new()));
    let steps = json!([{ "id": "say", "type": "log", "message": "hi" }]);

    let v1 = PackArchive::workflow("dev.acme.app", steps.clone()).file("old.txt", "v1");
    host.install(InstallRequest::dev("pack-app-universal-1.0.0.zip", v1.to_bytes(), dev_source()))?;

    let v2 = PackArchive::workflow("dev.acme.app", steps)
        .manifest_field("version", json!("2.0.0"))
        .file("new.txt", "v2");
    let pack = host.install(InstallRequest::dev("pack-app-universal-2.0.0.zip", v2.to_bytes(), dev_source()))?;

    assert_eq!(pack.version, "2.0.0");
    assert_eq!(host.packs()?.len(), 1);
    assert!(pack.install_path.join("new.txt").is_file());
    assert!(!pack.install_path.join("old.txt").exists());
    Ok(())
}

#[tokio::test]
async fn missing_secret_blocks_start_after_install() -> anyhow::Result<()> {
    let temp = TempDir::new()?;
    let host = host(temp.path(), Arc::new(MemorySecretStore::new()));
    let archive = PackArchive::workflow(
        "dev.acme.secretive",
        json!([{ "id": "say", "type": "log", "message": "hi" }]),
    )
    .required_env(&["API_TOKEN"]);
    let pack = host.install(InstallRequest::dev(
        "pack-secretive-universal-1.0.0.zip",
        archive.to_bytes(),
        dev_source(),
    ))?;

    let instance = host.instances().create(&pack.id)?;
    let err = host.instances().start(&instance.id).unwrap_err();
    assert_eq!(err.code(), "missing_secret");
    assert_eq!(
        host.instances().get(&instance.id).map(|i| i.state),
        Some(InstanceState::Stopped)
    );
    Ok(())
}
