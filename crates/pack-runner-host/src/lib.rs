//! Host runtime for the pack runner.
//!
//! [`RunnerHost`] is the composition root: it wires the pack installer, the
//! collaborator backends, the workflow engine and the instance manager from a
//! [`RunnerConfig`]. Every collaborator can be swapped through the builder,
//! which is how tests substitute in-memory fakes.

use std::sync::Arc;

use anyhow::{Context, Result};
use pack_core::{FsPackStore, InstallRequest, Pack, PackInstaller, PackResult, PackStore};
use tokio::sync::broadcast;
use tracing::warn;

pub mod boot;
pub mod config;
pub mod error;
pub mod executor;
pub mod host;
pub mod instance;
pub mod workflow;

pub use config::{Environment, RunnerConfig};
pub use error::{InstanceError, WorkflowError};
pub use executor::PackExecutor;
pub use instance::{
    Instance, InstanceChange, InstanceManager, InstanceState, PauseReason, StopReason,
};
pub use workflow::{RunSignals, WorkflowDefinition, WorkflowEngine};

use host::{
    BroadcastEventBus, Event, FanoutLogSink, HttpClient, LogEntry, LogLevel, LogSink,
    MemoryLogSink, ReqwestHttpClient, SecretStore, TracingLogSink, WasmRuntime, WasmtimeRuntime,
};

pub struct RunnerHost {
    config: RunnerConfig,
    installer: Arc<PackInstaller>,
    instances: InstanceManager,
    sink: Arc<dyn LogSink>,
    logs: Arc<MemoryLogSink>,
    events: Arc<BroadcastEventBus>,
}

impl RunnerHost {
    pub fn builder(config: RunnerConfig) -> RunnerHostBuilder {
        RunnerHostBuilder {
            config,
            pack_store: None,
            secrets: None,
            http: None,
            wasm: None,
            extra_sinks: Vec::new(),
        }
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    pub fn installer(&self) -> &Arc<PackInstaller> {
        &self.installer
    }

    pub fn instances(&self) -> &InstanceManager {
        &self.instances
    }

    /// Bounded buffer of every entry written to the log sink.
    pub fn logs(&self) -> &MemoryLogSink {
        &self.logs
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    pub fn install(&self, request: InstallRequest) -> PackResult<Pack> {
        let file_name = request.file_name.clone();
        match self.installer.install(request) {
            Ok(pack) => {
                self.sink.append(LogEntry::new(
                    LogLevel::Info,
                    "installer",
                    format!("installed {} {} from {file_name}", pack.id, pack.version),
                ));
                Ok(pack)
            }
            Err(err) => {
                warn!(file = %file_name, code = err.code(), "install rejected");
                self.sink.append(LogEntry::new(
                    LogLevel::Error,
                    err.code(),
                    format!("{file_name}: {err}"),
                ));
                Err(err)
            }
        }
    }

    pub fn packs(&self) -> PackResult<Vec<Pack>> {
        self.installer.list()
    }

    /// Cascade: every instance of the pack is stopped and removed first.
    pub async fn delete_pack(&self, pack_id: &str) -> Result<Option<Pack>, InstanceError> {
        self.instances.delete_pack(pack_id).await
    }
}

pub struct RunnerHostBuilder {
    config: RunnerConfig,
    pack_store: Option<Arc<dyn PackStore>>,
    secrets: Option<Arc<dyn SecretStore>>,
    http: Option<Arc<dyn HttpClient>>,
    wasm: Option<Arc<dyn WasmRuntime>>,
    extra_sinks: Vec<Arc<dyn LogSink>>,
}

impl RunnerHostBuilder {
    pub fn pack_store(mut self, store: Arc<dyn PackStore>) -> Self {
        self.pack_store = Some(store);
        self
    }

    pub fn secrets(mut self, secrets: Arc<dyn SecretStore>) -> Self {
        self.secrets = Some(secrets);
        self
    }

    pub fn http(mut self, http: Arc<dyn HttpClient>) -> Self {
        self.http = Some(http);
        self
    }

    pub fn wasm(mut self, wasm: Arc<dyn WasmRuntime>) -> Self {
        self.wasm = Some(wasm);
        self
    }

    pub fn log_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.extra_sinks.push(sink);
        self
    }

    pub fn build(self) -> Result<RunnerHost> {
        let config = self.config;
        std::fs::create_dir_all(&config.packs_dir)
            .with_context(|| format!("failed to create {}", config.packs_dir.display()))?;
        let store: Arc<dyn PackStore> = match self.pack_store {
            Some(store) => store,
            None => Arc::new(FsPackStore::new(config.state_dir.clone())),
        };
        let installer = Arc::new(PackInstaller::new(config.packs_dir.clone(), store));
        let secrets = match self.secrets {
            Some(secrets) => secrets,
            None => config
                .secrets
                .build_store_for(config.environment)
                .context("failed to build secret store")?,
        };
        let http: Arc<dyn HttpClient> = match self.http {
            Some(http) => http,
            None => Arc::new(ReqwestHttpClient::new(config.http_timeout)?),
        };
        let wasm: Arc<dyn WasmRuntime> = match self.wasm {
            Some(wasm) => wasm,
            None => Arc::new(WasmtimeRuntime::new()?),
        };

        let logs = Arc::new(MemoryLogSink::new(config.log_buffer));
        let mut sinks: Vec<Arc<dyn LogSink>> = vec![Arc::new(TracingLogSink), logs.clone()];
        sinks.extend(self.extra_sinks);
        let sink: Arc<dyn LogSink> = Arc::new(FanoutLogSink::new(sinks));
        let events = Arc::new(BroadcastEventBus::default());

        let engine = Arc::new(WorkflowEngine::new(
            http,
            wasm,
            sink.clone(),
            events.clone(),
            config.max_sleep,
        ));
        let instances = InstanceManager::new(
            installer.clone(),
            secrets,
            PackExecutor::new(engine),
            sink.clone(),
            config.stop_grace,
        );
        Ok(RunnerHost {
            config,
            installer,
            instances,
            sink,
            logs,
            events,
        })
    }
}
