//! Instance lifecycle: `Stopped -> Running <-> Paused -> Stopped`.
//!
//! Each running instance owns one executor task. A per-instance generation
//! counter is bumped whenever a run is superseded (stop, restart on resume),
//! and a finishing task only changes state when its generation is current.
//! The KV scope moves into the task for the run and comes back when it ends.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use pack_core::{Pack, PackInstaller};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

use crate::error::{InstanceError, WorkflowError};
use crate::executor::PackExecutor;
use crate::host::secrets::unique_names;
use crate::host::{KvScope, LogEntry, LogLevel, LogSink, ResolvedSecrets, SecretStore};
use crate::workflow::RunSignals;

const SOURCE: &str = "instance";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    Stopped,
    Running,
    Paused,
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceState::Stopped => f.write_str("stopped"),
            InstanceState::Running => f.write_str("running"),
            InstanceState::Paused => f.write_str("paused"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseReason {
    Backgrounded,
    MemoryPressure,
}

impl fmt::Display for PauseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PauseReason::Backgrounded => f.write_str("backgrounded"),
            PauseReason::MemoryPressure => f.write_str("memory_pressure"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Requested,
    Completed,
    Failed,
    Deleted,
    PackRemoved,
    Shutdown,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            StopReason::Requested => "requested",
            StopReason::Completed => "completed",
            StopReason::Failed => "failed",
            StopReason::Deleted => "deleted",
            StopReason::PackRemoved => "pack_removed",
            StopReason::Shutdown => "shutdown",
        };
        f.write_str(label)
    }
}

/// Observable snapshot of an instance. Secrets are never part of it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    pub pack_id: String,
    pub state: InstanceState,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub stop_reason: Option<StopReason>,
    pub pause_reason: Option<PauseReason>,
    pub runs: u64,
}

#[derive(Clone, Debug, PartialEq)]
pub enum InstanceChange {
    State {
        instance: Instance,
        from: InstanceState,
    },
    Removed {
        instance_id: String,
        pack_id: String,
    },
}

struct ActiveRun {
    signals: RunSignals,
    handle: JoinHandle<()>,
}

struct Slot {
    info: Instance,
    pack: Option<Arc<Pack>>,
    secrets: Option<Arc<ResolvedSecrets>>,
    kv: Option<KvScope>,
    run: Option<ActiveRun>,
    generation: u64,
    resuming: bool,
}

struct Inner {
    installer: Arc<PackInstaller>,
    secrets: Arc<dyn SecretStore>,
    executor: PackExecutor,
    logs: Arc<dyn LogSink>,
    stop_grace: Duration,
    slots: Mutex<BTreeMap<String, Slot>>,
    changes: broadcast::Sender<InstanceChange>,
}

#[derive(Clone)]
pub struct InstanceManager {
    inner: Arc<Inner>,
}

impl InstanceManager {
    pub fn new(
        installer: Arc<PackInstaller>,
        secrets: Arc<dyn SecretStore>,
        executor: PackExecutor,
        logs: Arc<dyn LogSink>,
        stop_grace: Duration,
    ) -> Self {
        let (changes, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(Inner {
                installer,
                secrets,
                executor,
                logs,
                stop_grace,
                slots: Mutex::new(BTreeMap::new()),
                changes,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<InstanceChange> {
        self.inner.changes.subscribe()
    }

    pub fn get(&self, id: &str) -> Option<Instance> {
        self.inner.slots.lock().get(id).map(|slot| slot.info.clone())
    }

    pub fn list(&self) -> Vec<Instance> {
        self.inner
            .slots
            .lock()
            .values()
            .map(|slot| slot.info.clone())
            .collect()
    }

    /// KV contents between runs; `None` while a run holds the scope.
    pub fn kv_snapshot(&self, id: &str) -> Option<KvScope> {
        self.inner
            .slots
            .lock()
            .get(id)
            .and_then(|slot| slot.kv.clone())
    }

    pub fn create(&self, pack_id: &str) -> Result<Instance, InstanceError> {
        if self.inner.installer.get(pack_id)?.is_none() {
            return Err(InstanceError::PackNotInstalled(pack_id.to_string()));
        }
        let info = Instance {
            id: Uuid::new_v4().to_string(),
            pack_id: pack_id.to_string(),
            state: InstanceState::Stopped,
            created_at: Utc::now(),
            started_at: None,
            stopped_at: None,
            last_error: None,
            stop_reason: None,
            pause_reason: None,
            runs: 0,
        };
        info!(instance_id = %info.id, pack_id, "instance created");
        self.inner.slots.lock().insert(
            info.id.clone(),
            Slot {
                info: info.clone(),
                pack: None,
                secrets: None,
                kv: Some(KvScope::new()),
                run: None,
                generation: 0,
                resuming: false,
            },
        );
        Ok(info)
    }

    /// `Stopped -> Running`. Already running or paused instances are left alone.
    pub fn start(&self, id: &str) -> Result<Instance, InstanceError> {
        let span = info_span!("instance.start", instance_id = %id);
        let _guard = span.enter();
        let pack_id = {
            let slots = self.inner.slots.lock();
            let slot = slots
                .get(id)
                .ok_or_else(|| InstanceError::InstanceNotFound(id.to_string()))?;
            if slot.info.state != InstanceState::Stopped {
                debug!(state = %slot.info.state, "start ignored; executor already exists");
                return Ok(slot.info.clone());
            }
            slot.info.pack_id.clone()
        };
        // Pack store and secret lookups run without the slot lock.
        let prepared = self.prepare_start(&pack_id);

        let mut slots = self.inner.slots.lock();
        let slot = slots
            .get_mut(id)
            .ok_or_else(|| InstanceError::InstanceNotFound(id.to_string()))?;
        if slot.info.state != InstanceState::Stopped {
            debug!(state = %slot.info.state, "start ignored; a concurrent start won");
            return Ok(slot.info.clone());
        }
        let (pack, secrets) = match prepared {
            Ok(prepared) => prepared,
            Err(err) => {
                slot.info.last_error = Some(err.to_string());
                self.inner.report_failure(id, err.code(), &err.to_string());
                return Err(err);
            }
        };
        slot.pack = Some(Arc::new(pack));
        slot.secrets = Some(Arc::new(secrets));
        slot.info.started_at = Some(Utc::now());
        slot.info.stopped_at = None;
        slot.info.last_error = None;
        slot.info.stop_reason = None;
        slot.info.pause_reason = None;
        self.inner.launch(slot);
        self.inner.transition(slot, InstanceState::Running);
        info!("instance started");
        Ok(slot.info.clone())
    }

    fn prepare_start(&self, pack_id: &str) -> Result<(Pack, ResolvedSecrets), InstanceError> {
        let pack = self
            .inner
            .installer
            .get(pack_id)?
            .ok_or_else(|| InstanceError::PackNotInstalled(pack_id.to_string()))?;
        let names = unique_names(&pack.required_secrets);
        match ResolvedSecrets::resolve(self.inner.secrets.as_ref(), &names)? {
            Ok(secrets) => Ok((pack, secrets)),
            Err(missing) => Err(InstanceError::MissingSecret {
                pack_id: pack_id.to_string(),
                names: missing,
            }),
        }
    }

    /// `Running -> Paused`. The in-flight run is interrupted; resume restarts it.
    pub fn pause(&self, id: &str, reason: PauseReason) -> Result<Instance, InstanceError> {
        let mut slots = self.inner.slots.lock();
        let slot = slots
            .get_mut(id)
            .ok_or_else(|| InstanceError::InstanceNotFound(id.to_string()))?;
        match slot.info.state {
            InstanceState::Paused => return Ok(slot.info.clone()),
            InstanceState::Stopped => {
                return Err(InstanceError::InvalidTransition {
                    instance: id.to_string(),
                    from: InstanceState::Stopped,
                    action: "pause",
                });
            }
            InstanceState::Running => {}
        }
        if let Some(run) = &slot.run {
            run.signals.pause();
        }
        slot.info.pause_reason = Some(reason);
        self.inner.transition(slot, InstanceState::Paused);
        info!(instance_id = %id, %reason, "instance paused");
        Ok(slot.info.clone())
    }

    /// `Paused -> Running`, restarting the workflow from its first step with
    /// the KV scope and secrets of the interrupted run.
    pub async fn resume(&self, id: &str) -> Result<Instance, InstanceError> {
        let previous = {
            let mut slots = self.inner.slots.lock();
            let slot = slots
                .get_mut(id)
                .ok_or_else(|| InstanceError::InstanceNotFound(id.to_string()))?;
            match slot.info.state {
                InstanceState::Running => return Ok(slot.info.clone()),
                InstanceState::Stopped => {
                    return Err(InstanceError::InvalidTransition {
                        instance: id.to_string(),
                        from: InstanceState::Stopped,
                        action: "resume",
                    });
                }
                InstanceState::Paused => {}
            }
            if slot.resuming {
                return Ok(slot.info.clone());
            }
            slot.resuming = true;
            slot.run.take()
        };
        if let Some(run) = previous {
            self.inner.settle(run.handle).await;
        }

        let mut slots = self.inner.slots.lock();
        let slot = slots
            .get_mut(id)
            .ok_or_else(|| InstanceError::InstanceNotFound(id.to_string()))?;
        slot.resuming = false;
        if slot.info.state != InstanceState::Paused {
            return Ok(slot.info.clone());
        }
        if slot.kv.is_none() {
            warn!(instance_id = %id, "interrupted run did not hand back its kv scope; starting empty");
        }
        slot.info.pause_reason = None;
        self.inner.launch(slot);
        self.inner.transition(slot, InstanceState::Running);
        info!(instance_id = %id, "instance resumed");
        Ok(slot.info.clone())
    }

    /// `Running | Paused -> Stopped`. The executor is cancelled, given
    /// `stop_grace` to unwind, then aborted.
    pub async fn stop(&self, id: &str, reason: StopReason) -> Result<Instance, InstanceError> {
        let run = {
            let mut slots = self.inner.slots.lock();
            let slot = slots
                .get_mut(id)
                .ok_or_else(|| InstanceError::InstanceNotFound(id.to_string()))?;
            if slot.info.state == InstanceState::Stopped {
                return Ok(slot.info.clone());
            }
            slot.generation += 1;
            let run = slot.run.take();
            if let Some(run) = &run {
                run.signals.stop();
            }
            run
        };
        if let Some(run) = run {
            self.inner.settle(run.handle).await;
        }

        let mut slots = self.inner.slots.lock();
        let slot = slots
            .get_mut(id)
            .ok_or_else(|| InstanceError::InstanceNotFound(id.to_string()))?;
        if slot.info.state != InstanceState::Stopped {
            slot.info.stop_reason = Some(reason);
            slot.info.stopped_at = Some(Utc::now());
            slot.info.pause_reason = None;
            self.inner.transition(slot, InstanceState::Stopped);
            info!(instance_id = %id, %reason, "instance stopped");
        }
        Ok(slot.info.clone())
    }

    pub async fn delete(&self, id: &str) -> Result<Instance, InstanceError> {
        let info = self.stop(id, StopReason::Deleted).await?;
        self.inner.slots.lock().remove(id);
        let _ = self.inner.changes.send(InstanceChange::Removed {
            instance_id: info.id.clone(),
            pack_id: info.pack_id.clone(),
        });
        info!(instance_id = %id, "instance deleted");
        Ok(info)
    }

    /// Stop and delete every instance of the pack, then uninstall it.
    pub async fn delete_pack(&self, pack_id: &str) -> Result<Option<Pack>, InstanceError> {
        let ids: Vec<String> = self
            .inner
            .slots
            .lock()
            .values()
            .filter(|slot| slot.info.pack_id == pack_id)
            .map(|slot| slot.info.id.clone())
            .collect();
        for id in &ids {
            self.stop(id, StopReason::PackRemoved).await?;
            self.inner.slots.lock().remove(id);
            let _ = self.inner.changes.send(InstanceChange::Removed {
                instance_id: id.clone(),
                pack_id: pack_id.to_string(),
            });
        }
        let removed = self.inner.installer.uninstall(pack_id)?;
        info!(pack_id, instances = ids.len(), "pack deleted");
        Ok(removed)
    }

    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.inner.slots.lock().keys().cloned().collect();
        for id in ids {
            if let Err(err) = self.stop(&id, StopReason::Shutdown).await {
                warn!(instance_id = %id, error = %err, "failed to stop instance during shutdown");
            }
        }
    }

    /// Wait until the instance reaches `Stopped` and return that snapshot.
    pub async fn wait_stopped(&self, id: &str) -> Result<Instance, InstanceError> {
        let mut rx = self.subscribe();
        loop {
            let current = self
                .get(id)
                .ok_or_else(|| InstanceError::InstanceNotFound(id.to_string()))?;
            if current.state == InstanceState::Stopped {
                return Ok(current);
            }
            match rx.recv().await {
                Ok(InstanceChange::Removed { instance_id, .. }) if instance_id == id => {
                    return Err(InstanceError::InstanceNotFound(id.to_string()));
                }
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => {
                    return self
                        .get(id)
                        .ok_or_else(|| InstanceError::InstanceNotFound(id.to_string()));
                }
            }
        }
    }
}

impl Inner {
    fn launch(self: &Arc<Self>, slot: &mut Slot) {
        let (Some(pack), Some(secrets)) = (slot.pack.clone(), slot.secrets.clone()) else {
            return;
        };
        slot.generation += 1;
        slot.info.runs += 1;
        let generation = slot.generation;
        let signals = RunSignals::new();
        let kv = slot.kv.take().unwrap_or_default();
        let id = slot.info.id.clone();
        let span = info_span!("instance.run", instance_id = %id, pack_id = %pack.id, generation);
        let inner = Arc::clone(self);
        let task_signals = signals.clone();
        let handle = tokio::spawn(
            async move {
                let mut kv = kv;
                let outcome = inner
                    .executor
                    .run(&pack, &id, &secrets, &mut kv, &task_signals)
                    .await;
                inner.finish_run(&id, generation, kv, outcome);
            }
            .instrument(span),
        );
        slot.run = Some(ActiveRun { signals, handle });
    }

    fn finish_run(
        &self,
        id: &str,
        generation: u64,
        kv: KvScope,
        outcome: Result<(), WorkflowError>,
    ) {
        let mut slots = self.slots.lock();
        let Some(slot) = slots.get_mut(id) else {
            debug!(instance_id = %id, "instance removed before its run finished");
            return;
        };
        if slot.kv.is_none() {
            slot.kv = Some(kv);
        }
        if slot.generation != generation {
            debug!(instance_id = %id, generation, "ignoring superseded run");
            return;
        }
        slot.run = None;
        match (slot.info.state, outcome) {
            (InstanceState::Paused, Err(WorkflowError::Interrupted)) => {
                self.logs.append(
                    LogEntry::new(
                        LogLevel::Info,
                        SOURCE,
                        "run interrupted by pause; resume restarts it",
                    )
                    .with_instance(id),
                );
            }
            (InstanceState::Running | InstanceState::Paused, Ok(())) => {
                slot.info.stop_reason = Some(StopReason::Completed);
                slot.info.stopped_at = Some(Utc::now());
                slot.info.pause_reason = None;
                self.transition(slot, InstanceState::Stopped);
                self.logs.append(
                    LogEntry::new(LogLevel::Info, SOURCE, "run completed").with_instance(id),
                );
            }
            (InstanceState::Running | InstanceState::Paused, Err(err)) => {
                let message = match &slot.secrets {
                    Some(secrets) => secrets.redact(&err.to_string()),
                    None => err.to_string(),
                };
                slot.info.last_error = Some(message.clone());
                slot.info.stop_reason = Some(StopReason::Failed);
                slot.info.stopped_at = Some(Utc::now());
                slot.info.pause_reason = None;
                self.transition(slot, InstanceState::Stopped);
                self.report_failure(id, err.code(), &message);
            }
            (InstanceState::Stopped, _) => {}
        }
    }

    /// Give a cancelled run `stop_grace` to finish, then abort it.
    async fn settle(&self, mut handle: JoinHandle<()>) {
        if tokio::time::timeout(self.stop_grace, &mut handle).await.is_err() {
            warn!(grace = ?self.stop_grace, "executor ignored cancellation; aborting");
            handle.abort();
            let _ = handle.await;
        }
    }

    fn transition(&self, slot: &mut Slot, to: InstanceState) {
        let from = slot.info.state;
        slot.info.state = to;
        if from != to {
            let _ = self.changes.send(InstanceChange::State {
                instance: slot.info.clone(),
                from,
            });
        }
    }

    fn report_failure(&self, id: &str, code: &str, message: &str) {
        warn!(instance_id = %id, code, "instance failure");
        self.logs
            .append(LogEntry::new(LogLevel::Error, code, message).with_instance(id));
    }
}
