use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use indexmap::IndexMap;
use pack_core::permissions::check_relative_path;
use pack_core::{Decision, FsMode, Pack, PermissionEnforcer};
use serde_json::{Map as JsonMap, Value};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span};

use super::definition::{DEFAULT_WASM_MODULE, Step, StepKind, WorkflowDefinition};
use super::templating;
use crate::error::WorkflowError;
use crate::host::{
    Event, EventBus, HttpClient, HttpRequest, KvScope, LogEntry, LogLevel, LogSink,
    ResolvedSecrets, WasmCallOutput, WasmCallRequest, WasmRuntime,
};

/// Key under which resolved secrets are visible to templates.
pub const SECRETS_KEY: &str = "env";

/// Stop and pause signals for one run. Stop yields [`WorkflowError::Cancelled`],
/// pause yields [`WorkflowError::Interrupted`]; stop wins when both fire.
#[derive(Clone, Debug, Default)]
pub struct RunSignals {
    stop: CancellationToken,
    pause: CancellationToken,
}

impl RunSignals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.stop.cancel();
    }

    pub fn pause(&self) {
        self.pause.cancel();
    }

    pub fn check(&self) -> Result<(), WorkflowError> {
        if self.stop.is_cancelled() {
            Err(WorkflowError::Cancelled)
        } else if self.pause.is_cancelled() {
            Err(WorkflowError::Interrupted)
        } else {
            Ok(())
        }
    }

    async fn signalled(&self) -> WorkflowError {
        tokio::select! {
            biased;
            _ = self.stop.cancelled() => WorkflowError::Cancelled,
            _ = self.pause.cancelled() => WorkflowError::Interrupted,
        }
    }

    /// Race a suspension point against the signals.
    pub async fn guard<F>(&self, fut: F) -> Result<F::Output, WorkflowError>
    where
        F: Future,
    {
        tokio::select! {
            biased;
            err = self.signalled() => Err(err),
            out = fut => Ok(out),
        }
    }
}

pub struct RunContext<'a> {
    pub pack: &'a Pack,
    pub instance_id: &'a str,
    pub secrets: &'a ResolvedSecrets,
    pub kv: &'a mut KvScope,
    pub signals: &'a RunSignals,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct RunReport {
    pub workflow_id: String,
    pub results: IndexMap<String, Value>,
}

#[derive(Clone)]
pub struct WorkflowEngine {
    http: Arc<dyn HttpClient>,
    wasm: Arc<dyn WasmRuntime>,
    logs: Arc<dyn LogSink>,
    events: Arc<dyn EventBus>,
    max_sleep: Duration,
}

impl WorkflowEngine {
    pub fn new(
        http: Arc<dyn HttpClient>,
        wasm: Arc<dyn WasmRuntime>,
        logs: Arc<dyn LogSink>,
        events: Arc<dyn EventBus>,
        max_sleep: Duration,
    ) -> Self {
        Self {
            http,
            wasm,
            logs,
            events,
            max_sleep,
        }
    }

    pub fn wasm(&self) -> &Arc<dyn WasmRuntime> {
        &self.wasm
    }

    pub fn load(&self, pack: &Pack) -> Result<WorkflowDefinition, WorkflowError> {
        WorkflowDefinition::load(&pack.entry_path(), self.max_sleep)
    }

    /// Load the pack's entry definition and run it.
    pub async fn run_pack(&self, ctx: RunContext<'_>) -> Result<RunReport, WorkflowError> {
        let definition = self.load(ctx.pack)?;
        self.run(&definition, ctx).await
    }

    pub async fn run(
        &self,
        definition: &WorkflowDefinition,
        mut ctx: RunContext<'_>,
    ) -> Result<RunReport, WorkflowError> {
        let span = info_span!(
            "workflow.run",
            workflow = %definition.id,
            pack_id = %ctx.pack.id,
            instance_id = %ctx.instance_id
        );
        async move {
            let mut results = IndexMap::with_capacity(definition.steps.len());
            for step in &definition.steps {
                ctx.signals.check()?;
                let response = self.execute(definition, step, &results, &mut ctx).await?;
                debug!(step = %step.id, step_type = step.kind.type_name(), "step completed");
                results.insert(step.id.clone(), response);
            }
            info!(steps = results.len(), "workflow completed");
            Ok(RunReport {
                workflow_id: definition.id.clone(),
                results,
            })
        }
        .instrument(span)
        .await
    }

    async fn execute(
        &self,
        definition: &WorkflowDefinition,
        step: &Step,
        results: &IndexMap<String, Value>,
        ctx: &mut RunContext<'_>,
    ) -> Result<Value, WorkflowError> {
        let template_err = |err: anyhow::Error| WorkflowError::Template {
            step: step.id.clone(),
            message: err.to_string(),
        };
        match &step.kind {
            StepKind::HttpRequest {
                method,
                url,
                headers,
                body,
            } => {
                let scope = template_scope(results, Some(ctx.secrets));
                let url = templating::render_string(url, &scope).map_err(template_err)?;
                deny_unless(
                    step,
                    PermissionEnforcer::check_network(&url, &ctx.pack.permissions.network),
                )?;
                let mut rendered_headers = std::collections::BTreeMap::new();
                for (name, value) in headers {
                    rendered_headers.insert(
                        name.clone(),
                        templating::render_string(value, &scope).map_err(template_err)?,
                    );
                }
                let body = match body {
                    None => None,
                    Some(Value::String(raw)) => {
                        Some(templating::render_string(raw, &scope).map_err(template_err)?)
                    }
                    Some(other) => {
                        let rendered = templating::render_value(other, &scope).map_err(template_err)?;
                        if !rendered_headers
                            .keys()
                            .any(|name| name.eq_ignore_ascii_case("content-type"))
                        {
                            rendered_headers
                                .insert("content-type".to_string(), "application/json".to_string());
                        }
                        Some(rendered.to_string())
                    }
                };
                let request = HttpRequest {
                    method: method.clone(),
                    url,
                    headers: rendered_headers,
                    body,
                };
                let response = ctx
                    .signals
                    .guard(self.http.send(request))
                    .await?
                    .map_err(|err| WorkflowError::step(&step.id, err))?;
                Ok(response.to_value())
            }
            StepKind::WasmCall {
                function,
                module,
                input_from,
                args,
            } => {
                let module = module.as_deref().unwrap_or(DEFAULT_WASM_MODULE);
                if let Err(reason) = check_relative_path(module) {
                    return Err(WorkflowError::PermissionDenied {
                        step: step.id.clone(),
                        reason,
                    });
                }
                if module.trim_start_matches("./") != ctx.pack.entry.trim_start_matches("./") {
                    deny_unless(
                        step,
                        PermissionEnforcer::check_filesystem(
                            module,
                            FsMode::Read,
                            &ctx.pack.permissions.filesystem,
                        ),
                    )?;
                }
                let scope = template_scope(results, Some(ctx.secrets));
                let args = match (args, input_from) {
                    (Some(args), _) => templating::render_value(args, &scope).map_err(template_err)?,
                    (None, Some(path)) => templating::lookup(&scope, path)
                        .cloned()
                        .map_err(template_err)?,
                    (None, None) => Value::Null,
                };
                let request = WasmCallRequest {
                    module_path: ctx.pack.install_path.join(module),
                    function: function.clone(),
                    args,
                    memory_limit_bytes: memory_limit_bytes(ctx.pack),
                };
                let output = ctx
                    .signals
                    .guard(self.wasm.call(request))
                    .await?
                    .map_err(|err| WorkflowError::step(&step.id, err))?;
                let source = format!("wasm:{module}");
                self.record_output(&source, ctx.instance_id, ctx.secrets, &output);
                Ok(output.value)
            }
            StepKind::KvPut { key, value } => {
                let scope = template_scope(results, Some(ctx.secrets));
                let key = templating::render_string(key, &scope).map_err(template_err)?;
                let value = templating::render_value(value, &scope).map_err(template_err)?;
                ctx.kv.put(key, value.clone());
                Ok(value)
            }
            StepKind::KvGet { key } => {
                let scope = template_scope(results, Some(ctx.secrets));
                let key = templating::render_string(key, &scope).map_err(template_err)?;
                Ok(ctx.kv.get(&key).cloned().unwrap_or(Value::Null))
            }
            StepKind::Log { message, level } => {
                let level = match level {
                    Some(raw) => raw
                        .parse::<LogLevel>()
                        .map_err(|err| WorkflowError::step(&step.id, err))?,
                    None => LogLevel::Info,
                };
                // Secrets are not in scope here; results carrying a secret value are refused.
                let scope = template_scope(results, None);
                let message = templating::render_string(message, &scope).map_err(template_err)?;
                if let Some(name) = ctx.secrets.exposed_in(&message) {
                    return Err(WorkflowError::Template {
                        step: step.id.clone(),
                        message: format!("message would expose secret `{name}`"),
                    });
                }
                self.logs.append(
                    LogEntry::new(level, format!("workflow:{}", definition.id), message.clone())
                        .with_instance(ctx.instance_id),
                );
                Ok(Value::String(message))
            }
            StepKind::Sleep { duration_ms } => {
                let duration = Duration::from_millis(*duration_ms).min(self.max_sleep);
                ctx.signals.guard(tokio::time::sleep(duration)).await?;
                Ok(Value::from(*duration_ms))
            }
            StepKind::EmitEvent { name, payload } => {
                let scope = template_scope(results, Some(ctx.secrets));
                let name = templating::render_string(name, &scope).map_err(template_err)?;
                let payload = match payload {
                    Some(payload) => templating::render_value(payload, &scope).map_err(template_err)?,
                    None => Value::Null,
                };
                self.events.publish(Event {
                    name,
                    payload: payload.clone(),
                    pack_id: ctx.pack.id.clone(),
                    instance_id: ctx.instance_id.to_string(),
                    emitted_at: Utc::now(),
                });
                Ok(payload)
            }
        }
    }

    /// Forward captured module output to the log sink, one entry per line.
    pub(crate) fn record_output(
        &self,
        source: &str,
        instance_id: &str,
        secrets: &ResolvedSecrets,
        output: &WasmCallOutput,
    ) {
        let streams = [(LogLevel::Info, &output.stdout), (LogLevel::Warn, &output.stderr)];
        for (level, text) in streams {
            for line in text.lines().filter(|line| !line.trim().is_empty()) {
                self.logs.append(
                    LogEntry::new(level, source, secrets.redact(line)).with_instance(instance_id),
                );
            }
        }
    }
}

fn deny_unless(step: &Step, decision: Decision) -> Result<(), WorkflowError> {
    match decision {
        Decision::Allowed => Ok(()),
        Decision::Denied(reason) => Err(WorkflowError::PermissionDenied {
            step: step.id.clone(),
            reason,
        }),
    }
}

fn template_scope(results: &IndexMap<String, Value>, secrets: Option<&ResolvedSecrets>) -> Value {
    let mut scope = JsonMap::with_capacity(results.len() + 1);
    for (id, response) in results {
        let mut entry = JsonMap::with_capacity(1);
        entry.insert("response".to_string(), response.clone());
        scope.insert(id.clone(), Value::Object(entry));
    }
    if let Some(secrets) = secrets {
        scope.insert(SECRETS_KEY.to_string(), secrets.to_json());
    }
    Value::Object(scope)
}

pub(crate) fn memory_limit_bytes(pack: &Pack) -> usize {
    let bytes = pack.limits.memory_mb.saturating_mul(1024 * 1024);
    usize::try_from(bytes).unwrap_or(usize::MAX)
}
