use std::sync::Arc;

use pack_core::{Pack, PackType};
use serde_json::Value;
use tracing::{debug, info};

use crate::error::WorkflowError;
use crate::host::{KvScope, ResolvedSecrets, WasmCallError, WasmCallRequest};
use crate::workflow::engine::memory_limit_bytes;
use crate::workflow::{RunContext, RunSignals, WorkflowEngine};

/// Exports tried, in order, when running a wasm pack's entry module.
pub const WASM_START_EXPORTS: [&str; 2] = ["start", "_start"];

/// Runs one pack to completion, picking the executor from the pack type.
#[derive(Clone)]
pub struct PackExecutor {
    engine: Arc<WorkflowEngine>,
}

impl PackExecutor {
    pub fn new(engine: Arc<WorkflowEngine>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &Arc<WorkflowEngine> {
        &self.engine
    }

    pub async fn run(
        &self,
        pack: &Pack,
        instance_id: &str,
        secrets: &ResolvedSecrets,
        kv: &mut KvScope,
        signals: &RunSignals,
    ) -> Result<(), WorkflowError> {
        match pack.pack_type {
            PackType::Workflow => {
                let report = self
                    .engine
                    .run_pack(RunContext {
                        pack,
                        instance_id,
                        secrets,
                        kv,
                        signals,
                    })
                    .await?;
                debug!(workflow = %report.workflow_id, steps = report.results.len(), "workflow run finished");
                Ok(())
            }
            PackType::Wasm => self.run_wasm_entry(pack, instance_id, secrets, signals).await,
        }
    }

    async fn run_wasm_entry(
        &self,
        pack: &Pack,
        instance_id: &str,
        secrets: &ResolvedSecrets,
        signals: &RunSignals,
    ) -> Result<(), WorkflowError> {
        signals.check()?;
        for export in WASM_START_EXPORTS {
            let request = WasmCallRequest {
                module_path: pack.entry_path(),
                function: export.to_string(),
                args: Value::Null,
                memory_limit_bytes: memory_limit_bytes(pack),
            };
            match signals.guard(self.engine.wasm().call(request)).await? {
                Ok(output) => {
                    let source = format!("wasm:{}", pack.entry);
                    self.engine
                        .record_output(&source, instance_id, secrets, &output);
                    return exit_status(export, &output.value);
                }
                Err(WasmCallError::MissingExport(_)) => continue,
                Err(err) => return Err(WorkflowError::step(export, err)),
            }
        }
        Err(WorkflowError::step(
            "start",
            format!(
                "entry module `{}` exports none of {}",
                pack.entry,
                WASM_START_EXPORTS.join(", ")
            ),
        ))
    }
}

fn exit_status(export: &str, result: &Value) -> Result<(), WorkflowError> {
    match result {
        Value::Null => Ok(()),
        Value::Number(code) if code.as_i64() == Some(0) => Ok(()),
        Value::Number(code) => {
            info!(export, code = %code, "wasm entry returned non-zero");
            Err(WorkflowError::step(export, format!("exited with status {code}")))
        }
        other => Err(WorkflowError::step(
            export,
            format!("unexpected return value {other}"),
        )),
    }
}
