//! `workflow.json`: an ordered, loop-free list of typed steps.
//!
//! Loading is all-or-nothing. Every step type is checked before anything
//! runs, so a definition with one unknown step never produces side effects.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use crate::error::WorkflowError;

pub const WORKFLOW_FILE: &str = "workflow.json";
pub const SUPPORTED_WORKFLOW_VERSION: u32 = 1;
pub const DEFAULT_WASM_MODULE: &str = "main.wasm";
const RESERVED_STEP_ID: &str = "env";

const STEP_TYPES: [&str; 7] = [
    "http.request",
    "wasm.call",
    "kv.put",
    "kv.get",
    "log",
    "sleep",
    "emit.event",
];

#[derive(Clone, Debug, PartialEq)]
pub struct WorkflowDefinition {
    pub id: String,
    pub workflow_version: u32,
    pub steps: Vec<Step>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Step {
    pub id: String,
    pub kind: StepKind,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum StepKind {
    #[serde(rename = "http.request")]
    HttpRequest {
        #[serde(default = "default_method")]
        method: String,
        url: String,
        #[serde(default)]
        headers: BTreeMap<String, String>,
        #[serde(default)]
        body: Option<Value>,
    },
    #[serde(rename = "wasm.call")]
    WasmCall {
        function: String,
        #[serde(default)]
        module: Option<String>,
        /// Path into prior results, e.g. `fetch.response.body.count`.
        #[serde(default, alias = "inputFrom")]
        input_from: Option<String>,
        #[serde(default)]
        args: Option<Value>,
    },
    #[serde(rename = "kv.put")]
    KvPut { key: String, value: Value },
    #[serde(rename = "kv.get")]
    KvGet { key: String },
    #[serde(rename = "log")]
    Log {
        message: String,
        #[serde(default)]
        level: Option<String>,
    },
    #[serde(rename = "sleep")]
    Sleep {
        #[serde(alias = "durationMs")]
        duration_ms: u64,
    },
    #[serde(rename = "emit.event")]
    EmitEvent {
        name: String,
        #[serde(default)]
        payload: Option<Value>,
    },
}

impl StepKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            StepKind::HttpRequest { .. } => "http.request",
            StepKind::WasmCall { .. } => "wasm.call",
            StepKind::KvPut { .. } => "kv.put",
            StepKind::KvGet { .. } => "kv.get",
            StepKind::Log { .. } => "log",
            StepKind::Sleep { .. } => "sleep",
            StepKind::EmitEvent { .. } => "emit.event",
        }
    }
}

fn default_method() -> String {
    "GET".to_string()
}

#[derive(Deserialize)]
struct RawWorkflow {
    id: String,
    workflow_version: u32,
    steps: Vec<Value>,
}

impl WorkflowDefinition {
    pub fn from_json_str(raw: &str, max_sleep: Duration) -> Result<Self, WorkflowError> {
        let raw: RawWorkflow = serde_json::from_str(raw)
            .map_err(|err| WorkflowError::InvalidWorkflow(format!("{WORKFLOW_FILE}: {err}")))?;
        if raw.id.trim().is_empty() {
            return Err(WorkflowError::InvalidWorkflow("workflow id must not be blank".into()));
        }
        if raw.workflow_version != SUPPORTED_WORKFLOW_VERSION {
            return Err(WorkflowError::InvalidWorkflow(format!(
                "unsupported workflow_version {} (expected {SUPPORTED_WORKFLOW_VERSION})",
                raw.workflow_version
            )));
        }

        let mut seen = BTreeSet::new();
        let mut steps = Vec::with_capacity(raw.steps.len());
        for (idx, value) in raw.steps.into_iter().enumerate() {
            let step = parse_step(idx, value, max_sleep)?;
            if !seen.insert(step.id.clone()) {
                return Err(WorkflowError::InvalidWorkflow(format!(
                    "step id `{}` is used twice",
                    step.id
                )));
            }
            steps.push(step);
        }
        Ok(Self {
            id: raw.id,
            workflow_version: raw.workflow_version,
            steps,
        })
    }

    pub fn load(path: &Path, max_sleep: Duration) -> Result<Self, WorkflowError> {
        let raw = std::fs::read_to_string(path).map_err(|err| {
            WorkflowError::InvalidWorkflow(format!("cannot read {}: {err}", path.display()))
        })?;
        Self::from_json_str(&raw, max_sleep)
    }
}

fn parse_step(idx: usize, value: Value, max_sleep: Duration) -> Result<Step, WorkflowError> {
    let id = match value.get("id").and_then(Value::as_str) {
        Some(id) if !id.trim().is_empty() => id.to_string(),
        _ => {
            return Err(WorkflowError::InvalidWorkflow(format!(
                "step #{idx} needs a non-empty string `id`"
            )));
        }
    };
    if id == RESERVED_STEP_ID {
        return Err(WorkflowError::InvalidWorkflow(format!(
            "step id `{RESERVED_STEP_ID}` is reserved for secrets"
        )));
    }
    let step_type = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| WorkflowError::InvalidWorkflow(format!("step `{id}` has no `type`")))?;
    if !STEP_TYPES.contains(&step_type) {
        return Err(WorkflowError::UnknownStepType {
            step: id,
            step_type: step_type.to_string(),
        });
    }
    let kind: StepKind = serde_json::from_value(value)
        .map_err(|err| WorkflowError::InvalidWorkflow(format!("step `{id}`: {err}")))?;
    if let StepKind::Sleep { duration_ms } = &kind
        && Duration::from_millis(*duration_ms) > max_sleep
    {
        return Err(WorkflowError::InvalidWorkflow(format!(
            "step `{id}` sleeps {duration_ms}ms, above the {}ms limit",
            max_sleep.as_millis()
        )));
    }
    Ok(Step { id, kind })
}
