use pack_core::PackError;
use thiserror::Error;

use crate::host::secrets::SecretError;
use crate::instance::InstanceState;

/// Failures that abort a workflow run. None of them is retried.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("step `{step}` denied: {reason}")]
    PermissionDenied { step: String, reason: String },
    #[error("step `{step}` has unknown type `{step_type}`")]
    UnknownStepType { step: String, step_type: String },
    #[error("step `{step}` failed: {message}")]
    StepExecution { step: String, message: String },
    #[error("invalid workflow: {0}")]
    InvalidWorkflow(String),
    #[error("step `{step}` template error: {message}")]
    Template { step: String, message: String },
    #[error("run cancelled")]
    Cancelled,
    #[error("run interrupted by pause")]
    Interrupted,
}

impl WorkflowError {
    pub fn code(&self) -> &'static str {
        match self {
            WorkflowError::PermissionDenied { .. } => "permission_denied",
            WorkflowError::UnknownStepType { .. } => "unknown_step_type",
            WorkflowError::StepExecution { .. } => "step_execution",
            WorkflowError::InvalidWorkflow(_) => "invalid_workflow",
            WorkflowError::Template { .. } => "template",
            WorkflowError::Cancelled => "cancelled",
            WorkflowError::Interrupted => "interrupted",
        }
    }

    pub(crate) fn step(step: &str, message: impl std::fmt::Display) -> Self {
        WorkflowError::StepExecution {
            step: step.to_string(),
            message: message.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum InstanceError {
    #[error("pack `{pack_id}` is missing required secrets: {}", names.join(", "))]
    MissingSecret { pack_id: String, names: Vec<String> },
    #[error("pack `{0}` is not installed")]
    PackNotInstalled(String),
    #[error("instance `{0}` not found")]
    InstanceNotFound(String),
    #[error("instance `{instance}` cannot {action} while {from}")]
    InvalidTransition {
        instance: String,
        from: InstanceState,
        action: &'static str,
    },
    #[error(transparent)]
    Secrets(#[from] SecretError),
    #[error(transparent)]
    Pack(#[from] PackError),
}

impl InstanceError {
    pub fn code(&self) -> &'static str {
        match self {
            InstanceError::MissingSecret { .. } => "missing_secret",
            InstanceError::PackNotInstalled(_) => "pack_not_installed",
            InstanceError::InstanceNotFound(_) => "instance_not_found",
            InstanceError::InvalidTransition { .. } => "invalid_transition",
            InstanceError::Secrets(_) => "secrets",
            InstanceError::Pack(err) => err.code(),
        }
    }
}
