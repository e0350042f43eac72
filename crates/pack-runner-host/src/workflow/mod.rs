//! Declarative step interpreter.

pub mod definition;
pub mod engine;
pub mod templating;

pub use definition::{Step, StepKind, WORKFLOW_FILE, WorkflowDefinition};
pub use engine::{RunContext, RunReport, RunSignals, WorkflowEngine};
