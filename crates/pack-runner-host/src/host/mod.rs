//! Collaborators the runner consumes through traits, with their default backends.

pub mod events;
pub mod http;
pub mod kv;
pub mod log;
pub mod secrets;
pub mod wasm;

pub use events::{BroadcastEventBus, Event, EventBus};
pub use http::{HttpClient, HttpError, HttpRequest, HttpResponse, ReqwestHttpClient};
pub use kv::KvScope;
pub use log::{FanoutLogSink, LogEntry, LogLevel, LogSink, MemoryLogSink, TracingLogSink};
pub use secrets::{
    ChainSecretStore, EnvSecretStore, FileSecretStore, MemorySecretStore, ResolvedSecrets,
    REDACTED, SecretError, SecretStore, SecretsBackend,
};
pub use wasm::{WasmCallError, WasmCallOutput, WasmCallRequest, WasmRuntime, WasmtimeRuntime};
