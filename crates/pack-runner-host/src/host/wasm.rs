//! Call boundary into WebAssembly modules shipped inside a pack.
//!
//! Modules are core WebAssembly linked against WASI preview 1 and nothing
//! else. The WASI context has no preopened directories, no environment and
//! no arguments; stdout and stderr are captured and handed back with the
//! result. Arguments and results cross the boundary as JSON numbers.
//!
//! The engine runs with epoch interruption: dropping the future returned by
//! [`WasmRuntime::call`] traps the module on its blocking thread.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Context;
use async_trait::async_trait;
use serde_json::{Number, Value};
use thiserror::Error;
use tracing::debug;
use wasmtime::{
    Config, Engine, Linker, Module, Store, StoreLimits, StoreLimitsBuilder, UpdateDeadline, Val,
    ValType,
};
use wasmtime_wasi::p1::{self, WasiP1Ctx};
use wasmtime_wasi::p2::pipe::MemoryOutputPipe;
use wasmtime_wasi::{I32Exit, WasiCtxBuilder};

/// Bytes of stdout and stderr a module may write per call.
pub const OUTPUT_CAPACITY: usize = 64 * 1024;

#[derive(Clone, Debug)]
pub struct WasmCallRequest {
    pub module_path: PathBuf,
    pub function: String,
    /// `null`, a number, or an array of numbers matched to the export's parameters.
    pub args: Value,
    pub memory_limit_bytes: usize,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct WasmCallOutput {
    /// Export results, or the status passed to `proc_exit`.
    pub value: Value,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Error)]
pub enum WasmCallError {
    #[error("failed to load module {path}: {message}")]
    Load { path: PathBuf, message: String },
    #[error("failed to instantiate module: {0}")]
    Instantiate(String),
    #[error("module has no exported function `{0}`")]
    MissingExport(String),
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("wasm trap: {0}")]
    Trap(String),
    #[error("wasm call interrupted")]
    Interrupted,
}

#[async_trait]
pub trait WasmRuntime: Send + Sync {
    async fn call(&self, request: WasmCallRequest) -> Result<WasmCallOutput, WasmCallError>;
}

struct CallState {
    limits: StoreLimits,
    wasi: WasiP1Ctx,
}

#[derive(Clone)]
pub struct WasmtimeRuntime {
    engine: Engine,
}

impl WasmtimeRuntime {
    pub fn new() -> anyhow::Result<Self> {
        let mut config = Config::new();
        config.epoch_interruption(true);
        let engine = Engine::new(&config).context("failed to build wasm engine")?;
        Ok(Self { engine })
    }
}

/// Interrupts the call it guards unless disarmed first.
struct Interrupter {
    engine: Engine,
    interrupted: Arc<AtomicBool>,
    armed: bool,
}

impl Interrupter {
    fn new(engine: Engine) -> Self {
        Self {
            engine,
            interrupted: Arc::new(AtomicBool::new(false)),
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for Interrupter {
    fn drop(&mut self) {
        if self.armed {
            self.interrupted.store(true, Ordering::SeqCst);
            // Other stores reach their deadline too and extend it in their callback.
            self.engine.increment_epoch();
            debug!("wasm call dropped; interrupting module");
        }
    }
}

#[async_trait]
impl WasmRuntime for WasmtimeRuntime {
    async fn call(&self, request: WasmCallRequest) -> Result<WasmCallOutput, WasmCallError> {
        let interrupter = Interrupter::new(self.engine.clone());
        let engine = self.engine.clone();
        let interrupted = Arc::clone(&interrupter.interrupted);
        let joined =
            tokio::task::spawn_blocking(move || invoke(&engine, &request, &interrupted)).await;
        interrupter.disarm();
        joined.map_err(|err| WasmCallError::Trap(format!("wasm call task failed: {err}")))?
    }
}

fn invoke(
    engine: &Engine,
    request: &WasmCallRequest,
    interrupted: &Arc<AtomicBool>,
) -> Result<WasmCallOutput, WasmCallError> {
    let module = Module::from_file(engine, &request.module_path).map_err(|err| {
        WasmCallError::Load {
            path: request.module_path.clone(),
            message: err.to_string(),
        }
    })?;
    let stdout = MemoryOutputPipe::new(OUTPUT_CAPACITY);
    let stderr = MemoryOutputPipe::new(OUTPUT_CAPACITY);
    let wasi = WasiCtxBuilder::new()
        .stdout(stdout.clone())
        .stderr(stderr.clone())
        .build_p1();
    let mut store = Store::new(
        engine,
        CallState {
            limits: StoreLimitsBuilder::new()
                .memory_size(request.memory_limit_bytes)
                .build(),
            wasi,
        },
    );
    store.limiter(|state| &mut state.limits);
    store.set_epoch_deadline(1);
    let flag = Arc::clone(interrupted);
    store.epoch_deadline_callback(move |_| {
        if flag.load(Ordering::SeqCst) {
            Ok(UpdateDeadline::Interrupt)
        } else {
            Ok(UpdateDeadline::Continue(1))
        }
    });
    // The deadline above is relative to the epoch; a drop that raced ahead of it must still win.
    if interrupted.load(Ordering::SeqCst) {
        return Err(WasmCallError::Interrupted);
    }

    let mut linker = Linker::<CallState>::new(engine);
    p1::add_to_linker_sync(&mut linker, |state: &mut CallState| &mut state.wasi)
        .map_err(|err| WasmCallError::Instantiate(format!("{err:#}")))?;
    let instance = linker
        .instantiate(&mut store, &module)
        .map_err(|err| {
            if interrupted.load(Ordering::SeqCst) {
                WasmCallError::Interrupted
            } else {
                WasmCallError::Instantiate(err.to_string())
            }
        })?;
    let func = instance
        .get_func(&mut store, &request.function)
        .ok_or_else(|| WasmCallError::MissingExport(request.function.clone()))?;

    let ty = func.ty(&store);
    let param_types: Vec<ValType> = ty.params().collect();
    let params = to_params(&request.args, &param_types)?;
    let mut results: Vec<Val> = ty.results().map(|_| Val::I32(0)).collect();
    debug!(
        function = %request.function,
        params = params.len(),
        results = results.len(),
        "calling wasm export"
    );
    let value = match func.call(&mut store, &params, &mut results) {
        Ok(()) => {
            let mut values = results.iter().map(from_val).collect::<Result<Vec<_>, _>>()?;
            match values.len() {
                0 => Value::Null,
                1 => values.remove(0),
                _ => Value::Array(values),
            }
        }
        Err(err) => match err.downcast_ref::<I32Exit>() {
            Some(exit) => Value::from(exit.0),
            None if interrupted.load(Ordering::SeqCst) => return Err(WasmCallError::Interrupted),
            None => return Err(WasmCallError::Trap(format!("{err:#}"))),
        },
    };
    Ok(WasmCallOutput {
        value,
        stdout: captured(&stdout),
        stderr: captured(&stderr),
    })
}

fn captured(pipe: &MemoryOutputPipe) -> String {
    String::from_utf8_lossy(&pipe.contents()).into_owned()
}

fn to_params(args: &Value, types: &[ValType]) -> Result<Vec<Val>, WasmCallError> {
    let args: Vec<&Value> = match args {
        Value::Null => Vec::new(),
        Value::Array(items) => items.iter().collect(),
        other => vec![other],
    };
    if args.len() != types.len() {
        return Err(WasmCallError::InvalidArguments(format!(
            "export expects {} argument(s), got {}",
            types.len(),
            args.len()
        )));
    }
    args.into_iter()
        .zip(types)
        .enumerate()
        .map(|(idx, (arg, ty))| to_val(arg, ty).ok_or_else(|| {
            WasmCallError::InvalidArguments(format!("argument {idx} `{arg}` does not fit {ty:?}"))
        }))
        .collect()
}

fn to_val(arg: &Value, ty: &ValType) -> Option<Val> {
    match ty {
        ValType::I32 => arg
            .as_i64()
            .and_then(|n| i32::try_from(n).ok())
            .map(Val::I32),
        ValType::I64 => arg.as_i64().map(Val::I64),
        ValType::F32 => arg.as_f64().map(|n| Val::F32((n as f32).to_bits())),
        ValType::F64 => arg.as_f64().map(|n| Val::F64(n.to_bits())),
        _ => None,
    }
}

fn from_val(val: &Val) -> Result<Value, WasmCallError> {
    match val {
        Val::I32(n) => Ok(Value::from(*n)),
        Val::I64(n) => Ok(Value::from(*n)),
        Val::F32(bits) => Number::from_f64(f32::from_bits(*bits) as f64)
            .map(Value::Number)
            .ok_or_else(|| WasmCallError::Trap("non-finite f32 result".into())),
        Val::F64(bits) => Number::from_f64(f64::from_bits(*bits))
            .map(Value::Number)
            .ok_or_else(|| WasmCallError::Trap("non-finite f64 result".into())),
        _ => Err(WasmCallError::Trap(
            "only numeric results cross the wasm boundary".into(),
        )),
    }
}
