//! Execution contexts: a loaded program bound to its working directory,
//! log sink, owner identity and the process capabilities.

mod api;
pub mod convert;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tracing::{debug, info};

use crate::capability::Capabilities;
use crate::compiler::{CompileError, Compiler, CompilerSettings, Runnable, ScriptError};
use crate::config::CompilerConfig;
use crate::rpc::Value;
use crate::transport::{RunRequest, RunResult};

use api::ScriptHost;

/// Destination of `print` and `log` output.
pub trait LogSink: Send + Sync {
    fn emit(&self, value: Value);
}

/// Sink that drops everything.
#[derive(Debug, Default)]
pub struct NullSink;

impl LogSink for NullSink {
    fn emit(&self, _value: Value) {}
}

/// Stop flag shared by every script of one server generation.
///
/// Running scripts observe it at their next progress check or sleep tick.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// What the server hands to every execution context.
#[derive(Clone)]
pub struct Environment {
    pub capabilities: Capabilities,
    pub compiler: CompilerConfig,
    /// Where `<owner>.<suffix>` service sockets live.
    pub socket_dir: PathBuf,
    pub rpc_timeout: Duration,
    /// Runtime blocking RPC calls are driven on.
    pub runtime: Handle,
    pub stop: StopSignal,
}

/// One run's compiler plus its bindings.
pub struct ExecutionContext {
    compiler: Arc<Compiler>,
    main_unit: String,
}

impl ExecutionContext {
    pub fn new(env: &Environment, request: &RunRequest, sink: Arc<dyn LogSink>) -> Self {
        let working_dir = PathBuf::from(&request.working_dir);
        let host = Arc::new(ScriptHost {
            working_dir: working_dir.clone(),
            owner: request.owner_id.clone(),
            sink,
            capabilities: env.capabilities.clone(),
            socket_dir: env.socket_dir.clone(),
            rpc_timeout: env.rpc_timeout,
            runtime: env.runtime.clone(),
            stop: env.stop.clone(),
            started: std::time::Instant::now(),
        });

        let settings = CompilerSettings::new(&working_dir, &env.compiler);
        let compiler = Compiler::new(settings, |engine, weak| api::register(engine, &host, weak));

        Self {
            compiler,
            main_unit: format!("main.{}", env.compiler.extension),
        }
    }

    /// Compile `source` with its siblings and run it.
    pub fn execute(&self, source: &str) -> Result<Value, ScriptError> {
        let script = self.compiler.evaluate(source, &self.main_unit, true)?;
        let value = script.run()?;
        Ok(convert::to_value(&value))
    }

    /// Source text of `request`, or `main.<ext>` from the working directory
    /// when it carries none.
    pub fn main_source(&self, request: &RunRequest) -> Result<String, ScriptError> {
        if let Some(text) = &request.source_text {
            return Ok(text.clone());
        }
        let path = self.compiler.settings().source_dir.join(&self.main_unit);
        std::fs::read_to_string(&path)
            .map_err(|source| CompileError::Io { path, source }.into())
    }

    /// Run `request`'s main source, folded into a protocol result.
    pub fn run(&self, request: &RunRequest) -> RunResult {
        match self
            .main_source(request)
            .and_then(|source| self.execute(&source))
        {
            Ok(value) => RunResult::Value(value.to_json()),
            Err(e) => {
                debug!(error = %e, "Script failed");
                RunResult::Error(e.to_string())
            }
        }
    }
}

/// Build a context for `request` and run it to completion.
pub fn run_request(env: &Environment, request: &RunRequest, sink: Arc<dyn LogSink>) -> RunResult {
    info!(
        working_dir = %request.working_dir,
        owner = request.owner_id.as_deref().unwrap_or("-"),
        "Running script"
    );
    ExecutionContext::new(env, request, sink).run(request)
}
