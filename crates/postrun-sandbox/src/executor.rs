//! Script executor: creates a fresh V8 isolate per invocation and runs a
//! post-response script against the `pm` capability object.
//!
//! V8 isolates are `!Send`, so every invocation runs on a dedicated thread
//! with its own single-threaded tokio runtime. The public API is fully async
//! and `Send`-safe. Nothing is shared between invocations.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use deno_core::{v8, JsRuntime, PollEventLoopOptions, RuntimeOptions};

use crate::audit::{AuditEntryBuilder, AuditLogger, NoopAuditLogger};
use crate::error::ScriptError;
#[cfg(feature = "metrics")]
use crate::metrics::ScriptMetrics;
use crate::ops::{postrun_ext, BoundEnvironment, CapabilityFault, VariableLimits};
use crate::types::{
    EnvironmentSnapshot, ExecutionResult, PendingVariableSet, ResponseView, ScriptOutcome,
};
use crate::validator::{validate_script, ScriptPolicy, MAX_SCRIPT_LENGTH};
use crate::EnvironmentStore;

/// Wall-clock ceiling for one script.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum variable key length, in UTF-16 code units.
pub const MAX_KEY_LENGTH: usize = 100;

/// Maximum variable value length, in UTF-16 code units.
pub const MAX_VALUE_LENGTH: usize = 10_000;

/// Extra time the caller waits for the sandbox thread past the ceiling
/// before abandoning it.
const HOST_GRACE: Duration = Duration::from_millis(500);

/// Configuration for the script executor.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Content policy applied before execution.
    pub policy: ScriptPolicy,
    /// Maximum execution time before the isolate is terminated.
    pub timeout: Duration,
    /// Maximum script length, in UTF-16 code units.
    pub max_script_length: usize,
    /// Maximum variable key length, in UTF-16 code units.
    pub max_key_length: usize,
    /// Maximum variable value length, in UTF-16 code units.
    pub max_value_length: usize,
    /// V8 heap limit in bytes.
    pub max_heap_size: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            policy: ScriptPolicy::default(),
            timeout: DEFAULT_TIMEOUT,
            max_script_length: MAX_SCRIPT_LENGTH,
            max_key_length: MAX_KEY_LENGTH,
            max_value_length: MAX_VALUE_LENGTH,
            max_heap_size: 64 * 1024 * 1024, // 64 MB
        }
    }
}

/// Runs post-response scripts. Holds configuration only; every call builds
/// and discards its own isolate, so one executor may be shared freely
/// between concurrent callers.
pub struct ScriptExecutor {
    config: SandboxConfig,
    audit_logger: Arc<dyn AuditLogger>,
    #[cfg(feature = "metrics")]
    metrics: Option<Arc<ScriptMetrics>>,
}

impl ScriptExecutor {
    /// Create a new executor with the given configuration.
    pub fn new(config: SandboxConfig) -> Self {
        Self::with_audit_logger(config, Arc::new(NoopAuditLogger))
    }

    /// Create a new executor with an audit logger.
    pub fn with_audit_logger(config: SandboxConfig, logger: Arc<dyn AuditLogger>) -> Self {
        tracing::info!(
            policy = %config.policy,
            rules = config.policy.rules().len(),
            timeout_ms = config.timeout.as_millis() as u64,
            max_script_length = config.max_script_length,
            "script executor configured"
        );
        Self {
            config,
            audit_logger: logger,
            #[cfg(feature = "metrics")]
            metrics: None,
        }
    }

    /// Attach Prometheus metrics.
    #[cfg(feature = "metrics")]
    pub fn with_metrics(mut self, metrics: Arc<ScriptMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// The active configuration.
    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Check a script against the active policy without running it.
    pub fn validate(&self, script: &str) -> Result<(), ScriptError> {
        validate_script(script, self.config.policy, Some(self.config.max_script_length))
    }

    /// Run a script and report the outcome. Never fails: every error is
    /// folded into the returned [`ExecutionResult`].
    pub async fn execute(
        &self,
        script: &str,
        response: &ResponseView,
        environment: Option<&EnvironmentSnapshot>,
    ) -> ExecutionResult {
        self.run(script, response, environment).await.into()
    }

    /// Run a script and, on success with staged writes, hand the merged
    /// mapping to `store` exactly once.
    ///
    /// The audit entry is written after the write-back, so a failed
    /// write-back is audited as a failure.
    pub async fn execute_and_persist(
        &self,
        script: &str,
        response: &ResponseView,
        environment: Option<&EnvironmentSnapshot>,
        store: &dyn EnvironmentStore,
    ) -> ExecutionResult {
        self.run_and_record(script, response, environment, Some(store))
            .await
            .into()
    }

    /// Run a script and return the typed outcome.
    pub async fn run(
        &self,
        script: &str,
        response: &ResponseView,
        environment: Option<&EnvironmentSnapshot>,
    ) -> Result<ScriptOutcome, ScriptError> {
        self.run_and_record(script, response, environment, None)
            .await
    }

    /// Run, optionally persist, then log, count and audit the final outcome.
    async fn run_and_record(
        &self,
        script: &str,
        response: &ResponseView,
        environment: Option<&EnvironmentSnapshot>,
        store: Option<&dyn EnvironmentStore>,
    ) -> Result<ScriptOutcome, ScriptError> {
        let environment_id = environment.map(|env| env.id.as_str());
        let audit_builder = AuditEntryBuilder::new(script, self.config.policy, environment_id);

        tracing::info!(
            execution_id = %audit_builder.execution_id(),
            script_len = script.len(),
            policy = %self.config.policy,
            environment_id = environment_id.unwrap_or("-"),
            "execute: starting"
        );

        let mut result = self.run_validated(script, response, environment).await;

        let persist_error = match (&result, store, environment) {
            (
                Ok(ScriptOutcome {
                    updated_variables: Some(merged),
                    ..
                }),
                Some(store),
                Some(env),
            ) => persist(store, &env.id, merged).await.err(),
            _ => None,
        };
        if let Some(e) = persist_error {
            result = Err(e);
        }

        match &result {
            Ok(outcome) => tracing::info!(staged = outcome.staged.len(), "execute: complete"),
            Err(e) if e.is_host_fault() => {
                tracing::error!(host_fault = true, error = %e, "execute: sandbox host fault")
            }
            Err(e) => tracing::warn!(kind = %e.kind(), error = %e, "execute: failed"),
        }

        let entry = audit_builder.finish(&result);

        #[cfg(feature = "metrics")]
        if let Some(metrics) = &self.metrics {
            metrics.record_execution(result.is_ok(), entry.duration_ms as f64 / 1000.0);
            if let Err(e) = &result {
                metrics.record_error(e.kind());
            }
        }

        self.audit_logger.log(&entry).await;

        result
    }

    async fn run_validated(
        &self,
        script: &str,
        response: &ResponseView,
        environment: Option<&EnvironmentSnapshot>,
    ) -> Result<ScriptOutcome, ScriptError> {
        self.validate(script)?;

        if script.trim().is_empty() {
            return Ok(ScriptOutcome::default());
        }

        let staged = self.run_in_sandbox_thread(script, response, environment).await?;

        let updated_variables = match environment {
            Some(env) if !staged.is_empty() => Some(staged.merge_into(&env.variables)),
            _ => None,
        };

        Ok(ScriptOutcome {
            staged,
            updated_variables,
        })
    }

    /// Spawn a dedicated thread with its own V8 isolate and race it against
    /// the ceiling plus a small host grace.
    async fn run_in_sandbox_thread(
        &self,
        script: &str,
        response: &ResponseView,
        environment: Option<&EnvironmentSnapshot>,
    ) -> Result<PendingVariableSet, ScriptError> {
        let script = script.to_string();
        let response = response.clone();
        let variables = environment.map(|env| env.variables.clone());
        let config = self.config.clone();

        let (tx, rx) = tokio::sync::oneshot::channel();
        std::thread::Builder::new()
            .name("postrun-sandbox".into())
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        if tx.send(Err(ScriptError::Host(e.into()))).is_err() {
                            tracing::warn!("sandbox result receiver dropped");
                        }
                        return;
                    }
                };
                let result = rt.block_on(run_script(&config, &script, &response, variables));
                if tx.send(result).is_err() {
                    tracing::warn!("sandbox result receiver dropped before result was sent");
                }
            })
            .map_err(|e| {
                ScriptError::Host(anyhow::anyhow!("failed to spawn sandbox thread: {e}"))
            })?;

        match tokio::time::timeout(self.config.timeout.saturating_add(HOST_GRACE), rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ScriptError::Host(anyhow::anyhow!(
                "sandbox thread exited without a result"
            ))),
            Err(_) => {
                tracing::warn!(
                    timeout_ms = self.config.timeout.as_millis() as u64,
                    "sandbox did not stop at the ceiling, abandoning its thread"
                );
                Err(ScriptError::Timeout {
                    timeout_ms: self.config.timeout.as_millis() as u64,
                })
            }
        }
    }
}

/// Hand the merged mapping to the caller's store.
async fn persist(
    store: &dyn EnvironmentStore,
    environment_id: &str,
    merged: &BTreeMap<String, String>,
) -> Result<(), ScriptError> {
    match store.save_variables(environment_id, merged).await {
        Ok(()) => {
            tracing::info!(
                environment_id,
                variables = merged.len(),
                "persisted environment variables"
            );
            Ok(())
        }
        Err(e) => {
            tracing::warn!(
                environment_id,
                code = e.code(),
                error = %e,
                "environment write-back failed"
            );
            Err(ScriptError::Persist(e))
        }
    }
}

/// State for the near-heap-limit callback.
struct HeapLimitState {
    handle: v8::IsolateHandle,
    triggered: AtomicBool,
}

/// V8 near-heap-limit callback. Terminates execution and grants 1MB grace
/// for the termination to propagate cleanly.
extern "C" fn near_heap_limit_callback(
    data: *mut std::ffi::c_void,
    current_heap_limit: usize,
    _initial_heap_limit: usize,
) -> usize {
    // SAFETY: `data` points to the boxed HeapLimitState owned by
    // `run_user_script`, which deregisters this callback before the box is
    // dropped. Only a shared reference is formed; `triggered` is atomic.
    let state = unsafe { &*(data as *const HeapLimitState) };
    if !state.triggered.swap(true, Ordering::SeqCst) {
        state.handle.terminate_execution();
    }
    current_heap_limit + 1024 * 1024
}

/// Run one script on the current thread and return its staged writes.
///
/// Must be called from a dedicated thread, not the caller's tokio runtime.
pub async fn run_script(
    config: &SandboxConfig,
    script: &str,
    response: &ResponseView,
    variables: Option<BTreeMap<String, String>>,
) -> Result<PendingVariableSet, ScriptError> {
    let mut runtime = create_runtime(config, variables);

    let response_json = serde_json::to_string(response)?;
    runtime
        .execute_script("[postrun:bootstrap]", build_bootstrap(&response_json))
        .map_err(|e| ScriptError::Host(anyhow::anyhow!("sandbox bootstrap failed: {e}")))?;

    run_user_script(&mut runtime, script, config).await
}

/// Create a fresh JsRuntime with the `pm` ops loaded and V8 heap limits set.
fn create_runtime(
    config: &SandboxConfig,
    variables: Option<BTreeMap<String, String>>,
) -> JsRuntime {
    let create_params = v8::CreateParams::default().heap_limits(0, config.max_heap_size);

    let mut runtime = JsRuntime::new(RuntimeOptions {
        extensions: vec![postrun_ext::init_ops_and_esm()],
        create_params: Some(create_params),
        ..Default::default()
    });

    {
        let state = runtime.op_state();
        let mut state = state.borrow_mut();
        state.put(BoundEnvironment(variables));
        state.put(PendingVariableSet::default());
        state.put(VariableLimits {
            max_key_length: config.max_key_length,
            max_value_length: config.max_value_length,
        });
    }

    runtime
}

/// Build the bootstrap script: construct the frozen `pm` object and
/// `console`, then strip every ambient capability from the global scope.
fn build_bootstrap(response_json: &str) -> String {
    format!(
        r#"((ops, response) => {{
    const deepFreeze = (value) => {{
        if (value !== null && typeof value === "object" && !Object.isFrozen(value)) {{
            Object.freeze(value);
            for (const key of Object.keys(value)) {{
                deepFreeze(value[key]);
            }}
        }}
        return value;
    }};
    const stringify = (value) => {{
        if (typeof value === "string") return value;
        if (value !== null && typeof value === "object") {{
            try {{ return JSON.stringify(value); }} catch (_) {{ return String(value); }}
        }}
        return String(value);
    }};
    const log = (...args) => ops.op_pm_log(args.map(stringify).join(" "));

    const body = deepFreeze(response.body === undefined ? null : response.body);
    const headers = deepFreeze(response.headers || {{}});
    const text = body === null ? "" : stringify(body);

    const responseView = Object.freeze({{
        status: response.status,
        headers: headers,
        data: body,
        json: () => (typeof body === "string" ? deepFreeze(JSON.parse(body)) : body),
        text: () => text,
    }});

    const environment = Object.freeze({{
        get: (key) => {{
            const value = ops.op_pm_env_get(String(key));
            return value === null ? undefined : value;
        }},
        set: (key, value) => {{
            ops.op_pm_env_set(String(key), stringify(value));
        }},
    }});

    globalThis.pm = Object.freeze({{
        response: responseView,
        environment: environment,
    }});
    globalThis.console = Object.freeze({{
        log: log,
        info: log,
        warn: log,
        error: log,
        debug: log,
    }});

    delete globalThis.Deno;
    delete globalThis.eval;
    delete globalThis.WebAssembly;
    delete globalThis.SharedArrayBuffer;
    delete globalThis.Atomics;

    const AsyncFunction = (async function () {{}}).constructor;
    const GeneratorFunction = (function* () {{}}).constructor;
    const AsyncGeneratorFunction = (async function* () {{}}).constructor;
    for (const ctor of [Function, AsyncFunction, GeneratorFunction, AsyncGeneratorFunction]) {{
        Object.defineProperty(ctor.prototype, "constructor", {{
            value: undefined, configurable: false, writable: false
        }});
    }}
    delete globalThis.Function;
}})(Deno.core.ops, {response_json});"#
    )
}

/// Wrap the script as the body of an async function so `await` and
/// `return` work at top level. The call's promise is the completion value
/// of the wrapped script; the host reads its state directly, so nothing the
/// script text does can report completion on its behalf.
fn wrap_script(script: &str) -> String {
    format!("(async function () {{\n{script}\n}})();")
}

/// How the script's completion promise ended up once the event loop
/// drained.
#[derive(Debug, PartialEq, Eq)]
enum Settlement {
    Fulfilled,
    Pending,
    Rejected(String),
}

/// Read the state of the completion value left by [`wrap_script`].
///
/// A value that is not a promise counts as fulfilled.
fn settlement(runtime: &mut JsRuntime, completion: &v8::Global<v8::Value>) -> Settlement {
    let scope = &mut runtime.handle_scope();
    let value = v8::Local::new(scope, completion);
    let Ok(promise) = v8::Local::<v8::Promise>::try_from(value) else {
        return Settlement::Fulfilled;
    };
    match promise.state() {
        v8::PromiseState::Pending => Settlement::Pending,
        v8::PromiseState::Fulfilled => Settlement::Fulfilled,
        v8::PromiseState::Rejected => {
            let reason = promise.result(scope);
            let scope = &mut v8::TryCatch::new(scope);
            let message = reason
                .to_string(scope)
                .map(|s| s.to_rust_string_lossy(scope))
                .unwrap_or_else(|| "script threw a value that cannot be printed".to_string());
            Settlement::Rejected(message)
        }
    }
}

/// Execute the wrapped script under the CPU watchdog and heap callback,
/// then collect the staged writes.
async fn run_user_script(
    runtime: &mut JsRuntime,
    script: &str,
    config: &SandboxConfig,
) -> Result<PendingVariableSet, ScriptError> {
    // --- Set up heap limit callback ---
    let heap_state = Box::new(HeapLimitState {
        handle: runtime.v8_isolate().thread_safe_handle(),
        triggered: AtomicBool::new(false),
    });
    runtime.v8_isolate().add_near_heap_limit_callback(
        near_heap_limit_callback,
        &*heap_state as *const HeapLimitState as *mut std::ffi::c_void,
    );

    // --- Set up CPU watchdog ---
    let watchdog_handle = runtime.v8_isolate().thread_safe_handle();
    let timed_out = Arc::new(AtomicBool::new(false));
    let watchdog_timed_out = timed_out.clone();
    let timeout = config.timeout;
    let (cancel_tx, cancel_rx) = std::sync::mpsc::channel::<()>();

    let watchdog = std::thread::spawn(move || {
        if let Err(std::sync::mpsc::RecvTimeoutError::Timeout) = cancel_rx.recv_timeout(timeout) {
            watchdog_timed_out.store(true, Ordering::SeqCst);
            watchdog_handle.terminate_execution();
        }
    });

    // --- Execute script ---
    let (completion, exec_error) =
        match runtime.execute_script("[postrun:script]", wrap_script(script)) {
            Ok(completion) => {
                let loop_error = match tokio::time::timeout(
                    config.timeout,
                    runtime.run_event_loop(PollEventLoopOptions::default()),
                )
                .await
                {
                    Ok(Ok(())) => None,
                    Ok(Err(e)) => Some(e.to_string()),
                    Err(_) => {
                        timed_out.store(true, Ordering::SeqCst);
                        None
                    }
                };
                (Some(completion), loop_error)
            }
            Err(e) => (None, Some(e.to_string())),
        };

    // Converting a rejection reason may call back into script code, so the
    // watchdog stays armed until this is done.
    let settled = completion.map(|completion| settlement(runtime, &completion));

    // --- Cleanup: the watchdog must exit before the runtime is dropped ---
    let _ = cancel_tx.send(());
    let _ = watchdog.join();
    // `heap_state` is freed on return while the isolate lives on until the
    // caller drops it.
    runtime
        .v8_isolate()
        .remove_near_heap_limit_callback(near_heap_limit_callback, 0);

    // --- Check causes in priority order ---
    if heap_state.triggered.load(Ordering::SeqCst) {
        return Err(ScriptError::HeapLimitExceeded);
    }

    if timed_out.load(Ordering::SeqCst) {
        return Err(ScriptError::Timeout {
            timeout_ms: config.timeout.as_millis() as u64,
        });
    }

    let (fault, staged) = {
        let state = runtime.op_state();
        let mut state = state.borrow_mut();
        (
            state.try_take::<CapabilityFault>(),
            state.try_take::<PendingVariableSet>().unwrap_or_default(),
        )
    };

    if let Some(CapabilityFault(violation)) = fault {
        return Err(violation.into());
    }

    // A rejected completion also surfaces from the event loop as an
    // unhandled rejection; the reason itself is the cleaner message.
    if let Some(Settlement::Rejected(message)) = settled {
        return Err(ScriptError::JsError { message });
    }

    if let Some(message) = exec_error {
        return Err(ScriptError::JsError { message });
    }

    match settled {
        Some(Settlement::Pending) => Err(ScriptError::JsError {
            message: "script did not finish: a pending promise never settled".into(),
        }),
        _ => Ok(staged),
    }
}
