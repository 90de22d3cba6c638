#![warn(missing_docs)]

//! # postrun-sandbox
//!
//! Sandboxed execution of post-response scripts for API tests.
//!
//! A script receives a read-only view of the HTTP response and may stage
//! environment variable writes through `pm.environment.set`. It runs in a
//! deno_core isolate with no filesystem, network, process, or module access.
//! The only bridge to the host is the set of ops registered in [`ops`].
//!
//! ## Security model
//!
//! - **Fresh isolate per call**: nothing leaks between invocations
//! - **Pre-execution validation**: the active [`ScriptPolicy`] rejects banned
//!   constructs before they reach V8
//! - **Wall-clock ceiling**: a watchdog terminates runaway scripts
//! - **Heap ceiling**: V8 heap limits stop allocation bombs
//! - **Staged writes**: variables are applied only after successful completion

pub mod audit;
pub mod error;
pub mod executor;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod ops;
pub mod types;
pub mod validator;

use std::collections::BTreeMap;

pub use error::{CapabilityViolation, FaultKind, ScriptError};
pub use executor::{SandboxConfig, ScriptExecutor};
pub use types::{
    EnvironmentSnapshot, ExecutionResult, PendingVariableSet, ResponseView, ScriptOutcome,
};
pub use validator::{ScriptPolicy, UnknownPolicy};

/// Write-back target for merged environment variables.
///
/// Called at most once per invocation, and only after the script completed
/// and staged at least one write.
#[async_trait::async_trait]
pub trait EnvironmentStore: Send + Sync {
    /// Replace the variables of `environment_id` with `variables`.
    async fn save_variables(
        &self,
        environment_id: &str,
        variables: &BTreeMap<String, String>,
    ) -> Result<(), postrun_error::StoreError>;
}

/// Check a script against the default (strict) policy without running it.
pub fn validate(script: &str) -> Result<(), ScriptError> {
    validator::validate_script(script, ScriptPolicy::default(), None)
}
