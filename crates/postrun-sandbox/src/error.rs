//! Error types for the postrun sandbox.

use serde::Serialize;
use thiserror::Error;

/// Errors that can occur while validating or executing a script.
#[derive(Debug, Error)]
pub enum ScriptError {
    /// Script exceeds the configured maximum length.
    #[error("script exceeds maximum length of {max} characters (got {actual})")]
    ScriptTooLong {
        /// Maximum allowed length in UTF-16 code units.
        max: usize,
        /// Actual length in UTF-16 code units.
        actual: usize,
    },

    /// A forbidden construct was detected by the active policy.
    #[error("script rejected by {policy} policy: {description} (rule `{rule}`)")]
    BannedPattern {
        /// Name of the policy that rejected the script.
        policy: String,
        /// Identifier of the rule that matched.
        rule: String,
        /// Human-readable explanation.
        description: String,
    },

    /// The script threw, failed to parse, or otherwise errored while running.
    #[error("script error: {message}")]
    JsError {
        /// The error message reported by the script runtime.
        message: String,
    },

    /// The script misused the `pm.environment` capability.
    #[error(transparent)]
    Capability(#[from] CapabilityViolation),

    /// The script exceeded the wall-clock ceiling.
    #[error("script execution timed out after {timeout_ms}ms")]
    Timeout {
        /// Configured ceiling in milliseconds.
        timeout_ms: u64,
    },

    /// V8 heap memory limit was exceeded.
    #[error("script exceeded the sandbox heap limit")]
    HeapLimitExceeded,

    /// The sandbox itself failed (not caused by the script).
    #[error("sandbox host fault: {0}")]
    Host(#[from] anyhow::Error),

    /// Marshalling between the host and the sandbox failed.
    #[error("sandbox serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The merged variable mapping could not be written back.
    #[error("failed to persist environment variables: {0}")]
    Persist(#[from] postrun_error::StoreError),
}

/// Violations of the `pm.environment.set` contract.
///
/// Any of these fails the whole invocation, even when the script catches
/// the exception thrown at the call site.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CapabilityViolation {
    /// `set` was called but no environment is bound to the invocation.
    #[error("cannot set environment variable: no environment is associated with this request")]
    NoEnvironment,

    /// The key is empty or longer than the allowed maximum.
    #[error("Invalid variable key: keys must be between 1 and {max} characters (got {actual})")]
    InvalidKey {
        /// Maximum key length in UTF-16 code units.
        max: usize,
        /// Actual key length in UTF-16 code units.
        actual: usize,
    },

    /// The value is longer than the allowed maximum.
    #[error("variable value too long for key '{key}' (max {max} characters, got {actual})")]
    ValueTooLong {
        /// The key being written.
        key: String,
        /// Maximum value length in UTF-16 code units.
        max: usize,
        /// Actual value length in UTF-16 code units.
        actual: usize,
    },
}

/// Coarse classification of a [`ScriptError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    /// Rejected before execution.
    PolicyViolation,
    /// The script errored while running.
    RuntimeFault,
    /// The script misused a capability.
    CapabilityViolation,
    /// The script ran past the ceiling.
    Timeout,
    /// Defect in the sandbox host, not caused by the script.
    HostFault,
    /// The caller's write-back failed after a successful run.
    Persistence,
}

impl FaultKind {
    /// Stable label used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PolicyViolation => "policy_violation",
            Self::RuntimeFault => "runtime_fault",
            Self::CapabilityViolation => "capability_violation",
            Self::Timeout => "timeout",
            Self::HostFault => "host_fault",
            Self::Persistence => "persistence",
        }
    }
}

impl std::fmt::Display for FaultKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ScriptError {
    /// Classify this error.
    pub fn kind(&self) -> FaultKind {
        match self {
            Self::ScriptTooLong { .. } | Self::BannedPattern { .. } => FaultKind::PolicyViolation,
            Self::JsError { .. } | Self::HeapLimitExceeded => FaultKind::RuntimeFault,
            Self::Capability(_) => FaultKind::CapabilityViolation,
            Self::Timeout { .. } => FaultKind::Timeout,
            Self::Host(_) | Self::Serialization(_) => FaultKind::HostFault,
            Self::Persist(_) => FaultKind::Persistence,
        }
    }

    /// Whether this error originates in the host rather than the script.
    pub fn is_host_fault(&self) -> bool {
        self.kind() == FaultKind::HostFault
    }
}
