//! Audit logging for script executions.
//!
//! Every invocation emits an [`AuditEntry`] containing:
//! - Execution ID (UUID)
//! - SHA-256 hash of the script and a short preview
//! - The active policy and the bound environment id
//! - Names of staged variables (never their values)
//! - Duration and outcome
//!
//! The [`AuditLogger`] trait allows pluggable backends.
//! [`JsonLinesAuditLogger`] writes newline-delimited JSON to any `AsyncWrite`.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::time::Instant;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{FaultKind, ScriptError};
use crate::types::ScriptOutcome;
use crate::validator::ScriptPolicy;

/// Maximum length of the script preview in audit entries, in characters.
const SCRIPT_PREVIEW_MAX: usize = 200;

/// A complete audit record for a single script execution.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    /// Unique execution identifier.
    pub execution_id: String,
    /// When execution started.
    pub timestamp: DateTime<Utc>,
    /// SHA-256 hash of the submitted script.
    pub script_hash: String,
    /// First characters of the script, for human review.
    pub script_preview: String,
    /// Policy the script was validated against.
    pub policy: ScriptPolicy,
    /// Environment bound to the invocation, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment_id: Option<String>,
    /// Keys the script staged. Values are never recorded.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub staged_keys: Vec<String>,
    /// Total duration in milliseconds.
    pub duration_ms: u64,
    /// Final outcome.
    pub outcome: AuditOutcome,
}

/// The outcome of a script execution.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case", tag = "status")]
#[non_exhaustive]
pub enum AuditOutcome {
    /// The script completed.
    Success,
    /// The script failed.
    Error {
        /// Classification of the failure.
        kind: FaultKind,
        /// The error message.
        message: String,
    },
    /// The script ran past the ceiling.
    Timeout,
}

/// Trait for audit log backends.
#[async_trait::async_trait]
pub trait AuditLogger: Send + Sync {
    /// Write an audit entry.
    async fn log(&self, entry: &AuditEntry);
}

/// A no-op audit logger for when auditing is not needed.
pub struct NoopAuditLogger;

#[async_trait::async_trait]
impl AuditLogger for NoopAuditLogger {
    async fn log(&self, _entry: &AuditEntry) {}
}

/// An audit logger that emits structured events via [`tracing`].
///
/// Use `RUST_LOG=postrun=info` to capture all audit events.
pub struct TracingAuditLogger;

#[async_trait::async_trait]
impl AuditLogger for TracingAuditLogger {
    async fn log(&self, entry: &AuditEntry) {
        let outcome = match &entry.outcome {
            AuditOutcome::Success => "success",
            AuditOutcome::Error { .. } => "error",
            AuditOutcome::Timeout => "timeout",
        };
        tracing::info!(
            audit = true,
            execution_id = %entry.execution_id,
            script_hash = %entry.script_hash,
            policy = %entry.policy,
            environment_id = entry.environment_id.as_deref().unwrap_or("-"),
            staged_keys = entry.staged_keys.len(),
            duration_ms = entry.duration_ms,
            outcome = outcome,
            "audit"
        );
    }
}

/// Writes audit entries as newline-delimited JSON to an `AsyncWrite` sink.
pub struct JsonLinesAuditLogger<W: AsyncWrite + Unpin + Send> {
    writer: Mutex<W>,
}

impl<W: AsyncWrite + Unpin + Send> JsonLinesAuditLogger<W> {
    /// Create a new JSON lines audit logger writing to the given sink.
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    /// Consume the logger and return the underlying sink.
    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

#[async_trait::async_trait]
impl<W: AsyncWrite + Unpin + Send + 'static> AuditLogger for JsonLinesAuditLogger<W> {
    async fn log(&self, entry: &AuditEntry) {
        let mut line = match serde_json::to_string(entry) {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize audit entry");
                return;
            }
        };
        line.push('\n');

        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            tracing::warn!(error = %e, "failed to write audit entry");
        }
        let _ = writer.flush().await;
    }
}

/// Compute the SHA-256 hash of a string, returned as a hex string.
pub fn sha256_hex(data: &str) -> String {
    let digest = Sha256::digest(data.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// First [`SCRIPT_PREVIEW_MAX`] characters of a script, with an ellipsis if
/// truncated.
pub fn script_preview(script: &str) -> String {
    match script.char_indices().nth(SCRIPT_PREVIEW_MAX) {
        None => script.to_string(),
        Some((end, _)) => format!("{}...", &script[..end]),
    }
}

/// Builder for constructing audit entries during execution.
pub struct AuditEntryBuilder {
    execution_id: String,
    timestamp: DateTime<Utc>,
    script_hash: String,
    script_preview: String,
    policy: ScriptPolicy,
    environment_id: Option<String>,
    start: Instant,
}

impl AuditEntryBuilder {
    /// Start building an audit entry for an execution.
    pub fn new(script: &str, policy: ScriptPolicy, environment_id: Option<&str>) -> Self {
        Self {
            execution_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            script_hash: sha256_hex(script),
            script_preview: script_preview(script),
            policy,
            environment_id: environment_id.map(str::to_string),
            start: Instant::now(),
        }
    }

    /// The execution id assigned to this run.
    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    /// Finalize the audit entry with the execution result.
    pub fn finish(self, result: &Result<ScriptOutcome, ScriptError>) -> AuditEntry {
        let duration_ms = self.start.elapsed().as_millis() as u64;
        let (staged_keys, outcome) = match result {
            Ok(outcome) => (
                outcome.staged.keys().map(str::to_string).collect(),
                AuditOutcome::Success,
            ),
            Err(ScriptError::Timeout { .. }) => (Vec::new(), AuditOutcome::Timeout),
            Err(e) => (
                Vec::new(),
                AuditOutcome::Error {
                    kind: e.kind(),
                    message: e.to_string(),
                },
            ),
        };

        AuditEntry {
            execution_id: self.execution_id,
            timestamp: self.timestamp,
            script_hash: self.script_hash,
            script_preview: self.script_preview,
            policy: self.policy,
            environment_id: self.environment_id,
            staged_keys,
            duration_ms,
            outcome,
        }
    }
}
