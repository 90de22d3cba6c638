//! Data exchanged between the caller and the sandbox.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ScriptError;

/// Read-only snapshot of an HTTP response, as exposed to `pm.response`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseView {
    /// HTTP status code.
    pub status: u16,
    /// Response headers, with names as received.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Structured body, or a JSON string holding the raw text.
    #[serde(default)]
    pub body: Value,
}

impl ResponseView {
    /// Build a view from an already-structured body.
    pub fn new(status: u16, headers: BTreeMap<String, String>, body: Value) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }

    /// Build a view from a raw text body.
    ///
    /// The text is kept verbatim; `pm.response.json()` parses it on demand.
    pub fn from_text(
        status: u16,
        headers: BTreeMap<String, String>,
        body: impl Into<String>,
    ) -> Self {
        Self::new(status, headers, Value::String(body.into()))
    }
}

/// A by-value copy of an environment's variables, taken before invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentSnapshot {
    /// Identifier used for the write-back call.
    pub id: String,
    /// Display name, for logs only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Current variable mapping.
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
}

impl EnvironmentSnapshot {
    /// Create a snapshot with the given id and variables.
    pub fn new(id: impl Into<String>, variables: BTreeMap<String, String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            variables,
        }
    }
}

/// Writes staged by `pm.environment.set` during one invocation.
///
/// Writes apply in call order; the last write to a key wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingVariableSet {
    writes: BTreeMap<String, String>,
}

impl PendingVariableSet {
    /// Stage a write.
    pub fn stage(&mut self, key: String, value: String) {
        self.writes.insert(key, value);
    }

    /// Value staged for `key`, if any.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.writes.get(key).map(String::as_str)
    }

    /// Whether nothing was staged.
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    /// Number of distinct keys staged.
    pub fn len(&self) -> usize {
        self.writes.len()
    }

    /// Staged key names, for audit records.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.writes.keys().map(String::as_str)
    }

    /// Merge staged writes over `base` into a new mapping.
    ///
    /// New keys are added, existing keys overwritten, untouched keys kept.
    /// `base` is not modified.
    pub fn merge_into(&self, base: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        let mut merged = base.clone();
        for (key, value) in &self.writes {
            merged.insert(key.clone(), value.clone());
        }
        merged
    }
}

/// What a completed run produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScriptOutcome {
    /// Writes staged by the script.
    pub staged: PendingVariableSet,
    /// Merged mapping, present only when an environment was bound and at
    /// least one write was staged.
    pub updated_variables: Option<BTreeMap<String, String>>,
}

/// Terminal result of one invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    /// Whether the script completed.
    pub success: bool,
    /// Failure reason, present only when `success` is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Merged variable mapping the caller should persist.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_variables: Option<BTreeMap<String, String>>,
}

impl ExecutionResult {
    /// A successful run.
    pub fn completed(updated_variables: Option<BTreeMap<String, String>>) -> Self {
        Self {
            success: true,
            error: None,
            updated_variables,
        }
    }

    /// A failed run. Never carries variables.
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            updated_variables: None,
        }
    }
}

impl From<Result<ScriptOutcome, ScriptError>> for ExecutionResult {
    fn from(result: Result<ScriptOutcome, ScriptError>) -> Self {
        match result {
            Ok(outcome) => Self::completed(outcome.updated_variables),
            Err(e) => Self::failed(e.to_string()),
        }
    }
}
