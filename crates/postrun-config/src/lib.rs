#![warn(missing_docs)]

//! # postrun-config
//!
//! Configuration loading for the postrun script runner.
//!
//! Supports TOML configuration files with environment variable expansion.
//!
//! ## Example
//!
//! ```toml
//! [sandbox]
//! policy = "strict"
//! timeout_secs = 5
//! max_heap_mb = 64
//! max_script_length = 10000
//!
//! [audit]
//! jsonl_path = "${HOME}/.postrun/audit.jsonl"
//! ```

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use postrun_sandbox::{SandboxConfig, ScriptPolicy};
use serde::Deserialize;
use thiserror::Error;

/// Largest accepted `sandbox.timeout_secs`.
pub const MAX_TIMEOUT_SECS: u64 = 300;

/// Largest accepted `sandbox.max_heap_mb`.
pub const MAX_HEAP_MB: usize = 4096;

/// Largest accepted `sandbox.max_script_length`.
pub const MAX_SCRIPT_LENGTH_LIMIT: usize = 1_000_000;

/// Errors from config parsing.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse TOML.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Invalid configuration value.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level postrun configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PostrunConfig {
    /// Sandbox execution settings.
    #[serde(default)]
    pub sandbox: SandboxOverrides,

    /// Audit sink settings.
    #[serde(default)]
    pub audit: AuditOverrides,
}

/// Sandbox configuration overrides. Unset fields keep the library defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SandboxOverrides {
    /// Script policy: "strict" (default) or "trusted".
    #[serde(default)]
    pub policy: Option<String>,

    /// Execution timeout in seconds.
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    /// Maximum V8 heap size in megabytes.
    #[serde(default)]
    pub max_heap_mb: Option<usize>,

    /// Maximum script length in UTF-16 code units.
    #[serde(default)]
    pub max_script_length: Option<usize>,
}

/// Audit sink configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuditOverrides {
    /// Append audit entries as JSON lines to this file. When unset, audit
    /// entries go to the tracing log.
    #[serde(default)]
    pub jsonl_path: Option<PathBuf>,
}

impl PostrunConfig {
    /// Parse a config from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let config: PostrunConfig = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse a config from a TOML string, expanding `${ENV_VAR}` references.
    pub fn from_toml_with_env(toml_str: &str) -> Result<Self, ConfigError> {
        let expanded = expand_env_vars(toml_str);
        Self::from_toml(&expanded)
    }

    /// Load config from a file path, expanding environment variables.
    pub fn from_file_with_env(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_with_env(&content)
    }

    /// The configured policy, or the library default when unset.
    pub fn policy(&self) -> Result<ScriptPolicy, ConfigError> {
        match &self.sandbox.policy {
            None => Ok(ScriptPolicy::default()),
            Some(name) => {
                ScriptPolicy::from_str(name).map_err(|e| ConfigError::Invalid(e.to_string()))
            }
        }
    }

    /// Apply the overrides on top of [`SandboxConfig::default`].
    pub fn to_sandbox_config(&self) -> Result<SandboxConfig, ConfigError> {
        let mut config = SandboxConfig {
            policy: self.policy()?,
            ..Default::default()
        };
        if let Some(secs) = self.sandbox.timeout_secs {
            config.timeout = Duration::from_secs(secs);
        }
        if let Some(mb) = self.sandbox.max_heap_mb {
            config.max_heap_size = mb.saturating_mul(1024 * 1024);
        }
        if let Some(len) = self.sandbox.max_script_length {
            config.max_script_length = len;
        }
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        self.policy()?;
        check_range("sandbox.timeout_secs", self.sandbox.timeout_secs, MAX_TIMEOUT_SECS)?;
        check_range(
            "sandbox.max_heap_mb",
            self.sandbox.max_heap_mb.map(|v| v as u64),
            MAX_HEAP_MB as u64,
        )?;
        check_range(
            "sandbox.max_script_length",
            self.sandbox.max_script_length.map(|v| v as u64),
            MAX_SCRIPT_LENGTH_LIMIT as u64,
        )?;
        Ok(())
    }
}

fn check_range(field: &str, value: Option<u64>, max: u64) -> Result<(), ConfigError> {
    match value {
        Some(0) => Err(ConfigError::Invalid(format!(
            "{field} must be greater than zero"
        ))),
        Some(v) if v > max => Err(ConfigError::Invalid(format!(
            "{field} must be at most {max} (got {v})"
        ))),
        _ => Ok(()),
    }
}

/// Expand `${ENV_VAR}` patterns in a string using environment variables.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                name.push(c);
            }
            match std::env::var(&name) {
                Ok(value) => result.push_str(&value),
                // unresolved placeholders are kept verbatim
                Err(_) => result.push_str(&format!("${{{name}}}")),
            }
        } else {
            result.push(ch);
        }
    }

    result
}
