//! deno_core op definitions backing the `pm` capability object.
//!
//! The `#[op2]` macro generates additional public items (v8 function pointers,
//! metadata structs) that cannot carry doc comments. We suppress `missing_docs`
//! at the module level.
#![allow(missing_docs)]

use std::collections::BTreeMap;

use deno_core::op2;
use deno_core::OpState;
use deno_error::JsErrorBox;

use crate::error::CapabilityViolation;
use crate::types::PendingVariableSet;

/// Variables of the environment bound to this invocation, if any.
pub struct BoundEnvironment(pub Option<BTreeMap<String, String>>);

/// Length limits for `pm.environment.set`, in UTF-16 code units so they
/// agree with `String.prototype.length` inside the script.
#[derive(Debug, Clone, Copy)]
pub struct VariableLimits {
    /// Maximum key length.
    pub max_key_length: usize,
    /// Maximum value length.
    pub max_value_length: usize,
}

/// First capability violation recorded during the invocation.
///
/// Sticky: once present, the invocation fails regardless of whether the
/// script caught the exception.
pub struct CapabilityFault(pub CapabilityViolation);

/// Check a single `set` call against the binding and the limits.
pub fn check_variable_write(
    environment_bound: bool,
    limits: VariableLimits,
    key: &str,
    value: &str,
) -> Result<(), CapabilityViolation> {
    if !environment_bound {
        return Err(CapabilityViolation::NoEnvironment);
    }
    let key_len = key.encode_utf16().count();
    if key_len == 0 || key_len > limits.max_key_length {
        return Err(CapabilityViolation::InvalidKey {
            max: limits.max_key_length,
            actual: key_len,
        });
    }
    let value_len = value.encode_utf16().count();
    if value_len > limits.max_value_length {
        return Err(CapabilityViolation::ValueTooLong {
            key: key.to_string(),
            max: limits.max_value_length,
            actual: value_len,
        });
    }
    Ok(())
}

/// Log a line from script `console.*` calls.
#[op2(fast)]
pub fn op_pm_log(#[string] msg: &str) {
    tracing::info!(target: "postrun::sandbox::script", "{}", msg);
}

/// Read a variable: staged writes first, then the bound snapshot.
#[op2]
#[string]
pub fn op_pm_env_get(state: &mut OpState, #[string] key: String) -> Option<String> {
    if let Some(staged) = state
        .try_borrow::<PendingVariableSet>()
        .and_then(|pending| pending.get(&key))
    {
        return Some(staged.to_string());
    }
    state
        .try_borrow::<BoundEnvironment>()
        .and_then(|env| env.0.as_ref())
        .and_then(|vars| vars.get(&key).cloned())
}

/// Stage a variable write after checking the capability contract.
#[op2(fast)]
pub fn op_pm_env_set(
    state: &mut OpState,
    #[string] key: String,
    #[string] value: String,
) -> Result<(), JsErrorBox> {
    let bound = state
        .try_borrow::<BoundEnvironment>()
        .is_some_and(|env| env.0.is_some());
    let limits = *state.borrow::<VariableLimits>();

    if let Err(violation) = check_variable_write(bound, limits, &key, &value) {
        tracing::debug!(error = %violation, "rejected pm.environment.set");
        let message = violation.to_string();
        if !state.has::<CapabilityFault>() {
            state.put(CapabilityFault(violation));
        }
        return Err(JsErrorBox::generic(message));
    }

    tracing::debug!(key = %key, value_len = value.len(), "staged environment write");
    state.borrow_mut::<PendingVariableSet>().stage(key, value);
    Ok(())
}

deno_core::extension!(
    postrun_ext,
    ops = [op_pm_log, op_pm_env_get, op_pm_env_set],
);

#[cfg(test)]
mod tests {
    use super::*;

    const LIMITS: VariableLimits = VariableLimits {
        max_key_length: 100,
        max_value_length: 10_000,
    };

    #[test]
    fn write_without_environment_is_rejected() {
        let err = check_variable_write(false, LIMITS, "token", "abc").unwrap_err();
        assert_eq!(err, CapabilityViolation::NoEnvironment);
    }

    #[test]
    fn empty_key_is_invalid() {
        let err = check_variable_write(true, LIMITS, "", "abc").unwrap_err();
        assert!(matches!(err, CapabilityViolation::InvalidKey { actual: 0, .. }));
    }

    #[test]
    fn key_limit_is_inclusive() {
        assert!(check_variable_write(true, LIMITS, &"k".repeat(100), "v").is_ok());
        let err = check_variable_write(true, LIMITS, &"k".repeat(101), "v").unwrap_err();
        assert!(err.to_string().contains("Invalid variable key"));
    }

    #[test]
    fn value_limit_is_inclusive() {
        assert!(check_variable_write(true, LIMITS, "k", &"v".repeat(10_000)).is_ok());
        let err = check_variable_write(true, LIMITS, "k", &"v".repeat(10_001)).unwrap_err();
        assert!(err.to_string().contains("too long"));
    }

    #[test]
    fn no_environment_takes_precedence_over_bad_key() {
        let err = check_variable_write(false, LIMITS, "", "v").unwrap_err();
        assert_eq!(err, CapabilityViolation::NoEnvironment);
    }

    #[test]
    fn lengths_count_utf16_code_units() {
        // each emoji is one char but two UTF-16 code units
        assert!(check_variable_write(true, LIMITS, &"\u{1F600}".repeat(50), "v").is_ok());
        let err = check_variable_write(true, LIMITS, &"\u{1F600}".repeat(51), "v").unwrap_err();
        assert_eq!(err, CapabilityViolation::InvalidKey { max: 100, actual: 102 });

        assert!(check_variable_write(true, LIMITS, "k", &"\u{1F600}".repeat(5_000)).is_ok());
        let err =
            check_variable_write(true, LIMITS, "k", &"\u{1F600}".repeat(5_001)).unwrap_err();
        assert!(matches!(err, CapabilityViolation::ValueTooLong { actual: 10_002, .. }));
    }
}
