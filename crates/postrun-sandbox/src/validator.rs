//! Pre-execution script validator.
//!
//! The V8 isolate is the real security boundary: nothing dangerous is
//! reachable from inside it. The validator is a cheap gate that runs before
//! any isolate is created. It always enforces the length bound, and under
//! [`ScriptPolicy::Strict`] it also rejects constructs that only make sense
//! as escape attempts, giving the script author a clear message instead of a
//! `ReferenceError`.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ScriptError;

/// Maximum script length, in UTF-16 code units (the script's own
/// `String.prototype.length`).
pub const MAX_SCRIPT_LENGTH: usize = 10_000;

/// Content policy applied by the validator.
///
/// The policy is a deployment setting. A single-user desktop install may
/// trust its script author fully; a shared server should not.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScriptPolicy {
    /// Length bound plus the forbidden-pattern rule set.
    #[default]
    Strict,
    /// Length bound only. For trusted, single-user deployments.
    Trusted,
}

impl ScriptPolicy {
    /// Stable name used in config files and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Strict => "strict",
            Self::Trusted => "trusted",
        }
    }

    /// The forbidden-pattern rules enforced under this policy.
    pub fn rules(&self) -> &'static [PatternRule] {
        match self {
            Self::Strict => STRICT_RULES.as_slice(),
            Self::Trusted => &[],
        }
    }
}

impl fmt::Display for ScriptPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown policy name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown script policy '{0}', supported: strict, trusted")]
pub struct UnknownPolicy(pub String);

impl FromStr for ScriptPolicy {
    type Err = UnknownPolicy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "strict" => Ok(Self::Strict),
            "trusted" => Ok(Self::Trusted),
            _ => Err(UnknownPolicy(s.to_string())),
        }
    }
}

/// A single forbidden-pattern rule.
pub struct PatternRule {
    /// Short identifier reported on rejection.
    pub name: &'static str,
    /// Explanation shown to the script author.
    pub description: &'static str,
    regex: Regex,
}

impl PatternRule {
    fn new(name: &'static str, pattern: &str, description: &'static str) -> Self {
        Self {
            name,
            description,
            regex: Regex::new(pattern).unwrap(),
        }
    }

    /// Whether the rule matches anywhere in the script.
    pub fn is_match(&self, script: &str) -> bool {
        self.regex.is_match(script)
    }
}

impl fmt::Debug for PatternRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PatternRule")
            .field("name", &self.name)
            .field("pattern", &self.regex.as_str())
            .finish()
    }
}

// `process.` alone is not banned so that `json.process.status` keeps working.
static STRICT_RULES: LazyLock<Vec<PatternRule>> = LazyLock::new(|| {
    vec![
        PatternRule::new(
            "eval",
            r"\beval\s*\(",
            "eval() is not available; scripts cannot generate code from strings",
        ),
        PatternRule::new(
            "function-constructor",
            r"\bFunction\s*\(",
            "the Function constructor is not available; scripts cannot generate code from strings",
        ),
        PatternRule::new(
            "dynamic-import",
            r"\bimport\s*\(",
            "dynamic import() is not available; scripts cannot load modules",
        ),
        PatternRule::new(
            "require",
            r"\brequire\s*\(",
            "require() is not available; scripts cannot load modules",
        ),
        PatternRule::new(
            "process-access",
            r"\bprocess\s*\.\s*(env|exit|argv|binding|kill|stdin|stdout|stderr|mainModule|dlopen)\b",
            "the host process is not accessible from scripts",
        ),
        PatternRule::new(
            "child-process",
            r"child_process",
            "scripts cannot spawn processes",
        ),
        PatternRule::new(
            "deno-namespace",
            r"\bDeno\s*\.",
            "the runtime namespace is not accessible from scripts",
        ),
        PatternRule::new(
            "proto",
            r"__proto__",
            "prototype mutation through __proto__ is not allowed",
        ),
        PatternRule::new(
            "constructor-chain",
            r"constructor\s*(\.\s*constructor|\[)",
            "reaching constructors through the prototype chain is not allowed",
        ),
        PatternRule::new(
            "global-computed-access",
            r"\bglobalThis\s*\[",
            "computed access on globalThis is not allowed",
        ),
        PatternRule::new(
            "reflect",
            r"\bReflect\s*\.",
            "the Reflect API is not available",
        ),
        PatternRule::new(
            "char-code-construction",
            r"String\s*\.\s*fromCharCode",
            "String.fromCharCode is blocked to prevent code construction",
        ),
        PatternRule::new(
            "timers",
            r"\b(setTimeout|setInterval|setImmediate|queueMicrotask)\s*\(",
            "timers are not available; scripts run to completion within the time budget",
        ),
        PatternRule::new(
            "webassembly",
            r"\bWebAssembly\b",
            "WebAssembly is not available",
        ),
    ]
});

/// Validates a script against a policy before any execution resources are
/// committed.
///
/// Blank scripts are valid; they simply do nothing.
pub fn validate_script(
    script: &str,
    policy: ScriptPolicy,
    max_length: Option<usize>,
) -> Result<(), ScriptError> {
    let max = max_length.unwrap_or(MAX_SCRIPT_LENGTH);

    let length = script.encode_utf16().count();
    if length > max {
        return Err(ScriptError::ScriptTooLong {
            max,
            actual: length,
        });
    }

    for rule in policy.rules() {
        if rule.is_match(script) {
            return Err(ScriptError::BannedPattern {
                policy: policy.to_string(),
                rule: rule.name.to_string(),
                description: rule.description.to_string(),
            });
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strict(script: &str) -> Result<(), ScriptError> {
        validate_script(script, ScriptPolicy::Strict, None)
    }

    fn assert_banned(script: &str, rule: &str) {
        match strict(script) {
            Err(ScriptError::BannedPattern { rule: got, .. }) => assert_eq!(got, rule),
            other => panic!("expected rule {rule} to fire, got {other:?}"),
        }
    }

    #[test]
    fn accepts_typical_script() {
        let script = r#"
            const body = pm.response.json();
            if (pm.response.status === 200) {
                pm.environment.set("token", body.access_token);
            }
            console.log("token stored", body.expires_in);
        "#;
        assert!(strict(script).is_ok());
    }

    #[test]
    fn accepts_blank_script() {
        assert!(strict("").is_ok());
        assert!(strict("   \n\t").is_ok());
    }

    #[test]
    fn rejects_over_length_and_names_limit() {
        let script = "x".repeat(MAX_SCRIPT_LENGTH + 1);
        let err = validate_script(&script, ScriptPolicy::Trusted, None).unwrap_err();
        assert!(matches!(err, ScriptError::ScriptTooLong { max: 10_000, .. }));
        assert!(err.to_string().contains("10000"));
    }

    #[test]
    fn length_is_counted_in_utf16_code_units() {
        let script = "é".repeat(MAX_SCRIPT_LENGTH);
        assert!(strict(&script).is_ok());

        // outside the BMP each character takes two code units
        let script = "\u{1F600}".repeat(MAX_SCRIPT_LENGTH / 2);
        assert!(strict(&script).is_ok());
        let script = "\u{1F600}".repeat(MAX_SCRIPT_LENGTH / 2 + 1);
        match strict(&script) {
            Err(ScriptError::ScriptTooLong { actual, .. }) => {
                assert_eq!(actual, MAX_SCRIPT_LENGTH + 2)
            }
            other => panic!("expected length rejection, got {other:?}"),
        }
    }

    #[test]
    fn exactly_at_limit_is_accepted() {
        let script = "x".repeat(MAX_SCRIPT_LENGTH);
        assert!(strict(&script).is_ok());
    }

    #[test]
    fn custom_max_length() {
        let script = "x".repeat(100);
        assert!(validate_script(&script, ScriptPolicy::Strict, Some(50)).is_err());
        assert!(validate_script(&script, ScriptPolicy::Strict, Some(200)).is_ok());
    }

    #[test]
    fn rejects_eval() {
        assert_banned(r#"eval("1+1")"#, "eval");
    }

    #[test]
    fn rejects_function_constructor() {
        assert_banned(r#"new Function("return this")()"#, "function-constructor");
    }

    #[test]
    fn rejects_dynamic_import() {
        assert_banned(r#"const m = await import("fs");"#, "dynamic-import");
    }

    #[test]
    fn rejects_require() {
        assert_banned(r#"const fs = require('fs');"#, "require");
    }

    #[test]
    fn rejects_process_env() {
        assert_banned("pm.environment.set('x', process.env.HOME);", "process-access");
    }

    #[test]
    fn accepts_data_process_status() {
        assert!(strict("const s = pm.response.json().process.status;").is_ok());
    }

    #[test]
    fn rejects_constructor_chain() {
        assert_banned(r#""".constructor.constructor("return this")()"#, "constructor-chain");
        assert_banned(r#"x.constructor["constructor"]"#, "constructor-chain");
    }

    #[test]
    fn accepts_constructor_name() {
        assert!(strict("console.log(obj.constructor.name);").is_ok());
    }

    #[test]
    fn rejects_timers() {
        assert_banned("setTimeout(() => {}, 10);", "timers");
    }

    #[test]
    fn evaluation_identifier_is_not_eval() {
        assert!(strict("const evaluation = 1; console.log(evaluation);").is_ok());
    }

    #[test]
    fn trusted_policy_allows_everything_within_length() {
        let script = r#"const fs = require('fs'); eval("1"); process.env.X;"#;
        assert!(validate_script(script, ScriptPolicy::Trusted, None).is_ok());
    }

    #[test]
    fn rejection_names_policy() {
        let err = strict("eval('1')").unwrap_err();
        assert!(err.to_string().contains("strict policy"));
    }

    #[test]
    fn policy_parses_case_insensitively() {
        assert_eq!("STRICT".parse::<ScriptPolicy>().unwrap(), ScriptPolicy::Strict);
        assert_eq!("trusted".parse::<ScriptPolicy>().unwrap(), ScriptPolicy::Trusted);
        let err = "lenient".parse::<ScriptPolicy>().unwrap_err();
        assert!(err.to_string().contains("lenient"));
    }

    #[test]
    fn default_policy_is_strict() {
        assert_eq!(ScriptPolicy::default(), ScriptPolicy::Strict);
        assert!(!ScriptPolicy::Strict.rules().is_empty());
        assert!(ScriptPolicy::Trusted.rules().is_empty());
    }
}
