//! The sandbox exposes nothing beyond `pm` and `console`.
//!
//! Each escape attempt runs under the trusted policy, so it reaches V8 and must fail
//! there, and under the strict policy, where it must be rejected up front.

use std::collections::BTreeMap;

use postrun_sandbox::{
    EnvironmentSnapshot, ResponseView, SandboxConfig, ScriptExecutor, ScriptPolicy,
};

fn executor(policy: ScriptPolicy) -> ScriptExecutor {
    ScriptExecutor::new(SandboxConfig {
        policy,
        ..Default::default()
    })
}

fn response() -> ResponseView {
    ResponseView::new(200, BTreeMap::new(), serde_json::json!({"ok": true}))
}

async fn run_trusted(script: &str) -> Result<(), String> {
    let result = executor(ScriptPolicy::Trusted)
        .execute(script, &response(), None)
        .await;
    match result.error {
        None => Ok(()),
        Some(e) => Err(e),
    }
}

#[tokio::test]
async fn require_is_not_defined() {
    let err = run_trusted(r#"require("fs");"#).await.unwrap_err();
    assert!(err.contains("ReferenceError"), "{err}");
}

#[tokio::test]
async fn process_is_not_defined() {
    let err = run_trusted("process.env.HOME;").await.unwrap_err();
    assert!(err.contains("ReferenceError"), "{err}");
}

#[tokio::test]
async fn runtime_namespace_is_removed() {
    let err = run_trusted("Deno.core.ops;").await.unwrap_err();
    assert!(err.contains("ReferenceError"), "{err}");
}

#[tokio::test]
async fn eval_is_removed() {
    let err = run_trusted(r#"eval("1 + 1");"#).await.unwrap_err();
    assert!(err.contains("ReferenceError"), "{err}");
}

#[tokio::test]
async fn function_constructor_is_unreachable() {
    let script = r#"
        const ctor = pm.environment.get.constructor;
        if (ctor !== undefined) {
            ctor("return 1")();
            throw new Error("constructor reachable");
        }
        const asyncCtor = (async () => {}).constructor;
        if (asyncCtor !== undefined) throw new Error("async constructor reachable");
    "#;
    let outcome = run_trusted(script).await;
    assert!(outcome.is_ok(), "{outcome:?}");
}

#[tokio::test]
async fn network_and_timers_are_absent() {
    let script = r#"
        for (const name of ["fetch", "XMLHttpRequest", "WebSocket", "setTimeout", "setInterval"]) {
            if (typeof globalThis[name] !== "undefined") throw new Error(name + " is defined");
        }
    "#;
    let outcome = run_trusted(script).await;
    assert!(outcome.is_ok(), "{outcome:?}");
}

#[tokio::test]
async fn dynamic_import_fails() {
    let err = run_trusted(r#"await import("data:text/javascript,export default 1");"#)
        .await
        .unwrap_err();
    assert!(!err.is_empty());
}

#[tokio::test]
async fn closing_the_function_body_early_does_not_commit_writes() {
    let exec = executor(ScriptPolicy::Strict);
    let env = EnvironmentSnapshot::new("env", BTreeMap::new());
    let script = "pm.environment.set('k','v'); })(); __postrunComplete({ok:true}); \
                  await new Promise(() => {}); await (async function(){";

    let result = exec.execute(script, &response(), Some(&env)).await;
    assert!(!result.success, "{result:?}");
    assert!(result.updated_variables.is_none());
}

#[tokio::test]
async fn no_host_hook_is_visible() {
    let script = r#"
        for (const name of Object.getOwnPropertyNames(globalThis)) {
            if (name.startsWith("__postrun")) throw new Error("hook visible: " + name);
        }
    "#;
    let outcome = run_trusted(script).await;
    assert!(outcome.is_ok(), "{outcome:?}");
}

#[tokio::test]
async fn globals_do_not_leak_between_runs() {
    let exec = executor(ScriptPolicy::Trusted);
    let env = EnvironmentSnapshot::new("env", BTreeMap::new());

    let first = exec
        .execute("globalThis.leaked = 'yes';", &response(), Some(&env))
        .await;
    assert!(first.success, "{first:?}");

    let second = exec
        .execute(
            r#"pm.environment.set("seen", typeof globalThis.leaked);"#,
            &response(),
            Some(&env),
        )
        .await;
    assert_eq!(second.updated_variables.unwrap()["seen"], "undefined");
}

#[tokio::test]
async fn strict_policy_rejects_escape_attempts_before_execution() {
    let exec = executor(ScriptPolicy::Strict);
    for attempt in [
        r#"require("fs")"#,
        "process.env.HOME",
        "Deno.core.ops",
        r#"eval("1")"#,
        r#"Function("return this")()"#,
        r#"import("x")"#,
        "({}).constructor.constructor",
        "setTimeout(() => {}, 1)",
    ] {
        let result = exec.execute(attempt, &response(), None).await;
        let err = result.error.unwrap_or_default();
        assert!(err.contains("strict policy"), "{attempt:?} gave {err:?}");
    }
}
