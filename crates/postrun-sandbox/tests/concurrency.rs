//! Concurrent invocations share nothing.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use postrun_sandbox::{EnvironmentSnapshot, ResponseView, SandboxConfig, ScriptExecutor};
use serial_test::serial;

fn response(token: &str) -> ResponseView {
    ResponseView::new(200, BTreeMap::new(), serde_json::json!({ "token": token }))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn parallel_runs_keep_their_own_environments() {
    let exec = Arc::new(ScriptExecutor::new(SandboxConfig::default()));
    let script = r#"
        pm.environment.set("token", pm.response.json().token);
        pm.environment.set("owner", pm.environment.get("name"));
    "#;

    let mut handles = Vec::new();
    for i in 0..8 {
        let exec = exec.clone();
        handles.push(tokio::spawn(async move {
            let mut vars = BTreeMap::new();
            vars.insert("name".to_string(), format!("env-{i}"));
            let env = EnvironmentSnapshot::new(format!("env-{i}"), vars);
            let result = exec
                .execute(script, &response(&format!("tok-{i}")), Some(&env))
                .await;
            (i, result)
        }));
    }

    for handle in handles {
        let (i, result) = handle.await.unwrap();
        assert!(result.success, "run {i}: {result:?}");
        let vars = result.updated_variables.unwrap();
        assert_eq!(vars["token"], format!("tok-{i}"));
        assert_eq!(vars["owner"], format!("env-{i}"));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn runaway_script_does_not_block_others() {
    let exec = Arc::new(ScriptExecutor::new(SandboxConfig {
        timeout: Duration::from_secs(2),
        ..Default::default()
    }));

    let runaway = {
        let exec = exec.clone();
        tokio::spawn(async move { exec.execute("while (true) {}", &response("x"), None).await })
    };

    let start = Instant::now();
    let env = EnvironmentSnapshot::new("env", BTreeMap::new());
    let quick = exec
        .execute(r#"pm.environment.set("a", "1");"#, &response("y"), Some(&env))
        .await;
    assert!(quick.success, "{quick:?}");
    assert!(
        start.elapsed() < Duration::from_secs(2),
        "quick run waited on the runaway one"
    );

    let runaway = runaway.await.unwrap();
    assert!(runaway.error.unwrap().contains("timed out"));
}
