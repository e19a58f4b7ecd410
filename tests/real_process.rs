// tests/real_process.rs
//
// Smoke tests against real `sh` subprocesses. The scripts know the exact
// size of the handshake (`{"initData":null}`, 17 bytes) so they can consume
// it without a JSON parser. Pools boot lazily so the first task is already
// waiting on the worker before the script produces any output.

#![cfg(unix)]

use std::error::Error;

use procpool::{Pool, PoolError, SpawnSpec, TaskError};
use procpool_test_utils::builders::PoolConfigBuilder;
use procpool_test_utils::{init_tracing, with_timeout};
use serde_json::json;

type TestResult = Result<(), Box<dyn Error>>;

fn sh_pool(script: &str) -> Pool {
    let spec = SpawnSpec::new("sh").arg("-c").arg(script);
    let config = PoolConfigBuilder::new(1).lazy().program(spec).build();
    Pool::with_command_spawner(config).expect("failed to start pool")
}

#[tokio::test]
async fn answers_a_task_and_shuts_down() -> TestResult {
    init_tracing();
    let pool = sh_pool(
        r#"head -c 17 >/dev/null
printf '{"initSuccess":true}'
head -c 1 >/dev/null
printf '{"response":{"pong":true}}'
cat >/dev/null"#,
    );

    let task = pool.send_message(json!({ "ping": 1 })).await?;
    assert_eq!(with_timeout(task).await, Ok(json!({ "pong": true })));
    with_timeout(pool.destroy()).await?;
    Ok(())
}

#[tokio::test]
async fn crashing_twice_reports_exit_code_and_stderr() -> TestResult {
    init_tracing();
    let pool = sh_pool(
        r#"head -c 17 >/dev/null
printf '{"initSuccess":true}'
head -c 1 >/dev/null
echo "boom: out of cheese" >&2
exit 7"#,
    );

    let task = pool.send_message(json!({ "job": "explode" })).await?;
    match with_timeout(task).await {
        Err(TaskError::Crashed(report)) => {
            assert_eq!(report.exit.code, Some(7));
            assert_eq!(report.exit.signal, None);
            assert!(report.stderr.contains("boom: out of cheese"), "{}", report.stderr);
            let msg = TaskError::Crashed(report).to_string();
            assert!(msg.contains("exit code: 7, exit signal: null"), "{msg}");
        }
        other => panic!("expected a crash report, got {other:?}"),
    }

    with_timeout(pool.destroy()).await?;
    Ok(())
}

#[tokio::test]
async fn init_error_from_a_real_process() -> TestResult {
    init_tracing();
    let pool = sh_pool(r#"printf '{"initError":"no license"}'; cat >/dev/null"#);

    let task = pool.send_message(json!({})).await?;
    match with_timeout(task).await {
        Err(TaskError::Initialization(msg)) => assert!(msg.ends_with("no license"), "{msg}"),
        other => panic!("expected an initialization error, got {other:?}"),
    }

    let err = with_timeout(pool.destroy()).await.expect_err("pool was aborted");
    assert!(matches!(err, PoolError::Terminated(_)), "got {err:?}");
    Ok(())
}

#[tokio::test]
async fn exit_before_handshake_from_a_real_process() -> TestResult {
    init_tracing();
    let pool = sh_pool("echo 'missing dependency' >&2; exit 3");

    let task = pool.send_message(json!({})).await?;
    match with_timeout(task).await {
        Err(TaskError::Initialization(msg)) => {
            assert!(msg.contains("exit code: 3"), "{msg}");
            assert!(msg.contains("  missing dependency"), "{msg}");
        }
        other => panic!("expected an initialization error, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn missing_program_fails_pool_construction() -> TestResult {
    init_tracing();
    let spec = SpawnSpec::new("/definitely/not/a/real/worker-binary");
    let config = PoolConfigBuilder::new(1).program(spec).build();

    match Pool::with_command_spawner(config) {
        Err(PoolError::Initialization { reason, .. }) => {
            assert!(reason.starts_with("failed to spawn"), "{reason}")
        }
        other => panic!("expected a spawn failure, got {other:?}"),
    }
    Ok(())
}
