// tests/pool_destroy.rs

use std::error::Error;
use std::time::Duration;

use procpool::{ExitInfo, PoolError, TaskError, WorkerId};
use procpool_test_utils::builders::PoolConfigBuilder;
use procpool_test_utils::fake_spawner::KILL_SIGNAL;
use procpool_test_utils::{fake_pool, init_tracing, with_timeout};
use serde_json::json;

type TestResult = Result<(), Box<dyn Error>>;

#[tokio::test]
async fn destroy_waits_for_in_flight_and_queued_tasks() -> TestResult {
    init_tracing();
    let (pool, _spawner, mut children) = fake_pool(PoolConfigBuilder::new(1).build());
    let mut child = with_timeout(children.next()).await;
    with_timeout(child.accept_init()).await;

    let t1 = pool.send_message(json!({ "n": 1 })).await?;
    let t2 = pool.send_message(json!({ "n": 2 })).await?;

    let destroyed = tokio::spawn(pool.destroy());
    let err = pool.send_message(json!({ "n": 3 })).await.expect_err("destroying");
    assert!(matches!(err, PoolError::PoolShutDown), "got {err:?}");
    let err = pool
        .send_message_to_all_workers(json!({}))
        .await
        .expect_err("destroying");
    assert!(matches!(err, PoolError::PoolShutDown), "got {err:?}");

    with_timeout(child.expect_message()).await;
    child.respond(json!(1)).await;
    assert_eq!(with_timeout(t1).await, Ok(json!(1)));

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!destroyed.is_finished(), "destroy resolved while a task was queued");
    assert!(!child.was_killed());

    assert_eq!(with_timeout(child.expect_message()).await, json!({ "n": 2 }));
    child.respond(json!(2)).await;
    assert_eq!(with_timeout(t2).await, Ok(json!(2)));

    with_timeout(destroyed).await??;
    assert!(child.was_killed());
    with_timeout(child.expect_stdin_closed()).await;
    Ok(())
}

#[tokio::test]
async fn destroy_resolves_even_when_tasks_fail() -> TestResult {
    init_tracing();
    let config = PoolConfigBuilder::new(2).max_reboots(0).build();
    let (pool, _spawner, mut children) = fake_pool(config);
    let mut a = with_timeout(children.next()).await;
    let mut b = with_timeout(children.next()).await;
    with_timeout(a.accept_init()).await;
    with_timeout(b.accept_init()).await;

    let ta = pool.send_message(json!({ "who": "a" })).await?;
    let tb = pool.send_message(json!({ "who": "b" })).await?;
    with_timeout(a.expect_message()).await;
    with_timeout(b.expect_message()).await;

    let destroyed = tokio::spawn(pool.destroy());

    a.respond_error(json!("nope")).await;
    b.exit(ExitInfo::with_code(9)).await;

    assert!(with_timeout(ta).await.is_err());
    assert!(matches!(with_timeout(tb).await, Err(TaskError::Crashed(_))));
    with_timeout(destroyed).await??;
    assert!(a.was_killed());
    Ok(())
}

#[tokio::test]
async fn destroy_waits_for_queued_broadcast_copies() -> TestResult {
    init_tracing();
    let (pool, _spawner, mut children) = fake_pool(PoolConfigBuilder::new(1).build());
    let mut child = with_timeout(children.next()).await;
    with_timeout(child.accept_init()).await;

    let task = pool.send_message(json!({ "first": true })).await?;
    let broadcast = pool.send_message_to_all_workers(json!({ "all": true })).await?;
    let destroyed = tokio::spawn(pool.destroy());

    with_timeout(child.expect_message()).await;
    child.respond(json!("a")).await;
    with_timeout(task).await?;

    assert_eq!(with_timeout(child.expect_message()).await, json!({ "all": true }));
    assert!(!destroyed.is_finished());
    child.respond(json!("b")).await;

    assert_eq!(with_timeout(broadcast).await, vec![(WorkerId(0), Ok(json!("b")))]);
    with_timeout(destroyed).await??;
    Ok(())
}

#[tokio::test]
async fn concurrent_destroy_calls_resolve_together() -> TestResult {
    init_tracing();
    let (pool, _spawner, mut children) = fake_pool(PoolConfigBuilder::new(2).build());
    let mut a = with_timeout(children.next()).await;
    let mut b = with_timeout(children.next()).await;
    with_timeout(a.accept_init()).await;
    with_timeout(b.accept_init()).await;

    let task = pool.send_message(json!({})).await?;
    with_timeout(a.expect_message()).await;

    let other = pool.clone();
    let first = tokio::spawn(pool.destroy());
    let second = tokio::spawn(other.destroy());

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!first.is_finished());
    assert!(!second.is_finished());

    a.respond(json!(null)).await;
    with_timeout(task).await?;
    with_timeout(first).await??;
    with_timeout(second).await??;

    // Asking again after the fact resolves right away.
    with_timeout(pool.destroy()).await?;
    assert!(a.was_killed() && b.was_killed());
    Ok(())
}

#[tokio::test]
async fn destroying_an_idle_pool_is_immediate() -> TestResult {
    init_tracing();
    let (pool, _spawner, mut children) = fake_pool(PoolConfigBuilder::new(3).build());
    let mut kids = Vec::new();
    for _ in 0..3 {
        let mut child = with_timeout(children.next()).await;
        with_timeout(child.accept_init()).await;
        kids.push(child);
    }

    with_timeout(pool.destroy()).await?;
    for child in &kids {
        assert_eq!(with_timeout(child.exited()).await, ExitInfo::with_signal(KILL_SIGNAL));
    }

    let err = pool.send_message(json!({})).await.expect_err("destroyed");
    assert!(matches!(err, PoolError::PoolShutDown), "got {err:?}");
    Ok(())
}

#[tokio::test]
async fn destroy_waits_for_workers_still_initializing() -> TestResult {
    init_tracing();
    let (pool, _spawner, mut children) = fake_pool(PoolConfigBuilder::new(1).build());
    let mut child = with_timeout(children.next()).await;

    let destroyed = tokio::spawn(pool.destroy());
    with_timeout(child.expect_init()).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!destroyed.is_finished());

    child.send(json!({ "initSuccess": true })).await;
    with_timeout(destroyed).await??;
    assert!(child.was_killed());
    Ok(())
}

#[tokio::test]
async fn a_worker_that_exited_while_idle_is_destroyed_without_reboot() -> TestResult {
    init_tracing();
    let (pool, spawner, mut children) = fake_pool(PoolConfigBuilder::new(1).build());
    let mut child = with_timeout(children.next()).await;
    with_timeout(child.accept_init()).await;

    // One round trip so the handshake is known to be processed; an exit
    // before that would count as an initialization failure.
    let task = pool.send_message(json!({})).await?;
    with_timeout(child.expect_message()).await;
    child.respond(json!(0)).await;
    with_timeout(task).await?;

    child.exit(ExitInfo::with_code(0)).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    with_timeout(pool.destroy()).await?;
    assert_eq!(spawner.spawned(), 1);
    assert!(!child.was_killed());
    Ok(())
}

#[tokio::test]
async fn dropping_every_pool_handle_destroys_the_pool() -> TestResult {
    init_tracing();
    let (pool, _spawner, mut children) = fake_pool(PoolConfigBuilder::new(2).build());
    let mut a = with_timeout(children.next()).await;
    let mut b = with_timeout(children.next()).await;
    with_timeout(a.accept_init()).await;
    with_timeout(b.accept_init()).await;

    let task = pool.send_message(json!({ "keep": "going" })).await?;
    drop(pool);

    // Outstanding work still completes.
    with_timeout(a.expect_message()).await;
    a.respond(json!("finished")).await;
    assert_eq!(with_timeout(task).await, Ok(json!("finished")));

    assert_eq!(with_timeout(a.exited()).await, ExitInfo::with_signal(KILL_SIGNAL));
    assert_eq!(with_timeout(b.exited()).await, ExitInfo::with_signal(KILL_SIGNAL));
    Ok(())
}
