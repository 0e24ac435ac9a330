// tests/unit_executor_test.rs

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use steward::core::StewardError;
use steward::core::executor::AsyncExecutor;

#[tokio::test]
async fn executor_runs_one_action() {
    let executor = AsyncExecutor::new();
    let done = Arc::new(AtomicBool::new(false));
    let flag = done.clone();

    executor
        .run_async("restarting the database", async move {
            flag.store(true, Ordering::SeqCst);
        })
        .unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(done.load(Ordering::SeqCst));
    assert!(!executor.busy());
}

#[tokio::test]
async fn executor_rejects_a_second_action_while_busy() {
    let executor = AsyncExecutor::new();
    executor
        .run_async("bootstrapping from leader", async {
            tokio::time::sleep(Duration::from_secs(60)).await;
        })
        .unwrap();

    assert!(executor.busy());
    assert_eq!(
        executor.scheduled_action(),
        Some("bootstrapping from leader".to_string())
    );

    let rejected = executor.run_async("restarting the database", async {});
    assert!(matches!(rejected, Err(StewardError::Busy(name)) if name == "bootstrapping from leader"));
    executor.cancel();
}

#[tokio::test]
async fn executor_slot_is_reusable_after_completion() {
    let executor = AsyncExecutor::new();
    executor.run_async("first", async {}).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(!executor.busy());
    executor.run_async("second", async {}).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!executor.busy());
}

#[tokio::test]
async fn cancel_frees_the_slot_immediately() {
    let executor = AsyncExecutor::new();
    executor
        .run_async("reinitializing from leader", async {
            tokio::time::sleep(Duration::from_secs(60)).await;
        })
        .unwrap();

    assert!(executor.busy());
    executor.cancel();
    assert!(!executor.busy());
    assert_eq!(executor.scheduled_action(), None);
}
