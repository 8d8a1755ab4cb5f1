//! Task lifecycle integration tests
//!
//! Commit, completion, nested calls and frame storage accounting.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use futures::future::BoxFuture;
use futures::FutureExt;
use rpc_routines::prelude::*;

fn fib(cx: TaskContext, n: u64) -> BoxFuture<'static, u64> {
    async move {
        if n < 2 {
            return n;
        }
        let a = cx.invoke(move |cx| fib(cx, n - 1)).await.unwrap();
        let b = cx.invoke(move |cx| fib(cx, n - 2)).await.unwrap();
        a + b
    }
    .boxed()
}

fn chain(cx: TaskContext, depth: usize) -> BoxFuture<'static, usize> {
    async move {
        if depth == 0 {
            return 0;
        }
        cx.invoke(move |cx| chain(cx, depth - 1)).await.unwrap() + 1
    }
    .boxed()
}

rr_test!(fn test_block_on(runtime) {
    assert_eq!(runtime.block_on(|_cx| async { "done".to_string() }), Ok("done".to_string()));
});

rr_test!(fn test_many_tasks_release_storage_once(runtime, 4) {
    let counter = Arc::new(AtomicUsize::new(0));
    let tasks: Vec<_> = (0..200)
        .map(|i| {
            let counter = Arc::clone(&counter);
            runtime
                .spawn(move |_cx| async move {
                    counter.fetch_add(1, Ordering::Relaxed);
                    i * 2
                })
                .unwrap()
        })
        .collect();

    let sum: usize = tasks.into_iter().map(|task| task.join().unwrap()).sum();
    assert_eq!(sum, (0..200).map(|i| i * 2).sum());
    assert_eq!(counter.load(Ordering::Relaxed), 200);

    let arena = common::settle(&runtime);
    assert_eq!(arena.live, 0);
    assert_eq!(arena.allocated, 200);
    assert_eq!(arena.released, 200);
    assert_eq!(runtime.stats().scheduler.running_tasks, 0);
});

rr_test!(fn test_result_survives_until_handle_drops(runtime) {
    let task = runtime.spawn(|_cx| async { vec![1u8, 2, 3] }).unwrap();
    task.wait();
    assert!(task.is_done());
    assert_eq!(task.get_result(), Some(vec![1, 2, 3]));
    assert_eq!(task.take_result(), Some(vec![1, 2, 3]));
    assert_eq!(task.take_result(), None);
    assert_eq!(runtime.stats().arena.live, 1);
    drop(task);
    assert_eq!(common::settle(&runtime).live, 0);
});

rr_test!(fn test_cloned_handle_keeps_frame(runtime) {
    let task = runtime.spawn(|_cx| async { 5u32 }).unwrap();
    let copy = task.clone();
    drop(task);
    assert_eq!(copy.join(), Some(5));
    assert_eq!(common::settle(&runtime).live, 0);
});

rr_test!(fn test_nested_fibonacci(runtime) {
    assert_eq!(runtime.block_on(|cx| fib(cx, 15)), Ok(610));
    assert_eq!(common::settle(&runtime).live, 0);
});

rr_test!(fn test_deep_chain_runs_flat(runtime, 1) {
    // Each level is a separate frame; resumption never recurses on the stack.
    assert_eq!(runtime.block_on(|cx| chain(cx, 5_000)), Ok(5_000));
    let arena = common::settle(&runtime);
    assert_eq!(arena.allocated, 5_001);
    assert_eq!(arena.live, 0);
    assert_eq!(runtime.stats().scheduler.frames_committed, 1);
});

rr_test!(fn test_child_inherits_correlation_id(runtime) {
    let (parent, child) = runtime
        .block_on(|cx| async move {
            let child = cx.invoke(|cx| async move { cx.correlation_id() }).await.unwrap();
            (cx.correlation_id(), child)
        })
        .unwrap();
    assert_eq!(parent, child);
});

rr_test!(fn test_roots_get_distinct_correlation_ids(runtime) {
    let a = runtime.task(|_cx| async {});
    let b = runtime.task(|_cx| async {});
    assert_ne!(a.correlation_id(), b.correlation_id());
});

rr_test!(fn test_join_task_created_elsewhere(runtime) {
    let result = runtime.block_on(|cx| async move {
        let task = cx.task(|cx| async move {
            cx.sleep(Duration::from_millis(5)).await;
            7
        });
        cx.join(task).await
    });
    assert_eq!(result, Ok(Ok(7)));
});

rr_test!(fn test_join_alongside_sleep(runtime) {
    let result = runtime.block_on(|cx| async move {
        let child = cx.task(|_cx| async { 11 });
        let ((), value) = futures::join!(cx.sleep(Duration::from_millis(10)), cx.join(child));
        value
    });
    assert_eq!(result, Ok(Ok(11)));
    assert_eq!(runtime.stats().timer.registered, 1);
    assert_eq!(common::settle(&runtime).live, 0);
});

rr_test!(fn test_join_committed_task_is_an_error(runtime) {
    let running = runtime
        .spawn(|cx| async move {
            cx.sleep(Duration::from_millis(200)).await;
            1
        })
        .unwrap();
    let handle = running.clone();
    let result = runtime.block_on(move |cx| async move { cx.join(handle).await });
    assert!(matches!(result, Ok(Err(Error::RuntimeError { .. }))));
    assert_eq!(running.join(), Some(1));
});

rr_test!(fn test_yield_interleaves_tasks(runtime, 1) {
    let turns = Arc::new(AtomicUsize::new(0));
    let tasks: Vec<_> = (0..2)
        .map(|_| {
            let turns = Arc::clone(&turns);
            runtime
                .spawn(move |cx| async move {
                    let mut seen = Vec::new();
                    for _ in 0..3 {
                        seen.push(turns.fetch_add(1, Ordering::SeqCst));
                        cx.yield_now().await;
                    }
                    seen
                })
                .unwrap()
        })
        .collect();

    let mut all: Vec<usize> = tasks.into_iter().flat_map(|task| task.join().unwrap()).collect();
    all.sort_unstable();
    assert_eq!(all, vec![0, 1, 2, 3, 4, 5]);
    assert!(runtime.stats().scheduler.frames_resumed >= 8);
});

#[test]
fn test_commit_after_stop_is_rejected() {
    let runtime = common::started_runtime(1);
    runtime.stop();
    assert!(matches!(
        runtime.spawn(|_cx| async { 1 }),
        Err(Error::ServiceStopped)
    ));
    runtime.wait();
}

#[test]
fn test_stop_waits_for_running_tasks() {
    let runtime = common::started_runtime(2);
    let task = runtime
        .spawn(|cx| async move {
            cx.sleep(Duration::from_millis(30)).await;
            cx.invoke(|_cx| async { 3 }).await.unwrap()
        })
        .unwrap();
    common::shutdown(&runtime);
    assert!(task.is_done());
    assert_eq!(task.take_result(), Some(3));
}
