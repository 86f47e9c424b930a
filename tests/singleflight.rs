use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use favkit::cache::Group;

#[tokio::test]
async fn overlapping_calls_execute_once() {
    let group: Arc<Group<usize>> = Arc::new(Group::new());
    let executions = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..100 {
        let group = group.clone();
        let executions = executions.clone();
        handles.push(tokio::spawn(async move {
            group
                .run("example.com|32|png", async move {
                    executions.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    42usize
                })
                .await
        }));
    }

    for handle in handles {
        assert_eq!(handle.await.unwrap(), 42);
    }
    assert_eq!(executions.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn sequential_calls_execute_fresh() {
    let group: Group<usize> = Group::new();
    let executions = Arc::new(AtomicUsize::new(0));

    for expected in 1..=3 {
        let executions = executions.clone();
        let n = group
            .run("key", async move { executions.fetch_add(1, Ordering::SeqCst) + 1 })
            .await;
        assert_eq!(n, expected);
    }
    assert_eq!(executions.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn distinct_keys_run_in_parallel() {
    let group: Arc<Group<&'static str>> = Arc::new(Group::new());

    let a = {
        let group = group.clone();
        tokio::spawn(async move {
            group
                .run("a", async {
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    "a"
                })
                .await
        })
    };
    let b = {
        let group = group.clone();
        tokio::spawn(async move {
            group
                .run("b", async {
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    "b"
                })
                .await
        })
    };

    assert_eq!(a.await.unwrap(), "a");
    assert_eq!(b.await.unwrap(), "b");
}

#[tokio::test]
async fn errors_are_shared_with_co_callers() {
    let group: Arc<Group<Result<usize, Arc<String>>>> = Arc::new(Group::new());
    let executions = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..10 {
        let group = group.clone();
        let executions = executions.clone();
        handles.push(tokio::spawn(async move {
            group
                .run("failing", async move {
                    executions.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Err::<usize, _>(Arc::new("upstream broke".to_string()))
                })
                .await
        }));
    }

    for handle in handles {
        let err = handle.await.unwrap().unwrap_err();
        assert_eq!(*err, "upstream broke");
    }
    assert_eq!(executions.load(Ordering::SeqCst), 1);
}
