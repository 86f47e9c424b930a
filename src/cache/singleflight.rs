use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tokio::sync::watch;

/// Duplicate-suppressed execution: overlapping `run` calls with the same key
/// share one execution and one result. Records live in the group only while
/// a call is in flight; there is no negative caching and no coalescing
/// across time.
pub struct Group<T> {
    calls: Arc<Mutex<HashMap<String, Arc<Call<T>>>>>,
}

struct Call<T> {
    result: OnceLock<T>,
    done: watch::Receiver<bool>,
}

/// Removes the in-flight record and wakes waiters when the leader finishes,
/// even if its future panics. Removal happens before the wake so a call
/// arriving after completion starts a fresh execution.
struct Finish<T> {
    calls: Arc<Mutex<HashMap<String, Arc<Call<T>>>>>,
    key: String,
    tx: watch::Sender<bool>,
}

impl<T> Drop for Finish<T> {
    fn drop(&mut self) {
        self.calls.lock().remove(&self.key);
        let _ = self.tx.send(true);
    }
}

impl<T> Default for Group<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Group<T> {
    pub fn new() -> Self {
        Self {
            calls: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Group<T> {
    /// Execute `work` for `key`, unless a call for the same key is already
    /// in flight, in which case wait for it and return its result.
    ///
    /// The winner's future runs in a spawned task: a caller that goes away
    /// mid-flight cannot cancel work other callers are waiting on. The lock
    /// is held only to insert or remove the record, never across the work.
    pub async fn run<F>(&self, key: &str, work: F) -> T
    where
        F: Future<Output = T> + Send + 'static,
    {
        let call = {
            let mut calls = self.calls.lock();
            if let Some(existing) = calls.get(key) {
                existing.clone()
            } else {
                let (tx, rx) = watch::channel(false);
                let call = Arc::new(Call {
                    result: OnceLock::new(),
                    done: rx,
                });
                calls.insert(key.to_string(), call.clone());

                let leader = call.clone();
                let finish = Finish {
                    calls: self.calls.clone(),
                    key: key.to_string(),
                    tx,
                };
                tokio::spawn(async move {
                    let _finish = finish;
                    let out = work.await;
                    let _ = leader.result.set(out);
                });
                call
            }
        };

        let mut done = call.done.clone();
        while !*done.borrow_and_update() {
            if done.changed().await.is_err() {
                break; // sender dropped after publishing
            }
        }
        call.result
            .get()
            .cloned()
            .expect("singleflight completed without a result")
    }
}
