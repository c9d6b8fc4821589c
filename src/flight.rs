//! In-flight task sharing
//!
//! The creation lock, launch lock and reset lock all have the same shape:
//! a stored pending result stands in for a mutex. `FlightMap` keys many
//! such tasks (one per session id); `FlightSlot` holds at most one (engine
//! launch, engine reset). Every concurrent caller awaits a clone of the
//! same shared future and observes the same outcome; the task removes its
//! own registration when it completes, so a failed attempt can be retried
//! by the next caller.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;

use crate::browser::RelayError;

/// A shared in-flight task; clones all resolve to the same outcome
pub type SharedTask<T> = Shared<BoxFuture<'static, Result<T, RelayError>>>;

/// Per-key in-flight task map: at most one task per key at a time
pub struct FlightMap<T: Clone> {
    inner: Arc<Mutex<HashMap<String, SharedTask<T>>>>,
}

impl<T> FlightMap<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Await the task registered under `key`, or register `make()` as the
    /// new task. The registration is removed when the task completes,
    /// success or failure.
    pub async fn run<F, Fut>(&self, key: &str, make: F) -> Result<T, RelayError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, RelayError>> + Send + 'static,
    {
        let task = {
            let mut inflight = self.inner.lock();
            if let Some(existing) = inflight.get(key) {
                existing.clone()
            } else {
                let map = Arc::clone(&self.inner);
                let owned_key = key.to_string();
                let fut = make();
                let task = async move {
                    let result = fut.await;
                    map.lock().remove(&owned_key);
                    result
                }
                .boxed()
                .shared();
                inflight.insert(key.to_string(), task.clone());
                task
            }
        };
        task.await
    }

    /// Whether a task is currently registered under `key`
    pub fn contains(&self, key: &str) -> bool {
        self.inner.lock().contains_key(key)
    }
}

impl<T> Default for FlightMap<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Single-slot in-flight task: at most one task at a time
pub struct FlightSlot<T: Clone> {
    inner: Arc<Mutex<Option<SharedTask<T>>>>,
}

impl<T> FlightSlot<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(None)),
        }
    }

    /// Await the in-flight task if one exists, otherwise register `make()`
    pub async fn run<F, Fut>(&self, make: F) -> Result<T, RelayError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, RelayError>> + Send + 'static,
    {
        let task = {
            let mut slot = self.inner.lock();
            if let Some(existing) = slot.as_ref() {
                existing.clone()
            } else {
                let cell = Arc::clone(&self.inner);
                let fut = make();
                let task = async move {
                    let result = fut.await;
                    cell.lock().take();
                    result
                }
                .boxed()
                .shared();
                *slot = Some(task.clone());
                task
            }
        };
        task.await
    }

    /// Clone of the in-flight task, if any; lets callers wait for an
    /// ongoing task without starting one
    pub fn current(&self) -> Option<SharedTask<T>> {
        self.inner.lock().clone()
    }

    pub fn in_flight(&self) -> bool {
        self.inner.lock().is_some()
    }
}

impl<T> Default for FlightSlot<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_one_task() {
        let map = Arc::new(FlightMap::<u32>::new());
        let runs = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let map = Arc::clone(&map);
            let runs = Arc::clone(&runs);
            handles.push(tokio::spawn(async move {
                map.run("k", move || async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(7)
                })
                .await
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), 7);
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(!map.contains("k"));
    }

    #[tokio::test]
    async fn failed_task_deregisters_for_retry() {
        let map = FlightMap::<u32>::new();
        let result = map
            .run("k", || async { Err(RelayError::SessionCreation("boom".into())) })
            .await;
        assert!(result.is_err());
        assert!(!map.contains("k"));

        let result = map.run("k", || async { Ok(3) }).await;
        assert_eq!(result.unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn distinct_keys_run_independently() {
        let map = Arc::new(FlightMap::<u32>::new());
        let runs = Arc::new(AtomicUsize::new(0));

        let slow_runs = Arc::clone(&runs);
        let slow = {
            let map = Arc::clone(&map);
            tokio::spawn(async move {
                map.run("slow", move || async move {
                    slow_runs.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(1)
                })
                .await
            })
        };

        let fast_runs = Arc::clone(&runs);
        let fast = map
            .run("fast", move || async move {
                fast_runs.fetch_add(1, Ordering::SeqCst);
                Ok(2)
            })
            .await;

        assert_eq!(fast.unwrap(), 2);
        assert_eq!(slow.await.unwrap().unwrap(), 1);
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn slot_shares_and_clears() {
        let slot = Arc::new(FlightSlot::<u32>::new());
        let runs = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let slot = Arc::clone(&slot);
            let runs = Arc::clone(&runs);
            handles.push(tokio::spawn(async move {
                slot.run(move || async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Ok(9)
                })
                .await
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), 9);
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(!slot.in_flight());
        assert!(slot.current().is_none());
    }

    #[tokio::test]
    async fn slot_current_observes_in_flight_task() {
        let slot = Arc::new(FlightSlot::<u32>::new());
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();

        let runner = {
            let slot = Arc::clone(&slot);
            tokio::spawn(async move {
                slot.run(move || async move {
                    let _ = rx.await;
                    Ok(5)
                })
                .await
            })
        };

        // Let the runner register itself
        tokio::task::yield_now().await;
        let observed = slot.current().expect("task should be in flight");
        assert!(slot.in_flight());

        tx.send(()).unwrap();
        assert_eq!(observed.await.unwrap(), 5);
        assert_eq!(runner.await.unwrap().unwrap(), 5);
    }
}
