use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

type InflightResult<T> = Result<T, String>;
type InflightFuture<T> = Shared<BoxFuture<'static, InflightResult<T>>>;

/// Collapses identical in-flight work onto a single execution.
///
/// The first caller for a key spawns the work; callers arriving while it runs
/// await the same result. The key is released once the work settles.
pub struct RequestDeduplicator<T: Clone> {
    inflight: Arc<Mutex<HashMap<String, InflightFuture<T>>>>,
}

impl<T: Clone> Clone for RequestDeduplicator<T> {
    fn clone(&self) -> Self {
        Self {
            inflight: Arc::clone(&self.inflight),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Default for RequestDeduplicator<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deduplicated<T> {
    pub value: InflightResult<T>,
    /// This caller joined work started by someone else.
    pub joined: bool,
}

impl<T: Clone + Send + Sync + 'static> RequestDeduplicator<T> {
    pub fn new() -> Self {
        Self {
            inflight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Runs `make()` unless identical work is already in flight. An `Err`
    /// value means the spawned work panicked or was aborted.
    pub async fn run<F>(&self, key: String, make: F) -> Deduplicated<T>
    where
        F: FnOnce() -> BoxFuture<'static, T>,
    {
        let (pending, joined) = {
            let mut guard = self.inflight.lock().await;
            if let Some(existing) = guard.get(&key) {
                (existing.clone(), true)
            } else {
                let inflight = Arc::clone(&self.inflight);
                let release_key = key.clone();
                let work = make();
                let handle = tokio::spawn(async move {
                    let value = work.await;
                    inflight.lock().await.remove(&release_key);
                    value
                });
                let pending = async move { handle.await.map_err(|err| err.to_string()) }
                    .boxed()
                    .shared();
                guard.insert(key.clone(), pending.clone());
                (pending, false)
            }
        };
        let value = pending.clone().await;
        if value.is_err() {
            // Aborted work never reached its own release step.
            let mut guard = self.inflight.lock().await;
            if guard.get(&key).is_some_and(|entry| entry.ptr_eq(&pending)) {
                guard.remove(&key);
            }
        }
        Deduplicated { value, joined }
    }

    pub async fn inflight_count(&self) -> usize {
        self.inflight.lock().await.len()
    }
}
