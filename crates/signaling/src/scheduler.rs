use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

struct ScheduledTask {
    generation: u64,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

#[derive(Clone)]
pub struct TaskTable<K> {
    name: &'static str,
    tasks: Arc<Mutex<HashMap<K, ScheduledTask>>>,
    generation: Arc<AtomicU64>,
}

impl<K> TaskTable<K>
where
    K: Eq + Hash + Clone + Display + Send + 'static,
{
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            tasks: Arc::new(Mutex::new(HashMap::new())),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<K, ScheduledTask>> {
        // the map stays consistent even if a holder panicked
        self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn schedule<F>(&self, key: K, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let table = self.clone();
        let task_key = key.clone();

        let mut tasks = self.lock();
        let handle = tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => {}
                _ = task => {}
            }
            table.finish(&task_key, generation);
        });
        if let Some(previous) = tasks.insert(key.clone(), ScheduledTask { generation, cancel, handle }) {
            previous.cancel.cancel();
            debug!(table = self.name, key = %key, "replaced scheduled task");
        }
    }

    pub fn cancel(&self, key: &K) -> bool {
        match self.lock().remove(key) {
            Some(task) => {
                task.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, key: &K) -> bool {
        self.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // Only removes the entry if it still belongs to the finishing task.
    fn finish(&self, key: &K, generation: u64) {
        let mut tasks = self.lock();
        if tasks.get(key).is_some_and(|task| task.generation == generation) {
            tasks.remove(key);
        }
    }

    pub async fn drain(&self, grace: Duration) {
        let drained: Vec<(K, ScheduledTask)> = self.lock().drain().collect();
        if drained.is_empty() {
            return;
        }
        let count = drained.len();
        let handles: Vec<JoinHandle<()>> = drained
            .into_iter()
            .map(|(_, task)| {
                task.cancel.cancel();
                task.handle
            })
            .collect();
        let joined = tokio::time::timeout(grace, futures_util::future::join_all(handles)).await;
        match joined {
            Ok(_) => debug!(table = self.name, count, "drained scheduled tasks"),
            Err(_) => warn!(table = self.name, count, "scheduled tasks did not stop within grace period"),
        }
    }
}
