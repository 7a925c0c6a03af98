//! Coalesces concurrent work for the same key into one execution.
//!
//! The first caller for a key spawns the operation as its own task; every
//! caller, the first included, subscribes to its result. A caller that gives
//! up only stops waiting: the run continues and later callers attach to it.
//! If the task itself dies without a result, a waiter takes over.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;

use crate::error::Error;

pub type Shared<V> = std::result::Result<Arc<V>, Arc<Error>>;

type FlightMap<K, V> = Arc<Mutex<HashMap<K, broadcast::Sender<Shared<V>>>>>;

pub struct SingleFlight<K, V> {
    in_flight: FlightMap<K, V>,
}

impl<K, V> Default for SingleFlight<K, V>
where
    K: Hash + Eq + Clone + Send + 'static,
    V: Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Clears the entry when the spawned run ends, including by panic.
struct RunGuard<K: Hash + Eq, V> {
    in_flight: FlightMap<K, V>,
    key: K,
    armed: bool,
}

impl<K: Hash + Eq, V> RunGuard<K, V> {
    fn remove(&mut self) {
        if std::mem::take(&mut self.armed) {
            if let Ok(mut map) = self.in_flight.lock() {
                map.remove(&self.key);
            }
        }
    }
}

impl<K: Hash + Eq, V> Drop for RunGuard<K, V> {
    fn drop(&mut self) {
        self.remove();
    }
}

impl<K, V> SingleFlight<K, V>
where
    K: Hash + Eq + Clone + Send + 'static,
    V: Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Run `f` unless a run for `key` is already in flight, then wait for
    /// whichever run owns the key. The lock is held only for map operations.
    pub async fn execute<F, Fut>(&self, key: K, f: F) -> Shared<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = crate::error::Result<V>> + Send + 'static,
    {
        let mut f = Some(f);
        loop {
            let mut rx = {
                let mut map = self
                    .in_flight
                    .lock()
                    .map_err(|_| Arc::new(Error::CacheUnavailable("single-flight map poisoned".into())))?;
                match map.get(&key) {
                    Some(tx) => tx.subscribe(),
                    None => {
                        let Some(op) = f.take() else {
                            return Err(Arc::new(Error::CacheUnavailable(
                                "single-flight run ended without a result".into(),
                            )));
                        };
                        let (tx, rx) = broadcast::channel(1);
                        map.insert(key.clone(), tx.clone());
                        self.spawn_run(key.clone(), tx, op());
                        rx
                    }
                }
            };

            match rx.recv().await {
                Ok(result) => return result,
                // The run died without a result; start over.
                Err(_) => continue,
            }
        }
    }

    fn spawn_run<Fut>(&self, key: K, tx: broadcast::Sender<Shared<V>>, fut: Fut)
    where
        Fut: Future<Output = crate::error::Result<V>> + Send + 'static,
    {
        let mut guard = RunGuard {
            in_flight: Arc::clone(&self.in_flight),
            key,
            armed: true,
        };
        tokio::spawn(async move {
            let result: Shared<V> = match fut.await {
                Ok(v) => Ok(Arc::new(v)),
                Err(e) => Err(Arc::new(e)),
            };
            // New callers start a fresh run from here on.
            guard.remove();
            let _ = tx.send(result);
        });
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().map(|m| m.len()).unwrap_or(0)
    }
}
