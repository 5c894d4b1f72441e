//! Coalesce concurrent cache misses: one caller does the work, the rest
//! join the same result.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

use tokio::sync::{Mutex, OnceCell};

pub struct SingleFlight<K, V> {
    flights: Mutex<HashMap<K, Arc<OnceCell<V>>>>,
}

impl<K, V> Default for SingleFlight<K, V> {
    fn default() -> Self {
        Self {
            flights: Mutex::new(HashMap::new()),
        }
    }
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `work` for `key`, sharing an in-flight execution with concurrent
    /// callers. Returns the value and whether this caller joined someone
    /// else's flight.
    pub async fn run<F, Fut>(&self, key: K, work: F) -> (V, bool)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V>,
    {
        let cell = {
            let mut flights = self.flights.lock().await;
            flights.entry(key.clone()).or_default().clone()
        };

        let mut executed = false;
        let value = cell
            .get_or_init(|| {
                executed = true;
                work()
            })
            .await
            .clone();

        if executed {
            self.flights.lock().await.remove(&key);
        }
        (value, !executed)
    }
}
