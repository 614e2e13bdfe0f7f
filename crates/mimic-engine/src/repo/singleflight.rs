//! Request coalescing.
//!
//! A [`Group`] guarantees at most one in-flight execution per key: the
//! first caller becomes the leader and runs the work, every concurrent
//! caller with the same key waits and receives a clone of the same outcome
//! (success or failure). The entry is removed before the result is
//! broadcast, so late arrivals start a fresh flight instead of waiting on
//! a completed one.
//!
//! If a leader is cancelled mid-flight, its sender drops; waiters observe
//! the closed channel and fall back to executing the work themselves.

use std::collections::HashMap;
use std::future::Future;

use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::error::Result;

enum Role<T> {
    Leader(broadcast::Sender<Result<T>>),
    Waiter(broadcast::Receiver<Result<T>>),
}

pub struct Group<T: Clone> {
    inflight: Mutex<HashMap<String, broadcast::Sender<Result<T>>>>,
}

impl<T: Clone + Send + 'static> Group<T> {
    pub fn new() -> Self {
        Self {
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Run `work` under the key, sharing its outcome with every concurrent
    /// caller of the same key.
    pub async fn run<F, Fut>(&self, key: &str, work: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let role = {
            let mut inflight = self.inflight.lock();
            match inflight.get(key) {
                Some(tx) => Role::Waiter(tx.subscribe()),
                None => {
                    let (tx, _) = broadcast::channel(1);
                    inflight.insert(key.to_string(), tx.clone());
                    Role::Leader(tx)
                }
            }
        };

        match role {
            Role::Waiter(mut rx) => match rx.recv().await {
                Ok(result) => result,
                // Leader was cancelled before delivering; run uncoalesced.
                Err(_) => work().await,
            },
            Role::Leader(tx) => {
                let guard = FlightGuard {
                    group: self,
                    key: key.to_string(),
                };
                let result = work().await;
                drop(guard);
                let _ = tx.send(result.clone());
                result
            }
        }
    }
}

impl<T: Clone + Send + 'static> Default for Group<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Removes the in-flight entry when the leader finishes or is dropped, so a
/// cancelled leader cannot leave waiters stranded behind a dead key.
struct FlightGuard<'a, T: Clone> {
    group: &'a Group<T>,
    key: String,
}

impl<T: Clone> Drop for FlightGuard<'_, T> {
    fn drop(&mut self) {
        self.group.inflight.lock().remove(&self.key);
    }
}
