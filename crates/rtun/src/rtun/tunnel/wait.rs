use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::oneshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WaitError {
    #[error("timed out waiting for response")]
    Timeout,
    #[error("wait canceled")]
    Canceled,
}

struct Slot<T> {
    id: u64,
    tx: oneshot::Sender<T>,
}

/// Keyed one-shot rendezvous between a waiting caller and a producer.
///
/// At most one waiter exists per key; registering again replaces (and
/// cancels) the previous one. `done` on a key nobody waits for is dropped.
pub struct WaitRegistry<T> {
    slots: DashMap<String, Slot<T>>,
    next_id: AtomicU64,
}

impl<T> Default for WaitRegistry<T> {
    fn default() -> Self {
        Self {
            slots: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }
}

impl<T> WaitRegistry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a waiter before the request goes out, so a response that
    /// arrives before the caller starts waiting is not lost.
    pub fn register(&self, key: impl Into<String>) -> Waiter<'_, T> {
        let key = key.into();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.slots.insert(key.clone(), Slot { id, tx });
        Waiter {
            registry: self,
            key,
            id,
            rx: Some(rx),
        }
    }

    pub async fn wait(&self, key: impl Into<String>, timeout: Duration) -> Result<T, WaitError> {
        self.register(key).wait(timeout).await
    }

    /// Resolves the pending waiter for `key`. Returns false if there was none.
    pub fn done(&self, key: &str, value: T) -> bool {
        match self.slots.remove(key) {
            Some((_, slot)) => slot.tx.send(value).is_ok(),
            None => false,
        }
    }

    /// Drops every pending waiter; they observe `WaitError::Canceled`.
    pub fn cancel_all(&self) {
        self.slots.clear();
    }

    pub fn pending(&self) -> usize {
        self.slots.len()
    }

    fn forget(&self, key: &str, id: u64) {
        self.slots.remove_if(key, |_, slot| slot.id == id);
    }
}

pub struct Waiter<'a, T> {
    registry: &'a WaitRegistry<T>,
    key: String,
    id: u64,
    rx: Option<oneshot::Receiver<T>>,
}

impl<T> Waiter<'_, T> {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub async fn wait(mut self, timeout: Duration) -> Result<T, WaitError> {
        let Some(rx) = self.rx.take() else {
            return Err(WaitError::Canceled);
        };
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(_)) => Err(WaitError::Canceled),
            Err(_) => Err(WaitError::Timeout),
        }
    }
}

impl<T> Drop for Waiter<'_, T> {
    fn drop(&mut self) {
        self.registry.forget(&self.key, self.id);
    }
}
