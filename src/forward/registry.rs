//! Append-only registries of closable handles, drained exactly once.

use crate::error::Result;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;

/// A handle the registry can close. Closing consumes the handle.
#[async_trait]
pub trait Closable: Send + 'static {
    async fn close(self) -> Result<()>;
}

/// Identifies one registry entry so its owner can take it back out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryId(u64);

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

struct Entries<T> {
    next_id: u64,
    items: Vec<(EntryId, T)>,
    sealed: bool,
}

/// Outcome of closing one entry during [`Registry::drain`].
#[derive(Debug)]
pub struct DrainOutcome {
    pub index: usize,
    pub total: usize,
    pub result: Result<()>,
}

/// A mutex-guarded list of handles owned by one tunnel.
///
/// Once drained the registry is sealed: later registrations are closed on
/// the spot, so a handle can never outlive the drain.
pub struct Registry<T> {
    inner: Arc<Mutex<Entries<T>>>,
}

impl<T> Clone for Registry<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Entries {
                next_id: 0,
                items: Vec::new(),
                sealed: false,
            })),
        }
    }
}

impl<T: Closable> Registry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `item`, or close it immediately if the registry was drained.
    ///
    /// Returns `None` in the latter case.
    pub async fn register(&self, item: T) -> Option<EntryId> {
        let mut entries = self.inner.lock().await;
        if entries.sealed {
            drop(entries);
            if let Err(e) = item.close().await {
                tracing::debug!("late registration close failed: {}", e);
            }
            return None;
        }
        let id = EntryId(entries.next_id);
        entries.next_id += 1;
        entries.items.push((id, item));
        Some(id)
    }

    /// Take an entry back out without closing it.
    pub async fn remove(&self, id: EntryId) -> Option<T> {
        let mut entries = self.inner.lock().await;
        let pos = entries.items.iter().position(|(entry, _)| *entry == id)?;
        Some(entries.items.remove(pos).1)
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.items.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Seal the registry and close every entry in registration order.
    ///
    /// Individual close failures are reported, never short-circuit. A second
    /// drain finds nothing left to close.
    pub async fn drain(&self) -> Vec<DrainOutcome> {
        let items = {
            let mut entries = self.inner.lock().await;
            entries.sealed = true;
            std::mem::take(&mut entries.items)
        };

        let total = items.len();
        let mut outcomes = Vec::with_capacity(total);
        for (index, (_, item)) in items.into_iter().enumerate() {
            outcomes.push(DrainOutcome {
                index: index + 1,
                total,
                result: item.close().await,
            });
        }
        outcomes
    }
}
