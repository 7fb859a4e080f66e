//! Bounded collection of launched slot actions.

use std::future::Future;

use tokio::task::{JoinError, JoinHandle};
use tracing::debug;

use crate::models::{ContendError, Result};

/// Slot actions launched but not yet gathered, owned by one session.
///
/// Dropping the collection aborts every task still in it, which in turn
/// kills any workload those tasks own.
#[derive(Debug)]
pub struct InFlight<T> {
    tasks: Vec<(usize, JoinHandle<T>)>,
    capacity: usize,
}

impl<T: Send + 'static> InFlight<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            tasks: Vec::new(),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Fail unless `count` more actions fit.
    pub fn ensure_room(&self, count: usize) -> Result<()> {
        if self.tasks.len().saturating_add(count) > self.capacity {
            return Err(ContendError::CapacityExceeded {
                capacity: self.capacity,
            });
        }
        Ok(())
    }

    /// Start the action for `slot` in the background.
    pub fn launch<F>(&mut self, slot: usize, action: F) -> Result<()>
    where
        F: Future<Output = T> + Send + 'static,
    {
        self.ensure_room(1)?;
        self.tasks.push((slot, tokio::spawn(action)));
        Ok(())
    }

    /// Join every launched action, in slot order.
    pub async fn gather(mut self) -> Vec<(usize, std::result::Result<T, JoinError>)> {
        let mut tasks = std::mem::take(&mut self.tasks);
        tasks.sort_by_key(|(slot, _)| *slot);
        debug!(tasks = tasks.len(), "Gathering slot actions");

        let mut results = Vec::with_capacity(tasks.len());
        for (slot, handle) in tasks {
            results.push((slot, handle.await));
        }
        results
    }
}

impl<T> Drop for InFlight<T> {
    fn drop(&mut self) {
        for (_, handle) in &self.tasks {
            handle.abort();
        }
    }
}
