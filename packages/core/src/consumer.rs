//! Read-only consumer bound to a single queue reference.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use crate::error::QueueError;
use crate::queue::{Queue, QueueReference};

/// Turns queue references into live queues.
pub trait QueueResolver<T> {
    fn resolve(&self, reference: &QueueReference) -> Option<Arc<dyn Queue<T>>>;
}

impl<T> QueueResolver<T> for HashMap<QueueReference, Arc<dyn Queue<T>>> {
    fn resolve(&self, reference: &QueueReference) -> Option<Arc<dyn Queue<T>>> {
        self.get(reference).cloned()
    }
}

/// Lazily-resolved façade over one queue.
///
/// Resolution happens once on the first `evaluate_queues` call and is
/// cached; later calls are no-ops.
pub struct Consumer<T> {
    reference: QueueReference,
    queue: OnceLock<Arc<dyn Queue<T>>>,
}

impl<T> Consumer<T> {
    pub fn new(reference: impl Into<QueueReference>) -> Self {
        Self {
            reference: reference.into(),
            queue: OnceLock::new(),
        }
    }

    pub fn reference(&self) -> &QueueReference {
        &self.reference
    }

    pub fn is_resolved(&self) -> bool {
        self.queue.get().is_some()
    }

    /// Resolve the bound reference against `resolver`.
    pub fn evaluate_queues(&self, resolver: &dyn QueueResolver<T>) -> Result<(), QueueError> {
        if self.is_resolved() {
            return Ok(());
        }
        let queue = resolver
            .resolve(&self.reference)
            .ok_or_else(|| QueueError::NotResolved(self.reference.identifier.clone()))?;
        // A concurrent resolution may have won; either queue is the same binding.
        let _ = self.queue.set(queue);
        Ok(())
    }

    /// Iterate over whatever the queue holds, calling `get` on each step.
    ///
    /// The iterator ends at the first empty `get`. It is not a subscription:
    /// items put after it ends need a new `drain` call.
    pub fn drain(&self) -> Result<Drain<'_, T>, QueueError> {
        let queue = self
            .queue
            .get()
            .ok_or_else(|| QueueError::NotResolved(self.reference.identifier.clone()))?;
        Ok(Drain {
            queue: queue.as_ref(),
            done: false,
        })
    }
}

/// Finite iterator over the items available in a queue.
pub struct Drain<'a, T> {
    queue: &'a dyn Queue<T>,
    done: bool,
}

impl<T> Iterator for Drain<'_, T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        if self.done {
            return None;
        }
        match self.queue.get() {
            Ok(item) => Some(item),
            Err(_) => {
                self.done = true;
                None
            }
        }
    }
}
