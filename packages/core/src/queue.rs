//! Queue definitions, references and the in-memory queue implementation.

use std::collections::VecDeque;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

use crate::error::QueueError;

/// Shared handle to a live queue carrying JSON items.
///
/// This is the item type the scheduler and handlers exchange; typed queues
/// are still available through [`Queue<T>`] for direct use.
pub type QueueHandle = Arc<dyn Queue<serde_json::Value>>;

/// Identifies a queue without owning its backing storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDefinition {
    /// Unique queue name.
    pub name: String,
    /// Item kinds this queue is the destination for (e.g. `"error"`).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub item_types: Vec<String>,
    /// Optional description of what flows through the queue.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Maximum number of buffered items; `None` means unbounded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capacity: Option<usize>,
}

impl QueueDefinition {
    /// Create an unbounded queue definition.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            item_types: Vec::new(),
            description: None,
            capacity: None,
        }
    }

    /// Mark this queue as the destination for an item type.
    pub fn for_type(mut self, item_type: impl Into<String>) -> Self {
        self.item_types.push(item_type.into());
        self
    }

    /// Set the description for this queue.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Bound the queue to `capacity` items.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    /// Reference to this queue by name.
    pub fn reference(&self) -> QueueReference {
        QueueReference::named(&self.name)
    }

    /// Build the in-memory queue described by this definition.
    pub fn build<T: Send + 'static>(&self) -> InMemoryQueue<T> {
        match self.capacity {
            Some(capacity) => InMemoryQueue::bounded(capacity),
            None => InMemoryQueue::new(),
        }
    }
}

/// How a reference should be resolved once queues are live.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum QueueBinding {
    /// Resolve by queue name.
    Name(String),
    /// Resolve to the first queue registered for an item type.
    ItemType(String),
}

/// A key naming a queue before it is resolved to a live instance.
///
/// Two references are equal iff their identifiers are equal; the binding is
/// ignored so a dependency can be declared before the queue exists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueReference {
    pub identifier: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binding: Option<QueueBinding>,
}

impl QueueReference {
    /// Reference with no explicit binding; resolves by identifier.
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            binding: None,
        }
    }

    /// Reference bound to a queue name equal to the identifier.
    pub fn named(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            binding: Some(QueueBinding::Name(name.clone())),
            identifier: name,
        }
    }

    /// Reference resolved through the item-type index.
    pub fn for_type(identifier: impl Into<String>, item_type: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            binding: Some(QueueBinding::ItemType(item_type.into())),
        }
    }

    /// Name to look up when the binding is by name (or absent).
    pub fn lookup_name(&self) -> &str {
        match &self.binding {
            Some(QueueBinding::Name(name)) => name,
            _ => &self.identifier,
        }
    }
}

impl PartialEq for QueueReference {
    fn eq(&self, other: &Self) -> bool {
        self.identifier == other.identifier
    }
}

impl Eq for QueueReference {}

impl Hash for QueueReference {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.identifier.hash(state);
    }
}

impl From<&str> for QueueReference {
    fn from(identifier: &str) -> Self {
        Self::named(identifier)
    }
}

impl std::fmt::Display for QueueReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.identifier)
    }
}

/// Ordered, typed storage decoupling producers from consumers.
///
/// No operation blocks: `get` on an empty queue returns
/// [`QueueError::Empty`] and the caller decides when to poll again.
pub trait Queue<T>: Send + Sync {
    /// Append one item.
    fn put(&self, item: T) -> Result<(), QueueError>;

    /// Append items in order, returning how many were accepted.
    fn put_iter(&self, items: Vec<T>) -> usize;

    /// Remove and return the oldest item.
    fn get(&self) -> Result<T, QueueError>;

    /// Remove up to `count` oldest items.
    fn get_iter(&self, count: usize) -> Vec<T>;

    /// Current number of items. Advisory under concurrent access.
    fn size(&self) -> usize;

    /// Maximum number of items, if bounded.
    fn capacity(&self) -> Option<usize> {
        None
    }

    fn is_empty(&self) -> bool {
        self.size() == 0
    }
}

/// In-memory FIFO queue, optionally bounded.
#[derive(Debug)]
pub struct InMemoryQueue<T> {
    items: Mutex<VecDeque<T>>,
    capacity: Option<usize>,
}

impl<T> InMemoryQueue<T> {
    /// Create an unbounded queue.
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            capacity: None,
        }
    }

    /// Create a queue that rejects items beyond `capacity`.
    pub fn bounded(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: Some(capacity),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T> Default for InMemoryQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send> Queue<T> for InMemoryQueue<T> {
    fn put(&self, item: T) -> Result<(), QueueError> {
        let mut items = self.lock();
        if let Some(capacity) = self.capacity
            && items.len() >= capacity
        {
            return Err(QueueError::Full { capacity });
        }
        items.push_back(item);
        Ok(())
    }

    fn put_iter(&self, batch: Vec<T>) -> usize {
        let mut items = self.lock();
        let room = match self.capacity {
            Some(capacity) => capacity.saturating_sub(items.len()),
            None => usize::MAX,
        };
        let before = items.len();
        items.extend(batch.into_iter().take(room));
        items.len() - before
    }

    fn get(&self) -> Result<T, QueueError> {
        self.lock().pop_front().ok_or(QueueError::Empty)
    }

    fn get_iter(&self, count: usize) -> Vec<T> {
        let mut items = self.lock();
        let take = count.min(items.len());
        items.drain(..take).collect()
    }

    fn size(&self) -> usize {
        self.lock().len()
    }

    fn capacity(&self) -> Option<usize> {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::disallowed_methods)]

    use super::*;
    use std::collections::HashSet;
    use std::time::{Duration, Instant};

    #[test]
    fn put_then_get_is_fifo() {
        let queue = InMemoryQueue::new();
        for i in 0..100 {
            queue.put(i).unwrap();
        }
        let drained: Vec<i32> = (0..100).map(|_| queue.get().unwrap()).collect();
        assert_eq!(drained, (0..100).collect::<Vec<_>>());
        assert!(queue.is_empty());
    }

    #[test]
    fn get_on_empty_fails_fast() {
        let queue: InMemoryQueue<u8> = InMemoryQueue::new();
        let start = Instant::now();
        assert_eq!(queue.get(), Err(QueueError::Empty));
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn bounded_queue_rejects_overflow() {
        let queue = InMemoryQueue::bounded(2);
        queue.put("a").unwrap();
        queue.put("b").unwrap();
        assert_eq!(queue.put("c"), Err(QueueError::Full { capacity: 2 }));
        assert_eq!(queue.size(), 2);
        assert_eq!(queue.get().unwrap(), "a");
    }

    #[test]
    fn put_iter_accepts_prefix_when_bounded() {
        let queue = InMemoryQueue::bounded(3);
        queue.put(0).unwrap();
        assert_eq!(queue.put_iter(vec![1, 2, 3, 4]), 2);
        assert_eq!(queue.get_iter(10), vec![0, 1, 2]);

        let unbounded = InMemoryQueue::new();
        assert_eq!(unbounded.put_iter(vec![1, 2, 3]), 3);
    }

    #[test]
    fn get_iter_returns_what_is_available() {
        let queue = InMemoryQueue::new();
        queue.put_iter(vec![1, 2, 3]);
        assert_eq!(queue.get_iter(2), vec![1, 2]);
        assert_eq!(queue.get_iter(5), vec![3]);
        assert!(queue.get_iter(5).is_empty());
    }

    #[test]
    fn references_compare_by_identifier_only() {
        let by_name = QueueReference::named("q1");
        let unbound = QueueReference::new("q1");
        let by_type = QueueReference::for_type("q1", "error");
        assert_eq!(by_name, unbound);
        assert_eq!(by_name, by_type);

        let set: HashSet<QueueReference> = [by_name, unbound, by_type].into_iter().collect();
        assert_eq!(set.len(), 1);
        assert_ne!(QueueReference::new("q1"), QueueReference::new("q2"));
    }

    #[test]
    fn definition_builds_bounded_queue() {
        let definition = QueueDefinition::new("small").with_capacity(1).for_type("error");
        let queue: InMemoryQueue<u8> = definition.build();
        assert_eq!(queue.capacity(), Some(1));
        assert_eq!(definition.reference().lookup_name(), "small");
        assert_eq!(definition.item_types, vec!["error".to_string()]);
    }
}
