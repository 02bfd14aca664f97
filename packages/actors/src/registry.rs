//! Registry for discovering live queues by name or item type.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use relay_core::{Queue, QueueBinding, QueueDefinition, QueueHandle, QueueReference, QueueResolver};
use serde_json::Value;

#[derive(Default)]
struct RegistryInner {
    queues: HashMap<String, (QueueDefinition, QueueHandle)>,
    /// item type -> queue names, in creation order
    by_type: HashMap<String, Vec<String>>,
}

/// Name-addressed set of live queues.
///
/// One registry is owned by each [`SchedulerContext`](crate::SchedulerContext)
/// and shared with jobs, handlers and the built-in APIs.
#[derive(Default)]
pub struct QueueRegistry {
    inner: RwLock<RegistryInner>,
}

impl QueueRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, RegistryInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a live queue under its definition's name.
    ///
    /// Returns false (and keeps the existing queue) if the name is taken.
    pub fn register_queue(&self, definition: QueueDefinition, queue: QueueHandle) -> bool {
        let mut inner = self.write();
        if inner.queues.contains_key(&definition.name) {
            return false;
        }
        for item_type in &definition.item_types {
            inner
                .by_type
                .entry(item_type.clone())
                .or_default()
                .push(definition.name.clone());
        }
        inner
            .queues
            .insert(definition.name.clone(), (definition, queue));
        true
    }

    /// Build and register the in-memory queue for `definition`.
    ///
    /// Returns the queue and whether it was newly created. An existing queue
    /// with the same name is returned unchanged.
    pub fn create_queue(&self, definition: QueueDefinition) -> (QueueHandle, bool) {
        if let Some(existing) = self.get_queue(&definition.name) {
            return (existing, false);
        }
        let queue: QueueHandle = Arc::new(definition.build::<Value>());
        if self.register_queue(definition.clone(), queue.clone()) {
            tracing::debug!("Created queue: {}", definition.name);
            (queue, true)
        } else {
            // Lost a race with a concurrent creation.
            (self.get_queue(&definition.name).unwrap_or(queue), false)
        }
    }

    /// Create a queue for every reference that does not resolve yet.
    ///
    /// Type-bound references get a queue registered for their item type.
    /// Returns how many queues were created.
    pub fn create_referenced<'a>(
        &self,
        references: impl IntoIterator<Item = &'a QueueReference>,
    ) -> usize {
        let mut created = 0;
        for reference in references {
            let definition = match &reference.binding {
                Some(QueueBinding::ItemType(item_type)) => {
                    if !self.names_by_type(item_type).is_empty() {
                        continue;
                    }
                    QueueDefinition::new(&reference.identifier).for_type(item_type)
                }
                _ => QueueDefinition::new(reference.lookup_name()),
            };
            if self.create_queue(definition).1 {
                tracing::debug!("Created queue for reference {}", reference);
                created += 1;
            }
        }
        created
    }

    /// Unregister a queue.
    pub fn remove_queue(&self, name: &str) -> Option<QueueHandle> {
        let mut inner = self.write();
        let (definition, queue) = inner.queues.remove(name)?;
        for item_type in &definition.item_types {
            if let Some(names) = inner.by_type.get_mut(item_type) {
                names.retain(|n| n != name);
            }
        }
        Some(queue)
    }

    /// Get a queue by name.
    pub fn get_queue(&self, name: &str) -> Option<QueueHandle> {
        self.read().queues.get(name).map(|(_, q)| q.clone())
    }

    pub fn definition(&self, name: &str) -> Option<QueueDefinition> {
        self.read().queues.get(name).map(|(d, _)| d.clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.read().queues.contains_key(name)
    }

    /// Names of queues registered for `item_type`, in creation order.
    pub fn names_by_type(&self, item_type: &str) -> Vec<String> {
        self.read()
            .by_type
            .get(item_type)
            .cloned()
            .unwrap_or_default()
    }

    /// Queues registered for `item_type`, in creation order.
    pub fn queues_by_type(&self, item_type: &str) -> Vec<QueueHandle> {
        let inner = self.read();
        inner
            .by_type
            .get(item_type)
            .into_iter()
            .flatten()
            .filter_map(|name| inner.queues.get(name).map(|(_, q)| q.clone()))
            .collect()
    }

    /// List all registered queue names, sorted.
    pub fn list_queues(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read().queues.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.read().queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().queues.is_empty()
    }
}

impl QueueResolver<Value> for QueueRegistry {
    fn resolve(&self, reference: &QueueReference) -> Option<Arc<dyn Queue<Value>>> {
        match &reference.binding {
            Some(QueueBinding::ItemType(item_type)) => {
                self.queues_by_type(item_type).into_iter().next()
            }
            _ => self.get_queue(reference.lookup_name()),
        }
    }
}

impl std::fmt::Debug for QueueRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueRegistry")
            .field("queues", &self.list_queues())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::disallowed_methods)]

    use super::*;
    use serde_json::json;

    #[test]
    fn create_queue_is_idempotent_by_name() {
        let registry = QueueRegistry::new();
        let (first, created) = registry.create_queue(QueueDefinition::new("q1"));
        assert!(created);
        first.put(json!(1)).unwrap();

        let (again, created) = registry.create_queue(QueueDefinition::new("q1").with_capacity(1));
        assert!(!created);
        assert_eq!(again.size(), 1);
        assert_eq!(registry.list_queues(), vec!["q1".to_string()]);
    }

    #[test]
    fn resolves_by_name_and_type() {
        let registry = QueueRegistry::new();
        registry.create_queue(QueueDefinition::new("errors").for_type("error"));
        registry.create_queue(QueueDefinition::new("more_errors").for_type("error"));
        registry.create_queue(QueueDefinition::new("plain"));

        assert!(registry.resolve(&QueueReference::named("plain")).is_some());
        assert!(registry.resolve(&QueueReference::new("plain")).is_some());
        assert!(registry.resolve(&QueueReference::named("missing")).is_none());

        let by_type = registry
            .resolve(&QueueReference::for_type("err", "error"))
            .unwrap();
        by_type.put(json!("x")).unwrap();
        assert_eq!(registry.get_queue("errors").unwrap().size(), 1);
        assert_eq!(registry.names_by_type("error"), vec!["errors", "more_errors"]);
        assert_eq!(registry.queues_by_type("error").len(), 2);
    }

    #[test]
    fn referenced_queues_are_created_once() {
        let registry = QueueRegistry::new();
        registry.create_queue(QueueDefinition::new("errors").for_type("error"));
        let references = [
            QueueReference::named("in"),
            QueueReference::new("in"),
            QueueReference::for_type("err", "error"),
            QueueReference::for_type("alerts", "alert"),
        ];

        assert_eq!(registry.create_referenced(&references), 2);
        assert_eq!(registry.list_queues(), vec!["alerts", "errors", "in"]);
        assert_eq!(registry.names_by_type("alert"), vec!["alerts"]);
        assert_eq!(registry.create_referenced(&references), 0);
    }

    #[test]
    fn remove_queue_updates_type_index() {
        let registry = QueueRegistry::new();
        registry.create_queue(QueueDefinition::new("errors").for_type("error"));
        assert!(registry.remove_queue("errors").is_some());
        assert!(registry.queues_by_type("error").is_empty());
        assert!(registry.is_empty());
    }
}
