// Event Registry Module
//
// INTENTION:
// Per-service table of publishable events: name -> (schema, signal). Local subscribers
// attach slots to a signal; remote (RPC) subscribers are tracked as opaque subscription
// ids so that a server connection can tag notifications with the ids they answer.
// Emitting calls the slots on the caller's thread; the ServiceBase decides whether that
// thread is the caller's own or a task of the "event" group.

use dashmap::DashMap;
use keel_common::logging::{Component, Logger};
use keel_common::types::{EventItemMap, EventSchema};
use keel_common::{log_debug, log_warn, ServiceError};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use uuid::Uuid;

use super::function_registry::panic_message;

/// Slot invoked for each emission: (event name, items)
pub type EventSlot = Arc<dyn Fn(&str, &EventItemMap) + Send + Sync>;

#[derive(Default)]
struct Signal {
    slots: Mutex<Vec<(u64, EventSlot)>>,
}

impl Signal {
    fn snapshot(&self) -> Vec<EventSlot> {
        self.slots.lock().iter().map(|(_, slot)| slot.clone()).collect()
    }
}

/// Handle to a local subscription.
///
/// Dropping the handle keeps the slot connected; call `disconnect` to detach it.
pub struct EventSubscription {
    id: u64,
    event_name: String,
    signal: Weak<Signal>,
}

impl EventSubscription {
    pub fn event_name(&self) -> &str {
        &self.event_name
    }

    pub fn is_connected(&self) -> bool {
        self.signal
            .upgrade()
            .map(|signal| signal.slots.lock().iter().any(|(id, _)| *id == self.id))
            .unwrap_or(false)
    }

    pub fn disconnect(&self) {
        if let Some(signal) = self.signal.upgrade() {
            signal.slots.lock().retain(|(id, _)| *id != self.id);
        }
    }
}

impl std::fmt::Debug for EventSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSubscription")
            .field("id", &self.id)
            .field("event_name", &self.event_name)
            .field("connected", &self.is_connected())
            .finish()
    }
}

struct EventEntry {
    schema: EventSchema,
    signal: Arc<Signal>,
}

/// Name -> (schema, signal) table of one service
pub struct EventRegistry {
    logger: Arc<Logger>,
    events: DashMap<String, EventEntry>,
    rpc_subscriptions: Mutex<HashMap<String, HashSet<String>>>,
    next_slot_id: AtomicU64,
}

impl EventRegistry {
    pub fn new(logger: &Logger) -> Self {
        Self {
            logger: Arc::new(logger.with_component(Component::Registry)),
            events: DashMap::new(),
            rpc_subscriptions: Mutex::new(HashMap::new()),
            next_slot_id: AtomicU64::new(1),
        }
    }

    /// Register an event. Fails on a duplicate name.
    pub fn add(&self, schema: EventSchema) -> bool {
        if self.events.contains_key(&schema.name) {
            log_warn!(self.logger, "Event `{}` already registered", schema.name);
            return false;
        }
        log_debug!(self.logger, "Registered event `{}`", schema.name);
        self.events.insert(
            schema.name.clone(),
            EventEntry {
                schema,
                signal: Arc::new(Signal::default()),
            },
        );
        true
    }

    /// Remove an event together with its local slots and remote subscriptions
    pub fn remove(&self, name: &str) -> bool {
        self.rpc_subscriptions.lock().remove(name);
        self.events.remove(name).is_some()
    }

    pub fn clear(&self) {
        self.rpc_subscriptions.lock().clear();
        self.events.clear();
    }

    pub fn contains(&self, name: &str) -> bool {
        self.events.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn schema(&self, name: &str) -> Option<EventSchema> {
        self.events.get(name).map(|entry| entry.schema.clone())
    }

    /// All schemas, sorted by name
    pub fn schemas(&self) -> Vec<EventSchema> {
        let mut schemas: Vec<EventSchema> =
            self.events.iter().map(|entry| entry.schema.clone()).collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    /// Check `items` against `schema`. Undeclared items only produce a warning.
    pub fn validate_items(&self, schema: &EventSchema, items: &EventItemMap) -> Result<(), ServiceError> {
        if !schema.items.is_empty() && items.is_empty() {
            return Err(ServiceError::Validation(format!(
                "Event `{}` requires items, but none were given",
                schema.name
            )));
        }

        for item in &schema.items {
            let Some(value) = items.get(&item.name) else {
                return Err(ServiceError::Validation(format!(
                    "Missing event item: `{}`",
                    item.name
                )));
            };
            if value.value_type() != item.value_type {
                return Err(ServiceError::Validation(format!(
                    "Invalid type for event item `{}`: expected `{}`, but got `{}`",
                    item.name,
                    item.value_type,
                    value.value_type()
                )));
            }
        }

        for name in items.keys() {
            if schema.item(name).is_none() {
                log_warn!(self.logger, "Event `{}` got undeclared item `{}`", schema.name, name);
            }
        }

        Ok(())
    }

    /// Attach a local slot to an event
    pub fn subscribe(&self, name: &str, slot: EventSlot) -> Result<EventSubscription, ServiceError> {
        let Some(entry) = self.events.get(name) else {
            return Err(ServiceError::UnknownEvent(name.to_string()));
        };
        let id = self.next_slot_id.fetch_add(1, Ordering::Relaxed);
        entry.signal.slots.lock().push((id, slot));
        Ok(EventSubscription {
            id,
            event_name: name.to_string(),
            signal: Arc::downgrade(&entry.signal),
        })
    }

    /// Number of local slots attached to an event
    pub fn slot_count(&self, name: &str) -> usize {
        self.events
            .get(name)
            .map(|entry| entry.signal.slots.lock().len())
            .unwrap_or(0)
    }

    /// Call every local slot of an event on the calling thread
    pub fn emit(&self, name: &str, items: &EventItemMap) -> bool {
        let Some(signal) = self.events.get(name).map(|entry| entry.signal.clone()) else {
            log_warn!(self.logger, "Cannot emit unknown event `{}`", name);
            return false;
        };

        for slot in signal.snapshot() {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| slot(name, items))) {
                log_warn!(
                    self.logger,
                    "Slot of event `{}` panicked: {}",
                    name,
                    panic_message(panic.as_ref())
                );
            }
        }
        true
    }

    /// Record a remote subscription and return its id
    pub fn on_rpc_subscribe(&self, name: &str) -> Result<String, ServiceError> {
        if !self.contains(name) {
            return Err(ServiceError::UnknownEvent(name.to_string()));
        }
        let subscription_id = Uuid::new_v4().to_string();
        self.rpc_subscriptions
            .lock()
            .entry(name.to_string())
            .or_default()
            .insert(subscription_id.clone());
        Ok(subscription_id)
    }

    /// Forget remote subscriptions by id, whatever event they belong to
    pub fn on_rpc_unsubscribe(&self, subscription_ids: &HashSet<String>) {
        let mut subscriptions = self.rpc_subscriptions.lock();
        for ids in subscriptions.values_mut() {
            ids.retain(|id| !subscription_ids.contains(id));
        }
        subscriptions.retain(|_, ids| !ids.is_empty());
    }

    /// Remote subscription ids of one event
    pub fn rpc_subscriptions(&self, name: &str) -> HashSet<String> {
        self.rpc_subscriptions
            .lock()
            .get(name)
            .cloned()
            .unwrap_or_default()
    }
}
