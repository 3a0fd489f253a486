//! In-process streaming bus.
//!
//! Resource state changes are published here after they are persisted;
//! long-lived watch clients consume them through filtered subscriptions.
//! Publishing never blocks: a subscriber that cannot keep up loses the
//! event and the drop is counted against its subscription.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::warn;

use kestrel_types::{Alert, Node, VirtualMachine};

/// Channel capacity for single-resource watches.
const SINGLE_CAPACITY: usize = 100;
/// Channel capacity for list watches, which see every event of a type.
const LIST_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ResourceType {
    Vm,
    Node,
    Alert,
    Drs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EventType {
    Created,
    Updated,
    Deleted,
    Started,
    Stopped,
}

/// Entity snapshot carried by an event.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum EventPayload {
    Vm(Box<VirtualMachine>),
    Node(Box<Node>),
    Alert(Box<Alert>),
    None,
}

/// One resource change.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub resource_type: ResourceType,
    pub event_type: EventType,
    pub resource_id: String,
    pub project_id: Option<String>,
    pub payload: EventPayload,
    /// Assigned at publish.
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn vm(event_type: EventType, vm: &VirtualMachine) -> Self {
        Self {
            resource_type: ResourceType::Vm,
            event_type,
            resource_id: vm.id.clone(),
            project_id: Some(vm.project_id.clone()),
            payload: EventPayload::Vm(Box::new(vm.clone())),
            timestamp: Utc::now(),
        }
    }

    pub fn vm_deleted(id: &str, project_id: &str) -> Self {
        Self {
            resource_type: ResourceType::Vm,
            event_type: EventType::Deleted,
            resource_id: id.to_string(),
            project_id: Some(project_id.to_string()),
            payload: EventPayload::None,
            timestamp: Utc::now(),
        }
    }

    pub fn node(event_type: EventType, node: &Node) -> Self {
        Self {
            resource_type: ResourceType::Node,
            event_type,
            resource_id: node.id.clone(),
            project_id: None,
            payload: EventPayload::Node(Box::new(node.clone())),
            timestamp: Utc::now(),
        }
    }

    pub fn alert(alert: &Alert) -> Self {
        Self {
            resource_type: ResourceType::Alert,
            event_type: EventType::Created,
            resource_id: alert.id.clone(),
            project_id: None,
            payload: EventPayload::Alert(Box::new(alert.clone())),
            timestamp: Utc::now(),
        }
    }
}

/// Subscription filter; unset fields impose no predicate.
#[derive(Debug, Clone)]
pub struct EventFilter {
    pub resource_type: ResourceType,
    pub resource_id: Option<String>,
    /// Empty means all event types.
    pub event_types: Vec<EventType>,
    pub project_id: Option<String>,
}

impl EventFilter {
    pub fn all(resource_type: ResourceType) -> Self {
        Self {
            resource_type,
            resource_id: None,
            event_types: Vec::new(),
            project_id: None,
        }
    }

    pub fn one(resource_type: ResourceType, resource_id: &str) -> Self {
        Self {
            resource_type,
            resource_id: Some(resource_id.to_string()),
            event_types: Vec::new(),
            project_id: None,
        }
    }

    fn matches(&self, event: &Event) -> bool {
        if event.resource_type != self.resource_type {
            return false;
        }
        if let Some(id) = &self.resource_id {
            if &event.resource_id != id {
                return false;
            }
        }
        if !self.event_types.is_empty() && !self.event_types.contains(&event.event_type) {
            return false;
        }
        if let Some(project) = &self.project_id {
            if event.project_id.as_deref() != Some(project.as_str()) {
                return false;
            }
        }
        true
    }
}

struct SubEntry {
    filter: EventFilter,
    tx: mpsc::Sender<Event>,
    dropped: Arc<AtomicU64>,
}

#[derive(Default)]
struct BusInner {
    subs: HashMap<u64, SubEntry>,
    next_id: u64,
}

/// The bus. Cheap to clone via `Arc`.
#[derive(Default)]
pub struct EventBus {
    inner: Mutex<BusInner>,
}

/// A live subscription. Dropping it unsubscribes and closes the channel.
pub struct Subscription {
    pub rx: mpsc::Receiver<Event>,
    id: u64,
    dropped: Arc<AtomicU64>,
    bus: Arc<EventBus>,
}

impl Subscription {
    /// Events lost to a full channel on this subscription.
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    /// Explicit unsubscribe; equivalent to dropping the subscription.
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let mut inner = lock_recover(&self.bus.inner);
        inner.subs.remove(&self.id);
    }
}

impl EventBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers a subscription; single-resource watches get the smaller
    /// channel.
    pub fn subscribe(self: &Arc<Self>, filter: EventFilter) -> Subscription {
        let capacity = if filter.resource_id.is_some() {
            SINGLE_CAPACITY
        } else {
            LIST_CAPACITY
        };
        let (tx, rx) = mpsc::channel(capacity);
        let dropped = Arc::new(AtomicU64::new(0));

        let mut inner = lock_recover(&self.inner);
        inner.next_id += 1;
        let id = inner.next_id;
        inner.subs.insert(
            id,
            SubEntry {
                filter,
                tx,
                dropped: Arc::clone(&dropped),
            },
        );
        Subscription {
            rx,
            id,
            dropped,
            bus: Arc::clone(self),
        }
    }

    /// Delivers `event` to every matching subscription without blocking.
    /// Full channels drop the event for that subscriber; closed channels
    /// are pruned.
    pub fn publish(&self, mut event: Event) {
        event.timestamp = Utc::now();
        let mut inner = lock_recover(&self.inner);
        inner.subs.retain(|id, entry| {
            if !entry.filter.matches(&event) {
                return true;
            }
            match entry.tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    entry.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        subscription = *id,
                        resource = %event.resource_id,
                        "dropping event for slow watch subscriber"
                    );
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }

    pub fn subscriber_count(&self) -> usize {
        lock_recover(&self.inner).subs.len()
    }
}

fn lock_recover<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use kestrel_types::{VmSpec, VmStatus};
    use std::collections::HashMap as StdHashMap;

    fn make_vm(id: &str, project: &str) -> VirtualMachine {
        VirtualMachine {
            id: id.to_string(),
            project_id: project.to_string(),
            name: id.to_string(),
            description: None,
            labels: StdHashMap::new(),
            hardware_version: 1,
            spec: VmSpec::default(),
            status: VmStatus::default(),
            created_by: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_subscription_receives_matching_events() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe(EventFilter::all(ResourceType::Vm));

        bus.publish(Event::vm(EventType::Created, &make_vm("vm-1", "p1")));
        let event = sub.recv().await.unwrap();
        assert_eq!(event.resource_id, "vm-1");
        assert_eq!(event.event_type, EventType::Created);
    }

    #[tokio::test]
    async fn test_filters_by_resource_id_and_project() {
        let bus = EventBus::new();
        let mut by_id = bus.subscribe(EventFilter::one(ResourceType::Vm, "vm-2"));
        let mut by_project = bus.subscribe(EventFilter {
            resource_type: ResourceType::Vm,
            resource_id: None,
            event_types: Vec::new(),
            project_id: Some("p2".to_string()),
        });

        bus.publish(Event::vm(EventType::Created, &make_vm("vm-1", "p1")));
        bus.publish(Event::vm(EventType::Created, &make_vm("vm-2", "p2")));

        assert_eq!(by_id.recv().await.unwrap().resource_id, "vm-2");
        assert_eq!(by_project.recv().await.unwrap().resource_id, "vm-2");
        assert!(by_id.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_filters_by_event_type() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe(EventFilter {
            resource_type: ResourceType::Vm,
            resource_id: None,
            event_types: vec![EventType::Started],
            project_id: None,
        });

        let vm = make_vm("vm-1", "p1");
        bus.publish(Event::vm(EventType::Updated, &vm));
        bus.publish(Event::vm(EventType::Started, &vm));

        let event = sub.recv().await.unwrap();
        assert_eq!(event.event_type, EventType::Started);
    }

    #[tokio::test]
    async fn test_slow_subscriber_drops_without_blocking_publisher() {
        let bus = EventBus::new();
        let sub = bus.subscribe(EventFilter::one(ResourceType::Vm, "vm-1"));

        let vm = make_vm("vm-1", "p1");
        // One more than the channel holds; publish must never block.
        for _ in 0..=SINGLE_CAPACITY {
            bus.publish(Event::vm(EventType::Updated, &vm));
        }
        assert_eq!(sub.dropped_events(), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_on_drop() {
        let bus = EventBus::new();
        let sub = bus.subscribe(EventFilter::all(ResourceType::Node));
        assert_eq!(bus.subscriber_count(), 1);
        drop(sub);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_per_subscription_order_preserved() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe(EventFilter::all(ResourceType::Vm));

        for i in 0..10 {
            bus.publish(Event::vm(EventType::Updated, &make_vm(&format!("vm-{}", i), "p1")));
        }
        for i in 0..10 {
            let event = sub.recv().await.unwrap();
            assert_eq!(event.resource_id, format!("vm-{}", i));
        }
    }
}
