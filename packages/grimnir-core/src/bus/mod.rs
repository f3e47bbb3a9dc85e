//! In-process typed event bus.
//!
//! Producers publish [`BusEvent`]s; consumers subscribe per [`EventType`]
//! and receive over a bounded queue. Delivery is fire-and-forget: a full
//! subscriber queue drops the event for that subscriber only, and the drop
//! is counted so operators can see sustained backpressure. A panicking
//! consumer can never affect a publisher because delivery is channel-based.
//!
//! The optional cross-node variant lives in [`remote`].

pub mod remote;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::protocol_constants::{BUS_HOT_QUEUE_CAPACITY, BUS_QUEUE_CAPACITY};

/// Discriminant for event subscription and routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    PriorityChange,
    PriorityEmergency,
    PriorityOverride,
    PriorityReleased,
    DjConnect,
    DjDisconnect,
    WebstreamFailover,
    WebstreamRecovered,
    ShowStart,
    ShowEnd,
    ListenerStats,
    ExecutorTransition,
    Audit,
}

impl EventType {
    /// Every topic, for subscribers that mirror the whole bus.
    pub const ALL: [EventType; 13] = [
        EventType::PriorityChange,
        EventType::PriorityEmergency,
        EventType::PriorityOverride,
        EventType::PriorityReleased,
        EventType::DjConnect,
        EventType::DjDisconnect,
        EventType::WebstreamFailover,
        EventType::WebstreamRecovered,
        EventType::ShowStart,
        EventType::ShowEnd,
        EventType::ListenerStats,
        EventType::ExecutorTransition,
        EventType::Audit,
    ];

    /// Dotted wire name used on the remote bus and in logs.
    #[must_use]
    pub fn wire_name(&self) -> &'static str {
        match self {
            Self::PriorityChange => "priority.change",
            Self::PriorityEmergency => "priority.emergency",
            Self::PriorityOverride => "priority.override",
            Self::PriorityReleased => "priority.released",
            Self::DjConnect => "dj.connect",
            Self::DjDisconnect => "dj.disconnect",
            Self::WebstreamFailover => "webstream.failover",
            Self::WebstreamRecovered => "webstream.recovered",
            Self::ShowStart => "show.start",
            Self::ShowEnd => "show.end",
            Self::ListenerStats => "listener.stats",
            Self::ExecutorTransition => "executor.transition",
            Self::Audit => "audit",
        }
    }

    /// Topics with enough traffic to warrant the larger subscriber queue.
    fn is_hot(self) -> bool {
        matches!(self, Self::PriorityChange | Self::ListenerStats)
    }
}

/// Direction of a listener count change in [`BusEvent::ListenerStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListenerChange {
    Connect,
    Disconnect,
}

/// Events carried across the core subsystems.
///
/// Payloads are typed per event; the string-keyed map the legacy consumers
/// expect is produced only at the remote-bus boundary via
/// [`BusEvent::payload`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusEvent {
    /// The arbiter selected a new current source for a station.
    PriorityChange {
        station_id: String,
        previous_source: Option<String>,
        source_id: String,
        source_type: String,
        priority: u8,
    },
    /// An emergency source took the station.
    PriorityEmergency {
        station_id: String,
        source_id: String,
    },
    /// A live source preempted automation.
    PriorityOverride {
        station_id: String,
        source_id: String,
        priority: u8,
    },
    /// A source released its claim.
    PriorityReleased {
        station_id: String,
        source_id: String,
        priority: u8,
    },
    /// A DJ connected through the harbor.
    DjConnect {
        station_id: String,
        mount_id: String,
        session_id: String,
        username: String,
    },
    /// A DJ disconnected (or timed out).
    DjDisconnect {
        station_id: String,
        session_id: String,
        username: String,
    },
    /// A webstream advanced down its URL chain.
    WebstreamFailover {
        webstream_id: String,
        station_id: String,
        from_url: String,
        to_url: String,
        manual: bool,
    },
    /// A webstream returned to its primary URL.
    WebstreamRecovered {
        webstream_id: String,
        station_id: String,
        url: String,
    },
    /// A scheduled show began.
    ShowStart {
        station_id: String,
        show_id: String,
        name: String,
    },
    /// A scheduled show ended.
    ShowEnd {
        station_id: String,
        show_id: String,
        name: String,
    },
    /// A listener attached to or detached from a mount.
    ListenerStats {
        change: ListenerChange,
        mount: String,
        bitrate: u32,
        listeners: usize,
        content_type: String,
    },
    /// An executor moved between states.
    ExecutorTransition {
        station_id: String,
        from: String,
        to: String,
        source_id: Option<String>,
    },
    /// Operator-visible audit trail entry (emergency takeovers etc.).
    Audit {
        station_id: Option<String>,
        action: String,
        detail: String,
    },
}

impl BusEvent {
    /// The subscription topic this event belongs to.
    #[must_use]
    pub fn event_type(&self) -> EventType {
        match self {
            Self::PriorityChange { .. } => EventType::PriorityChange,
            Self::PriorityEmergency { .. } => EventType::PriorityEmergency,
            Self::PriorityOverride { .. } => EventType::PriorityOverride,
            Self::PriorityReleased { .. } => EventType::PriorityReleased,
            Self::DjConnect { .. } => EventType::DjConnect,
            Self::DjDisconnect { .. } => EventType::DjDisconnect,
            Self::WebstreamFailover { .. } => EventType::WebstreamFailover,
            Self::WebstreamRecovered { .. } => EventType::WebstreamRecovered,
            Self::ShowStart { .. } => EventType::ShowStart,
            Self::ShowEnd { .. } => EventType::ShowEnd,
            Self::ListenerStats { .. } => EventType::ListenerStats,
            Self::ExecutorTransition { .. } => EventType::ExecutorTransition,
            Self::Audit { .. } => EventType::Audit,
        }
    }

    /// Flattens the event into the string-keyed map shape used by legacy
    /// consumers on the remote bus.
    #[must_use]
    pub fn payload(&self) -> serde_json::Map<String, serde_json::Value> {
        match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(map)) => map,
            _ => serde_json::Map::new(),
        }
    }
}

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<BusEvent>,
}

/// Handle returned by [`EventBus::subscribe`]; receive with
/// [`BusSubscription::recv`]. Dropping the handle ends delivery (the bus
/// prunes the closed queue on its next publish to the topic).
pub struct BusSubscription {
    id: u64,
    event_types: Vec<EventType>,
    rx: mpsc::Receiver<BusEvent>,
}

impl BusSubscription {
    /// Waits for the next event. Returns `None` once unsubscribed.
    pub async fn recv(&mut self) -> Option<BusEvent> {
        self.rx.recv().await
    }

    /// Non-blocking receive.
    pub fn try_recv(&mut self) -> Result<BusEvent, mpsc::error::TryRecvError> {
        self.rx.try_recv()
    }

    /// The topics this handle is registered for.
    #[must_use]
    pub fn event_types(&self) -> &[EventType] {
        &self.event_types
    }
}

/// In-process pub/sub hub.
pub struct EventBus {
    subscribers: RwLock<HashMap<EventType, Vec<Subscriber>>>,
    next_id: AtomicU64,
    dropped: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            dropped: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Subscribes to a single topic.
    pub fn subscribe(&self, event_type: EventType) -> BusSubscription {
        self.subscribe_many(&[event_type])
    }

    /// Subscribes one queue to several topics at once.
    ///
    /// Events from all listed topics arrive interleaved in publish order on
    /// the one queue; the queue capacity is the largest of the per-topic
    /// capacities.
    pub fn subscribe_many(&self, event_types: &[EventType]) -> BusSubscription {
        let capacity = event_types
            .iter()
            .map(|t| {
                if t.is_hot() {
                    BUS_HOT_QUEUE_CAPACITY
                } else {
                    BUS_QUEUE_CAPACITY
                }
            })
            .max()
            .unwrap_or(BUS_QUEUE_CAPACITY);

        let (tx, rx) = mpsc::channel(capacity);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let mut subscribers = self.subscribers.write();
        for event_type in event_types {
            subscribers
                .entry(*event_type)
                .or_default()
                .push(Subscriber { id, tx: tx.clone() });
        }

        BusSubscription {
            id,
            event_types: event_types.to_vec(),
            rx,
        }
    }

    /// Removes a subscription handle from every topic it registered for.
    pub fn unsubscribe(&self, subscription: &BusSubscription) {
        let mut subscribers = self.subscribers.write();
        for event_type in &subscription.event_types {
            if let Some(list) = subscribers.get_mut(event_type) {
                list.retain(|s| s.id != subscription.id);
            }
        }
    }

    /// Delivers `event` to every current subscriber of its topic without
    /// blocking. Full queues drop the event for that subscriber; closed
    /// queues are pruned.
    pub fn publish(&self, event: &BusEvent) {
        let event_type = event.event_type();
        let mut closed: Vec<u64> = Vec::new();

        {
            let subscribers = self.subscribers.read();
            let Some(list) = subscribers.get(&event_type) else {
                return;
            };
            for subscriber in list {
                match subscriber.tx.try_send(event.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                        tracing::warn!(
                            event = event_type.wire_name(),
                            subscriber = subscriber.id,
                            dropped_total = total,
                            "subscriber queue full, event dropped"
                        );
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => closed.push(subscriber.id),
                }
            }
        }

        if !closed.is_empty() {
            let mut subscribers = self.subscribers.write();
            if let Some(list) = subscribers.get_mut(&event_type) {
                list.retain(|s| !closed.contains(&s.id));
            }
        }
    }

    /// Total events dropped because of full subscriber queues.
    #[must_use]
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Current number of subscriptions on a topic.
    #[must_use]
    pub fn subscriber_count(&self, event_type: EventType) -> usize {
        self.subscribers
            .read()
            .get(&event_type)
            .map_or(0, Vec::len)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn audit(action: &str) -> BusEvent {
        BusEvent::Audit {
            station_id: None,
            action: action.to_string(),
            detail: String::new(),
        }
    }

    #[tokio::test]
    async fn subscribe_publish_receive_round_trip() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe(EventType::Audit);

        bus.publish(&audit("takeover"));

        match sub.recv().await {
            Some(BusEvent::Audit { action, .. }) => assert_eq!(action, "takeover"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn full_queue_drops_and_counts() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe(EventType::Audit);

        // Fill the bounded queue and then one more.
        for i in 0..=BUS_QUEUE_CAPACITY {
            bus.publish(&audit(&format!("a{i}")));
        }
        assert_eq!(bus.dropped_count(), 1);

        // FIFO order preserved for the delivered prefix.
        for i in 0..BUS_QUEUE_CAPACITY {
            match sub.try_recv().unwrap() {
                BusEvent::Audit { action, .. } => assert_eq!(action, format!("a{i}")),
                other => panic!("unexpected event: {other:?}"),
            }
        }
        assert!(sub.try_recv().is_err());
    }

    #[tokio::test]
    async fn events_route_by_type_only() {
        let bus = EventBus::new();
        let mut audit_sub = bus.subscribe(EventType::Audit);
        let mut show_sub = bus.subscribe(EventType::ShowStart);

        bus.publish(&audit("x"));

        assert!(audit_sub.try_recv().is_ok());
        assert!(show_sub.try_recv().is_err());
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe(EventType::Audit);
        bus.unsubscribe(&sub);

        bus.publish(&audit("gone"));
        assert_eq!(bus.subscriber_count(EventType::Audit), 0);
        assert!(sub.try_recv().is_err());
    }

    #[tokio::test]
    async fn dropped_receiver_is_pruned_on_publish() {
        let bus = EventBus::new();
        let sub = bus.subscribe(EventType::Audit);
        drop(sub);

        assert_eq!(bus.subscriber_count(EventType::Audit), 1);
        bus.publish(&audit("prune"));
        assert_eq!(bus.subscriber_count(EventType::Audit), 0);
    }

    #[tokio::test]
    async fn subscribe_many_receives_both_topics() {
        let bus = EventBus::new();
        let mut sub =
            bus.subscribe_many(&[EventType::PriorityChange, EventType::PriorityEmergency]);

        bus.publish(&BusEvent::PriorityEmergency {
            station_id: "st1".into(),
            source_id: "src1".into(),
        });
        bus.publish(&BusEvent::PriorityChange {
            station_id: "st1".into(),
            previous_source: None,
            source_id: "src2".into(),
            source_type: "media".into(),
            priority: 3,
        });

        assert!(matches!(
            sub.recv().await,
            Some(BusEvent::PriorityEmergency { .. })
        ));
        assert!(matches!(
            sub.recv().await,
            Some(BusEvent::PriorityChange { .. })
        ));
    }

    #[test]
    fn payload_shim_flattens_to_map() {
        let event = BusEvent::PriorityChange {
            station_id: "st1".into(),
            previous_source: Some("old".into()),
            source_id: "new".into(),
            source_type: "live".into(),
            priority: 1,
        };
        let map = event.payload();
        assert_eq!(map["station_id"], "st1");
        assert_eq!(map["priority"], 1);
        assert_eq!(map["type"], "priority_change");
    }

    #[test]
    fn wire_names_are_dotted() {
        assert_eq!(EventType::PriorityChange.wire_name(), "priority.change");
        assert_eq!(EventType::DjConnect.wire_name(), "dj.connect");
        assert_eq!(EventType::WebstreamFailover.wire_name(), "webstream.failover");
    }
}
