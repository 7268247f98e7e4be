// In-process message bus
//
// Routes BusMessages between agents and toward external observers.
// Subscribers hold an unbounded receiver and a filter; the subscriber
// list is copy-on-write so publish iterates an immutable snapshot
// without holding the lock. A failing subscriber is logged and skipped;
// the publisher never sees partial-delivery failures.
//
// Agent recipients get the message persisted into their conversation via
// the installed delivery sink; the reserved recipient "human" only
// reaches subscribers (WebSocket bridges, logs).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, warn};

/// Reserved recipient that surfaces to the external interface only
pub const HUMAN_RECIPIENT: &str = "human";

/// Kind of a routed message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusMessageKind {
    Message,
    Delegation,
    SystemNotice,
}

/// A routed inter-agent (or agent-to-human) message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusMessage {
    pub sender: String,
    pub recipient: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    pub kind: BusMessageKind,
    pub timestamp: DateTime<Utc>,
}

impl BusMessage {
    pub fn new(
        sender: impl Into<String>,
        recipient: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            sender: sender.into(),
            recipient: recipient.into(),
            content: content.into(),
            channel: None,
            kind: BusMessageKind::Message,
            timestamp: Utc::now(),
        }
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    pub fn with_kind(mut self, kind: BusMessageKind) -> Self {
        self.kind = kind;
        self
    }

    /// Whether this message targets the external interface
    pub fn is_for_human(&self) -> bool {
        self.recipient == HUMAN_RECIPIENT
    }
}

/// Subscriber-side selection; unset fields match anything, set fields AND
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubscriptionFilter {
    pub recipient: Option<String>,
    pub sender: Option<String>,
    pub channel: Option<String>,
    pub kind: Option<BusMessageKind>,
}

impl SubscriptionFilter {
    /// Match everything
    pub fn all() -> Self {
        Self::default()
    }

    /// Match one recipient
    pub fn for_recipient(recipient: impl Into<String>) -> Self {
        Self {
            recipient: Some(recipient.into()),
            ..Self::default()
        }
    }

    /// Match one channel
    pub fn for_channel(channel: impl Into<String>) -> Self {
        Self {
            channel: Some(channel.into()),
            ..Self::default()
        }
    }

    pub fn matches(&self, message: &BusMessage) -> bool {
        if let Some(recipient) = &self.recipient {
            if &message.recipient != recipient {
                return false;
            }
        }
        if let Some(sender) = &self.sender {
            if &message.sender != sender {
                return false;
            }
        }
        if let Some(channel) = &self.channel {
            if message.channel.as_deref() != Some(channel.as_str()) {
                return false;
            }
        }
        if let Some(kind) = self.kind {
            if message.kind != kind {
                return false;
            }
        }
        true
    }
}

/// Handle returned by subscribe, used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionHandle(u64);

/// Installed by the core façade so agent-recipient messages land in the
/// recipient's conversation. The sink reports whether the recipient was a
/// registered agent.
pub trait AgentDeliverySink: Send + Sync {
    fn deliver(&self, message: &BusMessage) -> bool;
}

struct Subscriber {
    id: u64,
    filter: SubscriptionFilter,
    tx: UnboundedSender<BusMessage>,
}

/// The in-process pub/sub router
pub struct MessageBus {
    subscribers: RwLock<Arc<Vec<Subscriber>>>,
    sink: RwLock<Option<Arc<dyn AgentDeliverySink>>>,
    next_id: AtomicU64,
}

impl MessageBus {
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(Arc::new(Vec::new())),
            sink: RwLock::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    /// Install the conversation delivery sink (done once by the core)
    pub fn set_delivery_sink(&self, sink: Arc<dyn AgentDeliverySink>) {
        *self.sink.write().expect("bus sink lock poisoned") = Some(sink);
    }

    /// Register a subscriber; returns its handle and receiver
    pub fn subscribe(
        &self,
        filter: SubscriptionFilter,
    ) -> (SubscriptionHandle, UnboundedReceiver<BusMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let mut guard = self.subscribers.write().expect("bus lock poisoned");
        let mut next: Vec<Subscriber> = guard
            .iter()
            .map(|s| Subscriber {
                id: s.id,
                filter: s.filter.clone(),
                tx: s.tx.clone(),
            })
            .collect();
        next.push(Subscriber { id, filter, tx });
        *guard = Arc::new(next);

        (SubscriptionHandle(id), rx)
    }

    /// Drop a subscriber
    pub fn unsubscribe(&self, handle: SubscriptionHandle) {
        let mut guard = self.subscribers.write().expect("bus lock poisoned");
        let next: Vec<Subscriber> = guard
            .iter()
            .filter(|s| s.id != handle.0)
            .map(|s| Subscriber {
                id: s.id,
                filter: s.filter.clone(),
                tx: s.tx.clone(),
            })
            .collect();
        *guard = Arc::new(next);
    }

    /// Deliver synchronously to the conversation sink and all matching
    /// subscribers. Per-publisher delivery order is preserved.
    pub fn publish(&self, message: BusMessage) {
        if !message.is_for_human() {
            let sink = self.sink.read().expect("bus sink lock poisoned").clone();
            match sink {
                Some(sink) => {
                    if !sink.deliver(&message) {
                        warn!(
                            recipient = %message.recipient,
                            "bus message for unknown agent dropped from conversations"
                        );
                    }
                }
                None => debug!("no delivery sink installed; conversations not updated"),
            }
        }

        let snapshot = self.subscribers.read().expect("bus lock poisoned").clone();
        let mut dead = Vec::new();
        for subscriber in snapshot.iter() {
            if subscriber.tx.is_closed() {
                dead.push(subscriber.id);
                continue;
            }
            if !subscriber.filter.matches(&message) {
                continue;
            }
            if subscriber.tx.send(message.clone()).is_err() {
                // Receiver dropped without unsubscribing; prune it
                debug!(subscriber = subscriber.id, "dropping send to dead subscriber");
                dead.push(subscriber.id);
            }
        }
        for id in dead {
            self.unsubscribe(SubscriptionHandle(id));
        }
    }

    /// Number of live subscribers
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().expect("bus lock poisoned").len()
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_filter_matching() {
        let msg = BusMessage::new("a", "b", "hello")
            .with_channel("room")
            .with_kind(BusMessageKind::Delegation);

        assert!(SubscriptionFilter::all().matches(&msg));
        assert!(SubscriptionFilter::for_recipient("b").matches(&msg));
        assert!(!SubscriptionFilter::for_recipient("c").matches(&msg));
        assert!(SubscriptionFilter::for_channel("room").matches(&msg));
        assert!(!SubscriptionFilter::for_channel("other").matches(&msg));

        let kind_filter = SubscriptionFilter {
            kind: Some(BusMessageKind::Message),
            ..Default::default()
        };
        assert!(!kind_filter.matches(&msg));
    }

    #[tokio::test]
    async fn test_publish_order_per_pair() {
        let bus = MessageBus::new();
        let (_handle, mut rx) = bus.subscribe(SubscriptionFilter::for_recipient("b"));

        for i in 0..10 {
            bus.publish(BusMessage::new("a", "b", format!("m{}", i)));
        }

        for i in 0..10 {
            let msg = rx.recv().await.unwrap();
            assert_eq!(msg.content, format!("m{}", i));
        }
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let bus = MessageBus::new();
        let (handle, mut rx) = bus.subscribe(SubscriptionFilter::all());
        bus.publish(BusMessage::new("a", "human", "one"));
        bus.unsubscribe(handle);
        bus.publish(BusMessage::new("a", "human", "two"));

        assert_eq!(rx.recv().await.unwrap().content, "one");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_dead_subscriber_does_not_block_others() {
        let bus = MessageBus::new();
        let (_h1, rx1) = bus.subscribe(SubscriptionFilter::all());
        drop(rx1);
        let (_h2, mut rx2) = bus.subscribe(SubscriptionFilter::all());

        bus.publish(BusMessage::new("a", "human", "still delivered"));
        assert_eq!(rx2.recv().await.unwrap().content, "still delivered");
    }

    #[test]
    fn test_agent_recipient_goes_through_sink() {
        struct Recorder(Mutex<Vec<String>>);
        impl AgentDeliverySink for Recorder {
            fn deliver(&self, message: &BusMessage) -> bool {
                self.0.lock().unwrap().push(message.recipient.clone());
                message.recipient == "known"
            }
        }

        let bus = MessageBus::new();
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        bus.set_delivery_sink(recorder.clone());

        bus.publish(BusMessage::new("a", "known", "hi"));
        bus.publish(BusMessage::new("a", "human", "to the ui"));

        // "human" never reaches the sink
        assert_eq!(*recorder.0.lock().unwrap(), vec!["known".to_string()]);
    }
}
