use crate::model::{ClosureReason, ProposalState};
use crate::{MessageId, ProposalId, Result, UserId};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Maximum events buffered per subscriber before lagging receivers drop
/// messages. Push is not the system of record; clients reconcile via the
/// synchronous read endpoints.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    ProposalReceived,
    ProposalAccepted,
    ProposalRejected,
    ProposalCancelled,
    ProposalExpired,
    ExpiryReminder,
    MessageReceived,
    SwapCompleted,
    EvaluationReceived,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub title: String,
    pub body: String,
    pub kind: NotificationKind,
    pub reference_id: uuid::Uuid,
}

impl Notification {
    pub fn new(
        kind: NotificationKind,
        reference_id: uuid::Uuid,
        title: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            title: title.into(),
            body: body.into(),
            kind,
            reference_id,
        }
    }
}

/// Push channel to the external notification collaborator. Delivery is
/// fire-and-forget: failures are logged, never retried by the core.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn send(&self, user_id: UserId, notification: Notification) -> Result<()>;
}

/// Sink that POSTs notifications to a configured webhook endpoint.
pub struct WebhookSink {
    endpoint: String,
    client: reqwest::Client,
}

impl WebhookSink {
    pub fn new(endpoint: String) -> Self {
        Self {
            endpoint,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl NotificationSink for WebhookSink {
    async fn send(&self, user_id: UserId, notification: Notification) -> Result<()> {
        let payload = serde_json::json!({
            "user_id": user_id,
            "title": notification.title,
            "body": notification.body,
            "type": notification.kind,
            "reference_id": notification.reference_id,
        });

        let response = self
            .client
            .post(&self.endpoint)
            .json(&payload)
            .send()
            .await?;

        response.error_for_status()?;
        Ok(())
    }
}

/// Sink that only logs; the default for development and tests.
pub struct TracingSink;

#[async_trait]
impl NotificationSink for TracingSink {
    async fn send(&self, user_id: UserId, notification: Notification) -> Result<()> {
        tracing::info!(
            "Notification for {}: [{:?}] {} - {}",
            user_id,
            notification.kind,
            notification.title,
            notification.body
        );
        Ok(())
    }
}

/// Real-time events pushed to subscribers. At-least-once, arrival order only.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum TradeEvent {
    ProposalCreated {
        proposal_id: ProposalId,
        proposer_id: UserId,
        receiver_id: UserId,
    },
    ProposalStateChanged {
        proposal_id: ProposalId,
        state: ProposalState,
        closure_reason: Option<ClosureReason>,
    },
    MessagePosted {
        proposal_id: ProposalId,
        message_id: MessageId,
        sender_id: Option<UserId>,
    },
    ReputationUpdated {
        user_id: UserId,
        score: f64,
    },
}

type TopicMap<K> = Arc<Mutex<HashMap<K, broadcast::Sender<TradeEvent>>>>;

/// Per-proposal and per-user outbound event topics. Publishing never blocks
/// on subscriber delivery; topics without subscribers drop events silently.
#[derive(Clone, Default)]
pub struct EventBus {
    proposal_topics: TopicMap<ProposalId>,
    user_topics: TopicMap<UserId>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe_proposal(&self, proposal_id: ProposalId) -> broadcast::Receiver<TradeEvent> {
        Self::topic(&self.proposal_topics, proposal_id).subscribe()
    }

    pub fn subscribe_user(&self, user_id: UserId) -> broadcast::Receiver<TradeEvent> {
        Self::topic(&self.user_topics, user_id).subscribe()
    }

    pub fn publish_proposal(&self, proposal_id: ProposalId, event: TradeEvent) {
        let sender = Self::topic(&self.proposal_topics, proposal_id);
        // send() only errors when no receiver is subscribed
        let _ = sender.send(event);
    }

    pub fn publish_user(&self, user_id: UserId, event: TradeEvent) {
        let sender = Self::topic(&self.user_topics, user_id);
        let _ = sender.send(event);
    }

    fn topic<K: std::hash::Hash + Eq + Copy>(
        map: &TopicMap<K>,
        key: K,
    ) -> broadcast::Sender<TradeEvent> {
        let mut topics = map.lock();
        topics
            .entry(key)
            .or_insert_with(|| broadcast::channel(EVENT_CHANNEL_CAPACITY).0)
            .clone()
    }
}

/// Bundles the external sink and the in-process event bus so callers emit
/// both with one call site per transition.
#[derive(Clone)]
pub struct Notifier {
    sink: Arc<dyn NotificationSink>,
    events: EventBus,
}

impl Notifier {
    pub fn new(sink: Arc<dyn NotificationSink>, events: EventBus) -> Self {
        Self { sink, events }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Detached delivery; the returned handle is for tests, callers drop it.
    pub fn dispatch(&self, user_id: UserId, notification: Notification) -> JoinHandle<()> {
        let sink = self.sink.clone();
        tokio::spawn(async move {
            if let Err(e) = sink.send(user_id, notification).await {
                tracing::warn!("Notification delivery to {} failed: {}", user_id, e);
            }
        })
    }

    /// Fan an event out to the proposal topic and each party's user topic.
    pub fn broadcast(&self, proposal_id: ProposalId, parties: &[UserId], event: TradeEvent) {
        self.events.publish_proposal(proposal_id, event.clone());
        for user_id in parties {
            self.events.publish_user(*user_id, event.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::mock;
    use uuid::Uuid;

    mock! {
        Sink {}

        #[async_trait]
        impl NotificationSink for Sink {
            async fn send(&self, user_id: UserId, notification: Notification) -> Result<()>;
        }
    }

    #[tokio::test]
    async fn test_dispatch_delivers_to_sink() {
        let mut sink = MockSink::new();
        sink.expect_send()
            .times(1)
            .returning(|_, _| Ok(()));

        let notifier = Notifier::new(Arc::new(sink), EventBus::new());
        let handle = notifier.dispatch(
            Uuid::new_v4(),
            Notification::new(
                NotificationKind::ProposalReceived,
                Uuid::new_v4(),
                "New trade proposal",
                "Someone wants to swap with you",
            ),
        );
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_dispatch_swallows_sink_errors() {
        let mut sink = MockSink::new();
        sink.expect_send().times(1).returning(|_, _| {
            Err(crate::TradeError::Serialization("sink offline".to_string()))
        });

        let notifier = Notifier::new(Arc::new(sink), EventBus::new());
        let handle = notifier.dispatch(
            Uuid::new_v4(),
            Notification::new(
                NotificationKind::MessageReceived,
                Uuid::new_v4(),
                "New message",
                "hola",
            ),
        );
        // Delivery failure is logged, never surfaced.
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_event_bus_routes_to_proposal_topic() {
        let bus = EventBus::new();
        let proposal_id = Uuid::new_v4();
        let mut rx = bus.subscribe_proposal(proposal_id);

        bus.publish_proposal(
            proposal_id,
            TradeEvent::ProposalStateChanged {
                proposal_id,
                state: ProposalState::Accepted,
                closure_reason: None,
            },
        );

        let event = rx.recv().await.unwrap();
        assert!(matches!(
            event,
            TradeEvent::ProposalStateChanged {
                state: ProposalState::Accepted,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_event_bus_isolates_topics() {
        let bus = EventBus::new();
        let mut other = bus.subscribe_proposal(Uuid::new_v4());

        bus.publish_proposal(
            Uuid::new_v4(),
            TradeEvent::ReputationUpdated {
                user_id: Uuid::new_v4(),
                score: 4.5,
            },
        );

        assert!(matches!(
            other.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }
}
