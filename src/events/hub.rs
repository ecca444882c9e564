//! Event distribution hub — per-topic subscriber registry with best-effort,
//! at-most-once fan-out.
//!
//! The hub owns the registry; each subscribe call returns a guard whose sole
//! purpose is to remove itself. Nothing is buffered or replayed: observers
//! that subscribe after a publish never see it, and observers that miss a
//! window reconcile with a full re-fetch.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::tasks::model::{ExecutionStatus, TaskStatus};

/// A subscribable event class.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Events for one agent's executions.
    Agent(String),
    /// Events for every agent on a server.
    Server(String),
    /// Token stream for one chat session.
    Chat(String),
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Agent(id) => write!(f, "agent:{id}"),
            Self::Server(id) => write!(f, "server:{id}"),
            Self::Chat(id) => write!(f, "chat:{id}"),
        }
    }
}

impl FromStr for Topic {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, id) = s
            .split_once(':')
            .ok_or_else(|| format!("topic '{s}' is not of the form kind:id"))?;
        if id.is_empty() {
            return Err(format!("topic '{s}' has an empty id"));
        }
        match kind {
            "agent" => Ok(Self::Agent(id.to_string())),
            "server" => Ok(Self::Server(id.to_string())),
            "chat" => Ok(Self::Chat(id.to_string())),
            other => Err(format!("unknown topic kind '{other}'")),
        }
    }
}

/// A record of one tool call made by the agent while producing a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    /// Tool name.
    pub name: String,
    /// Tool input as reported by the agent.
    pub input: serde_json::Value,
    /// Tool output, when reported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

/// Events fanned out by the hub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HubEvent {
    /// A task moved between statuses.
    TaskStatus {
        task_id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
        at: DateTime<Utc>,
    },
    /// An execution attempt started running.
    ExecutionStarted {
        execution_id: Uuid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        task_id: Option<Uuid>,
        agent_id: String,
        at: DateTime<Utc>,
    },
    /// An execution attempt reached a final state.
    ExecutionFinished {
        execution_id: Uuid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        task_id: Option<Uuid>,
        agent_id: String,
        status: ExecutionStatus,
        duration_ms: u64,
        tokens_used: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        at: DateTime<Utc>,
    },
    /// A chat message began streaming.
    ChatStart {
        session_id: String,
        message_id: Uuid,
    },
    /// An incremental chat delta. `accumulated` carries the whole content
    /// so far, so an observer that keeps only the latest chunk can still
    /// reconstruct full state.
    ChatChunk {
        session_id: String,
        message_id: Uuid,
        delta: String,
        accumulated: String,
    },
    /// The chat message finished streaming.
    ChatEnd {
        session_id: String,
        message_id: Uuid,
        content: String,
        #[serde(default)]
        tool_calls: Vec<ToolInvocation>,
    },
}

/// Identifier of one registry entry.
pub type SubscriptionId = u64;

type Registry = HashMap<Topic, HashMap<SubscriptionId, mpsc::UnboundedSender<HubEvent>>>;

/// The hub. Safe under concurrent publish-from-many / subscribe-from-many.
pub struct EventHub {
    registry: Arc<RwLock<Registry>>,
    next_id: AtomicU64,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHub {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(RwLock::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        }
    }

    /// Subscribe with a private channel. The returned [`Subscription`]
    /// yields events in publish order and unregisters itself on drop.
    pub fn subscribe(&self, topic: Topic) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let ticket = self.attach(topic, tx);
        Subscription { ticket, rx }
    }

    /// Register an existing sender on a topic. Lets one connection share a
    /// single FIFO channel across all of its topics. The returned ticket
    /// unregisters on drop.
    pub fn attach(
        &self,
        topic: Topic,
        tx: mpsc::UnboundedSender<HubEvent>,
    ) -> SubscriptionTicket {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.registry
            .write()
            .entry(topic.clone())
            .or_default()
            .insert(id, tx);
        tracing::debug!(topic = %topic, subscription = id, "Observer subscribed");
        SubscriptionTicket {
            topic,
            id,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Deliver an event to every observer currently subscribed to `topic`.
    /// Returns the number of observers the event was enqueued for. A closed
    /// receiver never prevents delivery to the rest; dead entries are
    /// pruned on the way out.
    pub fn publish(&self, topic: &Topic, event: HubEvent) -> usize {
        let mut delivered = 0;
        let mut dead: Vec<SubscriptionId> = Vec::new();

        {
            let registry = self.registry.read();
            let Some(subscribers) = registry.get(topic) else {
                return 0;
            };
            for (&id, tx) in subscribers {
                if tx.send(event.clone()).is_ok() {
                    delivered += 1;
                } else {
                    dead.push(id);
                }
            }
        }

        if !dead.is_empty() {
            let mut registry = self.registry.write();
            if let Some(subscribers) = registry.get_mut(topic) {
                for id in &dead {
                    subscribers.remove(id);
                }
                if subscribers.is_empty() {
                    registry.remove(topic);
                }
            }
        }

        tracing::trace!(topic = %topic, delivered, pruned = dead.len(), "Published event");
        delivered
    }

    /// Number of live subscriptions on a topic.
    pub fn subscriber_count(&self, topic: &Topic) -> usize {
        self.registry
            .read()
            .get(topic)
            .map(HashMap::len)
            .unwrap_or(0)
    }
}

/// Registry entry guard. Dropping it removes the subscription.
pub struct SubscriptionTicket {
    topic: Topic,
    id: SubscriptionId,
    registry: Weak<RwLock<Registry>>,
}

impl SubscriptionTicket {
    pub fn topic(&self) -> &Topic {
        &self.topic
    }
}

impl Drop for SubscriptionTicket {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            let mut registry = registry.write();
            if let Some(subscribers) = registry.get_mut(&self.topic) {
                subscribers.remove(&self.id);
                if subscribers.is_empty() {
                    registry.remove(&self.topic);
                }
            }
            tracing::debug!(topic = %self.topic, subscription = self.id, "Observer unsubscribed");
        }
    }
}

/// A private-channel subscription: ticket plus receiver.
pub struct Subscription {
    ticket: SubscriptionTicket,
    rx: mpsc::UnboundedReceiver<HubEvent>,
}

impl Subscription {
    /// Receive the next event, in publish order.
    pub async fn recv(&mut self) -> Option<HubEvent> {
        self.rx.recv().await
    }

    /// Non-blocking receive.
    pub fn try_recv(&mut self) -> Option<HubEvent> {
        self.rx.try_recv().ok()
    }

    pub fn topic(&self) -> &Topic {
        self.ticket.topic()
    }
}
