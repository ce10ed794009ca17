use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::trace;
use uuid::Uuid;

/// Lifecycle topics published by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventTopic {
    /// An agent was dispatched.
    AgentStarted,
    /// An agent settled successfully.
    AgentCompleted,
    /// An agent failed or was refused by its guards.
    AgentFailed,
    /// An agent was not run because a dependency failed or the run stopped.
    AgentSkipped,
    /// A run finished with every agent completed.
    RunCompleted,
    /// A run finished with a failure or was stopped.
    RunFailed,
}

impl std::fmt::Display for EventTopic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventTopic::AgentStarted => write!(f, "AGENT_STARTED"),
            EventTopic::AgentCompleted => write!(f, "AGENT_COMPLETED"),
            EventTopic::AgentFailed => write!(f, "AGENT_FAILED"),
            EventTopic::AgentSkipped => write!(f, "AGENT_SKIPPED"),
            EventTopic::RunCompleted => write!(f, "RUN_COMPLETED"),
            EventTopic::RunFailed => write!(f, "RUN_FAILED"),
        }
    }
}

/// State/action/next-state triple describing the scheduling context of an
/// agent execution. Opaque to the orchestrator; forwarded to learning
/// consumers as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub state: serde_json::Value,
    pub action: serde_json::Value,
    pub next_state: serde_json::Value,
}

/// A single published event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub topic: EventTopic,
    pub run_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl Event {
    /// Creates an event with an arbitrary payload.
    pub fn new(topic: EventTopic, run_id: Uuid, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            topic,
            run_id,
            timestamp: Utc::now(),
            payload,
        }
    }

    /// `AGENT_STARTED { agent }`.
    pub fn agent_started(run_id: Uuid, agent: &str) -> Self {
        Self::new(
            EventTopic::AgentStarted,
            run_id,
            serde_json::json!({ "agent": agent }),
        )
    }

    /// `AGENT_COMPLETED { agent, execution_time_ms, state?, action?, next_state?, success }`.
    pub fn agent_completed(
        run_id: Uuid,
        agent: &str,
        execution_time_ms: u64,
        transition: Option<&Transition>,
    ) -> Self {
        let mut payload = serde_json::json!({
            "agent": agent,
            "execution_time_ms": execution_time_ms,
            "success": true,
        });
        attach_transition(&mut payload, transition);
        Self::new(EventTopic::AgentCompleted, run_id, payload)
    }

    /// `AGENT_FAILED { agent, error, execution_time_ms, success: false }`.
    pub fn agent_failed(run_id: Uuid, agent: &str, error: &str, execution_time_ms: u64) -> Self {
        Self::new(
            EventTopic::AgentFailed,
            run_id,
            serde_json::json!({
                "agent": agent,
                "error": error,
                "execution_time_ms": execution_time_ms,
                "success": false,
            }),
        )
    }

    /// `AGENT_SKIPPED { agent, reason }`.
    pub fn agent_skipped(run_id: Uuid, agent: &str, reason: &str) -> Self {
        Self::new(
            EventTopic::AgentSkipped,
            run_id,
            serde_json::json!({ "agent": agent, "reason": reason }),
        )
    }

    /// The `agent` field of the payload, if any.
    pub fn agent(&self) -> Option<&str> {
        self.payload.get("agent").and_then(|v| v.as_str())
    }
}

fn attach_transition(payload: &mut serde_json::Value, transition: Option<&Transition>) {
    let (Some(t), Some(map)) = (transition, payload.as_object_mut()) else {
        return;
    };
    map.insert("state".into(), t.state.clone());
    map.insert("action".into(), t.action.clone());
    map.insert("next_state".into(), t.next_state.clone());
}

/// Outbound event capability.
///
/// Publishing never fails from the caller's point of view and nothing in the
/// scheduler depends on what a sink does with an event.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: Event);
}

/// Sink that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn publish(&self, _event: Event) {}
}

/// In-process publish/subscribe bus backed by a broadcast channel.
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a bus buffering up to `capacity` events per slow subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribe to every event published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventSink for EventBus {
    fn publish(&self, event: Event) {
        trace!(topic = %event.topic, "event");
        // No subscribers is not an error.
        let _ = self.tx.send(event);
    }
}

/// Forwards each event to several sinks.
#[derive(Default, Clone)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl EventSink for FanoutSink {
    fn publish(&self, event: Event) {
        if let Some((last, rest)) = self.sinks.split_last() {
            for sink in rest {
                sink.publish(event.clone());
            }
            last.publish(event);
        }
    }
}
