//! In-process event bus
//!
//! Carries the internal orchestration events between the workflow service
//! and the state machine service. These never touch the wire; the external
//! bus is for agent traffic only.

use serde_json::Value;
use tokio::sync::broadcast;
use uuid::Uuid;

use conductor_contracts::{AgentFailure, Stage};

/// Internal orchestration event.
#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    /// A workflow row was persisted; the state machine bootstraps it into
    /// its first pipeline stage.
    WorkflowCreated { workflow_id: Uuid },

    /// A stage finished (agent result ingested, or the sweeper gave up).
    StageComplete {
        workflow_id: Uuid,
        stage: Stage,
        success: bool,
        output: Value,
        errors: Vec<AgentFailure>,
    },

    /// A human resolved a pending decision gate.
    DecisionResolved {
        workflow_id: Uuid,
        approved: bool,
        decided_by: String,
    },
}

impl OrchestratorEvent {
    pub fn workflow_id(&self) -> Uuid {
        match self {
            OrchestratorEvent::WorkflowCreated { workflow_id }
            | OrchestratorEvent::StageComplete { workflow_id, .. }
            | OrchestratorEvent::DecisionResolved { workflow_id, .. } => *workflow_id,
        }
    }
}

/// Broadcast channel for orchestration events.
///
/// Cloning shares the underlying channel; every subscriber sees every event
/// published after it subscribed.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<OrchestratorEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1024);
        Self { sender }
    }

    /// Publish an event. A missing subscriber is not an error; events are
    /// notifications, not commands.
    pub fn publish(&self, event: OrchestratorEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscriber_receives_published_event() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let id = Uuid::now_v7();
        bus.publish(OrchestratorEvent::WorkflowCreated { workflow_id: id });
        let event = rx.recv().await.unwrap();
        assert_eq!(event.workflow_id(), id);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_fine() {
        let bus = EventBus::new();
        bus.publish(OrchestratorEvent::WorkflowCreated {
            workflow_id: Uuid::now_v7(),
        });
    }
}
