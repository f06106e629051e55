use serde::Serialize;

use crate::types::{RunStatus, SessionId, StageKind};

/// Progress events published by the workflow engine.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WorkflowEvent {
    RunStarted {
        session_id: SessionId,
        documents: usize,
    },
    StageStarted {
        session_id: SessionId,
        stage: StageKind,
        attempt: u32,
    },
    StageSucceeded {
        session_id: SessionId,
        stage: StageKind,
        attempt: u32,
        duration_ms: u64,
    },
    StageFailed {
        session_id: SessionId,
        stage: StageKind,
        attempt: u32,
        error: String,
        fatal: bool,
    },
    StageDegraded {
        session_id: SessionId,
        stage: StageKind,
    },
    RunFinished {
        session_id: SessionId,
        status: RunStatus,
    },
}

impl WorkflowEvent {
    pub fn session_id(&self) -> &SessionId {
        match self {
            Self::RunStarted { session_id, .. }
            | Self::StageStarted { session_id, .. }
            | Self::StageSucceeded { session_id, .. }
            | Self::StageFailed { session_id, .. }
            | Self::StageDegraded { session_id, .. }
            | Self::RunFinished { session_id, .. } => session_id,
        }
    }
}

/// Event bus using tokio broadcast channel.
/// All subscribers receive all events.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<WorkflowEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: WorkflowEvent) {
        // Ignore error if no receivers
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<WorkflowEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_see_events() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let sid = SessionId::from_str("s-1");
        bus.publish(WorkflowEvent::RunFinished {
            session_id: sid.clone(),
            status: RunStatus::Completed,
        });
        let event = rx.recv().await.unwrap();
        assert_eq!(event.session_id(), &sid);
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new(4);
        bus.publish(WorkflowEvent::StageDegraded {
            session_id: SessionId::new(),
            stage: StageKind::ComplianceMapper,
        });
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let event = WorkflowEvent::StageStarted {
            session_id: SessionId::from_str("abc"),
            stage: StageKind::TestGenerator,
            attempt: 2,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "stage_started");
        assert_eq!(json["stage"], "test_generator");
        assert_eq!(json["attempt"], 2);
    }
}
