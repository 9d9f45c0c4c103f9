use serde_json::Value;
use tokio::sync::broadcast;

use ember_types::EngineEvent;

/// Client-visible event kinds published by the orchestrator.
pub mod kinds {
    pub const TASK_PROGRESS: &str = "task.progress";
    pub const TASK_STEP: &str = "task.step";
    pub const TASK_COMPLETED: &str = "task.completed";
    pub const TASK_FAILED: &str = "task.failed";
    pub const TASK_CONFIRMATION_REQUIRED: &str = "task.confirmation_required";
    pub const BACKEND_STATUS: &str = "backend.status";
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(2048);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }

    pub fn emit(&self, event_type: &str, properties: Value) {
        self.publish(EngineEvent::new(event_type, properties));
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
