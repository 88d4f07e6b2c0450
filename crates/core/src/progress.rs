use crate::models::Stage;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub task_id: String,
    pub stage: Stage,
    pub progress: f32,
    pub message: Option<String>,
}

pub trait ProgressPublisher: Send + Sync {
    fn publish(&self, event: ProgressEvent);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NullPublisher;

impl ProgressPublisher for NullPublisher {
    fn publish(&self, _event: ProgressEvent) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingPublisher;

impl ProgressPublisher for TracingPublisher {
    fn publish(&self, event: ProgressEvent) {
        info!(
            task_id = %event.task_id,
            stage = %event.stage,
            progress = event.progress,
            message = event.message.as_deref().unwrap_or(""),
            "task progress"
        );
    }
}

#[derive(Debug, Clone)]
pub struct BroadcastPublisher {
    sender: broadcast::Sender<ProgressEvent>,
}

impl BroadcastPublisher {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.sender.subscribe()
    }
}

impl ProgressPublisher for BroadcastPublisher {
    fn publish(&self, event: ProgressEvent) {
        let _ = self.sender.send(event);
    }
}
