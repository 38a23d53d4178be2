//! `EventSink` adapters.

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::domain::WorkerEvent;
use crate::ports::EventSink;

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl EventSink for NoopSink {
    fn emit(&self, _event: WorkerEvent) {}
}

/// Logs events through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: WorkerEvent) {
        match &event {
            WorkerEvent::TaskStarted { worker_id, task } => {
                info!(worker_id = %worker_id, task_id = %task.id, attempt = task.attempts, "task started");
            }
            WorkerEvent::TaskCompleted { worker_id, task } => {
                info!(worker_id = %worker_id, task_id = %task.id, attempts = task.attempts, "task completed");
            }
            WorkerEvent::TaskRetry { worker_id, task, error } => {
                warn!(worker_id = %worker_id, task_id = %task.id, attempt = task.attempts, error = %error, "task will be retried");
            }
            WorkerEvent::TaskFailed { worker_id, task, error } => {
                warn!(worker_id = %worker_id, task_id = %task.id, attempts = task.attempts, error = %error, "task failed");
            }
            WorkerEvent::WorkerError { worker_id, error } => {
                warn!(worker_id = %worker_id, error = %error, "worker error");
            }
        }
    }
}

/// Forwards events into an unbounded tokio channel.
///
/// Sending never blocks; events are dropped once the receiver is gone.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<WorkerEvent>,
}

impl ChannelSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<WorkerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: WorkerEvent) {
        // receiver gone = nobody listening
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::WorkerId;

    #[tokio::test]
    async fn channel_sink_delivers_in_order() {
        let (sink, mut rx) = ChannelSink::channel();
        let worker_id = WorkerId::new("w1");
        sink.emit(WorkerEvent::WorkerError {
            worker_id: worker_id.clone(),
            error: "first".into(),
        });
        sink.emit(WorkerEvent::WorkerError {
            worker_id,
            error: "second".into(),
        });

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert!(matches!(first, WorkerEvent::WorkerError { error, .. } if error == "first"));
        assert!(matches!(second, WorkerEvent::WorkerError { error, .. } if error == "second"));
    }

    #[test]
    fn channel_sink_survives_dropped_receiver() {
        let (sink, rx) = ChannelSink::channel();
        drop(rx);
        sink.emit(WorkerEvent::WorkerError {
            worker_id: WorkerId::new("w1"),
            error: "lost".into(),
        });
    }
}
