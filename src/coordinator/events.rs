//! Task lifecycle events.
//!
//! A broadcast channel observers (dashboards, tests) subscribe to.
//! Emission never blocks dispatch; events are dropped when nobody
//! listens or a subscriber lags.

use std::time::Duration;

use tokio::sync::broadcast;

#[derive(Debug, Clone)]
pub enum TaskEvent {
    Started {
        task_id: String,
        worker_id: String,
    },
    Completed {
        task_id: String,
        worker_id: String,
        success: bool,
        wall_time: Duration,
    },
}

pub struct EventBus {
    tx: broadcast::Sender<TaskEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: TaskEvent) {
        // no receivers is fine
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribe_receives_emitted() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        bus.emit(TaskEvent::Started {
            task_id: "t1".into(),
            worker_id: "w1".into(),
        });
        match rx.recv().await.unwrap() {
            TaskEvent::Started { task_id, worker_id } => {
                assert_eq!(task_id, "t1");
                assert_eq!(worker_id, "w1");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_emit_without_subscribers_is_fine() {
        let bus = EventBus::default();
        bus.emit(TaskEvent::Completed {
            task_id: "t".into(),
            worker_id: "w".into(),
            success: true,
            wall_time: Duration::from_millis(5),
        });
    }
}
