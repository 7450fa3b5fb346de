//! Worker pool lifecycle events.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::worker::{PoolStats, TaskId, WorkerId};

/// Why a worker was replaced by a fresh one.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RestartReason {
    MaxTasks,
    Timeout,
    Crash,
}

/// Why a worker left the pool without a replacement.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    Idle,
    Crashed,
    Shutdown,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PoolEvent {
    Spawned {
        worker_id: WorkerId,
    },
    Ready {
        worker_id: WorkerId,
    },
    Restarted {
        old_worker_id: WorkerId,
        new_worker_id: WorkerId,
        restart_count: u32,
        reason: RestartReason,
    },
    Exited {
        worker_id: WorkerId,
        reason: ExitReason,
    },
    TaskTimedOut {
        task_id: TaskId,
        worker_id: WorkerId,
        method: String,
    },
    Stats(PoolStats),
}

/// Broadcasts worker pool events.
#[derive(Clone)]
pub struct PoolEventBroadcaster {
    sender: Arc<broadcast::Sender<PoolEvent>>,
}

impl PoolEventBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn send(&self, event: PoolEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.sender.subscribe()
    }
}

impl Default for PoolEventBroadcaster {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_restart_event_round_trips_through_channel() {
        let broadcaster = PoolEventBroadcaster::new(4);
        let mut rx = broadcaster.subscribe();

        broadcaster.send(PoolEvent::Restarted {
            old_worker_id: 1,
            new_worker_id: 3,
            restart_count: 1,
            reason: RestartReason::Timeout,
        });

        match rx.try_recv().unwrap() {
            PoolEvent::Restarted {
                old_worker_id,
                new_worker_id,
                reason,
                ..
            } => {
                assert_eq!(old_worker_id, 1);
                assert_eq!(new_worker_id, 3);
                assert_eq!(reason, RestartReason::Timeout);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_event_serialization_is_tagged() {
        let json = serde_json::to_value(PoolEvent::Exited {
            worker_id: 2,
            reason: ExitReason::Idle,
        })
        .unwrap();
        assert_eq!(json["type"], "exited");
        assert_eq!(json["reason"], "idle");
    }
}
