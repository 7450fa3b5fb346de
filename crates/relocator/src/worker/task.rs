use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use serde_json::Value;

use crate::error::PoolError;

pub type TaskId = u64;
pub type WorkerId = u64;

/// Final result of a task.
pub type TaskOutcome = Result<Value, PoolError>;

/// A unit of work waiting for, or running on, a worker.
pub(crate) struct Task {
    pub id: TaskId,
    pub method: String,
    pub args: Value,
    pub timeout: Duration,
    pub created_at: Instant,
    pub completion: Completion,
}

/// The single settle point of a task. Consumed on use, so a task can only be
/// settled once; dropping it unsettled surfaces as `Terminated` to the waiter.
pub(crate) struct Completion {
    task_id: TaskId,
    sender: Sender<TaskOutcome>,
}

impl Completion {
    pub fn settle(self, outcome: TaskOutcome) {
        if self.sender.send(outcome).is_err() {
            log::trace!("Task {} settled after its handle was dropped", self.task_id);
        }
    }
}

pub(crate) fn completion_pair(task_id: TaskId) -> (Completion, TaskHandle) {
    let (sender, receiver) = bounded(1);
    (
        Completion { task_id, sender },
        TaskHandle {
            id: task_id,
            receiver,
        },
    )
}

/// Caller side of a submitted task.
#[derive(Debug)]
pub struct TaskHandle {
    id: TaskId,
    receiver: Receiver<TaskOutcome>,
}

impl TaskHandle {
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Blocks until the task settles.
    pub fn wait(self) -> TaskOutcome {
        self.receiver.recv().unwrap_or(Err(PoolError::Terminated))
    }

    /// Blocks for at most `timeout`. `None` means the task is still pending.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<TaskOutcome> {
        match self.receiver.recv_timeout(timeout) {
            Ok(outcome) => Some(outcome),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(Err(PoolError::Terminated)),
        }
    }

    /// Non-blocking poll.
    pub fn try_result(&self) -> Option<TaskOutcome> {
        match self.receiver.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(PoolError::Terminated)),
        }
    }
}
