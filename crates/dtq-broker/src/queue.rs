use dtq_core::{Task, TaskId, TaskStatus};
use parking_lot::Mutex;
use std::collections::VecDeque;
use tracing::{debug, info, warn};

/// Bounded FIFO of pending tasks.
///
/// A single mutex covers every operation, so enqueue, dequeue and size are
/// linearizable. Dequeue never blocks waiting for work.
pub struct TaskQueue {
    tasks: Mutex<VecDeque<Task>>,
    capacity: usize,
}

impl TaskQueue {
    pub fn new(capacity: usize) -> Self {
        TaskQueue {
            tasks: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
            capacity,
        }
    }

    /// Append a task at the tail. Returns false without touching the queue
    /// when it is at capacity.
    pub fn enqueue(&self, task: Task) -> bool {
        let mut tasks = self.tasks.lock();
        if tasks.len() >= self.capacity {
            warn!("Queue is full. Task {} rejected", task.task_id);
            return false;
        }

        let task_id = task.task_id;
        tasks.push_back(task);
        debug!("Task {} enqueued. Queue size={}", task_id, tasks.len());
        true
    }

    /// Remove and return the head task, if any
    pub fn dequeue(&self) -> Option<Task> {
        let mut tasks = self.tasks.lock();
        let task = tasks.pop_front()?;
        debug!("Task {} dequeued. Queue size={}", task.task_id, tasks.len());
        Some(task)
    }

    /// Record a terminal result for a task.
    ///
    /// Dequeue hands ownership of a task to the assigning session, so the
    /// queue keeps no record to update; the result is only logged.
    pub fn update_task_result(&self, task_id: TaskId, result: &str, status: TaskStatus) -> bool {
        info!(
            "Task {} finished with status {}: {}",
            task_id,
            status.as_str(),
            result
        );
        true
    }

    pub fn size(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
