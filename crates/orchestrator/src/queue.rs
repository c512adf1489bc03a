//! Priority queue of pending task ids.
//!
//! Kept sorted by descending priority; equal priorities leave in arrival order.

#[derive(Debug, Clone, PartialEq, Eq)]
struct QueueEntry {
    priority: i32,
    task_id: String,
}

#[derive(Debug, Default)]
pub struct TaskQueue {
    entries: Vec<QueueEntry>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert behind every entry of equal or higher priority.
    pub fn push(&mut self, task_id: String, priority: i32) {
        let position = self
            .entries
            .partition_point(|entry| entry.priority >= priority);
        self.entries.insert(
            position,
            QueueEntry { priority, task_id },
        );
    }

    /// Take the highest-priority, earliest-arrived task.
    pub fn pop(&mut self) -> Option<String> {
        if self.entries.is_empty() {
            return None;
        }
        Some(self.entries.remove(0).task_id)
    }

    /// Remove a queued task; false when it is not queued.
    pub fn remove(&mut self, task_id: &str) -> bool {
        match self.entries.iter().position(|entry| entry.task_id == task_id) {
            Some(index) => {
                self.entries.remove(index);
                true
            }
            None => false,
        }
    }

    #[cfg(test)]
    pub fn contains(&self, task_id: &str) -> bool {
        self.entries.iter().any(|entry| entry.task_id == task_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Empty the queue, returning ids in dequeue order.
    pub fn drain(&mut self) -> Vec<String> {
        self.entries.drain(..).map(|entry| entry.task_id).collect()
    }
}
