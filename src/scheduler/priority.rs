use crate::executor::task::{Priority, TaskId};
use std::collections::VecDeque;

/// Per-priority-level FIFO queues of task ids.
///
/// Dequeue always drains the highest non-empty level; within a level,
/// strictly first-in first-out. No aging: a steady stream of high-priority
/// work starves lower levels, deliberately.
///
/// Not internally synchronized; lives inside the manager's scheduler lock.
#[derive(Debug, Default)]
pub struct PriorityQueue {
    levels: [VecDeque<TaskId>; Priority::COUNT],
}

impl PriorityQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, id: TaskId, priority: Priority) {
        self.levels[priority.index()].push_back(id);
    }

    /// Pops from the highest non-empty level. None when every level is empty.
    pub fn pop(&mut self) -> Option<(TaskId, Priority)> {
        for idx in 0..Priority::COUNT {
            if let Some(id) = self.levels[idx].pop_front() {
                return Some((id, Priority::from_index(idx)));
            }
        }
        None
    }

    /// Removes a waiting task by identity. Linear scan of one level; queues
    /// stay small enough that this never matters.
    pub fn remove(&mut self, id: TaskId, priority: Priority) -> bool {
        let level = &mut self.levels[priority.index()];
        if let Some(pos) = level.iter().position(|&queued| queued == id) {
            level.remove(pos);
            true
        } else {
            false
        }
    }

    pub fn len(&self) -> usize {
        self.levels.iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.iter().all(VecDeque::is_empty)
    }
}
