//! Two-lane FIFO work queue shared by a pool of workers.
//!
//! High-priority items are always taken before low-priority ones. Within a
//! lane, order is first-in first-out.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::Semaphore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Priority {
    /// Needed by a caller that is waiting right now.
    High,
    /// Speculative work such as read-ahead.
    Low,
}

impl Priority {
    fn lane(self) -> usize {
        match self {
            Priority::High => 0,
            Priority::Low => 1,
        }
    }
}

pub struct PriorityQueue<T> {
    lanes: Mutex<[VecDeque<T>; 2]>,
    // 每个排队中的元素对应一个 permit
    items: Semaphore,
}

impl<T> PriorityQueue<T> {
    pub fn new() -> Self {
        Self {
            lanes: Mutex::new([VecDeque::new(), VecDeque::new()]),
            items: Semaphore::new(0),
        }
    }

    /// Enqueues `item`; hands it back if the queue has been closed.
    pub fn push(&self, priority: Priority, item: T) -> Result<(), T> {
        if self.items.is_closed() {
            return Err(item);
        }
        self.lock()[priority.lane()].push_back(item);
        self.items.add_permits(1);
        Ok(())
    }

    /// Waits for the next item. After `close`, drains what is left and then
    /// returns `None`.
    pub async fn pop(&self) -> Option<T> {
        match self.items.acquire().await {
            Ok(permit) => permit.forget(),
            Err(_) => return self.take_next(),
        }
        self.take_next()
    }

    pub fn close(&self) {
        self.items.close();
    }

    pub fn len(&self) -> usize {
        self.lock().iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn take_next(&self) -> Option<T> {
        self.lock().iter_mut().find_map(VecDeque::pop_front)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, [VecDeque<T>; 2]> {
        self.lanes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<T> Default for PriorityQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
