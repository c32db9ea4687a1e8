// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! WorkQueue (spec §3 `C6`): a lock-guarded bounded queue of scheduled
//! callbacks feeding one `IORuntime`'s reactor loop.

use std::{collections::VecDeque, sync::Mutex};

/// Unit of work scheduled onto an `IORuntime` (spec §4.3 `schedule`). The
/// runtime calls this once popped off the queue.
pub type WorkItem = Box<dyn FnOnce() + Send + 'static>;

/// Bounded queue of pending work items. The lock is held only across one
/// enqueue/dequeue (spec §5 "a lock-guarded linked list").
pub struct WorkQueue {
    items: Mutex<VecDeque<WorkItem>>,
    max_pending: usize,
}

impl WorkQueue {
    pub fn new(max_pending: usize) -> Self {
        Self { items: Mutex::new(VecDeque::new()), max_pending }
    }

    /// Appends a work item. Returns `false` and drops nothing if the
    /// queue is at capacity — callers retry scheduling on the next wake
    /// (spec §4.3 "the queue has a max-pending bound").
    pub fn push(&self, item: WorkItem) -> bool {
        let mut guard = self.items.lock().unwrap_or_else(|e| e.into_inner());
        if guard.len() >= self.max_pending {
            return false;
        }
        guard.push_back(item);
        true
    }

    /// Pops the next item, or `None` if empty.
    pub fn pop(&self) -> Option<WorkItem> {
        let mut guard = self.items.lock().unwrap_or_else(|e| e.into_inner());
        guard.pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
