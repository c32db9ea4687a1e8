// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Channel (spec §3 `C10`): bounded MPSC of replies with a closed flag.
//! Producers are I/O callbacks on IORuntimes; the consumer is the thread
//! holding the owning `Iterator`. Push never blocks (capacity is managed
//! by the caller via bounded fanout, spec §5).

use std::{collections::VecDeque, sync::Mutex};

use tokio::{sync::Notify, time::timeout};

use crate::error::CoordinatorError;

/// One entry delivered from a shard's cursor stream: either a chunk of
/// raw reply bytes, or a shard-level error (spec §7 "the Iterator
/// normalizes shard errors into channel entries").
pub type ChannelEntry = Result<Vec<u8>, CoordinatorError>;

struct Inner {
    queue: VecDeque<ChannelEntry>,
    closed: bool,
}

/// Bounded-in-spirit MPSC queue: nothing here enforces a capacity bound
/// itself (the `Iterator`'s `pending`/`in_process` bookkeeping is what
/// keeps fanout bounded), but `len()` is exposed so `maybe_trigger_next`
/// can compare against `CURSOR_REPLY_THRESHOLD`.
pub struct Channel {
    inner: Mutex<Inner>,
    notify: Notify,
}

impl Channel {
    pub fn new() -> Self {
        Self { inner: Mutex::new(Inner { queue: VecDeque::new(), closed: false }), notify: Notify::new() }
    }

    /// Non-blocking push (spec §3 "Push is non-blocking").
    pub fn push(&self, entry: ChannelEntry) {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if guard.closed {
            return;
        }
        guard.queue.push_back(entry);
        drop(guard);
        self.notify.notify_one();
    }

    pub fn close(&self) {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        guard.closed = true;
        drop(guard);
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).closed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn try_pop(&self) -> Option<ChannelEntry> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).queue.pop_front()
    }

    /// Blocks until an entry is available, the channel closes, or
    /// `deadline` elapses. `None` on close-with-empty-queue or timeout
    /// (spec §4.7 "Timeout. The consumer passes an absolute deadline to
    /// each pop").
    pub async fn pop(&self, deadline: std::time::Duration) -> Option<ChannelEntry> {
        let deadline = tokio::time::Instant::now() + deadline;
        loop {
            let notified = self.notify.notified();
            if let Some(entry) = self.try_pop() {
                return Some(entry);
            }
            if self.is_closed() {
                return None;
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() || timeout(remaining, notified).await.is_err() {
                return None;
            }
        }
    }
}

impl Default for Channel {
    fn default() -> Self {
        Self::new()
    }
}
