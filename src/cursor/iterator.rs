// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Iterator / MRIterator (spec §3 `C11`, §4.7, §4.8, §4.9): streams
//! cursor replies across every shard for `FT.AGGREGATE`, owns DEL
//! teardown, and implements the reader/writer ref-counted release
//! protocol.

use std::sync::{
    Arc,
    atomic::{AtomicI8, AtomicUsize, Ordering},
};

use crate::command::Command;

use super::channel::Channel;

/// `ref_count` starts at 2: one ref for the reader (consumer thread) and
/// one collective ref for the writer side (outstanding shard callbacks).
/// It reaches 0 exactly once (spec §8 invariant 4).
const INITIAL_REF_COUNT: i8 = 2;

/// Per-shard cursor state tracked by the iterator (spec §3 "per_shard_commands").
struct ShardCursor {
    command: Command,
    depleted: bool,
}

/// Streams replies from a fanned-out cursor command across all shards.
pub struct Iterator {
    pub channel: Arc<Channel>,
    shards: Vec<std::sync::Mutex<ShardCursor>>,
    pending: AtomicUsize,
    in_process: AtomicUsize,
    ref_count: AtomicI8,
    timed_out: std::sync::atomic::AtomicBool,
}

impl Iterator {
    /// Creates an iterator with `pending = in_process = per_shard_commands.len()`
    /// (spec §4.7 "`iterate` creates an Iterator with pending = numShards,
    /// in_process = numShards").
    pub fn new(per_shard_commands: Vec<Command>) -> Arc<Self> {
        let n = per_shard_commands.len();
        Arc::new(Self {
            channel: Arc::new(Channel::new()),
            shards: per_shard_commands
                .into_iter()
                .map(|command| std::sync::Mutex::new(ShardCursor { command, depleted: false }))
                .collect(),
            pending: AtomicUsize::new(n),
            in_process: AtomicUsize::new(n),
            ref_count: AtomicI8::new(INITIAL_REF_COUNT),
            timed_out: std::sync::atomic::AtomicBool::new(false),
        })
    }

    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    pub fn in_process(&self) -> usize {
        self.in_process.load(Ordering::Acquire)
    }

    pub fn is_timed_out(&self) -> bool {
        self.timed_out.load(Ordering::Acquire)
    }

    pub fn mark_timed_out(&self) {
        self.timed_out.store(true, Ordering::Release);
    }

    /// Called once per shard reply. `eof` is true when the reply's cursor
    /// id is 0 (spec §4.7 "Reply callback"). Returns `true` when
    /// `in_process` just reached 0, the consumer's unblock signal.
    pub fn on_shard_reply(&self, shard_index: usize, eof: bool) -> bool {
        if eof {
            let mut cursor = self.shards[shard_index].lock().unwrap_or_else(|e| e.into_inner());
            cursor.depleted = true;
            drop(cursor);
            if self.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
                // spec §4.9: Active --channel closed & pending=0--> Drained.
                // Every shard is depleted with nothing in flight: the writer
                // side's collective ref is released here, not on reader
                // release.
                self.drop_ref();
            }
        }
        self.in_process.fetch_sub(1, Ordering::AcqRel) == 1
    }

    /// Spec §4.7 "Manual trigger" (`MaybeTriggerNext`). Returns commands
    /// to dispatch for the next round, or `None` when there is nothing to
    /// do yet (work in flight) or nothing left (drained).
    pub fn maybe_trigger_next(&self, threshold: usize) -> TriggerOutcome {
        if self.in_process() > 0 {
            return TriggerOutcome::InFlight;
        }
        if self.channel.len() > threshold {
            return TriggerOutcome::MoreComing;
        }
        let pending = self.pending();
        if pending > 0 {
            self.in_process.store(pending, Ordering::Release);
            let commands = self.next_round_commands();
            return TriggerOutcome::Dispatch(commands);
        }
        TriggerOutcome::Drained { channel_has_data: !self.channel.is_empty() }
    }

    fn next_round_commands(&self) -> Vec<(usize, Command)> {
        let timed_out = self.is_timed_out();
        self.shards
            .iter()
            .enumerate()
            .filter_map(|(i, cursor)| {
                let mut cursor = cursor.lock().unwrap_or_else(|e| e.into_inner());
                if cursor.depleted {
                    return None;
                }
                if timed_out {
                    cursor.command.rewrite_cursor_to_del();
                }
                Some((i, cursor.command.clone()))
            })
            .collect()
    }

    /// Reader-side release (spec §4.7 "Teardown"). If shards remain
    /// undepleted, rewrites each to `CURSOR DEL` and returns the final
    /// flight to dispatch, keeping the writer ref alive until those DELs
    /// land. Otherwise drops straight to 0.
    pub fn release(self: &Arc<Self>) -> ReleaseOutcome {
        if self.pending() == 0 {
            return match self.drop_ref() {
                true => ReleaseOutcome::Freed,
                false => ReleaseOutcome::Pending,
            };
        }

        let final_flight: Vec<(usize, Command)> = self
            .shards
            .iter()
            .enumerate()
            .filter_map(|(i, cursor)| {
                let mut cursor = cursor.lock().unwrap_or_else(|e| e.into_inner());
                if cursor.depleted {
                    return None;
                }
                cursor.command.rewrite_cursor_to_del();
                Some((i, cursor.command.clone()))
            })
            .collect();

        self.drop_ref();
        ReleaseOutcome::DelInFlight(final_flight)
    }

    /// Drops one reference, returning `true` iff this call brought the
    /// count to 0 (spec §8 invariant 4: "reaches 0 exactly once").
    pub fn drop_ref(&self) -> bool {
        let prev = self.ref_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "Iterator ref_count went negative");
        if prev == 1 {
            self.channel.close();
            true
        } else {
            false
        }
    }

    pub fn ref_count(&self) -> i8 {
        self.ref_count.load(Ordering::Acquire)
    }
}

#[derive(Debug)]
pub enum TriggerOutcome {
    InFlight,
    MoreComing,
    Dispatch(Vec<(usize, Command)>),
    Drained { channel_has_data: bool },
}

#[derive(Debug)]
pub enum ReleaseOutcome {
    Freed,
    Pending,
    DelInFlight(Vec<(usize, Command)>),
}
