// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! AggregateReducer (spec §3 `C13`, §4.7 "WITHCOUNT barrier"): drives the
//! `Iterator` for `FT.AGGREGATE`, accumulating each shard's first-reply
//! total behind a barrier before any row is emitted.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};

use crate::cfg::enums::TimeoutPolicy;
use crate::error::CoordinatorError;

/// Synchronizes the first reply from every shard before the consumer is
/// allowed to emit rows, so `total_results` reflects every shard (spec
/// §4.7 "buffering early replies... barrier.notify(shard_id, total,
/// isError)").
pub struct CountBarrier {
    num_shards: usize,
    responded: AtomicUsize,
    accumulated_total: AtomicI64,
    has_shard_error: AtomicBool,
}

impl CountBarrier {
    pub fn new(num_shards: usize) -> Self {
        Self {
            num_shards,
            responded: AtomicUsize::new(0),
            accumulated_total: AtomicI64::new(0),
            has_shard_error: AtomicBool::new(false),
        }
    }

    /// Records one shard's first reply. `total` is ignored when
    /// `is_error` is set. Safe to call once per shard; a duplicate call
    /// would double-count, so callers must gate on each shard's own
    /// first-reply flag (the `Iterator`'s per-shard `depleted`/seen
    /// bookkeeping already enforces this upstream).
    pub fn notify(&self, total: i64, is_error: bool) {
        if is_error {
            self.has_shard_error.store(true, Ordering::Release);
        } else {
            self.accumulated_total.fetch_add(total, Ordering::AcqRel);
        }
        self.responded.fetch_add(1, Ordering::AcqRel);
    }

    pub fn is_complete(&self) -> bool {
        self.responded.load(Ordering::Acquire) >= self.num_shards
    }

    pub fn has_shard_error(&self) -> bool {
        self.has_shard_error.load(Ordering::Acquire)
    }

    pub fn accumulated_total(&self) -> i64 {
        self.accumulated_total.load(Ordering::Acquire)
    }

    /// The barrier's verdict once either the deadline elapses or every
    /// shard has responded (spec §4.7 "If the deadline elapses before
    /// all shards respond and no shard error occurred, the query is
    /// failed with TIMEOUT").
    pub fn resolve(&self, deadline_elapsed: bool) -> BarrierOutcome {
        if self.is_complete() {
            return BarrierOutcome::Total(self.accumulated_total());
        }
        if deadline_elapsed && !self.has_shard_error() {
            return BarrierOutcome::TimedOut;
        }
        BarrierOutcome::Waiting
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum BarrierOutcome {
    Waiting,
    Total(i64),
    TimedOut,
}

/// One row emitted by the aggregate pipeline: shard-opaque byte payload
/// passed through verbatim, the coordinator merges nothing row-level for
/// aggregates beyond ordering-by-arrival (spec §4.7; row shape is the
/// single-shard engine's concern, out of scope per spec §1).
pub type AggregateRow = Vec<u8>;

/// Accumulates streamed aggregate rows plus the WITHCOUNT barrier's
/// verdict into the final reply shape (spec §3 `C13`).
pub struct AggregateAccumulator {
    pub rows: Vec<AggregateRow>,
    pub barrier: Option<CountBarrier>,
    policy: TimeoutPolicy,
}

impl AggregateAccumulator {
    pub fn new(num_shards: usize, with_count: bool, policy: TimeoutPolicy) -> Self {
        Self {
            rows: Vec::new(),
            barrier: with_count.then(|| CountBarrier::new(num_shards)),
            policy,
        }
    }

    pub fn push_row(&mut self, row: AggregateRow) {
        self.rows.push(row);
    }

    /// Finalizes the accumulated rows into a reply. `deadline_elapsed`
    /// only matters when a WITHCOUNT barrier is in play (spec §4.7); a
    /// plain cursor stream with no WITHCOUNT has nothing to wait on.
    pub fn finish(self, deadline_elapsed: bool) -> Result<AggregateReply, CoordinatorError> {
        let total_results = match &self.barrier {
            None => None,
            Some(barrier) => match barrier.resolve(deadline_elapsed) {
                BarrierOutcome::Total(t) => Some(t),
                BarrierOutcome::TimedOut => return Err(CoordinatorError::TimeoutHard),
                BarrierOutcome::Waiting => match self.policy {
                    TimeoutPolicy::Strict => return Err(CoordinatorError::TimeoutHard),
                    TimeoutPolicy::Relaxed => Some(barrier.accumulated_total()),
                },
            },
        };
        Ok(AggregateReply { rows: self.rows, total_results })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateReply {
    pub rows: Vec<AggregateRow>,
    pub total_results: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn barrier_waits_until_every_shard_responds() {
        let barrier = CountBarrier::new(2);
        assert_eq!(barrier.resolve(false), BarrierOutcome::Waiting);
        barrier.notify(40, false);
        assert_eq!(barrier.resolve(false), BarrierOutcome::Waiting);
        barrier.notify(60, false);
        assert_eq!(barrier.resolve(false), BarrierOutcome::Total(100));
    }

    #[test]
    fn barrier_times_out_without_shard_error() {
        let barrier = CountBarrier::new(2);
        barrier.notify(40, false);
        assert_eq!(barrier.resolve(true), BarrierOutcome::TimedOut);
    }

    #[test]
    fn barrier_keeps_waiting_past_deadline_if_a_shard_errored() {
        let barrier = CountBarrier::new(2);
        barrier.notify(0, true);
        assert_eq!(barrier.resolve(true), BarrierOutcome::Waiting);
        assert!(barrier.has_shard_error());
    }

    #[test]
    fn accumulator_with_count_emits_summed_total() {
        let mut acc = AggregateAccumulator::new(2, true, TimeoutPolicy::Strict);
        acc.push_row(b"row1".to_vec());
        if let Some(barrier) = &acc.barrier {
            barrier.notify(40, false);
            barrier.notify(60, false);
        }
        let reply = acc.finish(false).expect("completes");
        assert_eq!(reply.total_results, Some(100));
        assert_eq!(reply.rows.len(), 1);
    }

    #[test]
    fn accumulator_strict_policy_fails_hard_on_incomplete_barrier() {
        let mut acc = AggregateAccumulator::new(2, true, TimeoutPolicy::Strict);
        if let Some(barrier) = &acc.barrier {
            barrier.notify(40, false);
        }
        let err = acc.finish(true).unwrap_err();
        assert_eq!(err, CoordinatorError::TimeoutHard);
    }

    #[test]
    fn accumulator_relaxed_policy_emits_partial_total_on_incomplete_barrier() {
        let mut acc = AggregateAccumulator::new(2, true, TimeoutPolicy::Relaxed);
        if let Some(barrier) = &acc.barrier {
            barrier.notify(40, false);
        }
        let reply = acc.finish(false).expect("relaxed still completes");
        assert_eq!(reply.total_results, Some(40));
    }

    #[test]
    fn accumulator_without_withcount_has_no_total() {
        let mut acc = AggregateAccumulator::new(2, false, TimeoutPolicy::Strict);
        acc.push_row(b"row".to_vec());
        let reply = acc.finish(false).expect("completes");
        assert_eq!(reply.total_results, None);
    }
}
