// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! RequestContext (spec §3 `C9`): one per dispatched query, tracking
//! fan-in completion over a reply slab that grows by doubling.

use crate::error::CoordinatorError;

/// A single shard's outcome: either its raw reply bytes or an error.
pub type ShardOutcome = Result<Vec<u8>, CoordinatorError>;

/// Fan-in tracker for one dispatched query. `replied + errored <=
/// expected` always holds; the context is "complete" exactly when they're
/// equal (spec §8 invariant 1).
pub struct RequestContext {
    replies: Vec<Option<ShardOutcome>>,
    expected: usize,
    replied: usize,
    errored: usize,
    completed: bool,
}

impl RequestContext {
    pub fn new(expected_hint: usize) -> Self {
        Self {
            replies: Vec::with_capacity(expected_hint.max(1)),
            expected: 0,
            replied: 0,
            errored: 0,
            completed: false,
        }
    }

    /// Reserves one more expected reply slot, growing the backing slab by
    /// doubling when it runs out of room (spec §3 "oversized on demand,
    /// doubling").
    pub fn reserve_slot(&mut self) -> usize {
        let idx = self.expected;
        self.expected += 1;
        if idx >= self.replies.len() {
            let new_cap = (self.replies.len() * 2).max(1).max(self.expected);
            self.replies.resize_with(new_cap, || None);
        }
        idx
    }

    /// Records a shard's outcome at `slot`. Returns `true` exactly once,
    /// the moment this reply makes the context complete
    /// (`replied + errored == expected`).
    pub fn record(&mut self, slot: usize, outcome: ShardOutcome) -> bool {
        debug_assert!(self.replies[slot].is_none(), "slot recorded twice");
        match &outcome {
            Ok(_) => self.replied += 1,
            Err(_) => self.errored += 1,
        }
        self.replies[slot] = Some(outcome);

        debug_assert!(self.replied + self.errored <= self.expected);
        if !self.completed && self.replied + self.errored == self.expected {
            self.completed = true;
            return true;
        }
        false
    }

    pub fn is_complete(&self) -> bool {
        self.completed
    }

    pub fn expected(&self) -> usize {
        self.expected
    }

    pub fn replied(&self) -> usize {
        self.replied
    }

    pub fn errored(&self) -> usize {
        self.errored
    }

    /// Outcomes for every reserved slot, in slot order, once complete.
    pub fn outcomes(&self) -> impl Iterator<Item = &ShardOutcome> {
        self.replies[..self.expected].iter().filter_map(|o| o.as_ref())
    }

    /// First shard error, if any, used for fanout short-circuit forwarding
    /// (spec §7 `ShardError`).
    pub fn first_error(&self) -> Option<&CoordinatorError> {
        self.outcomes().find_map(|o| o.as_ref().err())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completes_exactly_once_when_counts_match() {
        let mut ctx = RequestContext::new(2);
        let s0 = ctx.reserve_slot();
        let s1 = ctx.reserve_slot();
        assert!(!ctx.record(s0, Ok(b"a".to_vec())));
        assert!(ctx.record(s1, Ok(b"b".to_vec())));
        assert!(ctx.is_complete());
    }

    #[test]
    fn doubling_growth_accommodates_many_slots() {
        let mut ctx = RequestContext::new(1);
        let slots: Vec<usize> = (0..10).map(|_| ctx.reserve_slot()).collect();
        for s in slots {
            ctx.record(s, Ok(Vec::new()));
        }
        assert_eq!(ctx.replied(), 10);
        assert!(ctx.is_complete());
    }

    #[test]
    fn first_error_is_earliest_by_slot_order() {
        let mut ctx = RequestContext::new(3);
        let s0 = ctx.reserve_slot();
        let s1 = ctx.reserve_slot();
        let s2 = ctx.reserve_slot();
        ctx.record(s1, Err(CoordinatorError::Oom));
        ctx.record(s0, Ok(Vec::new()));
        ctx.record(s2, Err(CoordinatorError::ClusterDown));
        assert_eq!(ctx.first_error(), Some(&CoordinatorError::Oom));
    }
}
