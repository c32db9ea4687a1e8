// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Cursor mappings for hybrid/vsim pulls (spec §4.8): the producer side
//! knows only a subset of shards that carry a cursor, shared with the
//! `Iterator` through a weak-ref promotion so a producer that tears down
//! first never leaves the iterator dispatching into nothing.

use std::sync::{Arc, Mutex, Weak};

use crate::command::Command;

/// One shard's cursor id as known by the hybrid producer.
#[derive(Debug, Clone, Copy)]
pub struct ShardCursorMapping {
    pub shard_id: i32,
    pub cursor_id: i64,
}

/// The producer-owned strong source of truth. Dropping or invalidating
/// it tears down any iterator still holding a weak reference (spec §4.8
/// "If the mapping source has been invalidated by the time the start
/// callback fires, release and tear down without any shard dispatch").
pub struct MappingSource {
    inner: Arc<Mutex<Option<Vec<ShardCursorMapping>>>>,
}

impl MappingSource {
    pub fn new(mappings: Vec<ShardCursorMapping>) -> Self {
        Self { inner: Arc::new(Mutex::new(Some(mappings))) }
    }

    /// Hands the iterator a weak reference; the iterator never keeps the
    /// producer alive past the producer's own lifetime.
    pub fn weak(&self) -> Weak<Mutex<Option<Vec<ShardCursorMapping>>>> {
        Arc::downgrade(&self.inner)
    }

    pub fn invalidate(&self) {
        *self.inner.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }
}

/// Builds the per-shard start flight for a hybrid pull by substituting
/// each mapping's cursor id into `base`'s reserved slot argument (spec
/// §4.8 "clone the base command for each mapping, set target shard and
/// substitute the cursor id placeholder, then dispatch"). Returns `None`
/// when the mapping source has gone away or been invalidated, signaling
/// the caller to release and tear down without dispatching anything.
pub fn build_start_commands(
    base: &Command,
    mapping: &Weak<Mutex<Option<Vec<ShardCursorMapping>>>>,
) -> Option<Vec<(usize, Command)>> {
    let strong = mapping.upgrade()?;
    let guard = strong.lock().unwrap_or_else(|e| e.into_inner());
    let mappings = guard.as_ref()?;

    Some(
        mappings
            .iter()
            .enumerate()
            .map(|(i, m)| {
                let mut cmd = base.clone_for_shard(m.shard_id);
                cmd.set_shard_slot(m.cursor_id.to_string());
                (i, cmd)
            })
            .collect(),
    )
}
