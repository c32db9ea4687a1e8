// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! A single shard entry within a [`super::Topology`] (spec §3 `Shard`),
//! grounded on `MRClusterShard`/`MRClusterTopology` in
//! `rmr/cluster_topology.c`.

use super::Endpoint;

/// Inclusive hash-slot range owned by a shard. Ranges across a topology
/// must be pairwise disjoint (enforced by `Topology::new`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotRange {
    pub start: u16,
    pub end: u16,
}

impl SlotRange {
    pub fn new(start: u16, end: u16) -> anyhow::Result<Self> {
        anyhow::ensure!(start <= end, "slot range start {start} > end {end}");
        Ok(Self { start, end })
    }

    pub fn contains(&self, slot: u16) -> bool {
        (self.start..=self.end).contains(&slot)
    }
}

/// One shard: its stable node id, dial target, and the slot ranges it
/// currently owns. `node_id` is what `Topology::new` sorts by, since it
/// stays stable across slot migrations while slot ranges move.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shard {
    pub node_id: String,
    pub endpoint: Endpoint,
    pub slot_ranges: Vec<SlotRange>,
}

impl Shard {
    pub fn owns_slot(&self, slot: u16) -> bool {
        self.slot_ranges.iter().any(|r| r.contains(slot))
    }
}
