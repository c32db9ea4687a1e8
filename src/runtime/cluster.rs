// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Cluster (spec §3 `C8`, §4.4): a fixed pool of `N` `IORuntime`s with
//! round-robin assignment and topology broadcast.

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use crate::{
    error::CoordinatorError,
    reduce::resp::RespValue,
    topology::Topology,
    transport::connection::Transport,
};

use super::io_runtime::IORuntime;

pub struct Cluster<T: Transport> {
    runtimes: Vec<Arc<IORuntime<T>>>,
    rr_cursor: AtomicUsize,
}

impl<T: Transport + 'static> Cluster<T> {
    pub fn new(runtimes: Vec<Arc<IORuntime<T>>>) -> Self {
        assert!(!runtimes.is_empty(), "Cluster requires at least one IORuntime");
        Self { runtimes, rr_cursor: AtomicUsize::new(0) }
    }

    pub fn len(&self) -> usize {
        self.runtimes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runtimes.is_empty()
    }

    pub fn runtime(&self, index: usize) -> &Arc<IORuntime<T>> {
        &self.runtimes[index % self.runtimes.len()]
    }

    /// Round-robin selects the next `IORuntime` for a new request (spec
    /// §4.4 "returns the next runtime index and advances the cursor
    /// modulo N").
    pub fn next_runtime(&self) -> &Arc<IORuntime<T>> {
        let n = self.runtimes.len();
        let idx = self.rr_cursor.fetch_add(1, Ordering::Relaxed) % n;
        &self.runtimes[idx]
    }

    /// Broadcasts a topology to every runtime: the first N-1 get a cloned
    /// `Arc`, the last takes the original (spec §4.4 — in an `Arc` world
    /// this distinction is cosmetic, but the clone-then-move order is
    /// kept to mirror the original's explicit refcount handoff).
    pub fn broadcast_topology(&self, topo: Topology) {
        let topo = Arc::new(topo);
        let (last, rest) = self.runtimes.split_last().expect("non-empty cluster");
        for rt in rest {
            rt.publish_topology(Arc::clone(&topo));
        }
        last.publish_topology(topo);
    }

    pub fn all_ready(&self) -> bool {
        self.runtimes.iter().all(|rt| rt.is_ready())
    }

    /// Parses a shard's `CLUSTER SHARDS` reply into a `Topology` for a
    /// `CLUSTERREFRESH` caller (spec.md §6's native-discovery
    /// alternative to `CLUSTERSET`). Doesn't broadcast it — the caller
    /// wires up any newly discovered connections first, the same as it
    /// would for a hand-rolled `CLUSTERSET`, then calls
    /// `broadcast_topology`.
    pub fn refresh_from_shards_reply(&self, reply: &RespValue) -> Result<Topology, CoordinatorError> {
        Topology::from_cluster_shards_reply(reply).map_err(|e| CoordinatorError::ParseError(e.to_string()))
    }

    /// Reports the topology currently applied on this cluster's first
    /// runtime for a `CLUSTERINFO` caller (every runtime converges on the
    /// same topology via `broadcast_topology`, so any one of them answers
    /// for the whole cluster).
    pub async fn info_reply(&self) -> RespValue {
        let Some(topo) = self.runtimes[0].current_topology().await else {
            return RespValue::Map(vec![(
                RespValue::BulkString(b"num_shards".to_vec()),
                RespValue::Integer(0),
            )]);
        };

        let shards = topo
            .shards()
            .iter()
            .map(|shard| {
                let slots = shard
                    .slot_ranges
                    .iter()
                    .flat_map(|r| [RespValue::Integer(r.start as i64), RespValue::Integer(r.end as i64)])
                    .collect();
                RespValue::Map(vec![
                    (RespValue::BulkString(b"node_id".to_vec()), RespValue::BulkString(shard.node_id.clone().into_bytes())),
                    (RespValue::BulkString(b"host".to_vec()), RespValue::BulkString(shard.endpoint.host.clone().into_bytes())),
                    (RespValue::BulkString(b"port".to_vec()), RespValue::Integer(shard.endpoint.port as i64)),
                    (RespValue::BulkString(b"slots".to_vec()), RespValue::Array(slots)),
                ])
            })
            .collect();

        RespValue::Map(vec![
            (RespValue::BulkString(b"num_shards".to_vec()), RespValue::Integer(topo.num_shards() as i64)),
            (RespValue::BulkString(b"shards".to_vec()), RespValue::Array(shards)),
        ])
    }
}
