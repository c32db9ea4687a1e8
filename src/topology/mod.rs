// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Shard-set snapshot (spec §3 `Topology`, §4.4 `Cluster`, §6.3 wire
//! formats). A `Topology` is built once, shared by `Arc`, and never
//! mutated — a new topology replaces the old one wholesale.

pub mod endpoint;
pub mod shard;

pub use endpoint::Endpoint;
pub use shard::{Shard, SlotRange};

use std::sync::Arc;

use anyhow::{Context, Result, bail};

/// Immutable snapshot of `{shard -> (node id, endpoint, slot ranges)}`
/// (spec §3). Cloning is cheap: wrap in `Arc<Topology>` before sharing
/// across `IORuntime`s.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Topology {
    shards: Vec<Shard>,
}

impl Topology {
    /// Builds a topology from an ordered shard list, sorted by node id the
    /// way `MRClusterTopology_SortShards` does in the original coordinator
    /// — nodes are stable while slots migrate, so sorting by node id gives
    /// deterministic shard indices across refreshes that only move slots.
    pub fn new(mut shards: Vec<Shard>) -> Result<Self> {
        shards.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        Self::validate_disjoint_slots(&shards)?;
        Ok(Self { shards })
    }

    fn validate_disjoint_slots(shards: &[Shard]) -> Result<()> {
        let mut ranges: Vec<&SlotRange> =
            shards.iter().flat_map(|s| s.slot_ranges.iter()).collect();
        ranges.sort_by_key(|r| r.start);
        for w in ranges.windows(2) {
            if w[0].end >= w[1].start {
                bail!(
                    "overlapping slot ranges: [{}, {}] and [{}, {}]",
                    w[0].start,
                    w[0].end,
                    w[1].start,
                    w[1].end
                );
            }
        }
        Ok(())
    }

    /// Number of shards in this topology. `0` means no topology has ever
    /// been established (spec §7 `ClusterDown`).
    pub fn num_shards(&self) -> usize {
        self.shards.len()
    }

    pub fn shards(&self) -> &[Shard] {
        &self.shards
    }

    pub fn shard(&self, index: usize) -> Option<&Shard> {
        self.shards.get(index)
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }

    /// Node ids present in this topology, used by `IORuntime` topology
    /// application (spec §4.3) to diff added/removed masters.
    pub fn node_ids(&self) -> impl Iterator<Item = &str> {
        self.shards.iter().map(|s| s.node_id.as_str())
    }

    /// Resolves the shard index owning a given slot, used for per-shard
    /// slot-range injection into dispatched commands (spec §3 `Command`).
    pub fn shard_for_slot(&self, slot: u16) -> Option<usize> {
        self.shards
            .iter()
            .position(|s| s.slot_ranges.iter().any(|r| r.contains(slot)))
    }

    /// Parses an explicit `CLUSTERSET` argument vector into a `Topology`
    /// (spec §6.1, §6.3). Shape: repeated groups of
    /// `SHARD <node_id> <host> <port> <slot_start> <slot_end> [<slot_start> <slot_end> ...] ENDSHARD`.
    /// This mirrors the original module's hand-rolled CLUSTERSET argument
    /// parser in `module.c`, simplified to the fields this coordinator
    /// needs.
    pub fn from_clusterset_args(args: &[&str]) -> Result<Self> {
        let mut shards = Vec::new();
        let mut i = 0;
        while i < args.len() {
            if args[i] != "SHARD" {
                bail!("expected SHARD, got {:?} at position {i}", args.get(i));
            }
            let node_id = args.get(i + 1).context("missing node id")?.to_string();
            let host = args.get(i + 2).context("missing host")?.to_string();
            let port: u16 = args
                .get(i + 3)
                .context("missing port")?
                .parse()
                .context("invalid port")?;
            i += 4;

            let mut slot_ranges = Vec::new();
            loop {
                match args.get(i) {
                    Some(&"ENDSHARD") => {
                        i += 1;
                        break;
                    },
                    Some(start_str) => {
                        let start: u16 = start_str.parse().context("invalid slot start")?;
                        let end: u16 = args
                            .get(i + 1)
                            .context("missing slot end")?
                            .parse()
                            .context("invalid slot end")?;
                        slot_ranges.push(SlotRange::new(start, end)?);
                        i += 2;
                    },
                    None => bail!("unterminated SHARD block (missing ENDSHARD)"),
                }
            }

            shards.push(Shard {
                node_id,
                endpoint: Endpoint::new(host, port),
                slot_ranges,
            });
        }
        Topology::new(shards)
    }

    /// Parses a `CLUSTER SHARDS` reply into a `Topology`, keeping each
    /// shard's master node and dropping any shard with no slots or no
    /// reachable master — the discovery path spec.md §6 prefers over a
    /// hand-rolled `CLUSTERSET` for clusters that already expose native
    /// slot ownership. Grounded on `redis_cluster.c`'s
    /// `RedisCluster_GetTopology` (`parseSlots`/`parseMasterNode`).
    pub fn from_cluster_shards_reply(reply: &crate::reduce::resp::RespValue) -> Result<Self> {
        use crate::reduce::resp::RespValue;

        fn to_pairs(value: &RespValue) -> Option<Vec<(RespValue, RespValue)>> {
            if let Some(m) = value.as_map() {
                return Some(m.to_vec());
            }
            let arr = value.as_array()?;
            if arr.is_empty() || arr.len() % 2 != 0 {
                return None;
            }
            Some(arr.chunks_exact(2).map(|c| (c[0].clone(), c[1].clone())).collect())
        }

        fn find_pair<'a>(pairs: &'a [(RespValue, RespValue)], key: &str) -> Option<&'a RespValue> {
            pairs
                .iter()
                .find(|(k, _)| k.as_bulk_str().is_some_and(|b| b == key.as_bytes()))
                .map(|(_, v)| v)
        }

        let entries = reply.as_array().context("CLUSTER SHARDS reply is not an array")?;
        let mut shards = Vec::new();

        for entry in entries {
            let Some(pairs) = to_pairs(entry) else { continue };

            let Some(slots) = find_pair(&pairs, "slots").and_then(RespValue::as_array) else { continue };
            if slots.is_empty() || slots.len() % 2 != 0 {
                continue;
            }
            let mut slot_ranges = Vec::new();
            let mut valid = true;
            for pair in slots.chunks_exact(2) {
                match (pair[0].as_i64(), pair[1].as_i64()) {
                    (Some(start), Some(end)) => match SlotRange::new(start as u16, end as u16) {
                        Ok(r) => slot_ranges.push(r),
                        Err(_) => {
                            valid = false;
                            break;
                        },
                    },
                    _ => {
                        valid = false;
                        break;
                    },
                }
            }
            if !valid || slot_ranges.is_empty() {
                continue;
            }

            let Some(nodes) = find_pair(&pairs, "nodes").and_then(RespValue::as_array) else { continue };
            let mut master = None;
            for node in nodes {
                let Some(node_pairs) = to_pairs(node) else { continue };
                let is_master = find_pair(&node_pairs, "role")
                    .and_then(RespValue::as_bulk_str)
                    .is_some_and(|r| r == b"master");
                if !is_master {
                    continue;
                }
                let id = find_pair(&node_pairs, "id")
                    .and_then(RespValue::as_bulk_str)
                    .map(|b| String::from_utf8_lossy(b).to_string());
                let ip = find_pair(&node_pairs, "ip")
                    .and_then(RespValue::as_bulk_str)
                    .map(|b| String::from_utf8_lossy(b).to_string());
                let port = find_pair(&node_pairs, "port").and_then(RespValue::as_i64);
                let tls_port = find_pair(&node_pairs, "tls-port").and_then(RespValue::as_i64);
                if let (Some(id), Some(ip), Some(port)) = (id, ip, port) {
                    master = Some((id, ip, port as u16, tls_port.map(|p| p as u16)));
                }
                break;
            }

            let Some((node_id, ip, port, tls_port)) = master else { continue };
            let mut endpoint = Endpoint::new(ip, port);
            if let Some(tls_port) = tls_port {
                endpoint = endpoint.with_tls_port(tls_port);
            }
            shards.push(Shard { node_id, endpoint, slot_ranges });
        }

        Topology::new(shards)
    }
}

/// A handoff slot that always holds the latest published topology, cleared
/// by the reader. Mirrors spec §3 `IORuntime.pending_topology` (an atomic
/// exchange carrying a topology from any thread to the reactor).
#[derive(Default)]
pub struct PendingTopology {
    inner: std::sync::Mutex<Option<Arc<Topology>>>,
}

impl PendingTopology {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes a new topology, discarding whatever was previously
    /// pending-and-unapplied (spec §5 "the atomic pending_topology slot
    /// always holds the latest; intermediate topologies are dropped").
    pub fn publish(&self, topo: Arc<Topology>) {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        *guard = Some(topo);
    }

    /// Atomically takes whatever topology is pending, if any.
    pub fn take(&self) -> Option<Arc<Topology>> {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        guard.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shard(id: &str, start: u16, end: u16) -> Shard {
        Shard {
            node_id: id.to_string(),
            endpoint: Endpoint::new("127.0.0.1".to_string(), 6379),
            slot_ranges: vec![SlotRange::new(start, end).expect("valid range")],
        }
    }

    #[test]
    fn rejects_overlapping_slot_ranges() {
        let err = Topology::new(vec![shard("b", 0, 100), shard("a", 50, 150)]).unwrap_err();
        assert!(err.to_string().contains("overlapping"));
    }

    #[test]
    fn sorts_shards_by_node_id() {
        let topo = Topology::new(vec![shard("zzz", 8192, 16383), shard("aaa", 0, 8191)])
            .expect("valid");
        assert_eq!(topo.shard(0).unwrap().node_id, "aaa");
        assert_eq!(topo.shard(1).unwrap().node_id, "zzz");
    }

    #[test]
    fn shard_for_slot_finds_owning_shard() {
        let topo = Topology::new(vec![shard("a", 0, 8191), shard("b", 8192, 16383)])
            .expect("valid");
        assert_eq!(topo.shard_for_slot(0), Some(0));
        assert_eq!(topo.shard_for_slot(16383), Some(1));
        assert_eq!(topo.shard_for_slot(16384), None);
    }

    #[test]
    fn clusterset_args_round_trip() {
        let args = [
            "SHARD", "nodeA", "10.0.0.1", "6379", "0", "8191", "ENDSHARD", "SHARD", "nodeB",
            "10.0.0.2", "6379", "8192", "16383", "ENDSHARD",
        ];
        let topo = Topology::from_clusterset_args(&args).expect("parses");
        assert_eq!(topo.num_shards(), 2);
    }

    #[test]
    fn cluster_shards_reply_keeps_master_and_drops_replicas() {
        use crate::reduce::resp::RespValue as R;

        fn node(id: &str, ip: &str, port: i64, role: &str) -> R {
            R::Map(vec![
                (R::BulkString(b"id".to_vec()), R::BulkString(id.as_bytes().to_vec())),
                (R::BulkString(b"ip".to_vec()), R::BulkString(ip.as_bytes().to_vec())),
                (R::BulkString(b"port".to_vec()), R::Integer(port)),
                (R::BulkString(b"role".to_vec()), R::BulkString(role.as_bytes().to_vec())),
            ])
        }

        let reply = R::Array(vec![R::Map(vec![
            (
                R::BulkString(b"slots".to_vec()),
                R::Array(vec![R::Integer(0), R::Integer(16383)]),
            ),
            (
                R::BulkString(b"nodes".to_vec()),
                R::Array(vec![
                    node("master-1", "127.0.0.1", 7000, "master"),
                    node("replica-1", "127.0.0.1", 7001, "replica"),
                ]),
            ),
        ])]);

        let topo = Topology::from_cluster_shards_reply(&reply).expect("parses");
        assert_eq!(topo.num_shards(), 1);
        let shard = topo.shard(0).expect("one shard");
        assert_eq!(shard.node_id, "master-1");
        assert_eq!(shard.endpoint.port, 7000);
    }

    #[test]
    fn cluster_shards_reply_captures_tls_port_when_advertised() {
        use crate::reduce::resp::RespValue as R;

        let node = R::Map(vec![
            (R::BulkString(b"id".to_vec()), R::BulkString(b"master-1".to_vec())),
            (R::BulkString(b"ip".to_vec()), R::BulkString(b"127.0.0.1".to_vec())),
            (R::BulkString(b"port".to_vec()), R::Integer(7000)),
            (R::BulkString(b"tls-port".to_vec()), R::Integer(7001)),
            (R::BulkString(b"role".to_vec()), R::BulkString(b"master".to_vec())),
        ]);
        let reply = R::Array(vec![R::Map(vec![
            (R::BulkString(b"slots".to_vec()), R::Array(vec![R::Integer(0), R::Integer(16383)])),
            (R::BulkString(b"nodes".to_vec()), R::Array(vec![node])),
        ])]);

        let topo = Topology::from_cluster_shards_reply(&reply).expect("parses");
        let shard = topo.shard(0).expect("one shard");
        assert_eq!(shard.endpoint.port, 7000);
        assert_eq!(shard.endpoint.tls_port, Some(7001));
        assert_eq!(shard.endpoint.dial_port(true), 7001);
        assert_eq!(shard.endpoint.dial_port(false), 7000);
    }

    #[test]
    fn cluster_shards_reply_skips_shards_with_no_slots() {
        use crate::reduce::resp::RespValue as R;

        let reply = R::Array(vec![R::Map(vec![
            (R::BulkString(b"slots".to_vec()), R::Array(vec![])),
            (R::BulkString(b"nodes".to_vec()), R::Array(vec![])),
        ])]);

        let topo = Topology::from_cluster_shards_reply(&reply).expect("parses");
        assert!(topo.is_empty());
    }

    #[test]
    fn pending_topology_keeps_only_latest() {
        let slot = PendingTopology::new();
        slot.publish(Arc::new(Topology::new(vec![shard("a", 0, 100)]).expect("valid")));
        slot.publish(Arc::new(Topology::new(vec![shard("b", 0, 100)]).expect("valid")));
        let taken = slot.take().expect("one pending");
        assert_eq!(taken.shard(0).unwrap().node_id, "b");
        assert!(slot.take().is_none());
    }
}
