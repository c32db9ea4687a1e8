// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use search_coord::{
    command::{Command, RootCommand},
    dispatch::dispatch_fanout,
    reduce::{
        resp::RespValue,
        search::{SearchFlags, TopKHeap, parse_shard_reply},
    },
    topology::{Endpoint, Shard, SlotRange, Topology},
    transport::{Connection, ConnectionManager, TcpTransport},
};
use tokio_util::sync::CancellationToken;

use super::common::{encode_array, spawn_fake_shard};

fn search_reply(doc_id: &str, score: &str) -> Vec<u8> {
    encode_array(&[
        RespValue::Integer(1),
        RespValue::BulkString(doc_id.as_bytes().to_vec()),
        RespValue::BulkString(score.as_bytes().to_vec()),
    ])
}

#[tokio::test]
async fn fanout_search_merges_top_results_across_shards() {
    let addr_a = spawn_fake_shard(search_reply("doc:a", "5.0")).await;
    let addr_b = spawn_fake_shard(search_reply("doc:b", "9.0")).await;

    let topology = Topology::new(vec![
        Shard {
            node_id: "shard-a".to_string(),
            endpoint: Endpoint::new(addr_a.ip().to_string(), addr_a.port()),
            slot_ranges: vec![SlotRange::new(0, 8191).expect("valid range")],
        },
        Shard {
            node_id: "shard-b".to_string(),
            endpoint: Endpoint::new(addr_b.ip().to_string(), addr_b.port()),
            slot_ranges: vec![SlotRange::new(8192, 16383).expect("valid range")],
        },
    ])
    .expect("valid topology");

    let mut manager = ConnectionManager::<TcpTransport>::new(1);
    for shard in topology.shards() {
        let node_id = shard.node_id.clone();
        let endpoint = shard.endpoint.clone();
        manager.add(&node_id, &endpoint, move |e| Connection::new(e, TcpTransport::new(None)));
    }
    for node_id in topology.node_ids().collect::<Vec<_>>() {
        let conn = manager.get(node_id).expect("pool exists");
        conn.drive(&CancellationToken::new()).await.expect("connects to fake shard");
    }

    let command = Command::new("FT.SEARCH", RootCommand::Read).arg("idx").arg("*").arg("WITHSCORES");
    let ctx = dispatch_fanout(&topology, &mut manager, &command).await;
    assert!(ctx.is_complete());
    assert_eq!(ctx.expected(), 2);

    let mut heap = TopKHeap::new(10, false, false);
    let mut total = 0i64;
    for outcome in ctx.outcomes() {
        let raw = outcome.as_ref().expect("shard succeeded");
        let (value, _) = search_coord::reduce::resp::parse(raw).expect("valid RESP reply");
        let (shard_total, results) =
            parse_shard_reply(&value, SearchFlags { with_scores: true, ..SearchFlags::default() })
                .expect("valid shard reply");
        total += shard_total;
        for r in results {
            heap.push(r);
        }
    }

    assert_eq!(total, 2);
    let merged = heap.into_sorted_best_first();
    assert_eq!(merged.len(), 2);
    assert_eq!(merged[0].doc_id, b"doc:b");
    assert_eq!(merged[1].doc_id, b"doc:a");
}
