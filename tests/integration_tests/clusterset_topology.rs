// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use search_coord::{
    command::{Command, RootCommand},
    reduce::resp::RespValue,
    topology::Topology,
    transport::{Connection, ConnectionManager, TcpTransport},
};
use tokio_util::sync::CancellationToken;

use super::common::{encode_array, spawn_fake_shard};

#[tokio::test]
async fn from_clusterset_args_builds_topology_and_wires_connections() {
    let addr = spawn_fake_shard(encode_array(&[
        RespValue::BulkString(b"index_name".to_vec()),
        RespValue::BulkString(b"idx".to_vec()),
    ]))
    .await;

    let host = addr.ip().to_string();
    let port = addr.port().to_string();
    let args = vec!["SHARD", "shard-0", host.as_str(), port.as_str(), "0", "16383", "ENDSHARD"];
    let topology = Topology::from_clusterset_args(&args).expect("valid CLUSTERSET args");
    assert_eq!(topology.num_shards(), 1);
    assert_eq!(topology.node_ids().collect::<Vec<_>>(), vec!["shard-0"]);

    let mut manager = ConnectionManager::<TcpTransport>::new(1);
    for shard in topology.shards() {
        let node_id = shard.node_id.clone();
        let endpoint = shard.endpoint.clone();
        manager.add(&node_id, &endpoint, move |e| Connection::new(e, TcpTransport::new(None)));
    }
    assert!(manager.contains("shard-0"));

    let conn = manager.get("shard-0").expect("pool has a connection");
    conn.drive(&CancellationToken::new()).await.expect("connects to fake shard");
    assert!(conn.is_connected());

    let reply = conn
        .send(&Command::new("FT.INFO", RootCommand::Read).arg("idx"))
        .await
        .expect("shard replies");
    let (value, _) = search_coord::reduce::resp::parse(&reply).expect("valid RESP reply");
    assert_eq!(value.get_key("index_name"), Some(&RespValue::BulkString(b"idx".to_vec())));
}

#[test]
fn from_clusterset_args_rejects_missing_endshard() {
    let args = vec!["SHARD", "shard-0", "127.0.0.1", "7000", "0", "16383"];
    assert!(Topology::from_clusterset_args(&args).is_err());
}
