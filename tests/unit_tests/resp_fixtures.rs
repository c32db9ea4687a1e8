// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::fs;

use search_coord::reduce::{
    admin::reduce_info,
    resp::{self, RespValue},
    search::{SearchFlags, parse_shard_reply},
};

fn load_fixture(name: &str) -> Vec<u8> {
    fs::read(format!("tests/fixtures/{name}")).expect("fixture exists")
}

#[test]
fn parses_resp2_search_shard_reply_fixture() {
    let buf = load_fixture("ft_search_resp2_shard_reply.resp");
    let (value, consumed) = resp::parse(&buf).expect("parses");
    assert_eq!(consumed, buf.len());

    let flags = SearchFlags { with_scores: true, ..SearchFlags::default() };
    let (total, results) = parse_shard_reply(&value, flags).expect("valid shard reply");
    assert_eq!(total, 2);
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].doc_id, b"doc:1");
    assert_eq!(results[0].score, 10.5);
}

#[test]
fn parses_resp3_search_shard_reply_fixture() {
    let buf = load_fixture("ft_search_resp3_shard_reply.resp");
    let (value, consumed) = resp::parse(&buf).expect("parses");
    assert_eq!(consumed, buf.len());
    assert!(value.as_map().is_some(), "RESP3 shard replies parse to a Map");

    let (total, results) = parse_shard_reply(&value, SearchFlags::default()).expect("valid shard reply");
    assert_eq!(total, 1);
    assert_eq!(results[0].doc_id, b"doc:1");
    assert_eq!(results[0].score, 0.5);
}

#[test]
fn reduces_ft_info_fixture_across_two_identical_shards() {
    let buf = load_fixture("ft_info_shard_reply.resp");
    let (value, _) = resp::parse(&buf).expect("parses");
    let merged = reduce_info(vec![value.clone(), value]).expect("merges");
    assert_eq!(merged.get_key("num_docs"), Some(&RespValue::Integer(200)));
    assert_eq!(merged.get_key("index_name"), Some(&RespValue::BulkString(b"idx".to_vec())));
}
