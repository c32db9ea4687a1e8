// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! SearchReducer (spec §3 `C12`, §4.6): merges N `FT.SEARCH` shard
//! replies via a top-K min-heap, with a KNN inner-heap specialization.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::error::CoordinatorError;

use super::resp::RespValue;

/// Flags parsed from the client's original `FT.SEARCH` invocation,
/// needed to know the per-result RESP2 offsets and merge comparator
/// (spec §4.6 "Parse offsets").
#[derive(Debug, Clone, Copy, Default)]
pub struct SearchFlags {
    pub with_scores: bool,
    pub with_payloads: bool,
    pub with_sortkeys: bool,
    pub with_sortby: bool,
    pub sortby_asc: bool,
    pub knn_k: Option<usize>,
}

/// One merge-ready candidate (spec §3 `SearchResult`).
#[derive(Debug, Clone)]
pub struct SearchResult {
    pub doc_id: Vec<u8>,
    pub score: f64,
    pub sort_key_num: Option<f64>,
    pub sort_key_str: Option<Vec<u8>>,
    pub knn_distance: Option<f64>,
    pub fields: Vec<(Vec<u8>, Vec<u8>)>,
    pub payload: Option<Vec<u8>>,
}

/// Reverse-ordered wrapper so `BinaryHeap` (a max-heap) behaves as the
/// min-heap the spec calls for: the heap's "smallest" element (evicted
/// first when over capacity) is the worst candidate by the merge
/// comparator.
struct HeapEntry {
    result: SearchResult,
    flags: SearchFlagsRef,
}

#[derive(Clone, Copy)]
struct SearchFlagsRef {
    with_sortby: bool,
    sortby_asc: bool,
}

impl HeapEntry {
    /// True if `self` ranks better than `other` under the merge
    /// comparator (spec §4.6 "Top-K heap"): numeric sort key wins over
    /// string, missing keys sort last, direction from `asc`; else higher
    /// score wins; tiebreak by doc_id reversed (larger id first).
    fn better_than(&self, other: &HeapEntry) -> Ordering {
        if self.flags.with_sortby {
            let has_self = self.result.sort_key_num.is_some() || self.result.sort_key_str.is_some();
            let has_other = other.result.sort_key_num.is_some() || other.result.sort_key_str.is_some();
            // Missing keys sort last regardless of direction.
            let cmp = match (has_self, has_other) {
                (true, false) => Ordering::Greater,
                (false, true) => Ordering::Less,
                (false, false) => Ordering::Equal,
                (true, true) => {
                    let value_cmp = match (
                        &self.result.sort_key_num,
                        &other.result.sort_key_num,
                        &self.result.sort_key_str,
                        &other.result.sort_key_str,
                    ) {
                        (Some(a), Some(b), _, _) => a.partial_cmp(b).unwrap_or(Ordering::Equal),
                        (Some(_), None, _, _) => Ordering::Greater,
                        (None, Some(_), _, _) => Ordering::Less,
                        (None, None, Some(a), Some(b)) => a.cmp(b),
                        _ => Ordering::Equal,
                    };
                    if self.flags.sortby_asc { value_cmp.reverse() } else { value_cmp }
                },
            };
            cmp.then_with(|| self.result.doc_id.cmp(&other.result.doc_id))
        } else {
            self.result
                .score
                .partial_cmp(&other.result.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| self.result.doc_id.cmp(&other.result.doc_id))
        }
    }
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.better_than(other) == Ordering::Equal
    }
}
impl Eq for HeapEntry {}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap pops the greatest; we want "better" results to sort
        // greatest so the heap's min (peek-replaceable) slot is the worst
        // candidate when the heap is full.
        other.better_than(self)
    }
}

/// Min-heap of size `L+O` ordered by the merge comparator (spec §4.6).
pub struct TopKHeap {
    heap: BinaryHeap<HeapEntry>,
    capacity: usize,
    flags: SearchFlagsRef,
}

impl TopKHeap {
    pub fn new(capacity: usize, with_sortby: bool, sortby_asc: bool) -> Self {
        Self {
            heap: BinaryHeap::with_capacity(capacity.max(1)),
            capacity: capacity.max(1),
            flags: SearchFlagsRef { with_sortby, sortby_asc },
        }
    }

    pub fn push(&mut self, result: SearchResult) {
        let entry = HeapEntry { result, flags: self.flags };
        if self.heap.len() < self.capacity {
            self.heap.push(entry);
        } else if let Some(worst) = self.heap.peek() {
            // `BinaryHeap::peek` returns the greatest by `Ord`, which our
            // reversed `Ord` makes the *worst* candidate currently held.
            if entry.cmp(worst) == Ordering::Less {
                self.heap.pop();
                self.heap.push(entry);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Drains the heap into a vec ordered best-first (spec §4.6 "pop the
    /// main heap into an array; reverse so the best is first"). Our `Ord`
    /// is already inverted so that `into_sorted_vec`'s ascending order
    /// places the best candidate first.
    pub fn into_sorted_best_first(self) -> Vec<SearchResult> {
        self.heap.into_sorted_vec().into_iter().map(|e| e.result).collect()
    }
}

/// Runs the KNN inner heap (spec §4.6 "KNN specialization"): a second
/// heap of size `k` ordered by vector distance (smaller is better), then
/// poured into the main heap using the main comparator. Returns the
/// number of results poured, which becomes `total_results` (`<= k`).
pub fn pour_knn_into_main(main: &mut TopKHeap, candidates: Vec<SearchResult>, k: usize) -> usize {
    let mut inner: BinaryHeap<KnnEntry> = BinaryHeap::with_capacity(k.max(1));
    for result in candidates {
        let dist = result.knn_distance.unwrap_or(f64::INFINITY);
        let entry = KnnEntry { dist, result };
        if inner.len() < k.max(1) {
            inner.push(entry);
        } else if let Some(worst) = inner.peek() {
            if entry.dist < worst.dist {
                inner.pop();
                inner.push(entry);
            }
        }
    }
    let poured = inner.len();
    for entry in inner {
        main.push(entry.result);
    }
    poured
}

struct KnnEntry {
    dist: f64,
    result: SearchResult,
}
impl PartialEq for KnnEntry {
    fn eq(&self, other: &Self) -> bool {
        self.dist == other.dist
    }
}
impl Eq for KnnEntry {}
impl PartialOrd for KnnEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for KnnEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap over distance so `peek`/`pop` evict the farthest
        // (worst) candidate once the heap is full.
        self.dist.partial_cmp(&other.dist).unwrap_or(Ordering::Equal)
    }
}

/// Parses one shard's `FT.SEARCH` reply into `(total_results,
/// results[])`, dispatching on RESP2 flat-array vs RESP3 map shape (spec
/// §4.6 "Parse offsets").
pub fn parse_shard_reply(
    reply: &RespValue,
    flags: SearchFlags,
) -> Result<(i64, Vec<SearchResult>), CoordinatorError> {
    if let RespValue::Error(msg) = reply {
        return Err(CoordinatorError::ShardError(msg.clone()));
    }

    if let Some(map) = reply.as_map() {
        return parse_resp3(map, flags);
    }
    parse_resp2(reply, flags)
}

fn parse_resp2(
    reply: &RespValue,
    flags: SearchFlags,
) -> Result<(i64, Vec<SearchResult>), CoordinatorError> {
    let arr = reply
        .as_array()
        .ok_or_else(|| CoordinatorError::ParseError("FT.SEARCH reply is not an array".to_string()))?;
    let total = arr
        .first()
        .and_then(RespValue::as_i64)
        .ok_or_else(|| CoordinatorError::ParseError("missing total_results".to_string()))?;

    let mut results = Vec::new();
    let mut i = 1;
    while i < arr.len() {
        let doc_id = arr[i]
            .as_bulk_str()
            .ok_or_else(|| CoordinatorError::ParseError("missing doc id".to_string()))?
            .to_vec();
        i += 1;

        let score = if flags.with_scores {
            let s = arr
                .get(i)
                .and_then(RespValue::as_f64)
                .ok_or_else(|| CoordinatorError::ParseError("missing score".to_string()))?;
            i += 1;
            s
        } else {
            0.0
        };

        let payload = if flags.with_payloads {
            let p = arr.get(i).and_then(RespValue::as_bulk_str).map(<[u8]>::to_vec);
            i += 1;
            p
        } else {
            None
        };

        let (sort_key_num, sort_key_str) = if flags.with_sortkeys {
            let v = arr.get(i);
            i += 1;
            match v {
                Some(v) if v.as_f64().is_some() && v.as_bulk_str().map(is_numeric_bytes).unwrap_or(false) => {
                    (v.as_f64(), None)
                },
                Some(v) => (None, v.as_bulk_str().map(<[u8]>::to_vec)),
                None => (None, None),
            }
        } else {
            (None, None)
        };

        let fields = match arr.get(i) {
            Some(RespValue::Array(field_arr)) => {
                i += 1;
                field_arr
                    .chunks_exact(2)
                    .filter_map(|pair| Some((pair[0].as_bulk_str()?.to_vec(), pair[1].as_bulk_str()?.to_vec())))
                    .collect()
            },
            _ => Vec::new(),
        };

        results.push(SearchResult {
            doc_id,
            score,
            sort_key_num,
            sort_key_str,
            knn_distance: None,
            fields,
            payload,
        });
    }

    Ok((total, results))
}

fn is_numeric_bytes(b: &[u8]) -> bool {
    std::str::from_utf8(b).map(|s| s.parse::<f64>().is_ok()).unwrap_or(false)
}

fn parse_resp3(
    map: &[(RespValue, RespValue)],
    flags: SearchFlags,
) -> Result<(i64, Vec<SearchResult>), CoordinatorError> {
    let find = |key: &str| map.iter().find(|(k, _)| k.as_bulk_str().is_some_and(|b| b == key.as_bytes()));

    let total = find("total_results")
        .and_then(|(_, v)| v.as_i64())
        .ok_or_else(|| CoordinatorError::ParseError("missing total_results".to_string()))?;

    let results_arr = find("results")
        .and_then(|(_, v)| v.as_array())
        .ok_or_else(|| CoordinatorError::ParseError("missing results array".to_string()))?;

    let mut results = Vec::with_capacity(results_arr.len());
    for entry in results_arr {
        let Some(m) = entry.as_map() else { continue };
        let find_e = |key: &str| m.iter().find(|(k, _)| k.as_bulk_str().is_some_and(|b| b == key.as_bytes()));

        let doc_id = find_e("id")
            .and_then(|(_, v)| v.as_bulk_str())
            .ok_or_else(|| CoordinatorError::ParseError("missing id".to_string()))?
            .to_vec();
        let score = find_e("score").and_then(|(_, v)| v.as_f64()).unwrap_or(0.0);
        let payload = find_e("payload").and_then(|(_, v)| v.as_bulk_str()).map(<[u8]>::to_vec);
        let sort_key_num = find_e("sortkey").and_then(|(_, v)| v.as_f64());
        let sort_key_str =
            find_e("sortkey").and_then(|(_, v)| v.as_bulk_str()).map(<[u8]>::to_vec);
        let fields = find_e("extra_attributes")
            .and_then(|(_, v)| v.as_map())
            .map(|m| {
                m.iter()
                    .filter_map(|(k, v)| Some((k.as_bulk_str()?.to_vec(), v.as_bulk_str()?.to_vec())))
                    .collect()
            })
            .unwrap_or_default();

        let _ = flags;
        results.push(SearchResult {
            doc_id,
            score,
            sort_key_num,
            sort_key_str,
            knn_distance: None,
            fields,
            payload,
        });
    }

    Ok((total, results))
}

/// One shard's profile payload plus the coordinator's own stitching
/// clocks (spec §4.6 "Profile stitching"). `shard_profile` is carried
/// through opaque since its internal shape belongs to the single-shard
/// query engine, out of scope here (spec §1).
#[derive(Debug, Clone)]
pub struct ShardProfile {
    pub node_id: String,
    pub shard_profile: RespValue,
}

/// Coordinator-side profile block surfaced alongside stitched shard
/// profiles: total wall time for the fanout plus the time this reducer
/// itself spent merging (spec §4.6).
#[derive(Debug, Clone, Copy, Default)]
pub struct CoordinatorProfile {
    pub total_micros: u64,
    pub post_processing_micros: u64,
}

/// Pulls the profile payload out of one shard's `FT.PROFILE SEARCH`
/// reply. RESP2 carries it as a trailing array element — index 1 when
/// there is no cursor id ahead of it, index 2 when there is (spec §4.6
/// "RESP2: reply element index 1 or 2 depending on whether a cursor is
/// present"); RESP3 carries it at the named key `profile.Shards[0]`.
pub fn extract_shard_profile(reply: &RespValue, has_cursor: bool) -> Result<RespValue, CoordinatorError> {
    if let Some(map) = reply.as_map() {
        return map
            .iter()
            .find(|(k, _)| k.as_bulk_str().is_some_and(|b| b == b"profile"))
            .and_then(|(_, v)| v.get_key("Shards"))
            .and_then(RespValue::as_array)
            .and_then(|a| a.first())
            .cloned()
            .ok_or_else(|| CoordinatorError::ParseError("missing profile.Shards[0]".to_string()));
    }

    let arr = reply
        .as_array()
        .ok_or_else(|| CoordinatorError::ParseError("profile reply is not an array".to_string()))?;
    let idx = if has_cursor { 2 } else { 1 };
    arr.get(idx)
        .cloned()
        .ok_or_else(|| CoordinatorError::ParseError("missing profile element".to_string()))
}

/// Stitches per-shard profiles with the coordinator's own clocks into
/// the combined `ShardProfile` list the client sees alongside the
/// merged search results (spec §4.6 "surface them plus a
/// coordinator-side profile block"). Shards are ordered by `node_id` so
/// the client-visible reply doesn't depend on the connection manager's
/// iteration order, which isn't guaranteed stable across calls.
pub fn stitch_profiles(
    mut shards: Vec<ShardProfile>,
    coordinator: CoordinatorProfile,
) -> (Vec<ShardProfile>, CoordinatorProfile) {
    shards.sort_by(|a, b| a.node_id.cmp(&b.node_id));
    (shards, coordinator)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(doc_id: &str, score: f64) -> SearchResult {
        SearchResult {
            doc_id: doc_id.as_bytes().to_vec(),
            score,
            sort_key_num: None,
            sort_key_str: None,
            knn_distance: None,
            fields: Vec::new(),
            payload: None,
        }
    }

    #[test]
    fn keeps_only_top_k_by_score() {
        let mut heap = TopKHeap::new(2, false, false);
        heap.push(result("a", 1.0));
        heap.push(result("b", 3.0));
        heap.push(result("c", 2.0));
        let out = heap.into_sorted_best_first();
        let scores: Vec<f64> = out.iter().map(|r| r.score).collect();
        assert_eq!(scores, vec![3.0, 2.0]);
    }

    #[test]
    fn ties_break_on_reversed_doc_id() {
        let mut heap = TopKHeap::new(2, false, false);
        heap.push(result("doc1", 1.0));
        heap.push(result("doc2", 1.0));
        let out = heap.into_sorted_best_first();
        assert_eq!(out[0].doc_id, b"doc2");
    }

    #[test]
    fn sortby_missing_keys_sort_last_ascending() {
        let mut a = result("a", 0.0);
        a.sort_key_num = Some(5.0);
        let mut b = result("b", 0.0);
        b.sort_key_num = None;

        let mut heap = TopKHeap::new(2, true, true);
        heap.push(a);
        heap.push(b);
        let out = heap.into_sorted_best_first();
        assert_eq!(out[0].doc_id, b"a");
    }

    #[test]
    fn knn_pour_keeps_nearest_k() {
        let mut main = TopKHeap::new(10, false, false);
        let mut candidates = Vec::new();
        for (id, dist) in [("a", 0.9), ("b", 0.1), ("c", 0.5)] {
            let mut r = result(id, 0.0);
            r.knn_distance = Some(dist);
            candidates.push(r);
        }
        let poured = pour_knn_into_main(&mut main, candidates, 2);
        assert_eq!(poured, 2);
        assert_eq!(main.len(), 2);
    }

    #[test]
    fn parses_resp2_reply_with_scores() {
        let reply = RespValue::Array(vec![
            RespValue::Integer(1),
            RespValue::BulkString(b"doc1".to_vec()),
            RespValue::BulkString(b"3.5".to_vec()),
        ]);
        let (total, results) =
            parse_shard_reply(&reply, SearchFlags { with_scores: true, ..Default::default() })
                .expect("parses");
        assert_eq!(total, 1);
        assert_eq!(results[0].score, 3.5);
    }

    #[test]
    fn shard_error_reply_surfaces_as_shard_error() {
        let reply = RespValue::Error("Timeout limit was reached".to_string());
        let err = parse_shard_reply(&reply, SearchFlags::default()).unwrap_err();
        assert_eq!(err, CoordinatorError::ShardError("Timeout limit was reached".to_string()));
    }

    #[test]
    fn extracts_resp2_profile_without_cursor() {
        // `[searchReply, profile]` — the search half stays opaque here.
        let reply = RespValue::Array(vec![
            RespValue::Array(vec![RespValue::Integer(0)]),
            RespValue::SimpleString("profile-payload".to_string()),
        ]);
        let profile = extract_shard_profile(&reply, false).expect("has profile");
        assert_eq!(profile, RespValue::SimpleString("profile-payload".to_string()));
    }

    #[test]
    fn extracts_resp2_profile_with_cursor_shifted_one() {
        // `[searchReply, cursorId, profile]` once a cursor id is present.
        let reply = RespValue::Array(vec![
            RespValue::Array(vec![RespValue::Integer(0)]),
            RespValue::Integer(123),
            RespValue::SimpleString("profile-payload".to_string()),
        ]);
        let profile = extract_shard_profile(&reply, true).expect("has profile");
        assert_eq!(profile, RespValue::SimpleString("profile-payload".to_string()));
    }

    #[test]
    fn stitch_profiles_orders_shards_by_node_id() {
        let shards = vec![
            ShardProfile { node_id: "shard-2".to_string(), shard_profile: RespValue::Integer(2) },
            ShardProfile { node_id: "shard-0".to_string(), shard_profile: RespValue::Integer(0) },
            ShardProfile { node_id: "shard-1".to_string(), shard_profile: RespValue::Integer(1) },
        ];
        let (stitched, _) = stitch_profiles(shards, CoordinatorProfile::default());
        let ids: Vec<&str> = stitched.iter().map(|s| s.node_id.as_str()).collect();
        assert_eq!(ids, vec!["shard-0", "shard-1", "shard-2"]);
    }

    #[test]
    fn extracts_resp3_profile_from_named_key() {
        let shards = RespValue::Array(vec![RespValue::SimpleString("payload".to_string())]);
        let mut shards_map = Vec::new();
        shards_map.push((RespValue::BulkString(b"Shards".to_vec()), shards));
        let profile_map = RespValue::Map(shards_map);
        let reply = RespValue::Map(vec![(RespValue::BulkString(b"profile".to_vec()), profile_map)]);
        let profile = extract_shard_profile(&reply, false).expect("has profile");
        assert_eq!(profile, RespValue::SimpleString("payload".to_string()));
    }
}
