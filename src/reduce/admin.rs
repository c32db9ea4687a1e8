// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Admin-command reducers (spec §6.1): the small fanout reducers for
//! `FT.INFO`, `FT.SPELLCHECK`, `FT.MGET`, `FT.TAGVALS`, and the
//! first-error-or-OK reducer shared by `FT.CREATE`/`FT.ALTER`/
//! `FT.DROPINDEX`/`FT.DICTADD`/etc.

use std::collections::BTreeSet;

use crate::error::CoordinatorError;

use super::resp::RespValue;

/// Sums the integer-valued counters of an `FT.INFO` reply across shards,
/// keeping the first shard's non-numeric fields (index name, field
/// schema, …) verbatim since those are identical across masters of the
/// same index (spec §6.1 "Fanout + custom info reducer (sums
/// counters)").
pub fn reduce_info(replies: Vec<RespValue>) -> Result<RespValue, CoordinatorError> {
    first_error(&replies)?;

    let mut entries: Vec<(RespValue, RespValue)> = Vec::new();
    for reply in replies {
        let Some(map) = reply.as_map() else {
            return Err(CoordinatorError::ParseError("FT.INFO reply is not a map".to_string()));
        };
        for (k, v) in map {
            match entries.iter_mut().find(|(ek, _)| ek == k) {
                Some((_, ev)) => {
                    if let (Some(a), Some(b)) = (ev.as_i64(), v.as_i64()) {
                        *ev = RespValue::Integer(a + b);
                    }
                },
                None => entries.push((k.clone(), v.clone())),
            }
        }
    }
    Ok(RespValue::Map(entries))
}

/// Merges per-shard `FT.SPELLCHECK` dictionary/term suggestion lists:
/// every shard returns an array of `(term, suggestions[])` pairs; the
/// coordinator concatenates suggestions for the same term across shards,
/// de-duplicating by suggestion text (spec §6.1 "Fanout + dictionary/term
/// merge reducer").
pub fn reduce_spellcheck(replies: Vec<RespValue>) -> Result<RespValue, CoordinatorError> {
    first_error(&replies)?;

    let mut by_term: Vec<(Vec<u8>, Vec<RespValue>)> = Vec::new();
    for reply in replies {
        let Some(terms) = reply.as_array() else {
            return Err(CoordinatorError::ParseError("FT.SPELLCHECK reply is not an array".to_string()));
        };
        for entry in terms {
            let Some(pair) = entry.as_array() else { continue };
            let (Some(term), Some(suggestions)) = (pair.first().and_then(RespValue::as_bulk_str), pair.get(1).and_then(RespValue::as_array)) else {
                continue;
            };
            let slot = match by_term.iter_mut().find(|(t, _)| t == term) {
                Some(slot) => slot,
                None => {
                    by_term.push((term.to_vec(), Vec::new()));
                    by_term.last_mut().expect("just pushed")
                },
            };
            for s in suggestions {
                if !slot.1.contains(s) {
                    slot.1.push(s.clone());
                }
            }
        }
    }

    let out = by_term
        .into_iter()
        .map(|(term, suggestions)| {
            RespValue::Array(vec![RespValue::BulkString(term), RespValue::Array(suggestions)])
        })
        .collect();
    Ok(RespValue::Array(out))
}

/// Merges `FT.MGET` replies positionally: the coordinator requested the
/// same N keys of every shard, and for each position takes the first
/// non-nil value any shard returned (a document lives on exactly one
/// shard, so at most one shard answers non-nil per position) (spec §6.1
/// "Fanout + first-non-nil-per-position array merge").
pub fn reduce_mget(replies: Vec<RespValue>) -> Result<RespValue, CoordinatorError> {
    first_error(&replies)?;

    let width = replies
        .iter()
        .filter_map(|r| r.as_array().map(<[RespValue]>::len))
        .max()
        .unwrap_or(0);

    let mut merged = vec![RespValue::Null; width];
    for reply in &replies {
        let Some(arr) = reply.as_array() else {
            return Err(CoordinatorError::ParseError("FT.MGET reply is not an array".to_string()));
        };
        for (i, v) in arr.iter().enumerate() {
            if matches!(merged[i], RespValue::Null) && !matches!(v, RespValue::Null) {
                merged[i] = v.clone();
            }
        }
    }
    Ok(RespValue::Array(merged))
}

/// Unions the per-shard tag value sets of `FT.TAGVALS`, de-duplicating
/// by raw bytes and sorting for a deterministic reply (spec §6.1 "Fanout
/// + set-union reducer").
pub fn reduce_tagvals(replies: Vec<RespValue>) -> Result<RespValue, CoordinatorError> {
    first_error(&replies)?;

    let mut set: BTreeSet<Vec<u8>> = BTreeSet::new();
    for reply in replies {
        let Some(arr) = reply.as_array() else {
            return Err(CoordinatorError::ParseError("FT.TAGVALS reply is not an array".to_string()));
        };
        for v in arr {
            if let Some(b) = v.as_bulk_str() {
                set.insert(b.to_vec());
            }
        }
    }
    Ok(RespValue::Array(set.into_iter().map(RespValue::BulkString).collect()))
}

/// Shared reducer for `FT.CREATE`/`FT.ALTER`/`FT.DROPINDEX`/`FT.DICTADD`/
/// etc.: the first shard error wins, otherwise `"OK"` once every shard
/// agrees (spec §6.1 "Fanout to all masters; reducer returns first error
/// or 'OK' when all agree").
pub fn reduce_first_error_or_ok(replies: &[RespValue]) -> Result<RespValue, CoordinatorError> {
    first_error(replies)?;
    Ok(RespValue::SimpleString("OK".to_string()))
}

fn first_error(replies: &[RespValue]) -> Result<(), CoordinatorError> {
    for reply in replies {
        if let RespValue::Error(msg) = reply {
            return Err(CoordinatorError::ShardError(msg.clone()));
        }
    }
    Ok(())
}
