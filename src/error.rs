// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Coordinator error taxonomy (spec §7).
//!
//! These are the small set of client-facing, typed errors; everything else
//! (I/O, parsing helpers, config loading) propagates as `anyhow::Error` with
//! context the way the teacher crate does, and is converted to a
//! [`CoordinatorError::ParseError`] or similar only at the point a reducer
//! needs to hand a typed reply back to the client.

use thiserror::Error;

/// Errors surfaced to a client as a RESP error reply.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoordinatorError {
    /// Topology never established (`numShards == 0`).
    #[error("CLUSTERDOWN The cluster is down")]
    ClusterDown,

    /// Client command arg count out of range.
    #[error("ERR wrong number of arguments")]
    WrongArity,

    /// Execution context forbids blocking (host runtime flag).
    #[error("ERR blocking is not allowed in this execution context")]
    BlockingDenied,

    /// Query deadline reached under the relaxed policy: partial results
    /// are still emitted, carrying this as a warning rather than an error.
    #[error("query timed out, returning partial results")]
    TimeoutSoft,

    /// Query deadline reached under the strict policy.
    #[error("Timeout limit was reached")]
    TimeoutHard,

    /// A shard returned a RESP error, forwarded verbatim.
    #[error("{0}")]
    ShardError(String),

    /// A shard's reply did not match the expected shape.
    #[error("could not parse shard reply: {0}")]
    ParseError(String),

    /// A shard reported out-of-memory.
    #[error("OOM command not allowed when used memory > 'maxmemory'")]
    Oom,
}

impl CoordinatorError {
    /// True for the one shard error string that relaxed-policy fanout
    /// swallows instead of forwarding (spec §7 `ShardError`).
    pub fn is_swallowed_timeout_under_relaxed_policy(&self) -> bool {
        matches!(self, CoordinatorError::ShardError(msg) if msg == "Timeout limit was reached")
    }

    /// Renders the fixed `-ERR`/`-TIMEOUT`/`-CLUSTERDOWN` wire string a
    /// client receives for this error (spec §7 "Exit/error shape").
    pub fn to_wire_string(&self) -> String {
        match self {
            CoordinatorError::ClusterDown => "CLUSTERDOWN The cluster is down".to_string(),
            CoordinatorError::TimeoutHard => "TIMEOUT Timeout limit was reached".to_string(),
            other => other.to_string(),
        }
    }
}
