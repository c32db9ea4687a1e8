// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use core::fmt;

use serde::{Deserialize, Serialize};

/// Timeout policy consulted uniformly by every reducer (spec §5, §9).
///
/// `Strict` turns a deadline overrun into a typed error; `Relaxed` instead
/// emits whatever partial results have accumulated, tagged with a warning.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimeoutPolicy {
    #[serde(rename = "strict", alias = "Strict", alias = "STRICT")]
    #[default]
    Strict,
    #[serde(rename = "relaxed", alias = "Relaxed", alias = "RELAXED")]
    Relaxed,
}
impl fmt::Display for TimeoutPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TimeoutPolicy::Strict => "strict",
            TimeoutPolicy::Relaxed => "relaxed",
        })
    }
}

/// `PARTITIONS` is deprecated and pinned to `Auto` (spec §6.1); kept as an
/// enum so old config files that still set the key deserialize without
/// error.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PartitionsMode {
    #[serde(rename = "AUTO", alias = "auto", alias = "Auto")]
    #[default]
    Auto,
}

/// The protocol a connection negotiates with a shard, or a client
/// negotiates with the coordinator (spec §3 `Command.protocol_version`).
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Protocol {
    #[serde(rename = "2")]
    Resp2 = 2,
    #[serde(rename = "3")]
    Resp3 = 3,
}
impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Protocol::Resp2 => "2",
            Protocol::Resp3 => "3",
        })
    }
}
impl Default for Protocol {
    fn default() -> Self {
        Protocol::Resp2
    }
}
