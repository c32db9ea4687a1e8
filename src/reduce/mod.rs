// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Reducers (spec §3 `C12`/`C13`, §4.6, §4.7 WITHCOUNT barrier, §6.1
//! admin commands): turn N shard replies into one client reply.

pub mod admin;
pub mod aggregate;
pub mod resp;
pub mod search;

pub use aggregate::{AggregateAccumulator, AggregateReply, CountBarrier};
pub use resp::RespValue;
pub use search::{SearchFlags, TopKHeap};
