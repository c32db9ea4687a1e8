// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Dispatch (spec §3 `C9`, §4.5): fans a client command out to one or
//! all shards and tracks fan-in completion.

pub mod cursor;
pub mod dispatch;
pub mod request_context;

pub use cursor::{dispatch_aggregate, dispatch_cursor};
pub use dispatch::{dispatch_fanout, dispatch_single};
pub use request_context::RequestContext;
