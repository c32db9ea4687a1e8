// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Cursor streaming: `Channel` (C10) and `Iterator`/MRIterator (C11),
//! spec §3, §4.7, §4.8, §4.9.

pub mod channel;
pub mod hybrid;
pub mod iterator;

pub use channel::Channel;
pub use hybrid::MappingSource;
pub use iterator::Iterator as CursorIterator;
