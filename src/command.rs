// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Command (spec §3 `C1`): the ordered byte-string vector dispatched to a
//! shard, plus the coordinator-private routing metadata that never
//! travels on the wire (`target_shard`, `root_command`, cursor/profile
//! flags).

use crate::cfg::enums::Protocol;

/// Which client-facing family a command belongs to, used to pick a
/// reducer and to decide whether `Iterator`-based streaming applies
/// (spec §3 `root_command`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RootCommand {
    Read,
    Del,
    Aggregate,
    Profile,
}

/// Special `target_shard` value meaning "fan out to every shard" (spec §3
/// `target_shard ∈ {-1 ∪ [0, numShards)}`).
pub const TARGET_FANOUT: i32 = -1;

/// A command queued for dispatch to one shard connection. Once queued on
/// a `Connection` its `args` must not change until the reply arrives
/// (spec §3 Command invariants).
#[derive(Debug, Clone)]
pub struct Command {
    args: Vec<Vec<u8>>,
    pub target_shard: i32,
    pub protocol_version: Protocol,
    pub for_cursor: bool,
    pub for_profiling: bool,
    pub depleted: bool,
    pub root_command: RootCommand,
    /// Index into `args` reserved for per-shard slot-range injection, set
    /// once the owning shard is known (spec §3 "pre-reserved slot for
    /// per-shard slot-range injection").
    slot_arg_index: Option<usize>,
}

impl Command {
    pub fn new(verb: impl Into<Vec<u8>>, root_command: RootCommand) -> Self {
        Self {
            args: vec![verb.into()],
            target_shard: TARGET_FANOUT,
            protocol_version: Protocol::Resp2,
            for_cursor: false,
            for_profiling: false,
            depleted: false,
            root_command,
            slot_arg_index: None,
        }
    }

    pub fn arg(mut self, a: impl Into<Vec<u8>>) -> Self {
        self.args.push(a.into());
        self
    }

    pub fn args(mut self, it: impl IntoIterator<Item = Vec<u8>>) -> Self {
        self.args.extend(it);
        self
    }

    pub fn verb(&self) -> &[u8] {
        &self.args[0]
    }

    pub fn as_slice(&self) -> &[Vec<u8>] {
        &self.args
    }

    /// Marks the argument at `index` as the shard-slot placeholder, to be
    /// overwritten by `set_shard_slot` once dispatch knows the target.
    pub fn reserve_slot_arg(mut self, index: usize) -> Self {
        self.slot_arg_index = Some(index);
        self
    }

    /// Fills in the reserved slot-range argument for the shard this clone
    /// is being sent to.
    pub fn set_shard_slot(&mut self, value: impl Into<Vec<u8>>) {
        if let Some(i) = self.slot_arg_index {
            self.args[i] = value.into();
        }
    }

    /// Clones this command for dispatch to a specific shard, pinning
    /// `target_shard`. Used by fanout and by the `Iterator` when cloning
    /// the base command once per shard (spec §4.7).
    pub fn clone_for_shard(&self, shard: i32) -> Self {
        let mut c = self.clone();
        c.target_shard = shard;
        c
    }

    /// Rewrites the root verb to `DEL` in place, turning e.g.
    /// `FT.CURSOR READ idx id` into `FT.CURSOR DEL idx id` for Iterator
    /// teardown (spec §4.7 "Teardown").
    pub fn rewrite_cursor_to_del(&mut self) {
        if self.args.len() > 1 {
            self.args[1] = b"DEL".to_vec();
        }
    }

    fn find_token_ci(&self, token: &[u8]) -> Option<usize> {
        self.args
            .iter()
            .position(|a| a.eq_ignore_ascii_case(token))
    }
}

/// Rewrites a client-facing `FT.SEARCH` into its shard-private form (spec
/// §4.5 "Command rewriting"): prefixes the verb with `_`, rewrites
/// `LIMIT a b` to `LIMIT 0 (a+b)`, and injects `WITHSCORES` when the
/// client did not specify `SORTBY`.
pub fn rewrite_search_for_shard(mut cmd: Command) -> Command {
    debug_assert!(cmd.verb().eq_ignore_ascii_case(b"FT.SEARCH"));
    cmd.args[0] = b"_FT.SEARCH".to_vec();

    if let Some(limit_idx) = cmd.find_token_ci(b"LIMIT") {
        if let (Some(o), Some(l)) = (
            cmd.args.get(limit_idx + 1).cloned(),
            cmd.args.get(limit_idx + 2).cloned(),
        ) {
            let offset: i64 = String::from_utf8_lossy(&o).parse().unwrap_or(0);
            let count: i64 = String::from_utf8_lossy(&l).parse().unwrap_or(0);
            cmd.args[limit_idx + 1] = b"0".to_vec();
            cmd.args[limit_idx + 2] = (offset + count).to_string().into_bytes();
        }
    }

    if cmd.find_token_ci(b"SORTBY").is_none() && cmd.find_token_ci(b"WITHSCORES").is_none() {
        cmd.args.push(b"WITHSCORES".to_vec());
    }

    cmd
}

/// Rewrites a client-facing `FT.AGGREGATE` into its shard-private form
/// (spec §4.5, §6.1): prefixes the verb with `_`. The cursor/WITHCOUNT
/// handling lives in the `Iterator`/`AggregateReducer`, not here.
pub fn rewrite_aggregate_for_shard(mut cmd: Command) -> Command {
    debug_assert!(cmd.verb().eq_ignore_ascii_case(b"FT.AGGREGATE"));
    cmd.args[0] = b"_FT.AGGREGATE".to_vec();
    cmd
}

/// Rewrites a client-facing `FT.PROFILE <idx> SEARCH ...` into its
/// shard-private form (spec §4.6, §6.1 "Same as the underlying command
/// with profile stitching"): prefixes the verb with `_` and applies the
/// same `LIMIT`-splitting/`WITHSCORES` injection `rewrite_search_for_shard`
/// applies to the plain `FT.SEARCH` it wraps. The `AGGREGATE` mode of
/// `FT.PROFILE` isn't covered — callers reject it before this rewrite runs.
pub fn rewrite_profile_for_shard(mut cmd: Command) -> Command {
    debug_assert!(cmd.verb().eq_ignore_ascii_case(b"FT.PROFILE"));
    cmd.args[0] = b"_FT.PROFILE".to_vec();

    if let Some(limit_idx) = cmd.find_token_ci(b"LIMIT") {
        if let (Some(o), Some(l)) = (
            cmd.args.get(limit_idx + 1).cloned(),
            cmd.args.get(limit_idx + 2).cloned(),
        ) {
            let offset: i64 = String::from_utf8_lossy(&o).parse().unwrap_or(0);
            let count: i64 = String::from_utf8_lossy(&l).parse().unwrap_or(0);
            cmd.args[limit_idx + 1] = b"0".to_vec();
            cmd.args[limit_idx + 2] = (offset + count).to_string().into_bytes();
        }
    }

    if cmd.find_token_ci(b"SORTBY").is_none() && cmd.find_token_ci(b"WITHSCORES").is_none() {
        cmd.args.push(b"WITHSCORES".to_vec());
    }

    cmd
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes_args(cmd: &Command) -> Vec<String> {
        cmd.as_slice()
            .iter()
            .map(|a| String::from_utf8_lossy(a).to_string())
            .collect()
    }

    #[test]
    fn search_rewrite_prefixes_verb_and_splits_limit() {
        let cmd = Command::new("FT.SEARCH", RootCommand::Read)
            .arg("idx")
            .arg("query")
            .arg("LIMIT")
            .arg("10")
            .arg("20");
        let rewritten = rewrite_search_for_shard(cmd);
        let args = bytes_args(&rewritten);
        assert_eq!(args[0], "_FT.SEARCH");
        assert_eq!(args[4], "0");
        assert_eq!(args[5], "30");
        assert!(args.contains(&"WITHSCORES".to_string()));
    }

    #[test]
    fn search_rewrite_skips_withscores_when_sortby_present() {
        let cmd = Command::new("FT.SEARCH", RootCommand::Read)
            .arg("idx")
            .arg("query")
            .arg("SORTBY")
            .arg("field");
        let rewritten = rewrite_search_for_shard(cmd);
        assert!(!bytes_args(&rewritten).contains(&"WITHSCORES".to_string()));
    }

    #[test]
    fn profile_rewrite_prefixes_verb_and_splits_limit() {
        let cmd = Command::new("FT.PROFILE", RootCommand::Profile)
            .arg("idx")
            .arg("SEARCH")
            .arg("QUERY")
            .arg("hello")
            .arg("LIMIT")
            .arg("10")
            .arg("20");
        let rewritten = rewrite_profile_for_shard(cmd);
        let args = bytes_args(&rewritten);
        assert_eq!(args[0], "_FT.PROFILE");
        assert_eq!(args[5], "0");
        assert_eq!(args[6], "30");
        assert!(args.contains(&"WITHSCORES".to_string()));
    }

    #[test]
    fn cursor_rewrite_to_del_replaces_second_arg() {
        let mut cmd = Command::new("FT.CURSOR", RootCommand::Read)
            .arg("READ")
            .arg("idx")
            .arg("123");
        cmd.rewrite_cursor_to_del();
        assert_eq!(bytes_args(&cmd)[1], "DEL");
    }

    #[test]
    fn clone_for_shard_pins_target_and_preserves_args() {
        let cmd = Command::new("FT.SEARCH", RootCommand::Read).arg("idx");
        let for_shard2 = cmd.clone_for_shard(2);
        assert_eq!(for_shard2.target_shard, 2);
        assert_eq!(cmd.target_shard, TARGET_FANOUT);
    }

    #[test]
    fn shard_slot_injection_fills_reserved_index() {
        let mut cmd = Command::new("_FT.CURSOR", RootCommand::Read)
            .arg("READ")
            .arg("idx")
            .arg("placeholder")
            .reserve_slot_arg(3);
        cmd.set_shard_slot("cursor-42");
        assert_eq!(bytes_args(&cmd)[3], "cursor-42");
    }
}
