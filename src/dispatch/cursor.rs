// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Cursor-streaming dispatch for `FT.AGGREGATE ... WITHCURSOR` and
//! `FT.CURSOR READ|DEL` (spec §3 `C11`/`C13`, §4.7, §4.8, §6.1): drives a
//! real [`CursorIterator`] against shard connections round by round,
//! pumping its [`Channel`][crate::cursor::channel::Channel] into an
//! [`AggregateAccumulator`].

use std::{sync::Arc, time::Duration};

use crate::{
    cfg::enums::TimeoutPolicy,
    command::{Command, rewrite_aggregate_for_shard},
    cursor::iterator::{Iterator as CursorIterator, TriggerOutcome},
    error::CoordinatorError,
    reduce::{
        aggregate::{AggregateAccumulator, AggregateReply},
        resp::{self, RespValue},
    },
    transport::{ConnectionManager, connection::Transport, tcp},
};

/// True when the client asked for an exact total up front rather than
/// accepting a best-effort running count as rows stream in (spec §4.7
/// "WITHCOUNT barrier").
fn wants_count_barrier(command: &Command) -> bool {
    command.as_slice().iter().any(|a| a.eq_ignore_ascii_case(b"WITHCOUNT"))
}

/// One shard's cursor reply: `[rows, cursor_id]` (spec §4.7 "RESP2:
/// cursor id element is 0"). Under WITHCOUNT, a shard's first reply
/// carries its running total as `rows[0]`, stripped here and handed back
/// separately so the caller can feed it to the barrier.
fn split_cursor_reply(value: &RespValue) -> Result<(Vec<RespValue>, i64), CoordinatorError> {
    let arr = value
        .as_array()
        .ok_or_else(|| CoordinatorError::ParseError("cursor reply is not an array".to_string()))?;
    let rows = arr
        .first()
        .and_then(RespValue::as_array)
        .ok_or_else(|| CoordinatorError::ParseError("cursor reply missing rows array".to_string()))?
        .to_vec();
    let cursor_id = arr
        .get(1)
        .and_then(RespValue::as_i64)
        .ok_or_else(|| CoordinatorError::ParseError("cursor reply missing cursor id".to_string()))?;
    Ok((rows, cursor_id))
}

/// Sends every `(shard_index, command)` pair in `flight`, in order,
/// feeding each outcome into `iterator`'s channel and bookkeeping (spec
/// §4.7 "Reply callback"). Shard errors and parse failures are treated
/// the same way a cursor EOF is: the shard is marked depleted so a
/// broken shard can't wedge the round-robin forever.
async fn run_round<T: Transport>(
    conn_manager: &mut ConnectionManager<T>,
    node_ids: &[String],
    flight: Vec<(usize, Command)>,
    iterator: &Arc<CursorIterator>,
    accumulator: &AggregateAccumulator,
    first_reply_seen: &mut [bool],
) {
    for (shard_index, command) in flight {
        let node_id = &node_ids[shard_index];
        let sent = match conn_manager.get(node_id) {
            Some(conn) => conn.send(&command).await.map_err(|e| CoordinatorError::ShardError(e.to_string())),
            None => Err(CoordinatorError::ShardError(format!("no connected connection for shard {node_id}"))),
        };

        let parsed = sent.and_then(|raw| resp::parse(&raw)).and_then(|(value, _)| split_cursor_reply(&value));

        let first_reply = !first_reply_seen[shard_index];
        first_reply_seen[shard_index] = true;

        match parsed {
            Ok((mut rows, cursor_id)) => {
                if let Some(barrier) = &accumulator.barrier {
                    if first_reply {
                        let total = rows.first().and_then(RespValue::as_i64).unwrap_or(0);
                        if !rows.is_empty() {
                            rows.remove(0);
                        }
                        barrier.notify(total, false);
                    }
                }
                for row in rows {
                    iterator.channel.push(Ok(tcp::encode(&row)));
                }
                iterator.on_shard_reply(shard_index, cursor_id == 0);
            },
            Err(e) => {
                if let Some(barrier) = &accumulator.barrier {
                    if first_reply {
                        barrier.notify(0, true);
                    }
                }
                iterator.channel.push(Err(e));
                iterator.on_shard_reply(shard_index, true);
            },
        }
    }
}

/// Drains every entry currently sitting in `iterator`'s channel without
/// blocking for more (a zero deadline makes [`Channel::pop`] resolve as
/// soon as the queue is empty), pushing rows into `accumulator`.
async fn drain_channel(iterator: &Arc<CursorIterator>, accumulator: &mut AggregateAccumulator) {
    while let Some(entry) = iterator.channel.pop(Duration::from_millis(0)).await {
        if let Ok(row) = entry {
            accumulator.push_row(row);
        }
    }
}

/// Drives `FT.AGGREGATE ... WITHCURSOR` end to end: builds one
/// shard-private command per node, constructs a [`CursorIterator`] over
/// them, and alternates dispatching rounds via `maybe_trigger_next` with
/// draining the channel until the iterator reports `Drained` (spec
/// §4.7). `command` is the client's original, unrewritten `FT.AGGREGATE`.
///
/// Callers holding a shared `IORuntime` reach this through
/// `IORuntime::lock_conn_manager`, which keeps the manager's lock held
/// for every round this driver issues rather than re-acquiring it per
/// send.
pub async fn dispatch_aggregate<T: Transport>(
    conn_manager: &mut ConnectionManager<T>,
    node_ids: &[String],
    command: Command,
    cursor_reply_threshold: usize,
    deadline: Duration,
    policy: TimeoutPolicy,
) -> Result<AggregateReply, CoordinatorError> {
    if node_ids.is_empty() {
        return Err(CoordinatorError::ClusterDown);
    }

    let with_count = wants_count_barrier(&command);
    let per_shard: Vec<Command> = (0..node_ids.len())
        .map(|i| rewrite_aggregate_for_shard(command.clone()).clone_for_shard(i as i32))
        .collect();

    let iterator = CursorIterator::new(per_shard.clone());
    let mut accumulator = AggregateAccumulator::new(node_ids.len(), with_count, policy);
    let mut first_reply_seen = vec![false; node_ids.len()];
    let deadline_at = tokio::time::Instant::now() + deadline;

    // `Iterator::new` already accounts for `per_shard` as in flight (spec
    // §4.7 "creates an Iterator with pending = in_process = numShards"),
    // so the initial round is sent directly rather than through
    // `maybe_trigger_next`.
    run_round(
        conn_manager,
        node_ids,
        per_shard.into_iter().enumerate().collect(),
        &iterator,
        &accumulator,
        &mut first_reply_seen,
    )
    .await;

    loop {
        if tokio::time::Instant::now() >= deadline_at {
            iterator.mark_timed_out();
        }
        drain_channel(&iterator, &mut accumulator).await;

        match iterator.maybe_trigger_next(cursor_reply_threshold) {
            TriggerOutcome::InFlight => {
                // Unreachable from this driver: `run_round` always awaits
                // every send before returning, so `in_process` is back to
                // 0 by the time we check. Kept as a recognizable state
                // rather than panicking in case a future non-blocking
                // driver reuses this loop.
                break;
            },
            TriggerOutcome::MoreComing => continue,
            TriggerOutcome::Dispatch(flight) => {
                run_round(conn_manager, node_ids, flight, &iterator, &accumulator, &mut first_reply_seen).await;
            },
            TriggerOutcome::Drained { .. } => {
                drain_channel(&iterator, &mut accumulator).await;
                iterator.release();
                break;
            },
        }
    }

    accumulator.finish(tokio::time::Instant::now() >= deadline_at)
}

/// Forwards a client-issued `FT.CURSOR READ|DEL` directly to the lone
/// shard in a single-shard topology (spec §6.1 "thin forwarder; handled
/// locally if a single shard"). A multi-shard cursor is never addressed
/// by a client directly — `dispatch_aggregate` mints and owns its own
/// per-shard `FT.CURSOR READ`/`DEL` commands internally.
pub async fn dispatch_cursor<T: Transport>(
    conn_manager: &mut ConnectionManager<T>,
    node_ids: &[String],
    command: &Command,
) -> Result<RespValue, CoordinatorError> {
    let node_id = match node_ids {
        [node_id] => node_id,
        _ => {
            return Err(CoordinatorError::ParseError(
                "FT.CURSOR can only be addressed directly against a single-shard topology".to_string(),
            ));
        },
    };
    let raw = match conn_manager.get(node_id) {
        Some(conn) => conn.send(command).await.map_err(|e| CoordinatorError::ShardError(e.to_string()))?,
        None => return Err(CoordinatorError::ShardError(format!("no connected connection for shard {node_id}"))),
    };
    resp::parse(&raw).map(|(value, _)| value)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use anyhow::Result;

    use super::*;
    use crate::{cfg::enums::Protocol, command::RootCommand, state_machine::connect_states::Dialer, transport::Connection};

    /// A fake shard that replies with a scripted queue of raw RESP
    /// payloads, one per call to `send_command`, so the driver's
    /// round-by-round behavior can be exercised without a real socket.
    struct ScriptedShard {
        replies: StdMutex<std::collections::VecDeque<Vec<u8>>>,
    }

    impl ScriptedShard {
        fn new(replies: Vec<Vec<u8>>) -> Self {
            Self { replies: StdMutex::new(replies.into_iter().collect()) }
        }
    }

    impl Dialer for ScriptedShard {
        async fn connect(&self, _endpoint: &crate::topology::Endpoint) -> Result<()> {
            Ok(())
        }
        async fn authenticate(&self) -> Result<()> {
            Ok(())
        }
        fn requires_auth(&self) -> bool {
            false
        }
    }

    impl Transport for ScriptedShard {
        async fn send_hello(&self, _protocol: Protocol) -> Result<()> {
            Ok(())
        }
        async fn send_command(&self, _command: &Command) -> Result<Vec<u8>> {
            let mut guard = self.replies.lock().unwrap_or_else(|e| e.into_inner());
            Ok(guard.pop_front().unwrap_or_else(|| b"*2\r\n*0\r\n:0\r\n".to_vec()))
        }
    }

    async fn connected_manager(replies_per_shard: Vec<Vec<Vec<u8>>>) -> (ConnectionManager<ScriptedShard>, Vec<String>) {
        let mut mgr = ConnectionManager::new(1);
        let mut node_ids = Vec::new();
        for (i, replies) in replies_per_shard.into_iter().enumerate() {
            let node_id = format!("shard-{i}");
            let endpoint = crate::topology::Endpoint::new("h".to_string(), 1);
            mgr.add(&node_id, &endpoint, |e| Connection::new(e, ScriptedShard::new(replies.clone())));
            node_ids.push(node_id);
        }
        for node_id in &node_ids {
            if let Some(conn) = mgr.get(node_id) {
                conn.drive(&tokio_util::sync::CancellationToken::new()).await.expect("connects");
            }
        }
        (mgr, node_ids)
    }

    fn aggregate_command() -> Command {
        Command::new("FT.AGGREGATE", RootCommand::Aggregate).arg("idx").arg("*").arg("WITHCURSOR")
    }

    #[tokio::test]
    async fn single_round_two_shards_drains_all_rows() {
        let (mut mgr, node_ids) = connected_manager(vec![
            vec![b"*2\r\n*1\r\n$4\r\nrow1\r\n:0\r\n".to_vec()],
            vec![b"*2\r\n*1\r\n$4\r\nrow2\r\n:0\r\n".to_vec()],
        ])
        .await;

        let reply = dispatch_aggregate(
            &mut mgr,
            &node_ids,
            aggregate_command(),
            0,
            Duration::from_secs(5),
            TimeoutPolicy::Strict,
        )
        .await
        .expect("completes");
        assert_eq!(reply.rows.len(), 2);
        assert_eq!(reply.total_results, None);
    }

    #[tokio::test]
    async fn multi_round_cursor_keeps_polling_until_eof() {
        let (mut mgr, node_ids) = connected_manager(vec![vec![
            b"*2\r\n*1\r\n$4\r\nrow1\r\n:7\r\n".to_vec(),
            b"*2\r\n*1\r\n$4\r\nrow2\r\n:0\r\n".to_vec(),
        ]])
        .await;

        let reply = dispatch_aggregate(
            &mut mgr,
            &node_ids,
            aggregate_command(),
            0,
            Duration::from_secs(5),
            TimeoutPolicy::Strict,
        )
        .await
        .expect("completes");
        assert_eq!(reply.rows.len(), 2);
    }

    #[tokio::test]
    async fn withcount_barrier_sums_per_shard_totals() {
        let (mut mgr, node_ids) = connected_manager(vec![
            vec![b"*2\r\n*2\r\n:40\r\n$4\r\nrow1\r\n:0\r\n".to_vec()],
            vec![b"*2\r\n*2\r\n:60\r\n$4\r\nrow2\r\n:0\r\n".to_vec()],
        ])
        .await;

        let cmd = Command::new("FT.AGGREGATE", RootCommand::Aggregate)
            .arg("idx")
            .arg("*")
            .arg("WITHCURSOR")
            .arg("WITHCOUNT");
        let reply =
            dispatch_aggregate(&mut mgr, &node_ids, cmd, 0, Duration::from_secs(5), TimeoutPolicy::Strict)
                .await
                .expect("completes");
        assert_eq!(reply.total_results, Some(100));
        assert_eq!(reply.rows.len(), 2);
    }

    #[tokio::test]
    async fn dispatch_cursor_forwards_directly_on_single_shard_topology() {
        let (mut mgr, node_ids) = connected_manager(vec![vec![b"+OK\r\n".to_vec()]]).await;
        let cmd = Command::new("FT.CURSOR", RootCommand::Read).arg("READ").arg("idx").arg("42");
        let value = dispatch_cursor(&mut mgr, &node_ids, &cmd).await.expect("forwards");
        assert_eq!(value, RespValue::SimpleString("OK".to_string()));
    }

    #[tokio::test]
    async fn dispatch_cursor_rejects_multi_shard_topology() {
        let (mut mgr, node_ids) =
            connected_manager(vec![vec![b"+OK\r\n".to_vec()], vec![b"+OK\r\n".to_vec()]]).await;
        let cmd = Command::new("FT.CURSOR", RootCommand::Read).arg("READ").arg("idx").arg("42");
        let err = dispatch_cursor(&mut mgr, &node_ids, &cmd).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::ParseError(_)));
    }

    #[tokio::test]
    async fn empty_topology_is_cluster_down() {
        let mut mgr: ConnectionManager<ScriptedShard> = ConnectionManager::new(1);
        let err = dispatch_aggregate(
            &mut mgr,
            &[],
            aggregate_command(),
            0,
            Duration::from_secs(5),
            TimeoutPolicy::Strict,
        )
        .await
        .unwrap_err();
        assert_eq!(err, CoordinatorError::ClusterDown);
    }
}
