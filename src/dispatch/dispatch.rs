// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Dispatch logic (spec §4.5): single-shard forwarding and fanout over
//! every shard in a topology.

use crate::{
    command::{Command, TARGET_FANOUT},
    error::CoordinatorError,
    topology::Topology,
    transport::{ConnectionManager, connection::Transport},
};

use super::request_context::{RequestContext, ShardOutcome};

fn outcome_from_send(result: anyhow::Result<Vec<u8>>) -> ShardOutcome {
    result.map_err(|e| CoordinatorError::ShardError(e.to_string()))
}

/// Sends a single-shard command to the shard named by `command.target_shard`
/// and returns its raw reply, forwarded verbatim (spec §4.5 "invoke
/// singleReply reducer which forwards the raw reply").
pub async fn dispatch_single<T: Transport>(
    topology: &Topology,
    conn_manager: &mut ConnectionManager<T>,
    command: &Command,
) -> ShardOutcome {
    if topology.is_empty() {
        return Err(CoordinatorError::ClusterDown);
    }
    debug_assert_ne!(
        command.target_shard, TARGET_FANOUT,
        "dispatch_single requires a resolved target_shard"
    );
    let Some(shard) = topology.shard(command.target_shard as usize) else {
        return Err(CoordinatorError::ShardError(format!(
            "no such shard: {}",
            command.target_shard
        )));
    };
    let Some(conn) = conn_manager.get(&shard.node_id) else {
        return Err(CoordinatorError::ShardError(format!(
            "no connected connection for shard {}",
            shard.node_id
        )));
    };
    outcome_from_send(conn.send(command).await)
}

/// Fans `command` out to every shard in `topology`, cloning it per shard
/// with `target_shard` pinned (spec §4.5 "Fanout command"). Returns one
/// outcome per shard, in shard order.
pub async fn dispatch_fanout<T: Transport>(
    topology: &Topology,
    conn_manager: &mut ConnectionManager<T>,
    command: &Command,
) -> RequestContext {
    let mut ctx = RequestContext::new(topology.num_shards());
    if topology.is_empty() {
        return ctx;
    }

    for (i, shard) in topology.shards().iter().enumerate() {
        let slot = ctx.reserve_slot();
        let per_shard = command.clone_for_shard(i as i32);
        let outcome = match conn_manager.get(&shard.node_id) {
            Some(conn) => outcome_from_send(conn.send(&per_shard).await),
            None => Err(CoordinatorError::ShardError(format!(
                "no connected connection for shard {}",
                shard.node_id
            ))),
        };
        ctx.record(slot, outcome);
    }

    ctx
}

#[cfg(test)]
mod tests {
    use anyhow::Result;

    use super::*;
    use crate::{
        cfg::enums::Protocol,
        command::{Command, RootCommand},
        state_machine::connect_states::Dialer,
        topology::{Endpoint, Shard, SlotRange},
        transport::Connection,
    };

    struct AlwaysUp;

    impl Dialer for AlwaysUp {
        async fn connect(&self, _endpoint: &Endpoint) -> Result<()> {
            Ok(())
        }
        async fn authenticate(&self) -> Result<()> {
            Ok(())
        }
        fn requires_auth(&self) -> bool {
            false
        }
    }

    impl Transport for AlwaysUp {
        async fn send_hello(&self, _protocol: Protocol) -> Result<()> {
            Ok(())
        }
        async fn send_command(&self, _command: &Command) -> Result<Vec<u8>> {
            Ok(b"+OK\r\n".to_vec())
        }
    }

    async fn connected_manager(node_ids: &[&str]) -> ConnectionManager<AlwaysUp> {
        let mut mgr = ConnectionManager::new(1);
        for id in node_ids {
            mgr.add(id, &Endpoint::new("h".to_string(), 1), |e| Connection::new(e, AlwaysUp));
        }
        for id in node_ids {
            if let Some(conn) = mgr.get(id) {
                conn.drive(&tokio_util::sync::CancellationToken::new())
                    .await
                    .expect("connects");
            }
        }
        mgr
    }

    fn two_shard_topology() -> Topology {
        Topology::new(vec![
            Shard {
                node_id: "a".to_string(),
                endpoint: Endpoint::new("h".to_string(), 1),
                slot_ranges: vec![SlotRange::new(0, 8191).expect("valid")],
            },
            Shard {
                node_id: "b".to_string(),
                endpoint: Endpoint::new("h".to_string(), 1),
                slot_ranges: vec![SlotRange::new(8192, 16383).expect("valid")],
            },
        ])
        .expect("valid")
    }

    #[tokio::test]
    async fn empty_topology_is_cluster_down() {
        let topo = Topology::default();
        let mut mgr: ConnectionManager<AlwaysUp> = ConnectionManager::new(1);
        let mut cmd = Command::new("FT.SEARCH", RootCommand::Read);
        cmd.target_shard = 0;
        let outcome = dispatch_single(&topo, &mut mgr, &cmd).await;
        assert_eq!(outcome, Err(CoordinatorError::ClusterDown));
    }

    #[tokio::test]
    async fn fanout_collects_one_outcome_per_shard() {
        let topo = two_shard_topology();
        let mut mgr = connected_manager(&["a", "b"]).await;
        let cmd = Command::new("FT.INFO", RootCommand::Read).arg("idx");
        let ctx = dispatch_fanout(&topo, &mut mgr, &cmd).await;
        assert!(ctx.is_complete());
        assert_eq!(ctx.replied(), 2);
    }
}
