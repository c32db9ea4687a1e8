// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! `coordinatord`: a thin binary wiring the library's pieces into a
//! running process. Resolves a config, initializes logging, stands up a
//! `Cluster`, and drives a minimal client-facing accept loop over
//! `FT.SEARCH`/`FT.AGGREGATE`/`FT.CURSOR`/`FT.INFO`/`CLUSTERSET`/
//! `CLUSTERREFRESH`/`CLUSTERINFO` — the full §6.1 command table is a
//! library concern exercised by tests, not a goal of this harness
//! (SPEC_FULL.md explicitly excludes "a general-purpose RPC framework").

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::{Context, Result, anyhow};
use search_coord::{
    cfg::{cli::resolve_config_path, config::Config, enums::TimeoutPolicy},
    command::{Command, RootCommand, rewrite_profile_for_shard, rewrite_search_for_shard},
    dispatch::{dispatch_aggregate, dispatch_cursor},
    error::CoordinatorError,
    reduce::{
        admin::reduce_info,
        resp::{self, RespValue},
        search::{
            CoordinatorProfile, SearchFlags, SearchResult, ShardProfile, TopKHeap, extract_shard_profile,
            parse_shard_reply, stitch_profiles,
        },
    },
    runtime::{cluster::Cluster, io_runtime::IORuntime},
    topology::{Endpoint, Shard, SlotRange, Topology},
    transport::{Connection, TcpTransport, tls::build_connector},
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};
use tokio_rustls::TlsConnector;
use tracing::{info, warn};

const CLIENT_READ_CHUNK: usize = 4096;

/// Everything the accept loop needs per client connection: the `Cluster`
/// and, when the host is TLS-configured, the shared connector every
/// shard connection wraps itself in (spec §4.1 "TLS").
#[derive(Clone)]
struct CoordinatorState {
    cluster: Arc<Cluster<TcpTransport>>,
    tls: Option<TlsConnector>,
    deadline: Duration,
    cursor_reply_threshold: usize,
    timeout_policy: TimeoutPolicy,
}

impl CoordinatorState {
    fn make_transport(&self) -> TcpTransport {
        match &self.tls {
            Some(connector) => TcpTransport::with_tls(None, connector.clone()),
            None => TcpTransport::new(None),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = resolve_config_path(
        &std::env::args().nth(1).unwrap_or_else(|| "config/coordinator.yaml".to_string()),
    )
    .context("resolving config path")?;
    let config = Config::load_from_file(&config_path).context("loading coordinator config")?;

    let logger_path = std::env::args().nth(2).unwrap_or_else(|| "config/logger.yaml".to_string());
    let _guard = search_coord::cfg::logger::init_logger(&logger_path).context("initializing logger")?;

    info!(io_threads = config.io_threads, "starting coordinatord");

    if config.tls.is_some() {
        // Needed once per process before any `rustls::ClientConfig` is
        // built (spec §4.1 "TLS").
        let _ = tokio_rustls::rustls::crypto::aws_lc_rs::default_provider().install_default();
    }

    let conns_per_node = config.conn_per_shard.unwrap_or(config.io_threads + 1);
    let runtimes: Vec<Arc<IORuntime<TcpTransport>>> = (0..config.io_threads)
        .map(|id| IORuntime::new(id, 1024, conns_per_node, config.topology_validation_timeout))
        .collect();
    let cluster = Arc::new(Cluster::new(runtimes));

    let tls = config.tls.as_ref().map(build_connector).transpose().context("building TLS connector")?;
    let state = CoordinatorState {
        cluster,
        tls,
        deadline: config.timeout,
        cursor_reply_threshold: config.cursor_reply_threshold,
        timeout_policy: config.timeout_policy,
    };

    // A single-shard bootstrap topology; a real deployment replaces this
    // via a client-issued `CLUSTERSET` once discovery completes (spec
    // §6.1, §6.3).
    let bootstrap = Topology::new(vec![Shard {
        node_id: "shard-0".to_string(),
        endpoint: Endpoint::new("127.0.0.1".to_string(), 7000),
        slot_ranges: vec![SlotRange::new(0, 16383).context("bootstrap slot range")?],
    }])
    .context("building bootstrap topology")?;
    apply_topology(&state, bootstrap).await;

    let listener = TcpListener::bind("127.0.0.1:7890").await.context("binding client listener")?;
    info!(addr = %listener.local_addr()?, "coordinatord listening");

    loop {
        let (socket, peer) = listener.accept().await.context("accepting client connection")?;
        let state = state.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_client(socket, state).await {
                warn!(%peer, error = %e, "client connection ended with an error");
            }
        });
    }
}

/// Publishes `topo` to every runtime and, since `IORuntime` itself never
/// creates connections for newly added nodes (its `apply_pending_topology`
/// only resets readiness), establishes one `ConnectionManager` pool per
/// runtime for every shard in the new topology (spec §4.3, §4.4). New
/// pools dial over TLS when `state` carries a connector (spec §4.1).
async fn apply_topology(state: &CoordinatorState, topo: Topology) {
    for i in 0..state.cluster.len() {
        let rt = state.cluster.runtime(i);
        for shard in topo.shards() {
            let node_id = shard.node_id.clone();
            let endpoint = shard.endpoint.clone();
            rt.with_conn_manager(|mgr| {
                mgr.add(&node_id, &endpoint, |e| Connection::new(e, state.make_transport()));
            })
            .await;
        }
    }
    state.cluster.broadcast_topology(topo);
}

async fn handle_client(mut socket: TcpStream, state: CoordinatorState) -> Result<()> {
    let mut buf = Vec::with_capacity(CLIENT_READ_CHUNK);
    loop {
        let command = match read_client_command(&mut socket, &mut buf).await? {
            Some(c) => c,
            None => return Ok(()),
        };

        let reply = match dispatch_client_command(&state, command).await {
            Ok(v) => v,
            Err(e) => RespValue::Error(e.to_wire_string()),
        };
        socket
            .write_all(&search_coord::transport::tcp::encode(&reply))
            .await
            .context("writing reply to client")?;
    }
}

/// Reads one client command, growing `buf` until a full RESP array of
/// bulk strings parses. Returns `None` on a clean EOF between commands.
async fn read_client_command(socket: &mut TcpStream, buf: &mut Vec<u8>) -> Result<Option<Command>> {
    loop {
        match resp::parse(buf) {
            Ok((value, consumed)) => {
                buf.drain(..consumed);
                return Ok(Some(resp_to_command(&value)?));
            },
            Err(CoordinatorError::ParseError(msg))
                if msg.contains("truncated") || msg.contains("missing CRLF") =>
            {
                let mut chunk = vec![0u8; CLIENT_READ_CHUNK];
                let n = socket.read(&mut chunk).await.context("reading client command")?;
                if n == 0 {
                    return if buf.is_empty() {
                        Ok(None)
                    } else {
                        Err(anyhow!("client disconnected mid-command"))
                    };
                }
                buf.extend_from_slice(&chunk[..n]);
            },
            Err(e) => return Err(anyhow!(e)),
        }
    }
}

fn resp_to_command(value: &RespValue) -> Result<Command> {
    let arr = value.as_array().ok_or_else(|| anyhow!("client command is not an array"))?;
    let mut parts = arr.iter().map(|v| v.as_bulk_str().map(<[u8]>::to_vec));
    let verb = parts.next().flatten().ok_or_else(|| anyhow!("missing command verb"))?;
    let verb_str = String::from_utf8_lossy(&verb).to_uppercase();

    let root = match verb_str.as_str() {
        "FT.SEARCH" | "FT.INFO" | "FT.CURSOR" | "CLUSTERSET" | "CLUSTERREFRESH" | "CLUSTERINFO" => RootCommand::Read,
        "FT.AGGREGATE" => RootCommand::Aggregate,
        "FT.PROFILE" => RootCommand::Profile,
        other => return Err(anyhow!("unsupported command: {other}")),
    };

    let mut cmd = Command::new(verb, root);
    for arg in parts {
        cmd = cmd.arg(arg.ok_or_else(|| anyhow!("non-bulk-string argument"))?);
    }
    Ok(cmd)
}

async fn dispatch_client_command(
    state: &CoordinatorState,
    command: Command,
) -> Result<RespValue, CoordinatorError> {
    match String::from_utf8_lossy(command.verb()).to_uppercase().as_str() {
        "FT.SEARCH" => dispatch_search(&state.cluster, command).await,
        "FT.INFO" => dispatch_info(&state.cluster, command).await,
        "FT.AGGREGATE" => dispatch_aggregate_cmd(state, command).await,
        "FT.CURSOR" => dispatch_cursor_cmd(state, command).await,
        "FT.PROFILE" => dispatch_profile_cmd(&state.cluster, command).await,
        "CLUSTERSET" => dispatch_clusterset(state, command).await,
        "CLUSTERREFRESH" => dispatch_clusterrefresh(state).await,
        "CLUSTERINFO" => Ok(state.cluster.info_reply().await),
        other => Err(CoordinatorError::ParseError(format!("unsupported command: {other}"))),
    }
}

fn client_args(command: &Command) -> Vec<String> {
    command.as_slice()[1..].iter().map(|a| String::from_utf8_lossy(a).to_string()).collect()
}

fn search_flags_from_args(args: &[String]) -> SearchFlags {
    let mut flags = SearchFlags::default();
    for a in args {
        if a.eq_ignore_ascii_case("SORTBY") {
            flags.with_sortby = true;
        } else if a.eq_ignore_ascii_case("WITHSCORES") {
            flags.with_scores = true;
        } else if a.eq_ignore_ascii_case("WITHPAYLOADS") {
            flags.with_payloads = true;
        } else if a.eq_ignore_ascii_case("WITHSORTKEYS") {
            flags.with_sortkeys = true;
        } else if a.eq_ignore_ascii_case("ASC") {
            flags.sortby_asc = true;
        }
    }
    flags
}

fn limit_from_args(args: &[String]) -> (usize, usize) {
    for (i, a) in args.iter().enumerate() {
        if a.eq_ignore_ascii_case("LIMIT") {
            let offset = args.get(i + 1).and_then(|v| v.parse().ok()).unwrap_or(0);
            let count = args.get(i + 2).and_then(|v| v.parse().ok()).unwrap_or(10);
            return (offset, count);
        }
    }
    (0, 10)
}

/// Forwards `FT.SEARCH` to every shard, rewrites it into the shard-private
/// form first, then merges replies through the top-K heap (spec §4.5,
/// §4.6). `WITHSCORES` is always forced on for the shard-bound copy by
/// the rewrite, so the merge always has a score to compare on, even when
/// the client didn't ask for one back.
async fn dispatch_search(
    cluster: &Cluster<TcpTransport>,
    command: Command,
) -> Result<RespValue, CoordinatorError> {
    let client_flags = search_flags_from_args(&client_args(&command));
    let (offset, count) = limit_from_args(&client_args(&command));
    let shard_flags = SearchFlags { with_scores: true, ..client_flags };

    let rewritten = rewrite_search_for_shard(command);
    let rt = cluster.next_runtime();
    let outcomes = fanout_over_runtime(rt, &rewritten).await;

    let mut heap = TopKHeap::new(offset + count, shard_flags.with_sortby, shard_flags.sortby_asc);
    let mut total: i64 = 0;
    for outcome in outcomes {
        let raw = outcome?;
        let (value, _) = resp::parse(&raw).map_err(|e| CoordinatorError::ParseError(e.to_string()))?;
        let (shard_total, results) = parse_shard_reply(&value, shard_flags)?;
        total += shard_total;
        for r in results {
            heap.push(r);
        }
    }

    let merged = heap.into_sorted_best_first();
    let page: Vec<&SearchResult> = merged.iter().skip(offset).take(count).collect();

    let mut items = vec![RespValue::Integer(total)];
    for r in page {
        items.push(RespValue::BulkString(r.doc_id.clone()));
        if client_flags.with_scores {
            items.push(RespValue::BulkString(r.score.to_string().into_bytes()));
        }
    }
    Ok(RespValue::Array(items))
}

/// Forwards `FT.PROFILE <idx> SEARCH ...` to every shard, merges the
/// search half the same way `dispatch_search` does, and stitches the
/// profile half into a combined reply (spec §4.6 "Profile stitching").
/// `FT.PROFILE ... AGGREGATE` isn't implemented by this harness: the
/// cursor driver in `dispatch::cursor` has no profile channel running
/// alongside its round-robin loop, so wiring that up is out of scope
/// here (see SPEC_FULL.md).
async fn dispatch_profile_cmd(
    cluster: &Cluster<TcpTransport>,
    command: Command,
) -> Result<RespValue, CoordinatorError> {
    let args = client_args(&command);
    if !args.get(1).is_some_and(|m| m.eq_ignore_ascii_case("SEARCH")) {
        return Err(CoordinatorError::ParseError(
            "FT.PROFILE only supports the SEARCH mode in this harness".to_string(),
        ));
    }
    let has_cursor = args.iter().any(|a| a.eq_ignore_ascii_case("WITHCURSOR"));

    let client_flags = search_flags_from_args(&args);
    let (offset, count) = limit_from_args(&args);
    let shard_flags = SearchFlags { with_scores: true, ..client_flags };

    let start = Instant::now();
    let rewritten = rewrite_profile_for_shard(command);
    let rt = cluster.next_runtime();
    let outcomes = fanout_over_runtime(rt, &rewritten).await;

    let mut heap = TopKHeap::new(offset + count, shard_flags.with_sortby, shard_flags.sortby_asc);
    let mut total: i64 = 0;
    let mut shard_profiles = Vec::with_capacity(outcomes.len());
    let node_ids = rt.with_conn_manager(|mgr| mgr.node_ids().map(str::to_string).collect::<Vec<_>>()).await;
    for (node_id, outcome) in node_ids.iter().zip(outcomes) {
        let raw = outcome?;
        let (value, _) = resp::parse(&raw).map_err(|e| CoordinatorError::ParseError(e.to_string()))?;

        let search_reply = value.as_array().and_then(|a| a.first()).unwrap_or(&value);
        let (shard_total, results) = parse_shard_reply(search_reply, shard_flags)?;
        total += shard_total;
        for r in results {
            heap.push(r);
        }

        let profile = extract_shard_profile(&value, has_cursor)?;
        shard_profiles.push(ShardProfile { node_id: node_id.clone(), shard_profile: profile });
    }

    let post_processing_start = Instant::now();
    let merged = heap.into_sorted_best_first();
    let page: Vec<&SearchResult> = merged.iter().skip(offset).take(count).collect();
    let post_processing_micros = post_processing_start.elapsed().as_micros() as u64;
    let total_micros = start.elapsed().as_micros() as u64;

    let (shard_profiles, coordinator) =
        stitch_profiles(shard_profiles, CoordinatorProfile { total_micros, post_processing_micros });

    let mut results_items = vec![RespValue::Integer(total)];
    for r in page {
        results_items.push(RespValue::BulkString(r.doc_id.clone()));
        if client_flags.with_scores {
            results_items.push(RespValue::BulkString(r.score.to_string().into_bytes()));
        }
    }

    let mut profile_items: Vec<RespValue> = shard_profiles
        .into_iter()
        .map(|p| RespValue::Array(vec![RespValue::BulkString(p.node_id.into_bytes()), p.shard_profile]))
        .collect();
    profile_items.push(RespValue::Array(vec![
        RespValue::BulkString(b"total_micros".to_vec()),
        RespValue::Integer(coordinator.total_micros as i64),
        RespValue::BulkString(b"post_processing_micros".to_vec()),
        RespValue::Integer(coordinator.post_processing_micros as i64),
    ]));

    Ok(RespValue::Array(vec![RespValue::Array(results_items), RespValue::Array(profile_items)]))
}

async fn dispatch_info(
    cluster: &Cluster<TcpTransport>,
    command: Command,
) -> Result<RespValue, CoordinatorError> {
    let rt = cluster.next_runtime();
    let outcomes = fanout_over_runtime(rt, &command).await;
    let mut replies = Vec::with_capacity(outcomes.len());
    for outcome in outcomes {
        let raw = outcome?;
        let (value, _) = resp::parse(&raw).map_err(|e| CoordinatorError::ParseError(e.to_string()))?;
        replies.push(value);
    }
    reduce_info(replies)
}

async fn dispatch_clusterset(
    state: &CoordinatorState,
    command: Command,
) -> Result<RespValue, CoordinatorError> {
    let args = client_args(&command);
    let refs: Vec<&str> = args.iter().map(String::as_str).collect();
    let topo =
        Topology::from_clusterset_args(&refs).map_err(|e| CoordinatorError::ParseError(e.to_string()))?;
    apply_topology(state, topo).await;
    Ok(RespValue::SimpleString("OK".to_string()))
}

/// Re-discovers the topology natively via `CLUSTER SHARDS` against
/// whichever shard the current topology already knows about (spec.md
/// §6's alternative to the hand-rolled `CLUSTERSET`).
async fn dispatch_clusterrefresh(state: &CoordinatorState) -> Result<RespValue, CoordinatorError> {
    let rt = state.cluster.next_runtime();
    let node_ids = rt.with_conn_manager(|mgr| mgr.node_ids().map(str::to_string).collect::<Vec<_>>()).await;
    let node_id = node_ids.first().ok_or(CoordinatorError::ClusterDown)?;

    let probe = Command::new("CLUSTER", RootCommand::Read).arg("SHARDS");
    let raw = rt
        .send_to_shard(node_id, &probe)
        .await
        .map_err(|e| CoordinatorError::ShardError(e.to_string()))?;
    let (value, _) = resp::parse(&raw).map_err(|e| CoordinatorError::ParseError(e.to_string()))?;
    let topo = state.cluster.refresh_from_shards_reply(&value)?;
    apply_topology(state, topo).await;
    Ok(RespValue::SimpleString("OK".to_string()))
}

/// Drives `FT.AGGREGATE ... WITHCURSOR` against every shard the chosen
/// runtime currently manages (spec §4.7, §6.1). The connection manager's
/// lock is held for the whole multi-round exchange rather than
/// reacquired per send, since `dispatch::dispatch_aggregate` drives
/// several rounds per call.
async fn dispatch_aggregate_cmd(
    state: &CoordinatorState,
    command: Command,
) -> Result<RespValue, CoordinatorError> {
    let rt = state.cluster.next_runtime();
    let node_ids = rt.with_conn_manager(|mgr| mgr.node_ids().map(str::to_string).collect::<Vec<_>>()).await;
    let mut guard = rt.lock_conn_manager().await;
    let reply = dispatch_aggregate(
        &mut guard,
        &node_ids,
        command,
        state.cursor_reply_threshold,
        state.deadline,
        state.timeout_policy,
    )
    .await?;
    drop(guard);

    let mut items = Vec::with_capacity(1 + reply.rows.len());
    if let Some(total) = reply.total_results {
        items.push(RespValue::Integer(total));
    }
    for row in reply.rows {
        let (value, _) = resp::parse(&row).map_err(|e| CoordinatorError::ParseError(e.to_string()))?;
        items.push(value);
    }
    Ok(RespValue::Array(items))
}

/// Forwards a client-issued `FT.CURSOR READ|DEL` to the lone shard in a
/// single-shard topology (spec §6.1).
async fn dispatch_cursor_cmd(
    state: &CoordinatorState,
    command: Command,
) -> Result<RespValue, CoordinatorError> {
    let rt = state.cluster.next_runtime();
    let node_ids = rt.with_conn_manager(|mgr| mgr.node_ids().map(str::to_string).collect::<Vec<_>>()).await;
    let mut guard = rt.lock_conn_manager().await;
    dispatch_cursor(&mut guard, &node_ids, &command).await
}

/// Fans `command` out over every shard the given runtime currently
/// manages, pinning `target_shard` per clone the way
/// `dispatch::dispatch_fanout` does against a `Topology` — this harness
/// instead walks the runtime's live connection pools directly, since the
/// accept loop has no independent `Topology` handle of its own.
async fn fanout_over_runtime(
    rt: &Arc<IORuntime<TcpTransport>>,
    command: &Command,
) -> Vec<Result<Vec<u8>, CoordinatorError>> {
    let node_ids = rt.with_conn_manager(|mgr| mgr.node_ids().map(str::to_string).collect::<Vec<_>>()).await;
    if node_ids.is_empty() {
        return vec![Err(CoordinatorError::ClusterDown)];
    }

    let mut outcomes = Vec::with_capacity(node_ids.len());
    for (i, node_id) in node_ids.iter().enumerate() {
        let per_shard = command.clone_for_shard(i as i32);
        let outcome = rt
            .send_to_shard(node_id, &per_shard)
            .await
            .map_err(|e| CoordinatorError::ShardError(e.to_string()));
        outcomes.push(outcome);
    }
    outcomes
}
