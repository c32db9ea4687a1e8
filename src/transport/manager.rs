// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! ConnectionManager (spec §3 `C4`, §4.2): node-id keyed map of
//! `ConnectionPool`s, exclusive to one `IORuntime`'s loop. Grounded on
//! `MRConnManager` in `rmr/conn.c` (a dict of node id -> pool).

use std::collections::HashMap;

use crate::topology::Endpoint;

use super::{connection::Transport, Connection, ConnectionPool};

/// Owns every connection pool for the shards an `IORuntime` talks to.
/// Single-threaded by design (spec §4.2 "mutations only performed from
/// that loop") — a plain `HashMap` is correct here, not `DashMap`.
pub struct ConnectionManager<T: Transport> {
    pools: HashMap<String, ConnectionPool<T>>,
    conns_per_node: usize,
}

impl<T: Transport> ConnectionManager<T> {
    pub fn new(conns_per_node: usize) -> Self {
        Self { pools: HashMap::new(), conns_per_node }
    }

    /// Adds a node's pool, replacing any existing pool for that id
    /// wholesale if the endpoint changed (mirrors `MRConnManager_Add`:
    /// a no-op if the node's address is unchanged). `make_conn` builds one
    /// fresh `Connection`; it is called `conns_per_node` times.
    pub fn add(
        &mut self,
        node_id: &str,
        endpoint: &Endpoint,
        mut make_conn: impl FnMut(Endpoint) -> Connection<T>,
    ) {
        if let Some(existing) = self.pools.get(node_id) {
            if existing.endpoint() == Some(endpoint) {
                return;
            }
        }
        let conns = (0..self.conns_per_node)
            .map(|_| make_conn(endpoint.clone()))
            .collect();
        self.pools.insert(node_id.to_string(), ConnectionPool::new(conns));
    }

    /// Removes a node's pool outright (spec §4.2 `disconnect`).
    pub fn disconnect(&mut self, node_id: &str) -> bool {
        self.pools.remove(node_id).is_some()
    }

    /// Returns a connection from the named node's pool via round-robin
    /// (spec §4.2 `get`).
    pub fn get(&mut self, node_id: &str) -> Option<&mut Connection<T>> {
        self.pools.get_mut(node_id).and_then(|pool| pool.get())
    }

    pub fn node_ids(&self) -> impl Iterator<Item = &str> {
        self.pools.keys().map(|k| k.as_str())
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.pools.contains_key(node_id)
    }

    /// True once every node in `node_ids` has at least one `Connected`
    /// connection in its pool (spec §4.3 readiness gating).
    pub fn all_connected<'a>(&self, node_ids: impl Iterator<Item = &'a str>) -> bool {
        for id in node_ids {
            match self.pools.get(id) {
                Some(pool) => {
                    if !pool.iter().any(|c| c.is_connected()) {
                        return false;
                    }
                },
                None => return false,
            }
        }
        true
    }

    /// Adjusts every pool's size to `num` (spec §4.2 `shrink`/`expand`).
    pub fn resize_all(&mut self, num: usize, mut make_conn: impl FnMut(Endpoint) -> Connection<T>) {
        for pool in self.pools.values_mut() {
            let current = pool.len();
            if num < current {
                pool.shrink(num.max(1));
            } else if num > current {
                if let Some(endpoint) = pool.endpoint().cloned() {
                    pool.expand(num, || make_conn(endpoint.clone()));
                }
            }
        }
        self.conns_per_node = num;
    }
}
