// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! A fake shard: a bare TCP listener that decodes one RESP command per
//! connection and replies with a scripted RESP value, standing in for a
//! real search-engine process in the integration tests.

use search_coord::reduce::resp::{self, RespValue};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpListener,
};

/// Spawns a listener on an ephemeral port that answers every command it
/// receives on every connection with `reply`, until the task is dropped.
pub async fn spawn_fake_shard(reply: Vec<u8>) -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind ephemeral port");
    let addr = listener.local_addr().expect("local addr");

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else { return };
            let reply = reply.clone();
            tokio::spawn(async move {
                let mut buf = Vec::new();
                loop {
                    match resp::parse(&buf) {
                        Ok((_, consumed)) => {
                            buf.drain(..consumed);
                            if socket.write_all(&reply).await.is_err() {
                                return;
                            }
                        },
                        Err(_) => {
                            let mut chunk = [0u8; 4096];
                            match socket.read(&mut chunk).await {
                                Ok(0) | Err(_) => return,
                                Ok(n) => buf.extend_from_slice(&chunk[..n]),
                            }
                        },
                    }
                }
            });
        }
    });

    addr
}

pub fn encode_array(items: &[RespValue]) -> Vec<u8> {
    search_coord::transport::tcp::encode(&RespValue::Array(items.to_vec()))
}
