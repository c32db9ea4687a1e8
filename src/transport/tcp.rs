// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! TCP-backed [`Transport`]/[`Dialer`] implementation: the concrete
//! socket layer underneath a shard `Connection` (spec §4.1, §6.2). Each
//! instance owns one TCP connection's split halves behind a tokio
//! `Mutex`, mirroring the split-read/split-write shape the teacher's
//! `ClientConnection` uses for its own wire connection.

use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    sync::Mutex,
};
use tokio_rustls::{TlsConnector, rustls::pki_types::ServerName};

use crate::{
    cfg::enums::Protocol,
    command::Command,
    reduce::resp::{self, RespValue},
    state_machine::connect_states::Dialer,
    topology::Endpoint,
};

use super::connection::{RawReply, Transport};

const READ_CHUNK: usize = 4096;

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// One real TCP socket to a shard, plaintext or TLS-wrapped. `auth_token`
/// is sent as `AUTH <token>` on connect when present (spec §4.1 "on
/// success with auth present, the connection sends AUTH and transitions
/// to `ReAuth`"). When `tls` is set, `connect` dials `endpoint`'s
/// TLS-preferred port and performs the handshake before the connection
/// is usable (spec §4.1 "TLS").
pub struct TcpTransport {
    auth_token: Option<String>,
    tls: Option<TlsConnector>,
    halves: Mutex<Option<(BoxedReader, BoxedWriter)>>,
}

impl TcpTransport {
    pub fn new(auth_token: Option<String>) -> Self {
        Self { auth_token, tls: None, halves: Mutex::new(None) }
    }

    /// Builds a transport that wraps every connection in TLS using
    /// `connector` (spec §4.1). `connector` is shared across every
    /// `TcpTransport` an `IORuntime` owns.
    pub fn with_tls(auth_token: Option<String>, connector: TlsConnector) -> Self {
        Self { auth_token, tls: Some(connector), halves: Mutex::new(None) }
    }

    async fn write_command(writer: &mut BoxedWriter, args: &[Vec<u8>]) -> Result<()> {
        let mut buf = Vec::new();
        buf.extend_from_slice(format!("*{}\r\n", args.len()).as_bytes());
        for arg in args {
            buf.extend_from_slice(format!("${}\r\n", arg.len()).as_bytes());
            buf.extend_from_slice(arg);
            buf.extend_from_slice(b"\r\n");
        }
        writer.write_all(&buf).await.context("writing command to shard")
    }

    /// Reads one complete RESP value off the socket, growing the buffer
    /// until `resp::parse` stops reporting a truncation (rather than a
    /// genuine malformed-reply error).
    async fn read_reply(reader: &mut BoxedReader) -> Result<RawReply> {
        let mut buf = Vec::with_capacity(READ_CHUNK);
        loop {
            match resp::parse(&buf) {
                Ok((_, consumed)) => {
                    buf.truncate(consumed);
                    return Ok(buf);
                },
                Err(crate::error::CoordinatorError::ParseError(msg))
                    if msg.contains("truncated") || msg.contains("missing CRLF") =>
                {
                    let mut chunk = vec![0u8; READ_CHUNK];
                    let n = reader.read(&mut chunk).await.context("reading shard reply")?;
                    if n == 0 {
                        bail!("shard closed the connection mid-reply");
                    }
                    buf.extend_from_slice(&chunk[..n]);
                },
                Err(e) => bail!(anyhow!(e)),
            }
        }
    }
}

impl Dialer for TcpTransport {
    async fn connect(&self, endpoint: &Endpoint) -> Result<()> {
        let port = endpoint.dial_port(self.tls.is_some());
        let stream = tokio::time::timeout(
            Duration::from_secs(5),
            TcpStream::connect((endpoint.host.as_str(), port)),
        )
        .await
        .context("connect timed out")?
        .with_context(|| format!("connecting to shard at {endpoint}"))?;
        stream.set_nodelay(true)?;

        let (r, w): (BoxedReader, BoxedWriter) = match &self.tls {
            Some(connector) => {
                let server_name = ServerName::try_from(endpoint.host.clone())
                    .map_err(|_| anyhow!("invalid TLS server name: {}", endpoint.host))?;
                let tls_stream = tokio::time::timeout(
                    Duration::from_secs(5),
                    connector.connect(server_name, stream),
                )
                .await
                .context("TLS handshake timed out")?
                .with_context(|| format!("TLS handshake with shard at {endpoint} failed"))?;
                let (r, w) = tokio::io::split(tls_stream);
                (Box::new(r), Box::new(w))
            },
            None => {
                let (r, w) = stream.into_split();
                (Box::new(r), Box::new(w))
            },
        };
        *self.halves.lock().await = Some((r, w));
        Ok(())
    }

    async fn authenticate(&self) -> Result<()> {
        let Some(token) = &self.auth_token else { return Ok(()) };
        let mut guard = self.halves.lock().await;
        let (reader, writer) = guard.as_mut().ok_or_else(|| anyhow!("not connected"))?;
        Self::write_command(writer, &[b"AUTH".to_vec(), token.clone().into_bytes()]).await?;
        let reply = Self::read_reply(reader).await?;
        let (value, _) = resp::parse(&reply)?;
        if value.is_error() {
            bail!("shard rejected AUTH");
        }
        Ok(())
    }

    fn requires_auth(&self) -> bool {
        self.auth_token.is_some()
    }
}

impl Transport for TcpTransport {
    async fn send_hello(&self, protocol: Protocol) -> Result<()> {
        let mut guard = self.halves.lock().await;
        let (reader, writer) = guard.as_mut().ok_or_else(|| anyhow!("not connected"))?;
        let version = match protocol {
            Protocol::Resp2 => "2",
            Protocol::Resp3 => "3",
        };
        Self::write_command(writer, &[b"HELLO".to_vec(), version.as_bytes().to_vec()]).await?;
        let reply = Self::read_reply(reader).await?;
        let (value, _) = resp::parse(&reply)?;
        if value.is_error() {
            bail!("shard rejected HELLO {version}");
        }
        Ok(())
    }

    async fn send_command(&self, command: &Command) -> Result<RawReply> {
        let mut guard = self.halves.lock().await;
        let (reader, writer) = guard.as_mut().ok_or_else(|| anyhow!("not connected"))?;
        Self::write_command(writer, command.as_slice()).await?;
        Self::read_reply(reader).await
    }
}

/// Encodes a coordinator reply for the client-facing socket. RESP3
/// `Map` values are flattened to a RESP2-compatible array (`[k1, v1, k2,
/// v2, ...]`) since the accept loop in `main` speaks RESP2 to clients
/// (spec §6.2's dual-protocol handling is the shard-facing side; the
/// client-facing listener here is the thin harness spec A.4 describes,
/// not a full protocol negotiator).
pub fn encode(value: &RespValue) -> Vec<u8> {
    match value {
        RespValue::SimpleString(s) => format!("+{s}\r\n").into_bytes(),
        RespValue::Error(e) => format!("-{e}\r\n").into_bytes(),
        RespValue::Integer(i) => format!(":{i}\r\n").into_bytes(),
        RespValue::Double(d) => format!("${}\r\n{}\r\n", d.to_string().len(), d).into_bytes(),
        RespValue::Boolean(b) => format!(":{}\r\n", if *b { 1 } else { 0 }).into_bytes(),
        RespValue::BulkString(b) => {
            let mut out = format!("${}\r\n", b.len()).into_bytes();
            out.extend_from_slice(b);
            out.extend_from_slice(b"\r\n");
            out
        },
        RespValue::Null => b"$-1\r\n".to_vec(),
        RespValue::Array(items) => {
            let mut out = format!("*{}\r\n", items.len()).into_bytes();
            for item in items {
                out.extend_from_slice(&encode(item));
            }
            out
        },
        RespValue::Map(pairs) => {
            let mut out = format!("*{}\r\n", pairs.len() * 2).into_bytes();
            for (k, v) in pairs {
                out.extend_from_slice(&encode(k));
                out.extend_from_slice(&encode(v));
            }
            out
        },
    }
}
