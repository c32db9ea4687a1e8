// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Connection (spec §3 `C2`, §4.1): one shard link, owned by exactly one
//! `IORuntime`'s loop. Non-blocking `send`; replies land on the same
//! reactor thread via a caller-supplied callback.

use anyhow::{Result, bail};
use tokio_util::sync::CancellationToken;

use crate::{
    cfg::enums::Protocol,
    command::Command,
    state_machine::connect_states::{ConnectCtx, Dialer},
    topology::Endpoint,
};

/// Raw bytes a shard sent back, handed to the reply callback. Parsing
/// into a typed RESP value happens in `reduce::resp`, not here.
pub type RawReply = Vec<u8>;

/// Everything a `Connection` needs from the host's async I/O layer:
/// dialing, AUTH, protocol negotiation, and writing a formatted command.
/// Kept as a trait so the reactor-thread machinery is testable without a
/// real socket.
pub trait Transport: Dialer {
    fn send_hello(&self, protocol: Protocol) -> impl Future<Output = Result<()>> + Send;
    fn send_command(
        &self,
        command: &Command,
    ) -> impl Future<Output = Result<RawReply>> + Send;
}

/// One connection to one shard node. `send` is non-blocking: it enqueues
/// with the transport and returns immediately once the transport future
/// resolves on the reactor; this type does not itself spawn tasks, that
/// is the `IORuntime`'s job (spec §4.3).
pub struct Connection<T: Transport> {
    ctx: ConnectCtx<T>,
    protocol_negotiated: Protocol,
}

/// Returned by `send` when the connection cannot accept work right now
/// (spec §4.1 "returns a transient error; sends are non-blocking").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotConnected;

impl std::fmt::Display for NotConnected {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "connection is not in the Connected state")
    }
}
impl std::error::Error for NotConnected {}

impl<T: Transport> Connection<T> {
    pub fn new(endpoint: Endpoint, transport: T) -> Self {
        Self {
            ctx: ConnectCtx::new(endpoint, transport),
            protocol_negotiated: Protocol::Resp2,
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.ctx.endpoint
    }

    pub fn is_connected(&self) -> bool {
        self.ctx.is_connected()
    }

    pub fn state_name(&self) -> &'static str {
        self.ctx.state_name()
    }

    /// Drives the reconnect/auth state machine one round to completion
    /// (spec §4.1 "transitions run on a reactor timer callback").
    pub async fn drive(&mut self, cancel: &CancellationToken) -> Result<()> {
        use crate::state_machine::common::StateMachineCtx;
        self.ctx.execute(cancel).await
    }

    pub fn request_stop(&mut self) {
        self.ctx.request_stop();
    }

    /// Sends a command iff this connection is `Connected`; otherwise
    /// returns without touching the wire (spec §4.1, invariant 2).
    /// Negotiates protocol first if the command asks for a different
    /// RESP version than the one last negotiated on this connection.
    pub async fn send(&mut self, command: &Command) -> Result<RawReply> {
        if !self.ctx.is_connected() {
            bail!(NotConnected);
        }

        self.maybe_send_hello(command.protocol_version).await?;

        match self.ctx.dialer.send_command(command).await {
            Ok(reply) => Ok(reply),
            Err(e) => {
                self.ctx.mark_disconnected();
                Err(e)
            },
        }
    }

    /// Issues a protocol-hello before the command if the connection's
    /// negotiated RESP version differs from what the command carries
    /// (spec §3 Connection invariants, §6.2).
    async fn maybe_send_hello(&mut self, wanted: Protocol) -> Result<()> {
        if wanted != self.protocol_negotiated {
            self.ctx.dialer.send_hello(wanted).await?;
            self.protocol_negotiated = wanted;
        }
        Ok(())
    }
}
