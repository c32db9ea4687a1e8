// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Connection (spec §3 `C2`, §4.1) five-state reconnect/auth machine.
//!
//! Reconnect backoff constants mirror the original coordinator's
//! `RSCONN_RECONNECT_TIMEOUT`/`RSCONN_REAUTH_TIMEOUT` in `rmr/conn.c`.

use std::{pin::Pin, time::Duration};

use anyhow::Result;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::{
    state_machine::common::{StateMachine, StateMachineCtx, Transition},
    topology::Endpoint,
};

/// Backoff before retrying a failed connect attempt.
pub const RECONNECT_BACKOFF: Duration = Duration::from_millis(250);
/// Backoff before retrying a failed AUTH handshake.
pub const REAUTH_BACKOFF: Duration = Duration::from_millis(1000);

/// Outcome of dialing a shard, supplied by whatever async I/O layer the
/// host wires up; kept abstract here so the state machine stays testable
/// without a real socket.
pub trait Dialer: Send + Sync {
    fn connect(&self, endpoint: &Endpoint) -> impl Future<Output = Result<()>> + Send;
    fn authenticate(&self) -> impl Future<Output = Result<()>> + Send;
    fn requires_auth(&self) -> bool;
}

/// Shared context threaded through every state's `step` (spec §3
/// `Connection`: `{endpoint, state, protocol_negotiated, async_context}`).
pub struct ConnectCtx<D: Dialer> {
    pub endpoint: Endpoint,
    pub dialer: D,
    pub stop_requested: bool,
    state: Option<ConnectStates>,
}

impl<D: Dialer> ConnectCtx<D> {
    pub fn new(endpoint: Endpoint, dialer: D) -> Self {
        Self {
            endpoint,
            dialer,
            stop_requested: false,
            state: Some(ConnectStates::Disconnected(Disconnected)),
        }
    }

    /// Current state name, for the `ConnectionPool`/`ConnectionManager`
    /// readiness check (spec §4.3 "Connected to every master").
    pub fn state_name(&self) -> &'static str {
        match &self.state {
            Some(ConnectStates::Disconnected(_)) => "Disconnected",
            Some(ConnectStates::Connecting(_)) => "Connecting",
            Some(ConnectStates::ReAuth(_)) => "ReAuth",
            Some(ConnectStates::Connected(_)) => "Connected",
            Some(ConnectStates::Freeing(_)) => "Freeing",
            None => "Transitioning",
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.state, Some(ConnectStates::Connected(_)))
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, Some(ConnectStates::Freeing(_)))
    }

    /// Drops back to `Connecting` after a send/read failure observed by
    /// the transport layer (spec §3 "any -- err --> Connecting").
    pub fn mark_disconnected(&mut self) {
        if !self.is_terminal() {
            self.state = Some(ConnectStates::Connecting(Connecting));
        }
    }

    /// Requests a transition to the terminal `Freeing` state on the next
    /// `execute` call (spec §3 "any -- stop req --> Freeing").
    pub fn request_stop(&mut self) {
        self.stop_requested = true;
    }
}

#[derive(Debug)]
pub struct Disconnected;
#[derive(Debug)]
pub struct Connecting;
#[derive(Debug)]
pub struct ReAuth;
#[derive(Debug)]
pub struct Connected;
#[derive(Debug)]
pub struct Freeing;

#[derive(Debug)]
pub enum ConnectStates {
    Disconnected(Disconnected),
    Connecting(Connecting),
    ReAuth(ReAuth),
    Connected(Connected),
    Freeing(Freeing),
}

type ConnectStepOut = Transition<ConnectStates, Result<()>>;
type BoxStep<'a> = Pin<Box<dyn Future<Output = ConnectStepOut> + Send + 'a>>;

impl<D: Dialer> StateMachine<ConnectCtx<D>, ConnectStepOut> for Disconnected {
    type StepResult<'a>
        = BoxStep<'a>
    where
        Self: 'a,
        ConnectCtx<D>: 'a;

    fn step<'a>(&'a self, ctx: &'a mut ConnectCtx<D>) -> Self::StepResult<'a> {
        Box::pin(async move {
            if ctx.stop_requested {
                return Transition::Next(ConnectStates::Freeing(Freeing), Ok(()));
            }
            Transition::Next(ConnectStates::Connecting(Connecting), Ok(()))
        })
    }
}

impl<D: Dialer> StateMachine<ConnectCtx<D>, ConnectStepOut> for Connecting {
    type StepResult<'a>
        = BoxStep<'a>
    where
        Self: 'a,
        ConnectCtx<D>: 'a;

    fn step<'a>(&'a self, ctx: &'a mut ConnectCtx<D>) -> Self::StepResult<'a> {
        Box::pin(async move {
            if ctx.stop_requested {
                return Transition::Next(ConnectStates::Freeing(Freeing), Ok(()));
            }
            match ctx.dialer.connect(&ctx.endpoint).await {
                Ok(()) if ctx.dialer.requires_auth() => {
                    Transition::Next(ConnectStates::ReAuth(ReAuth), Ok(()))
                },
                Ok(()) => Transition::Next(ConnectStates::Connected(Connected), Ok(())),
                Err(e) => {
                    sleep(RECONNECT_BACKOFF).await;
                    Transition::Next(ConnectStates::Connecting(Connecting), Err(e))
                },
            }
        })
    }
}

impl<D: Dialer> StateMachine<ConnectCtx<D>, ConnectStepOut> for ReAuth {
    type StepResult<'a>
        = BoxStep<'a>
    where
        Self: 'a,
        ConnectCtx<D>: 'a;

    fn step<'a>(&'a self, ctx: &'a mut ConnectCtx<D>) -> Self::StepResult<'a> {
        Box::pin(async move {
            if ctx.stop_requested {
                return Transition::Next(ConnectStates::Freeing(Freeing), Ok(()));
            }
            match ctx.dialer.authenticate().await {
                Ok(()) => Transition::Next(ConnectStates::Connected(Connected), Ok(())),
                Err(e) => {
                    sleep(REAUTH_BACKOFF).await;
                    Transition::Next(ConnectStates::Connecting(Connecting), Err(e))
                },
            }
        })
    }
}

impl<D: Dialer> StateMachine<ConnectCtx<D>, ConnectStepOut> for Connected {
    type StepResult<'a>
        = BoxStep<'a>
    where
        Self: 'a,
        ConnectCtx<D>: 'a;

    fn step<'a>(&'a self, ctx: &'a mut ConnectCtx<D>) -> Self::StepResult<'a> {
        Box::pin(async move {
            if ctx.stop_requested {
                return Transition::Next(ConnectStates::Freeing(Freeing), Ok(()));
            }
            Transition::Done(Ok(()))
        })
    }
}

impl<D: Dialer> StateMachine<ConnectCtx<D>, ConnectStepOut> for Freeing {
    type StepResult<'a>
        = BoxStep<'a>
    where
        Self: 'a,
        ConnectCtx<D>: 'a;

    fn step<'a>(&'a self, _ctx: &'a mut ConnectCtx<D>) -> Self::StepResult<'a> {
        Box::pin(async move { Transition::Done(Ok(())) })
    }
}

impl<D: Dialer + Send> StateMachineCtx<ConnectCtx<D>, ()> for ConnectCtx<D> {
    /// Drives transitions until the connection reaches `Connected` (the
    /// caller calls this again after send failures to reconnect) or
    /// `Freeing` on a stop request. `cancel` aborts mid-backoff.
    async fn execute(&mut self, cancel: &CancellationToken) -> Result<()> {
        loop {
            if cancel.is_cancelled() {
                self.stop_requested = true;
            }
            let state = self.state.take().expect("state must be set on ConnectCtx");
            let trans = match state {
                ConnectStates::Disconnected(s) => s.step(self).await,
                ConnectStates::Connecting(s) => s.step(self).await,
                ConnectStates::ReAuth(s) => s.step(self).await,
                ConnectStates::Connected(s) => s.step(self).await,
                ConnectStates::Freeing(s) => s.step(self).await,
            };

            match trans {
                Transition::Next(next, _r) => {
                    self.state = Some(next);
                },
                Transition::Stay(r) => {
                    self.state = Some(ConnectStates::Connecting(Connecting));
                    r?;
                },
                Transition::Done(r) => {
                    self.state = Some(if self.is_terminal_after_done() {
                        ConnectStates::Freeing(Freeing)
                    } else {
                        ConnectStates::Connected(Connected)
                    });
                    return r;
                },
            }
        }
    }
}

impl<D: Dialer> ConnectCtx<D> {
    fn is_terminal_after_done(&self) -> bool {
        self.stop_requested
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct FlakyDialer {
        fail_connects: AtomicUsize,
        needs_auth: bool,
    }

    impl Dialer for FlakyDialer {
        async fn connect(&self, _endpoint: &Endpoint) -> Result<()> {
            if self.fail_connects.fetch_sub(1, Ordering::SeqCst) > 0 {
                anyhow::bail!("simulated connect failure")
            }
            Ok(())
        }

        async fn authenticate(&self) -> Result<()> {
            Ok(())
        }

        fn requires_auth(&self) -> bool {
            self.needs_auth
        }
    }

    fn endpoint() -> Endpoint {
        Endpoint::new("127.0.0.1".to_string(), 6379)
    }

    #[tokio::test]
    async fn reaches_connected_without_auth() {
        let dialer = FlakyDialer { fail_connects: AtomicUsize::new(0), needs_auth: false };
        let mut ctx = ConnectCtx::new(endpoint(), dialer);
        let cancel = CancellationToken::new();
        ctx.execute(&cancel).await.expect("connects");
        assert!(ctx.is_connected());
    }

    #[tokio::test]
    async fn goes_through_reauth_when_auth_required() {
        let dialer = FlakyDialer { fail_connects: AtomicUsize::new(0), needs_auth: true };
        let mut ctx = ConnectCtx::new(endpoint(), dialer);
        let cancel = CancellationToken::new();
        ctx.execute(&cancel).await.expect("connects via reauth");
        assert!(ctx.is_connected());
    }

    #[tokio::test]
    async fn stop_request_drives_to_freeing() {
        let dialer = FlakyDialer { fail_connects: AtomicUsize::new(0), needs_auth: false };
        let mut ctx = ConnectCtx::new(endpoint(), dialer);
        ctx.stop_requested = true;
        let cancel = CancellationToken::new();
        ctx.execute(&cancel).await.expect("freeing is not an error");
        assert!(ctx.is_terminal());
    }
}
