// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Generic state-machine scaffolding shared by every `Connection`'s
//! reconnect/auth loop: a `step` advances one state and returns a
//! `Transition`; `execute` drives steps until `Done`.

use std::future::Future;

use anyhow::Result;
use tokio_util::sync::CancellationToken;

/// Outcome of a single `step`: move to a new state, stay put (retry the
/// same state next tick), or finish with a final result.
#[derive(Debug)]
pub enum Transition<S, R> {
    Next(S, R),
    Stay(R),
    Done(R),
}

/// One state in a state machine operating on `Ctx`, producing `RespCtx`
/// on each step.
pub trait StateMachine<Ctx, RespCtx>: Sized {
    type StepResult<'a>: Future<Output = RespCtx> + Send + 'a
    where
        Self: 'a,
        RespCtx: 'a,
        Ctx: 'a;

    fn step<'a>(&'a self, ctx: &'a mut Ctx) -> Self::StepResult<'a>;
}

/// Drives a `StateMachine` to completion, yielding `Output` once `Done`.
pub trait StateMachineCtx<Ctx, Output> {
    fn execute(
        &mut self,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<Output>> + Send;
}
