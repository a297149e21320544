// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The command runner: resolve, validate, invoke, interpret.
//!
//! The runner executes exactly one statement. Chaining belongs to
//! the session worker and the sandbox script executor, so a line
//! with operators in it is rejected here with `chained_command`.

use std::panic::{self, AssertUnwindSafe};

use shbox_protocol::{CommandCode, Error, ErrorCode};
use tracing::warn;

use crate::parser::{self, Statement};

use super::{CommandCtx, Outcome};

/// Why a running statement stopped before producing an outcome.
#[derive(Debug)]
pub enum Stop {
    /// The session asked the command to stop. Not an error; the
    /// server turns this into a `command_cancelled` terminal event.
    Cancelled,
    /// The statement failed.
    Err(Error),
}

impl From<Error> for Stop {
    fn from(e: Error) -> Self {
        Stop::Err(e)
    }
}

pub type RunResult = Result<Outcome, Stop>;

/// Where command output goes, and the cooperative cancellation
/// point: every emit call may come back `Stop::Cancelled`, and
/// long-running commands that go quiet for a while must poll
/// `cancelled` themselves.
pub trait Emitter {
    fn emit(&mut self, chunk: &str) -> Result<(), Stop>;
    fn cancelled(&self) -> bool;
}

/// An emitter for tests and fire-and-forget callers: collects
/// chunks, never cancels.
#[derive(Default)]
pub struct BufferEmitter {
    pub chunks: Vec<String>,
}

impl BufferEmitter {
    pub fn text(&self) -> String {
        self.chunks.concat()
    }
}

impl Emitter for BufferEmitter {
    fn emit(&mut self, chunk: &str) -> Result<(), Stop> {
        self.chunks.push(String::from(chunk));
        Ok(())
    }

    fn cancelled(&self) -> bool {
        false
    }
}

/// Run a single already-parsed statement.
pub fn run_statement(
    ctx: &CommandCtx,
    stmt: &Statement,
    emitter: &mut dyn Emitter,
) -> RunResult {
    let command = ctx.registry.lookup(&stmt.command)?;
    let args = command.schema.validate(command.name, &stmt.args)?;

    // A command body that panics must not take the worker down with
    // it; it becomes a structured crash error instead.
    let result = panic::catch_unwind(AssertUnwindSafe(|| (command.run)(ctx, &args, emitter)));
    match result {
        Ok(run_result) => run_result,
        Err(payload) => {
            let reason = panic_reason(payload.as_ref());
            warn!("command {} panicked: {}", command.name, reason);
            Err(Stop::Err(
                Error::new(
                    ErrorCode::Command(CommandCode::Crashed),
                    format!("command {} crashed", command.name),
                )
                .with("command", command.name)
                .with("reason", reason),
            ))
        }
    }
}

/// Parse a line as one unchained statement and run it.
pub fn run_line(ctx: &CommandCtx, line: &str, emitter: &mut dyn Emitter) -> RunResult {
    let stmt = parser::parse_single(line)?;
    run_statement(ctx, &stmt, emitter)
}

pub fn panic_reason(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        String::from(*s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        String::from("unknown panic")
    }
}

//
// Unit Tests
//
