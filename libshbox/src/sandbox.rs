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

//! The sandbox script executor.
//!
//! Runs a bash-looking script against the command registry: the
//! script is split into statements, each statement must name a
//! registered command, and state updates (`cd`, `env`) thread from
//! one statement into the next so `cd /a` then `pwd` does what it
//! looks like it does. Any failing statement aborts the rest of the
//! script.
//!
//! This is what the `bash` built-in runs on. It is deliberately not
//! a shell: no pipes, no redirection, no expansion, no control flow.

use tracing::instrument;

use crate::{
    commands::{runner, CommandCtx, Outcome, StateUpdate, Stop},
    parser,
};

use super::commands::Emitter;

/// Run a script, returning the cumulative state update it produced.
/// Statements see the updates of the statements before them; the
/// caller decides what to do with the final accumulation.
#[instrument(skip_all)]
pub fn execute(
    ctx: &CommandCtx,
    script: &str,
    emitter: &mut dyn Emitter,
) -> Result<StateUpdate, Stop> {
    let mut local = ctx.state.clone();
    let mut cumulative = StateUpdate::default();

    for raw_line in script.lines() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if emitter.cancelled() {
            return Err(Stop::Cancelled);
        }

        for stmt in parser::parse(line)?.into_iter() {
            if emitter.cancelled() {
                return Err(Stop::Cancelled);
            }
            if let Some(policy) = ctx.policy {
                policy.check(line, &stmt)?;
            }

            let stmt_ctx = CommandCtx {
                state: &local,
                vfs: ctx.vfs,
                registry: ctx.registry,
                policy: ctx.policy,
            };
            match runner::run_statement(&stmt_ctx, &stmt, emitter)? {
                Outcome::Ok => {}
                Outcome::Update(update) => {
                    local.apply(update.clone());
                    cumulative.merge(update);
                }
            }
        }
    }

    Ok(cumulative)
}

//
// Unit Tests
//
