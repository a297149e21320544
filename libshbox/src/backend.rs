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

//! The pluggable command executor contract.
//!
//! A backend is what actually runs a statement: the in-process
//! command registry here, or an out-of-process executor (an SSH
//! channel, a container provider) supplied by an embedder. The
//! session server only ever sees this trait.
//!
//! Output streams back through the `Emitter` the server passes in,
//! which doubles as the cancellation point; a backend whose work can
//! block for long stretches must also honor `cancel`, which the
//! server may call from another thread while a worker is parked
//! inside `execute`. Backends that own external resources (network
//! connections, processes) must make `terminate` idempotent.

use std::sync::{Arc, Mutex};

use shbox_protocol::Error;

use crate::{
    commands::{runner, CommandCtx, Emitter, Registry, RunResult},
    netpolicy::NetworkPolicy,
    parser::Statement,
    session::state::ShellState,
    vfs::Vfs,
};

pub trait Backend: Send + Sync {
    /// Run one statement, streaming output through `emitter`.
    fn execute(&self, state: &ShellState, stmt: &Statement, emitter: &mut dyn Emitter)
        -> RunResult;

    /// Advisory: ask an in-flight `execute` to stop. Must be safe to
    /// call from the server thread at any time.
    fn cancel(&self) {}

    /// The executor's own working directory, for backends that track
    /// one remotely. The in-process backend has no notion of its
    /// own; session state is authoritative.
    fn cwd(&self) -> Option<String> {
        None
    }

    /// Notify the backend that the session's cwd changed.
    fn cd(&self, _path: &str) -> Result<(), Error> {
        Ok(())
    }

    /// Hand the backend the session's network policy, for executors
    /// that enforce it on their side of the wire.
    fn configure_network(&self, _policy: &NetworkPolicy) {}

    /// Release any external resources. Idempotent.
    fn terminate(&self) {}
}

/// The default backend: statements run in-process against the
/// command registry and the workspace VFS.
pub struct RegistryBackend {
    registry: Arc<Registry>,
    vfs: Vfs,
    /// Only consulted by nested scripts (`bash`); top level policy
    /// enforcement happens in the session server before dispatch.
    policy: Mutex<Option<NetworkPolicy>>,
}

impl RegistryBackend {
    pub fn new(registry: Arc<Registry>, vfs: Vfs) -> Self {
        RegistryBackend { registry, vfs, policy: Mutex::new(None) }
    }
}

impl Backend for RegistryBackend {
    fn execute(
        &self,
        state: &ShellState,
        stmt: &Statement,
        emitter: &mut dyn Emitter,
    ) -> RunResult {
        let policy = self.policy.lock().unwrap().clone();
        let ctx = CommandCtx {
            state,
            vfs: &self.vfs,
            registry: &self.registry,
            policy: policy.as_ref(),
        };
        runner::run_statement(&ctx, stmt, emitter)
    }

    fn configure_network(&self, policy: &NetworkPolicy) {
        let mut slot = self.policy.lock().unwrap();
        *slot = Some(policy.clone());
    }
}

//
// Unit Tests
//

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;
    use shbox_protocol::{ErrorCode, ShellCode};

    use crate::{
        commands::{runner::BufferEmitter, Outcome, Stop},
        parser,
        vfs::{mem::MemAdapter, MountOptions, MountTable},
    };

    use super::*;

    fn test_backend() -> RegistryBackend {
        let table = Arc::new(MountTable::new());
        table.register_adapter(Arc::new(MemAdapter));
        table.mount("ws", "/", "mem", &MountOptions::default()).unwrap();
        RegistryBackend::new(Arc::new(Registry::builtin()), Vfs::new(table, "ws"))
    }

    #[test]
    fn test_execute() {
        let backend = test_backend();
        let state = ShellState::new();
        let stmt = parser::parse_single("echo hi").unwrap();

        let mut emitter = BufferEmitter::default();
        let result = backend.execute(&state, &stmt, &mut emitter);
        assert_matches!(result, Ok(Outcome::Ok));
        assert_eq!(emitter.text(), "hi\n");
    }

    #[test]
    fn test_configured_policy_reaches_scripts() {
        let backend = test_backend();
        backend.configure_network(&NetworkPolicy::default());

        let state = ShellState::new();
        let stmt = parser::parse_single("bash 'curl https://example.com'").unwrap();

        let mut emitter = BufferEmitter::default();
        let result = backend.execute(&state, &stmt, &mut emitter);
        assert_matches!(
            result,
            Err(Stop::Err(e)) if e.code == ErrorCode::Shell(ShellCode::NetworkBlocked)
        );
    }
}
