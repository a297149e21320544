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

use shbox_protocol::SessionEvent;

/// Callbacks that the embedding application can implement in order
/// to inject telemetry at session lifecycle points.
///
/// Hooks are invoked inline within the session server's control
/// flow, so you MUST NOT block for extended periods of time. If you
/// need to do work that could block for a while, you should spin up
/// a worker thread and enqueue events so the hooks can be processed
/// async.
///
/// Any errors returned will simply be logged.
///
/// All hooks do nothing by default.
pub trait Hooks {
    /// Triggered when a fresh session is created.
    fn on_session_created(&self, _session_id: &str) -> anyhow::Result<()> {
        Ok(())
    }

    /// Triggered when a session is stopped and deregistered.
    fn on_session_stopped(&self, _session_id: &str) -> anyhow::Result<()> {
        Ok(())
    }

    /// Triggered when a session accepts a command line.
    fn on_command_started(&self, _session_id: &str, _line: &str) -> anyhow::Result<()> {
        Ok(())
    }

    /// Triggered when a command line reaches its terminal event.
    /// `terminal` is always one of the terminal `SessionEvent`s.
    fn on_command_finished(
        &self,
        _session_id: &str,
        _terminal: &SessionEvent,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// Triggered when a subscriber's delivery target disappears and
    /// the server drops it from the set.
    fn on_subscriber_dropped(&self, _session_id: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

pub struct NoopHooks {}

impl Hooks for NoopHooks {}
