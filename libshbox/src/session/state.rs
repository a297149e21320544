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

//! Session state values.
//!
//! `ShellState` is the slice of a session that commands get to see:
//! cwd, env and history. The rest of the per-session record
//! (subscribers, the in-flight command, lifecycle status) is private
//! to the session server, which hands out read-only `SessionSnapshot`
//! copies on request.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::commands::StateUpdate;

/// The command-visible session state. `cwd` is always a normalized
/// absolute path; env keys are non-empty; history is newest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellState {
    pub cwd: String,
    pub env: BTreeMap<String, String>,
    pub history: Vec<String>,
}

impl ShellState {
    pub fn new() -> Self {
        ShellState { cwd: String::from("/"), env: BTreeMap::new(), history: Vec::new() }
    }

    /// Fold a command's state update in.
    pub fn apply(&mut self, update: StateUpdate) {
        if let Some(cwd) = update.cwd {
            self.cwd = cwd;
        }
        for (key, value) in update.env.into_iter() {
            self.env.insert(key, value);
        }
    }
}

impl Default for ShellState {
    fn default() -> Self {
        Self::new()
    }
}

/// Where a session is in its run loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Idle,
    Running,
    Cancelling,
}

/// The in-flight command, as visible in snapshots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentCommand {
    pub line: String,
    pub started_at: DateTime<Utc>,
}

/// A point-in-time copy of the full session record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub id: String,
    pub workspace_id: String,
    pub status: Status,
    pub cwd: String,
    pub env: BTreeMap<String, String>,
    pub history: Vec<String>,
    pub meta: BTreeMap<String, String>,
    pub current_command: Option<CurrentCommand>,
}

//
// Unit Tests
//
