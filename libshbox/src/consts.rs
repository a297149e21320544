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

use std::time;

pub const DEFAULT_WORKSPACE: &str = "default";

/// How long a command line may run before the server cancels it.
pub const DEFAULT_COMMAND_TIMEOUT: time::Duration = time::Duration::from_secs(60);

/// Cumulative output cap per command line, in bytes.
pub const DEFAULT_OUTPUT_LIMIT: usize = 1024 * 1024;

/// Cancellation must be observed within roughly this window, so
/// long-running builtins like `sleep` tick at a fraction of it.
pub const CANCEL_POLL_DURATION: time::Duration = time::Duration::from_millis(25);

/// Pacing between chunks emitted by the `seq` builtin. Slow enough
/// that cancellation and output caps are exercisable, fast enough
/// that generating a few thousand lines stays snappy.
pub const SEQ_TICK_DURATION: time::Duration = time::Duration::from_millis(1);
