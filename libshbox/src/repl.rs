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

//! The line-oriented front end.
//!
//! A thin consumer of the session server API: read a line, submit
//! it, print the event stream until the terminal event, repeat.
//! Ctrl-C while a command is in flight asks the session to cancel
//! rather than killing the process.

use std::{
    io::{self, BufRead, Write},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time,
};

use anyhow::Context;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use shbox_protocol::{SessionEvent, SessionMessage};
use tracing::{info, instrument};

use crate::session::{registry::SessionRegistry, server::SessionServer};

/// How often the event drain loop wakes up to look for Ctrl-C.
const INTERRUPT_POLL: time::Duration = time::Duration::from_millis(50);

#[instrument(skip_all, fields(s = session.id()))]
pub fn run(registry: &SessionRegistry, session: SessionServer) -> anyhow::Result<()> {
    let (tx, rx) = crossbeam_channel::unbounded();
    let subscriber = session.subscribe(tx);
    session.set_meta("transport", "repl");

    let interrupted = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&interrupted))
        .context("registering SIGINT handler")?;

    let stdin = io::stdin();
    let mut stdout = io::stdout();
    let mut input = String::new();
    loop {
        let snapshot = session.get_state();
        write!(stdout, "{}:{}> ", snapshot.workspace_id, snapshot.cwd)
            .context("writing prompt")?;
        stdout.flush().context("flushing prompt")?;

        input.clear();
        match stdin.lock().read_line(&mut input) {
            Ok(0) => {
                // EOF ends the session cleanly
                writeln!(stdout).ok();
                break;
            }
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                interrupted.store(false, Ordering::SeqCst);
                writeln!(stdout).ok();
                continue;
            }
            Err(e) => return Err(e).context("reading stdin"),
        }

        let line = input.trim();
        if line.is_empty() {
            continue;
        }
        if line == "exit" || line == "quit" {
            break;
        }

        match session.run_command(line) {
            Ok(()) => drain_events(&rx, &session, &interrupted, &mut stdout)?,
            Err(err) => {
                writeln!(stdout, "error: {}", err.message).context("writing error")?;
            }
        }
    }

    info!("repl exiting, stopping session {}", session.id());
    session.unsubscribe(subscriber);
    let _ = registry.remove(session.id());

    Ok(())
}

/// Print events for one command line, through its terminal event.
fn drain_events(
    rx: &Receiver<SessionMessage>,
    session: &SessionServer,
    interrupted: &AtomicBool,
    stdout: &mut io::Stdout,
) -> anyhow::Result<()> {
    loop {
        if interrupted.swap(false, Ordering::SeqCst) {
            session.cancel();
        }
        let msg = match rx.recv_timeout(INTERRUPT_POLL) {
            Ok(msg) => msg,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => return Ok(()),
        };
        match msg.event {
            SessionEvent::CommandStarted { .. } | SessionEvent::CwdChanged { .. } => {}
            SessionEvent::Output { chunk } => {
                write!(stdout, "{chunk}").context("writing output")?;
                stdout.flush().ok();
            }
            SessionEvent::Error { error } => {
                writeln!(stdout, "error: {}", error.message).context("writing error")?;
            }
            SessionEvent::CommandDone => return Ok(()),
            SessionEvent::CommandCancelled => {
                writeln!(stdout, "Cancelled").context("writing cancel notice")?;
                return Ok(());
            }
            SessionEvent::CommandCrashed { reason } => {
                writeln!(stdout, "crashed: {reason}").context("writing crash notice")?;
                return Ok(());
            }
        }
    }
}
