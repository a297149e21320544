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

//! The session server.
//!
//! One `SessionServer` per live session. The server is a small state
//! machine (`idle` -> `running` -> `cancelling` -> `idle`) guarded
//! by a single mutex: all state transitions happen under that lock,
//! which is what makes them totally ordered per session, and events
//! are published to subscribers under the same lock, which is what
//! makes every subscriber observe the same ordered sequence.
//!
//! Each accepted line gets two threads: a worker that parses the
//! line and walks its statements through the backend, and a monitor
//! that owns the terminal event. The worker never publishes a
//! terminal event itself; it reports an outcome over a channel and
//! the monitor turns that (or a timeout, or a panic) into exactly
//! one of `command_done`, `command_cancelled` or `command_crashed`.
//!
//! Subscriber delivery is unbounded-channel sends: it never blocks a
//! transition, and a subscriber whose receiving end has vanished is
//! silently dropped from the set.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread, time,
};

use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use shbox_protocol::{
    CommandCode, Error, ErrorCode, SessionCode, SessionEvent, SessionMessage, ShellCode,
};
use tracing::{info, instrument, warn};

use crate::{
    backend::Backend,
    commands::{runner, Emitter, Outcome, StateUpdate, Stop},
    consts,
    hooks::Hooks,
    netpolicy::NetworkPolicy,
    parser::{self, ChainOp},
    session::state::{CurrentCommand, SessionSnapshot, ShellState, Status},
};

/// Per-session limits and policy. One of these is built from the
/// config file and shared by every session the registry creates.
#[derive(Clone)]
pub struct SessionConfig {
    /// How long one command line may run.
    pub timeout: time::Duration,
    /// Cumulative output cap per command line, in bytes.
    pub output_limit: usize,
    /// Network policy applied to every statement; None disables
    /// enforcement entirely.
    pub policy: Option<NetworkPolicy>,
    /// Environment variables injected into fresh sessions.
    pub env: BTreeMap<String, String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            timeout: consts::DEFAULT_COMMAND_TIMEOUT,
            output_limit: consts::DEFAULT_OUTPUT_LIMIT,
            policy: None,
            env: BTreeMap::new(),
        }
    }
}

pub type SubscriberId = u64;

struct Current {
    line: String,
    started_at: DateTime<Utc>,
    cancel: Arc<AtomicBool>,
}

struct Inner {
    status: Status,
    stopped: bool,
    shell: ShellState,
    meta: BTreeMap<String, String>,
    subscribers: HashMap<SubscriberId, Sender<SessionMessage>>,
    next_subscriber: SubscriberId,
    current: Option<Current>,
    bytes_emitted: usize,
}

impl Inner {
    /// Deliver one event to every live subscriber, dropping the dead
    /// ones. Called with the state lock held so that all subscribers
    /// see the same total order of events.
    fn publish(&mut self, session_id: &str, hooks: &dyn Hooks, event: SessionEvent) {
        let before = self.subscribers.len();
        self.subscribers
            .retain(|_, tx| tx.send(SessionMessage::new(session_id, event.clone())).is_ok());
        for _ in self.subscribers.len()..before {
            info!("dropped dead subscriber from session {}", session_id);
            log_hook(hooks.on_subscriber_dropped(session_id));
        }
    }
}

enum WorkerOutcome {
    Done,
    Cancelled,
}

enum Finish {
    Done,
    Cancelled,
    Crashed(String),
}

/// A handle to one live session. Cheap to clone; every clone talks
/// to the same underlying state machine.
#[derive(Clone)]
pub struct SessionServer {
    id: String,
    workspace_id: String,
    config: SessionConfig,
    backend: Arc<dyn Backend>,
    hooks: Arc<dyn Hooks + Send + Sync>,
    inner: Arc<Mutex<Inner>>,
}

impl std::fmt::Debug for SessionServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionServer")
            .field("id", &self.id)
            .field("workspace_id", &self.workspace_id)
            .finish()
    }
}

impl SessionServer {
    pub fn new(
        id: &str,
        workspace_id: &str,
        backend: Arc<dyn Backend>,
        hooks: Arc<dyn Hooks + Send + Sync>,
        config: SessionConfig,
    ) -> Self {
        if let Some(policy) = &config.policy {
            backend.configure_network(policy);
        }
        let mut shell = ShellState::new();
        shell.env = config.env.clone();
        SessionServer {
            id: String::from(id),
            workspace_id: String::from(workspace_id),
            config,
            backend,
            hooks,
            inner: Arc::new(Mutex::new(Inner {
                status: Status::Idle,
                stopped: false,
                shell,
                meta: BTreeMap::new(),
                subscribers: HashMap::new(),
                next_subscriber: 0,
                current: None,
                bytes_emitted: 0,
            })),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn workspace_id(&self) -> &str {
        &self.workspace_id
    }

    /// Register a delivery target for all future events. There is no
    /// replay; events published before this call are gone.
    pub fn subscribe(&self, tx: Sender<SessionMessage>) -> SubscriberId {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_subscriber;
        inner.next_subscriber += 1;
        inner.subscribers.insert(id, tx);
        id
    }

    pub fn unsubscribe(&self, id: SubscriberId) {
        let mut inner = self.inner.lock().unwrap();
        inner.subscribers.remove(&id);
    }

    /// A point-in-time copy of the session record.
    pub fn get_state(&self) -> SessionSnapshot {
        let inner = self.inner.lock().unwrap();
        SessionSnapshot {
            id: self.id.clone(),
            workspace_id: self.workspace_id.clone(),
            status: inner.status,
            cwd: inner.shell.cwd.clone(),
            env: inner.shell.env.clone(),
            history: inner.shell.history.clone(),
            meta: inner.meta.clone(),
            current_command: inner.current.as_ref().map(|c| CurrentCommand {
                line: c.line.clone(),
                started_at: c.started_at,
            }),
        }
    }

    /// Attach an opaque transport-level tag to the session.
    pub fn set_meta(&self, key: &str, value: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.meta.insert(String::from(key), String::from(value));
    }

    /// Accept a command line. Exactly one line runs at a time: if
    /// the session is running or cancelling this comes back
    /// `{shell, busy}` immediately.
    #[instrument(skip_all, fields(s = %self.id))]
    pub fn run_command(&self, line: &str) -> Result<(), Error> {
        let cancel = Arc::new(AtomicBool::new(false));
        let shell = {
            let mut inner = self.inner.lock().unwrap();
            if inner.stopped {
                return Err(Error::new(
                    ErrorCode::Session(SessionCode::NotFound),
                    format!("session {} is stopped", self.id),
                )
                .with("session_id", self.id.as_str()));
            }
            if inner.status != Status::Idle {
                return Err(Error::new(
                    ErrorCode::Shell(ShellCode::Busy),
                    "a command is already running",
                )
                .with("line", line));
            }

            inner.status = Status::Running;
            inner.bytes_emitted = 0;
            inner.current = Some(Current {
                line: String::from(line),
                started_at: Utc::now(),
                cancel: Arc::clone(&cancel),
            });
            inner.shell.history.insert(0, String::from(line));
            inner.publish(
                &self.id,
                self.hooks.as_ref(),
                SessionEvent::CommandStarted { line: String::from(line) },
            );
            inner.shell.clone()
        };
        log_hook(self.hooks.on_command_started(&self.id, line));

        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        let worker = {
            let server = self.clone();
            let line = String::from(line);
            let cancel = Arc::clone(&cancel);
            thread::spawn(move || {
                let outcome = server.run_worker(&line, shell, cancel);
                // the monitor may already have moved on after a
                // timeout; that is fine
                let _ = done_tx.send(outcome);
            })
        };
        {
            let server = self.clone();
            thread::spawn(move || server.monitor(worker, done_rx, cancel));
        }

        Ok(())
    }

    /// Ask the in-flight command to stop. Advisory and cooperative:
    /// the worker stops at its next suspension point and the session
    /// emits `command_cancelled`. A no-op when idle, idempotent when
    /// already cancelling.
    #[instrument(skip_all, fields(s = %self.id))]
    pub fn cancel(&self) {
        let mut inner = self.inner.lock().unwrap();
        match inner.status {
            Status::Running => {
                info!("cancelling in-flight command");
                inner.status = Status::Cancelling;
                if let Some(current) = &inner.current {
                    current.cancel.store(true, Ordering::SeqCst);
                }
                self.backend.cancel();
            }
            Status::Cancelling | Status::Idle => {}
        }
    }

    /// Terminate the session. The in-flight command (if any) is
    /// cancelled, the backend is released, and no further lines are
    /// accepted. The registry deregisters stopped sessions.
    #[instrument(skip_all, fields(s = %self.id))]
    pub fn stop(&self) {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.stopped {
                return;
            }
            inner.stopped = true;
            if let Some(current) = &inner.current {
                current.cancel.store(true, Ordering::SeqCst);
            }
            if inner.status == Status::Running {
                inner.status = Status::Cancelling;
            }
        }
        self.backend.cancel();
        self.backend.terminate();
        log_hook(self.hooks.on_session_stopped(&self.id));
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.lock().unwrap().stopped
    }

    /// The worker half: parse, then walk the statements honoring
    /// the chain gates. Never publishes a terminal event.
    fn run_worker(
        &self,
        line: &str,
        mut shell: ShellState,
        cancel: Arc<AtomicBool>,
    ) -> WorkerOutcome {
        let mut emitter = ServerEmitter {
            inner: Arc::clone(&self.inner),
            hooks: Arc::clone(&self.hooks),
            session_id: self.id.clone(),
            cancel: Arc::clone(&cancel),
            limit: self.config.output_limit,
        };

        let program = match parser::parse(line) {
            Ok(program) => program,
            Err(e) => {
                self.publish_error(e);
                return WorkerOutcome::Done;
            }
        };

        let mut prev_ok = true;
        for stmt in program.iter() {
            if cancel.load(Ordering::SeqCst) {
                return WorkerOutcome::Cancelled;
            }
            // `&&` runs only after success; `;` always runs
            if stmt.op == ChainOp::AndIf && !prev_ok {
                continue;
            }

            if let Some(policy) = &self.config.policy {
                if let Err(e) = policy.check(line, stmt) {
                    self.publish_error(e);
                    prev_ok = false;
                    continue;
                }
            }

            match self.backend.execute(&shell, stmt, &mut emitter) {
                Ok(Outcome::Ok) => prev_ok = true,
                Ok(Outcome::Update(update)) => {
                    prev_ok = true;
                    shell.apply(update.clone());
                    self.commit_update(update);
                }
                Err(Stop::Cancelled) => return WorkerOutcome::Cancelled,
                Err(Stop::Err(e)) => {
                    self.publish_error(e);
                    prev_ok = false;
                }
            }
        }
        WorkerOutcome::Done
    }

    /// The monitor half: waits for the worker's outcome, enforcing
    /// the timeout, and publishes the line's one terminal event.
    fn monitor(
        &self,
        worker: thread::JoinHandle<()>,
        done_rx: Receiver<WorkerOutcome>,
        cancel: Arc<AtomicBool>,
    ) {
        let finish = match done_rx.recv_timeout(self.config.timeout) {
            Ok(WorkerOutcome::Done) => {
                let _ = worker.join();
                Finish::Done
            }
            Ok(WorkerOutcome::Cancelled) => {
                let _ = worker.join();
                Finish::Cancelled
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!("command timed out after {:?}", self.config.timeout);
                self.publish_error(
                    Error::new(
                        ErrorCode::Command(CommandCode::Timeout),
                        format!("command timed out after {}ms", self.config.timeout.as_millis()),
                    )
                    .with("timeout_ms", self.config.timeout.as_millis().to_string()),
                );
                cancel.store(true, Ordering::SeqCst);
                {
                    let mut inner = self.inner.lock().unwrap();
                    if inner.status == Status::Running {
                        inner.status = Status::Cancelling;
                    }
                }
                self.backend.cancel();
                // the worker observes the flag at its next
                // suspension point and winds down
                match done_rx.recv() {
                    Ok(_) => {
                        let _ = worker.join();
                        Finish::Cancelled
                    }
                    Err(_) => Finish::Crashed(join_reason(worker)),
                }
            }
            Err(RecvTimeoutError::Disconnected) => Finish::Crashed(join_reason(worker)),
        };

        let terminal = match finish {
            Finish::Done => SessionEvent::CommandDone,
            Finish::Cancelled => SessionEvent::CommandCancelled,
            Finish::Crashed(reason) => {
                warn!("worker crashed: {}", reason);
                SessionEvent::CommandCrashed { reason }
            }
        };
        {
            let mut inner = self.inner.lock().unwrap();
            inner.publish(&self.id, self.hooks.as_ref(), terminal.clone());
            inner.status = Status::Idle;
            inner.current = None;
        }
        log_hook(self.hooks.on_command_finished(&self.id, &terminal));
    }

    /// Fold a statement's state update into the canonical session
    /// state, announcing cwd changes.
    fn commit_update(&self, update: StateUpdate) {
        let mut inner = self.inner.lock().unwrap();
        let old_cwd = inner.shell.cwd.clone();
        inner.shell.apply(update);
        let new_cwd = inner.shell.cwd.clone();
        if new_cwd != old_cwd {
            inner.publish(
                &self.id,
                self.hooks.as_ref(),
                SessionEvent::CwdChanged { path: new_cwd },
            );
        }
    }

    fn publish_error(&self, error: Error) {
        let mut inner = self.inner.lock().unwrap();
        inner.publish(&self.id, self.hooks.as_ref(), SessionEvent::Error { error });
    }
}

/// The emitter handed to workers: forwards output to subscribers,
/// enforces the output cap, and doubles as the cancellation point.
struct ServerEmitter {
    inner: Arc<Mutex<Inner>>,
    hooks: Arc<dyn Hooks + Send + Sync>,
    session_id: String,
    cancel: Arc<AtomicBool>,
    limit: usize,
}

impl Emitter for ServerEmitter {
    fn emit(&mut self, chunk: &str) -> Result<(), Stop> {
        if self.cancel.load(Ordering::SeqCst) {
            return Err(Stop::Cancelled);
        }

        let mut inner = self.inner.lock().unwrap();
        inner.bytes_emitted += chunk.len();
        inner.publish(
            &self.session_id,
            self.hooks.as_ref(),
            SessionEvent::Output { chunk: String::from(chunk) },
        );
        if inner.bytes_emitted > self.limit {
            warn!("output limit of {} bytes exceeded", self.limit);
            let error = Error::new(
                ErrorCode::Command(CommandCode::OutputLimitExceeded),
                format!("output exceeded the {} byte limit", self.limit),
            )
            .with("limit", self.limit.to_string());
            inner.publish(&self.session_id, self.hooks.as_ref(), SessionEvent::Error { error });
            if inner.status == Status::Running {
                inner.status = Status::Cancelling;
            }
            self.cancel.store(true, Ordering::SeqCst);
            return Err(Stop::Cancelled);
        }
        Ok(())
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }
}

fn join_reason(worker: thread::JoinHandle<()>) -> String {
    match worker.join() {
        Ok(()) => String::from("worker exited without reporting an outcome"),
        Err(payload) => runner::panic_reason(payload.as_ref()),
    }
}

fn log_hook(res: anyhow::Result<()>) {
    if let Err(e) = res {
        warn!("hook error: {:?}", e);
    }
}

//
// Unit Tests
//
