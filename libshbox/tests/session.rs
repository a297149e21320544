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

//! End to end tests driving a session server through full command
//! lines and asserting on the exact event streams subscribers see.

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time,
};

use assert_matches::assert_matches;
use crossbeam_channel::Receiver;
use ntest::timeout;

use libshbox::{
    backend::RegistryBackend,
    commands::{self, Registry},
    netpolicy::NetworkPolicy,
    session::{SessionConfig, SessionRegistry, SessionServer},
    vfs::{mem::MemAdapter, MountOptions, MountTable, Vfs},
    Hooks,
};
use shbox_protocol::{
    CommandCode, Error, ErrorCode, SessionEvent, SessionMessage, ShellCode, VfsCode,
};

struct TestHooks;
impl Hooks for TestHooks {}

fn test_registry(config: SessionConfig) -> SessionRegistry {
    let mounts = Arc::new(MountTable::new());
    mounts.register_adapter(Arc::new(MemAdapter));
    mounts.mount("ws", "/", "mem", &MountOptions::default()).unwrap();
    SessionRegistry::new(
        mounts,
        Arc::new(Registry::builtin()),
        Arc::new(TestHooks),
        config,
    )
}

fn subscribed(
    registry: &SessionRegistry,
) -> (SessionServer, Receiver<SessionMessage>) {
    let session = registry.create("ws");
    let (tx, rx) = crossbeam_channel::unbounded();
    session.subscribe(tx);
    (session, rx)
}

/// Collect events for one line, through its terminal event.
fn drain(rx: &Receiver<SessionMessage>) -> Vec<SessionEvent> {
    let mut events = Vec::new();
    loop {
        let msg = rx
            .recv_timeout(time::Duration::from_secs(5))
            .expect("event stream went quiet before the terminal event");
        let terminal = msg.event.is_terminal();
        events.push(msg.event);
        if terminal {
            return events;
        }
    }
}

fn started(line: &str) -> SessionEvent {
    SessionEvent::CommandStarted { line: String::from(line) }
}

fn output(chunk: &str) -> SessionEvent {
    SessionEvent::Output { chunk: String::from(chunk) }
}

fn error_code(event: &SessionEvent) -> Option<&Error> {
    match event {
        SessionEvent::Error { error } => Some(error),
        _ => None,
    }
}

#[test]
#[timeout(10000)]
fn test_echo_line() {
    let registry = test_registry(SessionConfig::default());
    let (session, rx) = subscribed(&registry);

    session.run_command("echo hello world").unwrap();
    let events = drain(&rx);
    assert_eq!(
        events,
        vec![
            started("echo hello world"),
            output("hello world\n"),
            SessionEvent::CommandDone,
        ]
    );
    assert_eq!(session.get_state().cwd, "/");
}

#[test]
#[timeout(10000)]
fn test_chained_line_with_cwd_change() {
    let registry = test_registry(SessionConfig::default());
    let (session, rx) = subscribed(&registry);

    session.run_command("mkdir /a; cd /a && pwd").unwrap();
    let events = drain(&rx);
    assert_eq!(
        events,
        vec![
            started("mkdir /a; cd /a && pwd"),
            output("created: /a\n"),
            SessionEvent::CwdChanged { path: String::from("/a") },
            output("/a\n"),
            SessionEvent::CommandDone,
        ]
    );
    assert_eq!(session.get_state().cwd, "/a");
}

#[test]
#[timeout(10000)]
fn test_and_if_gates_on_error() {
    let registry = test_registry(SessionConfig::default());
    let (session, rx) = subscribed(&registry);

    session.run_command("cd /does-not-exist && pwd").unwrap();
    let events = drain(&rx);
    assert_eq!(events.len(), 3);
    assert_eq!(events[0], started("cd /does-not-exist && pwd"));
    let err = error_code(&events[1]).expect("want an error event");
    assert_eq!(err.code, ErrorCode::Vfs(VfsCode::NotFound));
    // pwd never ran, and the program still ended normally
    assert_eq!(events[2], SessionEvent::CommandDone);
    assert_eq!(session.get_state().cwd, "/");
}

#[test]
#[timeout(10000)]
fn test_semicolon_continues_after_error() {
    let registry = test_registry(SessionConfig::default());
    let (session, rx) = subscribed(&registry);

    session.run_command("cat /missing; echo still here").unwrap();
    let events = drain(&rx);
    assert_eq!(events.len(), 4);
    let err = error_code(&events[1]).expect("want an error event");
    assert_eq!(err.code, ErrorCode::Vfs(VfsCode::NotFound));
    assert_eq!(events[2], output("still here\n"));
    assert_eq!(events[3], SessionEvent::CommandDone);
}

#[test]
#[timeout(10000)]
fn test_cancel_sleep() {
    let registry = test_registry(SessionConfig::default());
    let (session, rx) = subscribed(&registry);

    session.run_command("sleep 5").unwrap();
    assert_eq!(
        rx.recv_timeout(time::Duration::from_secs(1)).unwrap().event,
        started("sleep 5")
    );
    assert_eq!(
        rx.recv_timeout(time::Duration::from_secs(1)).unwrap().event,
        output("Sleeping for 5 seconds...\n")
    );

    std::thread::sleep(time::Duration::from_millis(50));
    let cancelled_at = time::Instant::now();
    session.cancel();

    let msg = rx.recv_timeout(time::Duration::from_secs(1)).unwrap();
    assert_eq!(msg.event, SessionEvent::CommandCancelled);
    // the cancel grace window: the worker ticks every 25ms
    assert!(cancelled_at.elapsed() < time::Duration::from_millis(500));
}

#[test]
#[timeout(10000)]
fn test_network_policy_blocks_curl() {
    let config = SessionConfig {
        policy: Some(NetworkPolicy {
            allow_domains: [String::from("example.com")].into_iter().collect(),
            ..NetworkPolicy::default()
        }),
        ..SessionConfig::default()
    };
    let registry = test_registry(config);
    let (session, rx) = subscribed(&registry);

    session.run_command("curl https://evil.example").unwrap();
    let events = drain(&rx);
    assert_eq!(events.len(), 3);
    let err = error_code(&events[1]).expect("want an error event");
    assert_eq!(err.code, ErrorCode::Shell(ShellCode::NetworkBlocked));
    assert_eq!(err.context.get("domain").map(String::as_str), Some("evil.example"));
    assert_eq!(events[2], SessionEvent::CommandDone);
}

#[test]
#[timeout(10000)]
fn test_output_limit_cancels() {
    let config = SessionConfig { output_limit: 64, ..SessionConfig::default() };
    let registry = test_registry(config);
    let (session, rx) = subscribed(&registry);

    session.run_command("seq 1000").unwrap();
    let events = drain(&rx);

    let err = events
        .iter()
        .filter_map(error_code)
        .next()
        .expect("want an output limit error event");
    assert_eq!(err.code, ErrorCode::Command(CommandCode::OutputLimitExceeded));
    assert_eq!(events.last(), Some(&SessionEvent::CommandCancelled));

    // output stops promptly after the limit trips
    let emitted: usize = events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::Output { chunk } => Some(chunk.len()),
            _ => None,
        })
        .sum();
    assert!(emitted < 128, "runaway output: {emitted} bytes");
}

#[test]
#[timeout(10000)]
fn test_timeout_cancels() {
    let config = SessionConfig {
        timeout: time::Duration::from_millis(100),
        ..SessionConfig::default()
    };
    let registry = test_registry(config);
    let (session, rx) = subscribed(&registry);

    session.run_command("sleep 5").unwrap();
    let events = drain(&rx);

    let err = events.iter().filter_map(error_code).next().expect("want a timeout error");
    assert_eq!(err.code, ErrorCode::Command(CommandCode::Timeout));
    assert_eq!(events.last(), Some(&SessionEvent::CommandCancelled));
}

#[test]
#[timeout(10000)]
fn test_exactly_one_start_and_one_terminal() {
    let registry = test_registry(SessionConfig::default());
    let (session, rx) = subscribed(&registry);

    for line in ["echo a", "cat /nope; echo b", "mkdir /x && cd /x", "definitely-not-a-command"] {
        session.run_command(line).unwrap();
        let events = drain(&rx);

        let starts = events
            .iter()
            .filter(|e| matches!(e, SessionEvent::CommandStarted { .. }))
            .count();
        let terminals = events.iter().filter(|e| e.is_terminal()).count();
        assert_eq!(starts, 1, "line {line:?}");
        assert_eq!(terminals, 1, "line {line:?}");
        assert!(events.last().unwrap().is_terminal(), "line {line:?}");
    }
}

#[test]
#[timeout(10000)]
fn test_busy_until_terminal() {
    let registry = test_registry(SessionConfig::default());
    let (session, rx) = subscribed(&registry);

    session.run_command("sleep 2").unwrap();
    let err = session.run_command("echo nope").unwrap_err();
    assert_eq!(err.code, ErrorCode::Shell(ShellCode::Busy));

    session.cancel();
    let events = drain(&rx);
    assert_eq!(events.last(), Some(&SessionEvent::CommandCancelled));

    session.run_command("echo now it works").unwrap();
    let events = drain(&rx);
    assert_eq!(events.last(), Some(&SessionEvent::CommandDone));
}

#[test]
#[timeout(10000)]
fn test_env_updates_persist_across_lines() {
    let registry = test_registry(SessionConfig::default());
    let (session, rx) = subscribed(&registry);

    session.run_command("env GREETING=hello").unwrap();
    drain(&rx);
    session.run_command("env GREETING").unwrap();
    let events = drain(&rx);
    assert_eq!(events[1], output("hello\n"));

    let state = session.get_state();
    assert_eq!(state.env.get("GREETING").map(String::as_str), Some("hello"));
}

#[test]
#[timeout(10000)]
fn test_bash_builtin_state_reaches_session() {
    let registry = test_registry(SessionConfig::default());
    let (session, rx) = subscribed(&registry);

    session.run_command("bash 'mkdir /a; cd /a; env IN_SCRIPT=yes'").unwrap();
    let events = drain(&rx);
    assert!(events.contains(&SessionEvent::CwdChanged { path: String::from("/a") }));
    assert_eq!(events.last(), Some(&SessionEvent::CommandDone));

    let state = session.get_state();
    assert_eq!(state.cwd, "/a");
    assert_eq!(state.env.get("IN_SCRIPT").map(String::as_str), Some("yes"));
}

#[test]
#[timeout(10000)]
fn test_partial_updates_survive_cancellation_semantics() {
    let registry = test_registry(SessionConfig::default());
    let (session, rx) = subscribed(&registry);

    // the cd lands before the sleep is cancelled, and stays landed
    session.run_command("mkdir /a; cd /a; sleep 5").unwrap();
    loop {
        let msg = rx.recv_timeout(time::Duration::from_secs(5)).unwrap();
        if msg.event == (SessionEvent::CwdChanged { path: String::from("/a") }) {
            break;
        }
    }
    session.cancel();
    loop {
        let msg = rx.recv_timeout(time::Duration::from_secs(5)).unwrap();
        if msg.event.is_terminal() {
            assert_eq!(msg.event, SessionEvent::CommandCancelled);
            break;
        }
    }
    assert_eq!(session.get_state().cwd, "/a");
}

#[test]
#[timeout(10000)]
fn test_worker_panic_becomes_crash_for_unexpected_failures() {
    // a command that panics is caught by the runner and surfaced as
    // a structured crash error followed by a normal done terminal
    fn boom(
        _: &commands::CommandCtx,
        _: &commands::ValidatedArgs,
        _: &mut dyn commands::Emitter,
    ) -> commands::RunResult {
        panic!("worker went sideways");
    }

    let mounts = Arc::new(MountTable::new());
    mounts.register_adapter(Arc::new(MemAdapter));
    mounts.mount("ws", "/", "mem", &MountOptions::default()).unwrap();

    let mut cmds = Registry::builtin();
    cmds.register(commands::Command {
        name: "boom",
        summary: "explode",
        schema: commands::Schema::none(),
        run: boom,
    });

    let backend = Arc::new(RegistryBackend::new(
        Arc::new(cmds),
        Vfs::new(mounts, "ws"),
    ));
    let session = SessionServer::new(
        "s-crash",
        "ws",
        backend,
        Arc::new(TestHooks),
        SessionConfig::default(),
    );
    let (tx, rx) = crossbeam_channel::unbounded();
    session.subscribe(tx);

    session.run_command("boom").unwrap();
    let events = drain(&rx);
    let err = events.iter().filter_map(error_code).next().expect("want a crash error");
    assert_eq!(err.code, ErrorCode::Command(CommandCode::Crashed));
    assert_eq!(events.last(), Some(&SessionEvent::CommandDone));
}

#[test]
#[timeout(10000)]
fn test_panicking_backend_produces_crashed_terminal() {
    // a backend that panics outside the runner's catch takes the
    // whole worker down, which must surface as command_crashed
    struct PanickingBackend;
    impl libshbox::backend::Backend for PanickingBackend {
        fn execute(
            &self,
            _: &libshbox::session::state::ShellState,
            _: &libshbox::parser::Statement,
            _: &mut dyn commands::Emitter,
        ) -> commands::RunResult {
            panic!("backend fell over");
        }
    }

    let session = SessionServer::new(
        "s-backend-crash",
        "ws",
        Arc::new(PanickingBackend),
        Arc::new(TestHooks),
        SessionConfig::default(),
    );
    let (tx, rx) = crossbeam_channel::unbounded();
    session.subscribe(tx);

    session.run_command("echo hi").unwrap();
    let events = drain(&rx);
    assert_matches!(
        events.last(),
        Some(SessionEvent::CommandCrashed { reason }) if reason.contains("backend fell over")
    );

    // the session recovers to idle and keeps serving
    session.run_command("echo again").unwrap();
    let events = drain(&rx);
    assert!(events.last().unwrap().is_terminal());
}

#[test]
#[timeout(10000)]
fn test_two_subscribers_see_the_same_sequence() {
    let registry = test_registry(SessionConfig::default());
    let session = registry.create("ws");
    let (tx_a, rx_a) = crossbeam_channel::unbounded();
    let (tx_b, rx_b) = crossbeam_channel::unbounded();
    session.subscribe(tx_a);
    session.subscribe(tx_b);

    session.run_command("mkdir /a; cd /a && pwd; echo done").unwrap();
    let events_a = drain(&rx_a);
    let events_b = drain(&rx_b);
    assert_eq!(events_a, events_b);
}

#[test]
#[timeout(10000)]
fn test_sessions_run_concurrently() {
    let registry = test_registry(SessionConfig::default());
    let (a, rx_a) = subscribed(&registry);
    let (b, rx_b) = subscribed(&registry);

    a.run_command("sleep 2").unwrap();
    // session b is not serialized behind session a
    b.run_command("echo independent").unwrap();
    let events_b = drain(&rx_b);
    assert_eq!(events_b.last(), Some(&SessionEvent::CommandDone));

    a.cancel();
    let events_a = drain(&rx_a);
    assert_eq!(events_a.last(), Some(&SessionEvent::CommandCancelled));
}

#[test]
#[timeout(10000)]
fn test_hooks_fire_at_lifecycle_points() {
    #[derive(Default)]
    struct CountingHooks {
        created: AtomicUsize,
        started: AtomicUsize,
        finished: AtomicUsize,
        stopped: AtomicUsize,
        terminals: Mutex<Vec<SessionEvent>>,
    }
    impl Hooks for CountingHooks {
        fn on_session_created(&self, _: &str) -> anyhow::Result<()> {
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn on_command_started(&self, _: &str, _: &str) -> anyhow::Result<()> {
            self.started.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn on_command_finished(&self, _: &str, terminal: &SessionEvent) -> anyhow::Result<()> {
            self.finished.fetch_add(1, Ordering::SeqCst);
            self.terminals.lock().unwrap().push(terminal.clone());
            Ok(())
        }
        fn on_session_stopped(&self, _: &str) -> anyhow::Result<()> {
            self.stopped.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    let hooks = Arc::new(CountingHooks::default());
    let mounts = Arc::new(MountTable::new());
    mounts.register_adapter(Arc::new(MemAdapter));
    mounts.mount("ws", "/", "mem", &MountOptions::default()).unwrap();
    let registry = SessionRegistry::new(
        mounts,
        Arc::new(Registry::builtin()),
        Arc::clone(&hooks) as Arc<dyn Hooks + Send + Sync>,
        SessionConfig::default(),
    );

    let (session, rx) = {
        let session = registry.create("ws");
        let (tx, rx) = crossbeam_channel::unbounded();
        session.subscribe(tx);
        (session, rx)
    };
    session.run_command("echo hi").unwrap();
    drain(&rx);
    registry.stop_all();

    assert_eq!(hooks.created.load(Ordering::SeqCst), 1);
    assert_eq!(hooks.started.load(Ordering::SeqCst), 1);
    assert_eq!(hooks.finished.load(Ordering::SeqCst), 1);
    assert_eq!(hooks.stopped.load(Ordering::SeqCst), 1);
    assert_matches!(
        hooks.terminals.lock().unwrap().first(),
        Some(SessionEvent::CommandDone)
    );
}
