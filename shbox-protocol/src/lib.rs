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

use std::{collections::BTreeMap, fmt};

use serde::{
    de::{self, Deserializer, SeqAccess, Visitor},
    ser::{SerializeTuple, Serializer},
    Deserialize, Serialize,
};
use serde_derive::{Deserialize as DeriveDeserialize, Serialize as DeriveSerialize};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// The stream tag attached to every message a session server
/// publishes. There is only one stream kind right now, but the tag
/// is part of the wire shape so that transports can multiplex other
/// streams over the same channel later without breaking subscribers.
pub const SESSION_STREAM: &str = "session";

/// A message published to session subscribers.
///
/// Subscribers may be watching more than one session over a single
/// channel, so every event is wrapped in an envelope carrying the
/// id of the session that produced it.
#[derive(DeriveSerialize, DeriveDeserialize, Debug, Clone, PartialEq)]
pub struct SessionMessage {
    pub stream: String,
    pub session_id: String,
    pub event: SessionEvent,
}

impl SessionMessage {
    pub fn new<S: Into<String>>(session_id: S, event: SessionEvent) -> Self {
        SessionMessage {
            stream: String::from(SESSION_STREAM),
            session_id: session_id.into(),
            event,
        }
    }
}

/// An event in the life of one submitted command line.
///
/// Every accepted line produces exactly one `CommandStarted`, zero or
/// more `Output`/`CwdChanged`/`Error` events, and then exactly one of
/// the three terminal events (`CommandDone`, `CommandCancelled`,
/// `CommandCrashed`). The shape must stay stable across backends.
#[derive(DeriveSerialize, DeriveDeserialize, Debug, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionEvent {
    CommandStarted { line: String },
    Output { chunk: String },
    CwdChanged { path: String },
    Error { error: Error },
    CommandDone,
    CommandCancelled,
    CommandCrashed { reason: String },
}

impl SessionEvent {
    /// True for the three events that end a command line.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionEvent::CommandDone
                | SessionEvent::CommandCancelled
                | SessionEvent::CommandCrashed { .. }
        )
    }
}

/// A structured error with a stable two-level code.
///
/// On the wire this serializes as
/// `{"code": ["vfs", "not_found"], "message": "...", "context": {...}}`.
/// Front ends display `message`; `context` is for logs and assertions,
/// never for display logic.
#[derive(thiserror::Error, DeriveSerialize, DeriveDeserialize, Debug, Clone, PartialEq)]
#[error("{message}")]
pub struct Error {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub context: BTreeMap<String, String>,
}

impl Error {
    pub fn new<S: Into<String>>(code: ErrorCode, message: S) -> Self {
        Error { code, message: message.into(), context: BTreeMap::new() }
    }

    /// Attach a context entry. Builder style so call sites can chain
    /// a few of these without a mutable local.
    pub fn with<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// The stable error code taxonomy. The namespace/detail split is part
/// of the wire contract, so variants here must never be renamed, only
/// added.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Vfs(VfsCode),
    Shell(ShellCode),
    Command(CommandCode),
    Session(SessionCode),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VfsCode {
    NotFound,
    NotADirectory,
    Exists,
    Io,
    NoMount,
    PathAlreadyMounted,
    InvalidAdapterConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShellCode {
    UnknownCommand,
    EmptyCommand,
    ChainedCommand,
    Validation,
    Busy,
    NetworkBlocked,
    UnclosedQuote,
    DanglingEscape,
    InvalidOperatorPosition,
    TrailingOperator,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandCode {
    ExitCode,
    Timeout,
    OutputLimitExceeded,
    Crashed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionCode {
    NotFound,
}

impl ErrorCode {
    pub fn namespace(&self) -> &'static str {
        match self {
            ErrorCode::Vfs(_) => "vfs",
            ErrorCode::Shell(_) => "shell",
            ErrorCode::Command(_) => "command",
            ErrorCode::Session(_) => "session",
        }
    }

    pub fn detail(&self) -> &'static str {
        match self {
            ErrorCode::Vfs(VfsCode::NotFound) => "not_found",
            ErrorCode::Vfs(VfsCode::NotADirectory) => "not_a_directory",
            ErrorCode::Vfs(VfsCode::Exists) => "exists",
            ErrorCode::Vfs(VfsCode::Io) => "io",
            ErrorCode::Vfs(VfsCode::NoMount) => "no_mount",
            ErrorCode::Vfs(VfsCode::PathAlreadyMounted) => "path_already_mounted",
            ErrorCode::Vfs(VfsCode::InvalidAdapterConfig) => "invalid_adapter_config",
            ErrorCode::Shell(ShellCode::UnknownCommand) => "unknown_command",
            ErrorCode::Shell(ShellCode::EmptyCommand) => "empty_command",
            ErrorCode::Shell(ShellCode::ChainedCommand) => "chained_command",
            ErrorCode::Shell(ShellCode::Validation) => "validation",
            ErrorCode::Shell(ShellCode::Busy) => "busy",
            ErrorCode::Shell(ShellCode::NetworkBlocked) => "network_blocked",
            ErrorCode::Shell(ShellCode::UnclosedQuote) => "unclosed_quote",
            ErrorCode::Shell(ShellCode::DanglingEscape) => "dangling_escape",
            ErrorCode::Shell(ShellCode::InvalidOperatorPosition) => "invalid_operator_position",
            ErrorCode::Shell(ShellCode::TrailingOperator) => "trailing_operator",
            ErrorCode::Command(CommandCode::ExitCode) => "exit_code",
            ErrorCode::Command(CommandCode::Timeout) => "timeout",
            ErrorCode::Command(CommandCode::OutputLimitExceeded) => "output_limit_exceeded",
            ErrorCode::Command(CommandCode::Crashed) => "crashed",
            ErrorCode::Session(SessionCode::NotFound) => "not_found",
        }
    }

    fn parse(namespace: &str, detail: &str) -> Option<Self> {
        let code = match (namespace, detail) {
            ("vfs", "not_found") => ErrorCode::Vfs(VfsCode::NotFound),
            ("vfs", "not_a_directory") => ErrorCode::Vfs(VfsCode::NotADirectory),
            ("vfs", "exists") => ErrorCode::Vfs(VfsCode::Exists),
            ("vfs", "io") => ErrorCode::Vfs(VfsCode::Io),
            ("vfs", "no_mount") => ErrorCode::Vfs(VfsCode::NoMount),
            ("vfs", "path_already_mounted") => ErrorCode::Vfs(VfsCode::PathAlreadyMounted),
            ("vfs", "invalid_adapter_config") => ErrorCode::Vfs(VfsCode::InvalidAdapterConfig),
            ("shell", "unknown_command") => ErrorCode::Shell(ShellCode::UnknownCommand),
            ("shell", "empty_command") => ErrorCode::Shell(ShellCode::EmptyCommand),
            ("shell", "chained_command") => ErrorCode::Shell(ShellCode::ChainedCommand),
            ("shell", "validation") => ErrorCode::Shell(ShellCode::Validation),
            ("shell", "busy") => ErrorCode::Shell(ShellCode::Busy),
            ("shell", "network_blocked") => ErrorCode::Shell(ShellCode::NetworkBlocked),
            ("shell", "unclosed_quote") => ErrorCode::Shell(ShellCode::UnclosedQuote),
            ("shell", "dangling_escape") => ErrorCode::Shell(ShellCode::DanglingEscape),
            ("shell", "invalid_operator_position") => {
                ErrorCode::Shell(ShellCode::InvalidOperatorPosition)
            }
            ("shell", "trailing_operator") => ErrorCode::Shell(ShellCode::TrailingOperator),
            ("command", "exit_code") => ErrorCode::Command(CommandCode::ExitCode),
            ("command", "timeout") => ErrorCode::Command(CommandCode::Timeout),
            ("command", "output_limit_exceeded") => {
                ErrorCode::Command(CommandCode::OutputLimitExceeded)
            }
            ("command", "crashed") => ErrorCode::Command(CommandCode::Crashed),
            ("session", "not_found") => ErrorCode::Session(SessionCode::NotFound),
            _ => return None,
        };
        Some(code)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace(), self.detail())
    }
}

// Codes cross the subscriber boundary as a two element array so that
// subscribers in other languages can match on them without knowing
// the full taxonomy.
impl Serialize for ErrorCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut tup = serializer.serialize_tuple(2)?;
        tup.serialize_element(self.namespace())?;
        tup.serialize_element(self.detail())?;
        tup.end()
    }
}

impl<'de> Deserialize<'de> for ErrorCode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct CodeVisitor;

        impl<'de> Visitor<'de> for CodeVisitor {
            type Value = ErrorCode;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "a [namespace, detail] error code pair")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
                let namespace: String =
                    seq.next_element()?.ok_or_else(|| de::Error::invalid_length(0, &self))?;
                let detail: String =
                    seq.next_element()?.ok_or_else(|| de::Error::invalid_length(1, &self))?;
                ErrorCode::parse(&namespace, &detail).ok_or_else(|| {
                    de::Error::custom(format!("unknown error code {namespace}:{detail}"))
                })
            }
        }

        deserializer.deserialize_tuple(2, CodeVisitor)
    }
}

//
// Unit Tests
//
