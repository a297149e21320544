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

//! The command registry and argument schemas.
//!
//! Every command the runtime can execute is a value in the registry:
//! a name, a one line summary, a declarative argument schema, and a
//! plain function pointer to run. There is no reflection and no
//! dynamic discovery; the built-in set is the authoritative
//! vocabulary, and embedders extend it by registering more values.

use std::collections::BTreeMap;

use shbox_protocol::{Error, ErrorCode, ShellCode};

use crate::{netpolicy::NetworkPolicy, session::state::ShellState, vfs::Vfs};

pub mod builtins;
pub mod runner;

pub use runner::{Emitter, RunResult, Stop};

/// A partial change to session state returned by a command. The
/// session server (or the sandbox executor, for scripts) folds this
/// into the state handed to the next statement.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateUpdate {
    pub cwd: Option<String>,
    /// Env assignments in the order they were made.
    pub env: Vec<(String, String)>,
}

impl StateUpdate {
    pub fn cwd<S: Into<String>>(path: S) -> Self {
        StateUpdate { cwd: Some(path.into()), env: Vec::new() }
    }

    pub fn env<K: Into<String>, V: Into<String>>(key: K, value: V) -> Self {
        StateUpdate { cwd: None, env: vec![(key.into(), value.into())] }
    }

    pub fn is_empty(&self) -> bool {
        self.cwd.is_none() && self.env.is_empty()
    }

    /// Fold a later update into this one.
    pub fn merge(&mut self, other: StateUpdate) {
        if other.cwd.is_some() {
            self.cwd = other.cwd;
        }
        self.env.extend(other.env);
    }
}

/// What a successful run produced besides its streamed output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Plain success.
    Ok,
    /// Success carrying session state changes.
    Update(StateUpdate),
}

/// Everything a command gets to see while running. Output goes
/// through the emitter, never through the context.
pub struct CommandCtx<'a> {
    pub state: &'a ShellState,
    pub vfs: &'a Vfs,
    pub registry: &'a Registry,
    /// Network policy for nested scripts run by the `bash` builtin.
    pub policy: Option<&'a NetworkPolicy>,
}

pub type RunFn = fn(&CommandCtx, &ValidatedArgs, &mut dyn Emitter) -> RunResult;

/// A command descriptor registered in the registry.
#[derive(Debug)]
pub struct Command {
    pub name: &'static str,
    pub summary: &'static str,
    pub schema: Schema,
    pub run: RunFn,
}

/// The kind of a positional argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    Str,
    Int,
}

/// One positional argument in a command's schema.
#[derive(Debug)]
pub struct ArgSpec {
    pub name: &'static str,
    pub kind: ArgKind,
    pub required: bool,
    pub default: Option<&'static str>,
}

impl ArgSpec {
    pub fn required(name: &'static str) -> Self {
        ArgSpec { name, kind: ArgKind::Str, required: true, default: None }
    }

    pub fn required_int(name: &'static str) -> Self {
        ArgSpec { name, kind: ArgKind::Int, required: true, default: None }
    }

    pub fn optional(name: &'static str) -> Self {
        ArgSpec { name, kind: ArgKind::Str, required: false, default: None }
    }

    pub fn optional_int(name: &'static str) -> Self {
        ArgSpec { name, kind: ArgKind::Int, required: false, default: None }
    }

    pub fn with_default(name: &'static str, default: &'static str) -> Self {
        ArgSpec { name, kind: ArgKind::Str, required: false, default: Some(default) }
    }
}

/// A declarative argument schema: a fixed list of positional args,
/// optionally followed by free trailing args.
#[derive(Debug)]
pub struct Schema {
    pub args: Vec<ArgSpec>,
    pub variadic: bool,
}

impl Schema {
    pub fn none() -> Self {
        Schema { args: vec![], variadic: false }
    }

    pub fn positional(args: Vec<ArgSpec>) -> Self {
        Schema { args, variadic: false }
    }

    pub fn variadic(args: Vec<ArgSpec>) -> Self {
        Schema { args, variadic: true }
    }

    /// A `usage:` line derived from the schema, used in validation
    /// error messages and `help` output.
    pub fn usage(&self, name: &str) -> String {
        let mut usage = format!("usage: {name}");
        for spec in self.args.iter() {
            if spec.required {
                usage.push_str(&format!(" {}", spec.name.to_uppercase()));
            } else {
                usage.push_str(&format!(" [{}]", spec.name.to_uppercase()));
            }
        }
        if self.variadic {
            usage.push_str(" [ARG ...]");
        }
        usage
    }

    /// Check raw args against the schema. All problems are gathered
    /// before failing so the user sees everything wrong at once,
    /// aggregated into a single validation error.
    pub fn validate(&self, name: &str, raw: &[String]) -> Result<ValidatedArgs, Error> {
        let mut problems: Vec<String> = Vec::new();
        let mut values: BTreeMap<&'static str, ArgValue> = BTreeMap::new();

        for (idx, spec) in self.args.iter().enumerate() {
            let raw_value = raw.get(idx).map(String::as_str).or(spec.default);
            match raw_value {
                None if spec.required => {
                    problems.push(format!("missing required argument: {}", spec.name));
                }
                None => {}
                Some(v) => match spec.kind {
                    ArgKind::Str => {
                        values.insert(spec.name, ArgValue::Str(String::from(v)));
                    }
                    ArgKind::Int => match v.parse::<i64>() {
                        Ok(n) => {
                            values.insert(spec.name, ArgValue::Int(n));
                        }
                        Err(_) => problems
                            .push(format!("argument {} must be an integer, got {v:?}", spec.name)),
                    },
                },
            }
        }

        let rest: Vec<String> = if raw.len() > self.args.len() {
            if self.variadic {
                raw[self.args.len()..].to_vec()
            } else {
                problems.push(format!(
                    "too many arguments: expected at most {}, got {}",
                    self.args.len(),
                    raw.len()
                ));
                vec![]
            }
        } else {
            vec![]
        };

        if !problems.is_empty() {
            let mut err = Error::new(
                ErrorCode::Shell(ShellCode::Validation),
                format!("{}: {}", problems.join("; "), self.usage(name)),
            )
            .with("command", name);
            for (idx, problem) in problems.iter().enumerate() {
                err = err.with(format!("problem_{idx}"), problem.as_str());
            }
            return Err(err);
        }

        Ok(ValidatedArgs { values, rest })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ArgValue {
    Str(String),
    Int(i64),
}

/// Arguments that passed schema validation.
#[derive(Debug, Clone, Default)]
pub struct ValidatedArgs {
    values: BTreeMap<&'static str, ArgValue>,
    /// Trailing args beyond the declared positionals.
    pub rest: Vec<String>,
}

impl ValidatedArgs {
    pub fn get_str(&self, name: &str) -> Option<&str> {
        match self.values.get(name) {
            Some(ArgValue::Str(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn get_int(&self, name: &str) -> Option<i64> {
        match self.values.get(name) {
            Some(ArgValue::Int(n)) => Some(*n),
            _ => None,
        }
    }
}

/// The name to command mapping. Lookup misses become
/// `unknown_command` errors.
pub struct Registry {
    commands: BTreeMap<&'static str, Command>,
}

impl Registry {
    pub fn new() -> Self {
        Registry { commands: BTreeMap::new() }
    }

    /// A registry holding the full built-in vocabulary.
    pub fn builtin() -> Self {
        let mut registry = Registry::new();
        for command in builtins::all().into_iter() {
            registry.register(command);
        }
        registry
    }

    pub fn register(&mut self, command: Command) {
        self.commands.insert(command.name, command);
    }

    pub fn lookup(&self, name: &str) -> Result<&Command, Error> {
        self.commands.get(name).ok_or_else(|| {
            Error::new(
                ErrorCode::Shell(ShellCode::UnknownCommand),
                format!("unknown command: {name}"),
            )
            .with("command", name)
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.commands.contains_key(name)
    }

    /// All commands in name order.
    pub fn iter(&self) -> impl Iterator<Item = &Command> {
        self.commands.values()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::builtin()
    }
}

//
// Unit Tests
//
