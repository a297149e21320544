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

//! The built-in command set.
//!
//! Each built-in is one plain function; the filesystem ones are thin
//! adapters over the VFS façade. `sleep` and `seq` are deterministic
//! generators whose whole purpose is exercising cancellation and
//! output pacing, so they tick in small slices and poll for
//! cancellation as they go.

use std::{thread, time};

use shbox_protocol::{Error, ErrorCode, ShellCode, VfsCode};

use crate::{consts, path, sandbox};

use super::{
    runner::{Emitter, RunResult, Stop},
    ArgSpec, Command, CommandCtx, Outcome, Schema, StateUpdate, ValidatedArgs,
};

/// Every built-in, in no particular order; the registry sorts.
pub fn all() -> Vec<Command> {
    vec![
        Command {
            name: "echo",
            summary: "print arguments back",
            schema: Schema::variadic(vec![]),
            run: echo,
        },
        Command {
            name: "pwd",
            summary: "print the working directory",
            schema: Schema::none(),
            run: pwd,
        },
        Command {
            name: "cd",
            summary: "change the working directory",
            schema: Schema::positional(vec![ArgSpec::with_default("path", "/")]),
            run: cd,
        },
        Command {
            name: "ls",
            summary: "list a directory",
            schema: Schema::positional(vec![ArgSpec::optional("path")]),
            run: ls,
        },
        Command {
            name: "cat",
            summary: "print a file's contents",
            schema: Schema::positional(vec![ArgSpec::required("path")]),
            run: cat,
        },
        Command {
            name: "mkdir",
            summary: "create a directory",
            schema: Schema::positional(vec![ArgSpec::required("path")]),
            run: mkdir,
        },
        Command {
            name: "rm",
            summary: "delete a file or directory tree",
            schema: Schema::positional(vec![ArgSpec::required("path")]),
            run: rm,
        },
        Command {
            name: "cp",
            summary: "copy a file",
            schema: Schema::positional(vec![ArgSpec::required("src"), ArgSpec::required("dst")]),
            run: cp,
        },
        Command {
            name: "write",
            summary: "write text to a file",
            schema: Schema::variadic(vec![ArgSpec::required("path")]),
            run: write,
        },
        Command {
            name: "env",
            summary: "list, read or set environment variables",
            schema: Schema::positional(vec![ArgSpec::optional("spec")]),
            run: env,
        },
        Command {
            name: "help",
            summary: "describe the available commands",
            schema: Schema::positional(vec![ArgSpec::optional("command")]),
            run: help,
        },
        Command {
            name: "history",
            summary: "show this session's command history",
            schema: Schema::none(),
            run: history,
        },
        Command {
            name: "mounts",
            summary: "show the workspace mount table",
            schema: Schema::none(),
            run: mounts,
        },
        Command {
            name: "sleep",
            summary: "pause for a number of seconds",
            schema: Schema::positional(vec![ArgSpec::required_int("seconds")]),
            run: sleep,
        },
        Command {
            name: "seq",
            summary: "print a sequence of numbers",
            schema: Schema::positional(vec![
                ArgSpec::required_int("first"),
                ArgSpec::optional_int("last"),
            ]),
            run: seq,
        },
        Command {
            name: "bash",
            summary: "run a script of built-in commands",
            schema: Schema::positional(vec![ArgSpec::required("script")]),
            run: bash,
        },
    ]
}

fn echo(_ctx: &CommandCtx, args: &ValidatedArgs, emitter: &mut dyn Emitter) -> RunResult {
    emitter.emit(&format!("{}\n", args.rest.join(" ")))?;
    Ok(Outcome::Ok)
}

fn pwd(ctx: &CommandCtx, _args: &ValidatedArgs, emitter: &mut dyn Emitter) -> RunResult {
    emitter.emit(&format!("{}\n", ctx.state.cwd))?;
    Ok(Outcome::Ok)
}

fn cd(ctx: &CommandCtx, args: &ValidatedArgs, _emitter: &mut dyn Emitter) -> RunResult {
    // the schema defaults the target to the root
    let target = path::resolve(&ctx.state.cwd, args.get_str("path").unwrap_or("/"));
    let meta = ctx.vfs.stat(&target).map_err(Stop::Err)?;
    if !meta.is_dir() {
        return Err(Stop::Err(
            Error::new(
                ErrorCode::Vfs(VfsCode::NotADirectory),
                format!("not a directory: {target}"),
            )
            .with("path", target),
        ));
    }
    Ok(Outcome::Update(StateUpdate::cwd(target)))
}

fn ls(ctx: &CommandCtx, args: &ValidatedArgs, emitter: &mut dyn Emitter) -> RunResult {
    let target = path::resolve(&ctx.state.cwd, args.get_str("path").unwrap_or("."));
    let entries = ctx.vfs.list(&target).map_err(Stop::Err)?;
    for entry in entries.into_iter() {
        emitter.emit(&format!("{}\n", entry.name))?;
    }
    Ok(Outcome::Ok)
}

fn cat(ctx: &CommandCtx, args: &ValidatedArgs, emitter: &mut dyn Emitter) -> RunResult {
    // "path" is required, so validation guarantees it is present
    let target = path::resolve(&ctx.state.cwd, args.get_str("path").unwrap_or_default());
    let data = ctx.vfs.read(&target).map_err(Stop::Err)?;
    emitter.emit(&String::from_utf8_lossy(&data))?;
    Ok(Outcome::Ok)
}

fn mkdir(ctx: &CommandCtx, args: &ValidatedArgs, emitter: &mut dyn Emitter) -> RunResult {
    let target = path::resolve(&ctx.state.cwd, args.get_str("path").unwrap_or_default());
    ctx.vfs.mkdir(&target).map_err(Stop::Err)?;
    emitter.emit(&format!("created: {target}\n"))?;
    Ok(Outcome::Ok)
}

fn rm(ctx: &CommandCtx, args: &ValidatedArgs, _emitter: &mut dyn Emitter) -> RunResult {
    let target = path::resolve(&ctx.state.cwd, args.get_str("path").unwrap_or_default());
    ctx.vfs.delete(&target).map_err(Stop::Err)?;
    Ok(Outcome::Ok)
}

fn cp(ctx: &CommandCtx, args: &ValidatedArgs, _emitter: &mut dyn Emitter) -> RunResult {
    let src = path::resolve(&ctx.state.cwd, args.get_str("src").unwrap_or_default());
    let mut dst = path::resolve(&ctx.state.cwd, args.get_str("dst").unwrap_or_default());

    // copying onto an existing directory drops the file into it
    if let Ok(meta) = ctx.vfs.stat(&dst) {
        if meta.is_dir() {
            if let Some(name) = path::base_name(&src) {
                dst = path::resolve(&dst, name);
            }
        }
    }

    let data = ctx.vfs.read(&src).map_err(Stop::Err)?;
    ctx.vfs.write(&dst, &data).map_err(Stop::Err)?;
    Ok(Outcome::Ok)
}

fn write(ctx: &CommandCtx, args: &ValidatedArgs, _emitter: &mut dyn Emitter) -> RunResult {
    let target = path::resolve(&ctx.state.cwd, args.get_str("path").unwrap_or_default());
    let mut data = args.rest.join(" ");
    data.push('\n');
    ctx.vfs.write(&target, data.as_bytes()).map_err(Stop::Err)?;
    Ok(Outcome::Ok)
}

fn env(ctx: &CommandCtx, args: &ValidatedArgs, emitter: &mut dyn Emitter) -> RunResult {
    let spec = match args.get_str("spec") {
        None => {
            // env keys live in a sorted map, so listing is
            // key-sorted for free
            for (key, value) in ctx.state.env.iter() {
                emitter.emit(&format!("{key}={value}\n"))?;
            }
            return Ok(Outcome::Ok);
        }
        Some(spec) => spec,
    };

    match spec.split_once('=') {
        Some(("", _)) => Err(Stop::Err(
            Error::new(
                ErrorCode::Shell(ShellCode::Validation),
                "environment variable names must be non-empty",
            )
            .with("command", "env"),
        )),
        Some((key, value)) => Ok(Outcome::Update(StateUpdate::env(key, value))),
        None => {
            match ctx.state.env.get(spec) {
                Some(value) => emitter.emit(&format!("{value}\n"))?,
                None => emitter.emit("(not set)\n")?,
            }
            Ok(Outcome::Ok)
        }
    }
}

fn help(ctx: &CommandCtx, args: &ValidatedArgs, emitter: &mut dyn Emitter) -> RunResult {
    if let Some(name) = args.get_str("command") {
        let command = ctx.registry.lookup(name).map_err(Stop::Err)?;
        emitter.emit(&format!(
            "{} - {}\n{}\n",
            command.name,
            command.summary,
            command.schema.usage(command.name)
        ))?;
        return Ok(Outcome::Ok);
    }

    for command in ctx.registry.iter() {
        emitter.emit(&format!("{:<10} {}\n", command.name, command.summary))?;
    }
    Ok(Outcome::Ok)
}

fn history(ctx: &CommandCtx, _args: &ValidatedArgs, emitter: &mut dyn Emitter) -> RunResult {
    for (idx, line) in ctx.state.history.iter().enumerate() {
        emitter.emit(&format!("{:>4}  {}\n", idx + 1, line))?;
    }
    Ok(Outcome::Ok)
}

fn mounts(ctx: &CommandCtx, _args: &ValidatedArgs, emitter: &mut dyn Emitter) -> RunResult {
    for mount in ctx.vfs.mounts().into_iter() {
        emitter.emit(&format!(
            "{:<20} {:<8} {}\n",
            mount.path, mount.adapter, mount.ownership
        ))?;
    }
    Ok(Outcome::Ok)
}

fn sleep(_ctx: &CommandCtx, args: &ValidatedArgs, emitter: &mut dyn Emitter) -> RunResult {
    let seconds = args.get_int("seconds").unwrap_or(0).max(0) as u64;
    emitter.emit(&format!("Sleeping for {seconds} seconds...\n"))?;

    // tick in small slices so a cancel lands within the grace window
    let deadline = time::Instant::now() + time::Duration::from_secs(seconds);
    while time::Instant::now() < deadline {
        if emitter.cancelled() {
            return Err(Stop::Cancelled);
        }
        thread::sleep(consts::CANCEL_POLL_DURATION);
    }
    Ok(Outcome::Ok)
}

fn seq(_ctx: &CommandCtx, args: &ValidatedArgs, emitter: &mut dyn Emitter) -> RunResult {
    // `seq LAST` counts from 1; `seq FIRST LAST` from FIRST
    let (first, last) = match (args.get_int("first"), args.get_int("last")) {
        (Some(first), Some(last)) => (first, last),
        (Some(last), None) => (1, last),
        _ => (1, 0),
    };

    let mut n = first;
    while n <= last {
        emitter.emit(&format!("{n}\n"))?;
        n += 1;
        thread::sleep(consts::SEQ_TICK_DURATION);
    }
    Ok(Outcome::Ok)
}

fn bash(ctx: &CommandCtx, args: &ValidatedArgs, emitter: &mut dyn Emitter) -> RunResult {
    let script = args.get_str("script").unwrap_or_default();
    let update = sandbox::execute(ctx, script, emitter)?;
    if update.is_empty() {
        Ok(Outcome::Ok)
    } else {
        Ok(Outcome::Update(update))
    }
}

//
// Unit Tests
//
