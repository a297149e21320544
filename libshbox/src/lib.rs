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

use std::{fs, io, sync::Arc, sync::Mutex};

use anyhow::Context;
use clap::Parser;
pub use hooks::Hooks;
use tracing::{error, warn};
use tracing_subscriber::fmt::format::FmtSpan;

pub mod backend;
pub mod commands;
pub mod config;
mod consts;
mod hooks;
pub mod netpolicy;
pub mod parser;
pub mod path;
mod repl;
pub mod sandbox;
pub mod session;
pub mod vfs;

use session::SessionRegistry;
use vfs::{mem, MountOptions, MountTable};

/// The command line arguments that shbox expects.
/// These can be directly parsed with clap or manually
/// constructed in order to present some other user
/// interface.
#[derive(Parser, Debug)]
#[clap(author, about)]
pub struct Args {
    #[clap(
        short,
        long,
        action,
        long_help = "The file to write logs to

Logs are discarded by default so they don't interleave
with command output at the prompt."
    )]
    pub log_file: Option<String>,

    #[clap(
        short,
        long,
        action = clap::ArgAction::Count,
        help = "Show more in logs, may be provided multiple times",
    )]
    pub verbose: u8,

    #[clap(short, long, action, help = "a toml file containing configuration")]
    pub config_file: Option<String>,

    #[clap(
        short,
        long,
        action,
        help = "The workspace whose mounts and sessions to use [default: default]"
    )]
    pub workspace: Option<String>,

    #[clap(
        long,
        action,
        long_help = "Attach to the session with this id

If no session with the id exists yet one is created, so a
client that reconnects with the same id keeps its cwd, env
and history."
    )]
    pub session_id: Option<String>,

    #[clap(long, action, help = "Select the full-screen front end")]
    pub ui: bool,
}

/// Run the shbox tool with the given arguments. If hooks is
/// provided, inject the callbacks into the session servers.
pub fn run(args: Args, hooks: Option<Box<dyn hooks::Hooks + Send + Sync>>) -> anyhow::Result<()> {
    let trace_level = if args.verbose == 0 {
        tracing::Level::INFO
    } else if args.verbose == 1 {
        tracing::Level::DEBUG
    } else {
        tracing::Level::TRACE
    };
    if let Some(log_file) = args.log_file.clone() {
        let file = fs::File::create(log_file)?;
        tracing_subscriber::fmt()
            .with_max_level(trace_level)
            .with_thread_ids(true)
            .with_target(false)
            .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
            .with_writer(Mutex::new(file))
            .init();
    } else if args.verbose > 0 {
        tracing_subscriber::fmt()
            .with_max_level(trace_level)
            .with_thread_ids(true)
            .with_target(false)
            .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
            .with_writer(io::stderr)
            .init();
    }

    let res = run_repl(args, hooks.unwrap_or(Box::new(hooks::NoopHooks {})));

    if let Err(err) = res {
        error!("{:?}", err);
        std::process::exit(1);
    }

    Ok(())
}

fn run_repl(args: Args, hooks: Box<dyn hooks::Hooks + Send + Sync>) -> anyhow::Result<()> {
    let config = config::read_config(&args.config_file)?;
    let workspace = args.workspace.as_deref().unwrap_or(consts::DEFAULT_WORKSPACE);

    let mounts = Arc::new(MountTable::new());
    mounts.register_adapter(Arc::new(mem::MemAdapter));
    for mount in config.mount.iter().flatten() {
        let opts = MountOptions {
            managed: mount.managed,
            opts: mount.options.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        };
        mounts
            .mount(workspace, &mount.path, &mount.adapter, &opts)
            .with_context(|| format!("establishing configured mount at {}", mount.path))?;
    }
    // every workspace needs a root so `cd /` and friends work
    if !mounts.list(workspace).iter().any(|m| m.path == "/") {
        mounts
            .mount(workspace, "/", mem::ADAPTER_NAME, &MountOptions::default())
            .context("establishing root mount")?;
    }

    let registry = SessionRegistry::new(
        mounts,
        Arc::new(commands::Registry::builtin()),
        Arc::from(hooks),
        config.session_config(),
    );

    let session = match &args.session_id {
        Some(id) => registry.create_with_id(workspace, id),
        None => registry.create(workspace),
    };

    if args.ui {
        warn!("full-screen front end is not built into this binary, using the line repl");
    }

    let res = repl::run(&registry, session);
    registry.stop_all();
    res
}
