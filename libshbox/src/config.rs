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

use std::{collections::HashMap, fs, time};

use anyhow::Context;
use serde_derive::Deserialize;
use tracing::{info, instrument};

use crate::{consts, netpolicy::NetworkPolicy, session::server::SessionConfig};

#[instrument(skip_all)]
pub fn read_config(config_file: &Option<String>) -> anyhow::Result<Config> {
    let mut config = Config::default();
    if let Some(config_path) = config_file {
        info!("parsing explicitly passed in config ({})", config_path);
        let config_str = fs::read_to_string(config_path).context("reading config toml")?;
        config = toml::from_str(&config_str).context("parsing config file")?;
    }

    Ok(config)
}

#[derive(Deserialize, Default, Debug, Clone)]
pub struct Config {
    /// How long one command line may run before the session cancels
    /// it, in milliseconds. One minute if unset.
    pub timeout_ms: Option<u64>,

    /// Per-line cap on cumulative command output, in bytes.
    pub output_limit: Option<usize>,

    /// A table of environment variables to inject into fresh
    /// sessions.
    pub env: Option<HashMap<String, String>>,

    /// The network access policy applied to every statement. When
    /// the whole table is omitted, no policy is enforced; an empty
    /// `[network]` table gets the default-deny policy.
    pub network: Option<NetworkPolicy>,

    /// Mounts to establish against the workspace at startup. A `mem`
    /// mount at `/` is always added if nothing else covers the root.
    pub mount: Option<Vec<MountConfig>>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct MountConfig {
    /// Absolute path to mount at.
    pub path: String,
    /// The adapter tag (`mem` is the only one shipped in-tree).
    pub adapter: String,
    /// Managed mounts are the ones `unmount_workspace` tears down
    /// when asked for managed mounts only.
    #[serde(default)]
    pub managed: bool,
    /// Adapter-defined options.
    #[serde(default)]
    pub options: HashMap<String, String>,
}

impl Config {
    /// The per-session limits this config describes.
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            timeout: self
                .timeout_ms
                .map(time::Duration::from_millis)
                .unwrap_or(consts::DEFAULT_COMMAND_TIMEOUT),
            output_limit: self.output_limit.unwrap_or(consts::DEFAULT_OUTPUT_LIMIT),
            policy: self.network.clone(),
            env: self
                .env
                .as_ref()
                .map(|env| env.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
                .unwrap_or_default(),
        }
    }
}

//
// Unit Tests
//
