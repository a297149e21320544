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

//! The mount table.
//!
//! Per workspace, an ordered set of mounts over filesystem adapters.
//! Path resolution is longest-prefix: the table keeps each
//! workspace's mounts sorted longest path first (ties broken
//! lexicographically) so the first prefix hit is the right one and
//! resolution order is deterministic.
//!
//! Mutations go through one mutex. A mount is removed from the table
//! under the lock before its backing process is stopped, which is
//! what makes concurrent unmounts of the same path produce exactly
//! one success and one `not_found`, and owned processes stop exactly
//! once.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use shbox_protocol::{Error, ErrorCode, VfsCode};
use tracing::{info, instrument, warn};

use crate::path;

use super::adapter::{Adapter, ChildHandle, FileSystem, MountOptions, Ownership, ProcessSpawn};

struct MountEntry {
    path: String,
    adapter: &'static str,
    ownership: Ownership,
    managed: bool,
    filesystem: Arc<dyn FileSystem>,
    child: Option<Box<dyn ChildHandle>>,
}

impl MountEntry {
    /// Stop the backing process if this mount owns it. Consumes the
    /// entry, so a given mount can only ever be torn down once.
    fn teardown(self) {
        if self.ownership == Ownership::Owned {
            if let Some(child) = self.child {
                info!("stopping owned adapter process for mount {}", self.path);
                child.stop();
            } else {
                // ownership bookkeeping bug in an adapter
                warn!("owned mount {} has no child handle", self.path);
            }
        }
    }
}

/// A mount as reported by `list`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountInfo {
    pub path: String,
    pub adapter: &'static str,
    pub ownership: Ownership,
    pub managed: bool,
}

/// The result of resolving an absolute path against a workspace's
/// mounts.
#[derive(Debug)]
pub struct Resolved {
    pub filesystem: Arc<dyn FileSystem>,
    pub mount_path: String,
    pub adapter: &'static str,
    /// Mount-relative remainder, `"."` exactly at the mount root.
    pub relative: String,
}

pub struct MountTable {
    adapters: Mutex<HashMap<&'static str, Arc<dyn Adapter>>>,
    tables: Mutex<HashMap<String, Vec<MountEntry>>>,
}

impl MountTable {
    pub fn new() -> Self {
        MountTable { adapters: Mutex::new(HashMap::new()), tables: Mutex::new(HashMap::new()) }
    }

    /// Make an adapter available for mounting under its tag.
    pub fn register_adapter(&self, adapter: Arc<dyn Adapter>) {
        let mut adapters = self.adapters.lock().unwrap();
        adapters.insert(adapter.name(), adapter);
    }

    /// Mount `adapter` at `mount_path` in the given workspace.
    #[instrument(skip_all, fields(ws = workspace, path = mount_path))]
    pub fn mount(
        &self,
        workspace: &str,
        mount_path: &str,
        adapter: &str,
        opts: &MountOptions,
    ) -> Result<(), Error> {
        let mount_path = path::resolve("/", mount_path);

        let adapter = {
            let adapters = self.adapters.lock().unwrap();
            match adapters.get(adapter) {
                Some(a) => Arc::clone(a),
                None => {
                    return Err(Error::new(
                        ErrorCode::Vfs(VfsCode::InvalidAdapterConfig),
                        format!("no such adapter: {adapter}"),
                    )
                    .with("adapter", adapter))
                }
            }
        };

        // Configure outside the table lock. Adapters may launch
        // processes, and that must not serialize against resolution
        // in other workspaces.
        let configured = adapter.configure(opts).map_err(|e| {
            Error::new(
                ErrorCode::Vfs(VfsCode::InvalidAdapterConfig),
                format!("configuring adapter {}: {}", adapter.name(), e.message),
            )
            .with("adapter", adapter.name())
        })?;
        let (ownership, child) = match configured.process {
            ProcessSpawn::None => (Ownership::None, None),
            ProcessSpawn::Started(child) => (Ownership::Owned, Some(child)),
            ProcessSpawn::Existing(child) => (Ownership::Shared, Some(child)),
        };

        let mut tables = self.tables.lock().unwrap();
        let mounts = tables.entry(String::from(workspace)).or_default();
        if mounts.iter().any(|m| m.path == mount_path) {
            // stop the process we just started before surfacing
            // the conflict, or it would leak
            if ownership == Ownership::Owned {
                if let Some(child) = child {
                    child.stop();
                }
            }
            return Err(Error::new(
                ErrorCode::Vfs(VfsCode::PathAlreadyMounted),
                format!("already mounted: {mount_path}"),
            )
            .with("path", mount_path));
        }

        info!("mounting {} adapter at {}", adapter.name(), mount_path);
        mounts.push(MountEntry {
            path: mount_path,
            adapter: adapter.name(),
            ownership,
            managed: opts.managed,
            filesystem: configured.filesystem,
            child,
        });
        mounts.sort_by(|a, b| {
            b.path.len().cmp(&a.path.len()).then_with(|| a.path.cmp(&b.path))
        });

        Ok(())
    }

    /// Remove the mount at exactly `mount_path`, stopping its
    /// backing process iff this mount owns it.
    #[instrument(skip_all, fields(ws = workspace, path = mount_path))]
    pub fn unmount(&self, workspace: &str, mount_path: &str) -> Result<(), Error> {
        let mount_path = path::resolve("/", mount_path);

        let entry = {
            let mut tables = self.tables.lock().unwrap();
            let mounts = tables.get_mut(workspace);
            let idx = mounts
                .as_ref()
                .and_then(|ms| ms.iter().position(|m| m.path == mount_path));
            match (mounts, idx) {
                (Some(mounts), Some(idx)) => mounts.remove(idx),
                _ => {
                    return Err(Error::new(
                        ErrorCode::Vfs(VfsCode::NotFound),
                        format!("no mount at: {mount_path}"),
                    )
                    .with("path", mount_path))
                }
            }
        };
        entry.teardown();

        Ok(())
    }

    /// Tear down a workspace's mounts; with `managed_only`, just the
    /// ones whose options flagged them as managed.
    #[instrument(skip_all, fields(ws = workspace))]
    pub fn unmount_workspace(&self, workspace: &str, managed_only: bool) {
        let drained = {
            let mut tables = self.tables.lock().unwrap();
            match tables.get_mut(workspace) {
                Some(mounts) if managed_only => {
                    let (managed, kept): (Vec<_>, Vec<_>) =
                        mounts.drain(..).partition(|m| m.managed);
                    *mounts = kept;
                    managed
                }
                Some(mounts) => mounts.drain(..).collect(),
                None => Vec::new(),
            }
        };
        for entry in drained.into_iter() {
            entry.teardown();
        }
    }

    /// The workspace's mounts, longest path first.
    pub fn list(&self, workspace: &str) -> Vec<MountInfo> {
        let tables = self.tables.lock().unwrap();
        tables
            .get(workspace)
            .map(|mounts| {
                mounts
                    .iter()
                    .map(|m| MountInfo {
                        path: m.path.clone(),
                        adapter: m.adapter,
                        ownership: m.ownership,
                        managed: m.managed,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Route an absolute path to the owning mount: the first (and
    /// therefore longest) mounted prefix wins.
    pub fn resolve(&self, workspace: &str, abs_path: &str) -> Result<Resolved, Error> {
        let abs_path = path::resolve("/", abs_path);

        let tables = self.tables.lock().unwrap();
        let mounts = tables.get(workspace);
        let hit = mounts.and_then(|ms| {
            ms.iter().find(|m| path::is_path_prefix(&m.path, &abs_path))
        });
        match hit {
            Some(m) => Ok(Resolved {
                filesystem: Arc::clone(&m.filesystem),
                mount_path: m.path.clone(),
                adapter: m.adapter,
                relative: path::strip_path_prefix(&m.path, &abs_path),
            }),
            None => Err(Error::new(
                ErrorCode::Vfs(VfsCode::NoMount),
                format!("no mount covers: {abs_path}"),
            )
            .with("path", abs_path)
            .with("workspace", workspace)),
        }
    }
}

impl Default for MountTable {
    fn default() -> Self {
        Self::new()
    }
}

//
// Unit Tests
//
