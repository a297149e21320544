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

//! The virtual filesystem.
//!
//! `Vfs` is the workspace-scoped façade commands talk to: it routes
//! every absolute path through the workspace's mount table and
//! dispatches the operation to the owning adapter. Callers must hand
//! it normalized absolute paths; `crate::path` has the tools.

use std::sync::Arc;

use shbox_protocol::Error;

pub mod adapter;
pub mod mem;
pub mod mount;

pub use adapter::{
    Adapter, ChildHandle, Configured, DirEntry, FileSystem, Metadata, MountOptions, NodeKind,
    Ownership, ProcessSpawn,
};
pub use mount::{MountInfo, MountTable, Resolved};

/// A view of one workspace's mounts. Cheap to clone; all clones
/// share the underlying table.
#[derive(Clone)]
pub struct Vfs {
    table: Arc<MountTable>,
    workspace: String,
}

impl Vfs {
    pub fn new(table: Arc<MountTable>, workspace: &str) -> Self {
        Vfs { table, workspace: String::from(workspace) }
    }

    pub fn workspace(&self) -> &str {
        &self.workspace
    }

    pub fn mounts(&self) -> Vec<MountInfo> {
        self.table.list(&self.workspace)
    }

    pub fn stat(&self, abs_path: &str) -> Result<Metadata, Error> {
        let r = self.table.resolve(&self.workspace, abs_path)?;
        r.filesystem.stat(&r.relative).map_err(|e| e.with("path", abs_path))
    }

    pub fn read(&self, abs_path: &str) -> Result<Vec<u8>, Error> {
        let r = self.table.resolve(&self.workspace, abs_path)?;
        r.filesystem.read(&r.relative).map_err(|e| e.with("path", abs_path))
    }

    pub fn write(&self, abs_path: &str, data: &[u8]) -> Result<(), Error> {
        let r = self.table.resolve(&self.workspace, abs_path)?;
        r.filesystem.write(&r.relative, data).map_err(|e| e.with("path", abs_path))
    }

    pub fn list(&self, abs_path: &str) -> Result<Vec<DirEntry>, Error> {
        let r = self.table.resolve(&self.workspace, abs_path)?;
        r.filesystem.list(&r.relative).map_err(|e| e.with("path", abs_path))
    }

    pub fn mkdir(&self, abs_path: &str) -> Result<(), Error> {
        let r = self.table.resolve(&self.workspace, abs_path)?;
        r.filesystem.mkdir(&r.relative).map_err(|e| e.with("path", abs_path))
    }

    pub fn delete(&self, abs_path: &str) -> Result<(), Error> {
        let r = self.table.resolve(&self.workspace, abs_path)?;
        r.filesystem.delete(&r.relative).map_err(|e| e.with("path", abs_path))
    }
}

//
// Unit Tests
//
