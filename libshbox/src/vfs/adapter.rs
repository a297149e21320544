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

//! The filesystem adapter contract.
//!
//! A mount binds a path prefix to a filesystem produced by an
//! adapter. Adapters are capability objects: the mount table only
//! ever talks to them through the two small traits here, so backing
//! stores can range from the in-memory reference implementation to
//! network filesystems with their own helper processes.

use std::{collections::BTreeMap, fmt, sync::Arc};

use shbox_protocol::Error;

/// Options passed to `mount`. The `managed` flag marks mounts that
/// workspace teardown should clean up when asked for managed mounts
/// only; everything else is adapter-defined.
#[derive(Debug, Clone, Default)]
pub struct MountOptions {
    pub managed: bool,
    pub opts: BTreeMap<String, String>,
}

impl MountOptions {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.opts.get(key).map(String::as_str)
    }
}

/// Who is responsible for the adapter's backing process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// The mount launched the process and must stop it on unmount.
    Owned,
    /// The process pre-existed the mount and must be left alone.
    Shared,
    /// The adapter has no backing process.
    None,
}

impl fmt::Display for Ownership {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ownership::Owned => write!(f, "owned"),
            Ownership::Shared => write!(f, "shared"),
            Ownership::None => write!(f, "-"),
        }
    }
}

/// A handle to an adapter's backing process. `stop` must be
/// idempotent; the mount table guarantees it calls stop at most
/// once per mount, but adapters get restarted and handles get
/// dropped on error paths.
pub trait ChildHandle: Send + Sync {
    fn stop(&self);
}

/// What `configure` did about a backing process.
pub enum ProcessSpawn {
    /// No process involved.
    None,
    /// The adapter launched a fresh process for this mount.
    Started(Box<dyn ChildHandle>),
    /// The adapter found a suitable process already running.
    Existing(Box<dyn ChildHandle>),
}

/// The result of configuring an adapter for one mount.
pub struct Configured {
    pub filesystem: Arc<dyn FileSystem>,
    pub process: ProcessSpawn,
}

/// An adapter knows how to turn mount options into a live
/// filesystem, starting a backing process if it needs one.
pub trait Adapter: Send + Sync {
    /// The tag this adapter registers under (`mem`, `sshfs`, ...).
    fn name(&self) -> &'static str;

    /// Build a filesystem for a new mount. Any error here surfaces
    /// to the caller of `mount` as `invalid_adapter_config`.
    fn configure(&self, opts: &MountOptions) -> Result<Configured, Error>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    File,
    Dir,
}

/// Stat result for a single VFS node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    pub kind: NodeKind,
    pub size: u64,
}

impl Metadata {
    pub fn is_dir(&self) -> bool {
        self.kind == NodeKind::Dir
    }
}

/// A directory listing entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub kind: NodeKind,
}

/// The operations a mounted filesystem must support.
///
/// Paths handed to these methods are always mount-relative: `"."`
/// for the mount root, otherwise a normalized relative path like
/// `"a/b"`. Implementations never see the mount prefix.
pub trait FileSystem: Send + Sync + std::fmt::Debug {
    fn stat(&self, path: &str) -> Result<Metadata, Error>;
    fn read(&self, path: &str) -> Result<Vec<u8>, Error>;
    fn write(&self, path: &str, data: &[u8]) -> Result<(), Error>;
    fn list(&self, path: &str) -> Result<Vec<DirEntry>, Error>;
    fn mkdir(&self, path: &str) -> Result<(), Error>;
    fn delete(&self, path: &str) -> Result<(), Error>;
}
