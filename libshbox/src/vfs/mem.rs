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

//! The in-memory reference filesystem adapter.
//!
//! A plain tree of nodes behind a mutex. This is the adapter tests
//! and the default workspace use; it also pins down the semantics
//! other adapters are expected to copy (strict parents for write
//! and mkdir, recursive delete, sorted listings).

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
};

use shbox_protocol::{Error, ErrorCode, VfsCode};

use super::adapter::{
    Adapter, Configured, DirEntry, FileSystem, Metadata, MountOptions, NodeKind, ProcessSpawn,
};

/// The adapter tag, used in `mount` calls and config files.
pub const ADAPTER_NAME: &str = "mem";

pub struct MemAdapter;

impl Adapter for MemAdapter {
    fn name(&self) -> &'static str {
        ADAPTER_NAME
    }

    fn configure(&self, _opts: &MountOptions) -> Result<Configured, Error> {
        Ok(Configured { filesystem: Arc::new(MemFs::new()), process: ProcessSpawn::None })
    }
}

#[derive(Debug)]
enum Node {
    File(Vec<u8>),
    Dir(BTreeMap<String, Node>),
}

impl Node {
    fn metadata(&self) -> Metadata {
        match self {
            Node::File(data) => Metadata { kind: NodeKind::File, size: data.len() as u64 },
            Node::Dir(_) => Metadata { kind: NodeKind::Dir, size: 0 },
        }
    }
}

#[derive(Debug)]
pub struct MemFs {
    root: Mutex<Node>,
}

impl MemFs {
    pub fn new() -> Self {
        MemFs { root: Mutex::new(Node::Dir(BTreeMap::new())) }
    }
}

impl Default for MemFs {
    fn default() -> Self {
        Self::new()
    }
}

fn not_found(path: &str) -> Error {
    Error::new(ErrorCode::Vfs(VfsCode::NotFound), format!("no such file or directory: {path}"))
        .with("path", path)
}

fn not_a_directory(path: &str) -> Error {
    Error::new(ErrorCode::Vfs(VfsCode::NotADirectory), format!("not a directory: {path}"))
        .with("path", path)
}

/// Split a mount-relative path into components. `"."` is the root.
fn components(path: &str) -> Vec<&str> {
    if path == "." {
        vec![]
    } else {
        path.split('/').filter(|s| !s.is_empty()).collect()
    }
}

/// Walk to the node at `path`, or None if any step is missing.
/// Walking through a file yields a `not_a_directory` error.
fn lookup<'a>(root: &'a Node, path: &str) -> Result<Option<&'a Node>, Error> {
    let mut node = root;
    let comps = components(path);
    for (idx, comp) in comps.iter().enumerate() {
        match node {
            Node::Dir(entries) => match entries.get(*comp) {
                Some(child) => node = child,
                None => return Ok(None),
            },
            Node::File(_) => {
                return Err(not_a_directory(&comps[..idx].join("/")));
            }
        }
    }
    Ok(Some(node))
}

/// Walk to the directory containing the last component of `path`,
/// returning the directory's entry map and the final name.
fn lookup_parent<'a>(
    root: &'a mut Node,
    path: &str,
) -> Result<(&'a mut BTreeMap<String, Node>, String), Error> {
    let comps = components(path);
    let (name, dirs) = match comps.split_last() {
        Some((name, dirs)) => (name, dirs),
        // the mount root has no parent; callers guard against
        // operating on "." before getting here
        None => return Err(not_found(path)),
    };

    let mut node = root;
    for comp in dirs {
        match node {
            Node::Dir(entries) => match entries.get_mut(*comp) {
                Some(child) => node = child,
                None => return Err(not_found(path)),
            },
            Node::File(_) => return Err(not_a_directory(path)),
        }
    }
    match node {
        Node::Dir(entries) => Ok((entries, String::from(*name))),
        Node::File(_) => Err(not_a_directory(path)),
    }
}

impl FileSystem for MemFs {
    fn stat(&self, path: &str) -> Result<Metadata, Error> {
        let root = self.root.lock().unwrap();
        match lookup(&root, path)? {
            Some(node) => Ok(node.metadata()),
            None => Err(not_found(path)),
        }
    }

    fn read(&self, path: &str) -> Result<Vec<u8>, Error> {
        let root = self.root.lock().unwrap();
        match lookup(&root, path)? {
            Some(Node::File(data)) => Ok(data.clone()),
            Some(Node::Dir(_)) => Err(Error::new(
                ErrorCode::Vfs(VfsCode::Io),
                format!("is a directory: {path}"),
            )
            .with("path", path)),
            None => Err(not_found(path)),
        }
    }

    fn write(&self, path: &str, data: &[u8]) -> Result<(), Error> {
        let mut root = self.root.lock().unwrap();
        let (entries, name) = lookup_parent(&mut root, path)?;
        match entries.get_mut(&name) {
            Some(Node::Dir(_)) => Err(Error::new(
                ErrorCode::Vfs(VfsCode::Io),
                format!("is a directory: {path}"),
            )
            .with("path", path)),
            Some(Node::File(existing)) => {
                *existing = data.to_vec();
                Ok(())
            }
            None => {
                entries.insert(name, Node::File(data.to_vec()));
                Ok(())
            }
        }
    }

    fn list(&self, path: &str) -> Result<Vec<DirEntry>, Error> {
        let root = self.root.lock().unwrap();
        match lookup(&root, path)? {
            Some(Node::Dir(entries)) => Ok(entries
                .iter()
                .map(|(name, node)| DirEntry {
                    name: name.clone(),
                    kind: node.metadata().kind,
                })
                .collect()),
            Some(Node::File(_)) => Err(not_a_directory(path)),
            None => Err(not_found(path)),
        }
    }

    fn mkdir(&self, path: &str) -> Result<(), Error> {
        let mut root = self.root.lock().unwrap();
        let (entries, name) = lookup_parent(&mut root, path)?;
        if entries.contains_key(&name) {
            return Err(Error::new(
                ErrorCode::Vfs(VfsCode::Exists),
                format!("already exists: {path}"),
            )
            .with("path", path));
        }
        entries.insert(name, Node::Dir(BTreeMap::new()));
        Ok(())
    }

    fn delete(&self, path: &str) -> Result<(), Error> {
        let mut root = self.root.lock().unwrap();
        let (entries, name) = lookup_parent(&mut root, path)?;
        match entries.remove(&name) {
            Some(_) => Ok(()),
            None => Err(not_found(path)),
        }
    }
}

//
// Unit Tests
//

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;
    use shbox_protocol::{ErrorCode, VfsCode};

    use super::*;

    #[test]
    fn test_write_read() {
        let fs = MemFs::new();
        fs.write("hello.txt", b"hi").unwrap();
        assert_eq!(fs.read("hello.txt").unwrap(), b"hi");

        fs.write("hello.txt", b"rewritten").unwrap();
        assert_eq!(fs.read("hello.txt").unwrap(), b"rewritten");
    }

    #[test]
    fn test_mkdir_and_nesting() {
        let fs = MemFs::new();
        fs.mkdir("a").unwrap();
        fs.mkdir("a/b").unwrap();
        fs.write("a/b/f.txt", b"deep").unwrap();

        assert!(fs.stat("a/b").unwrap().is_dir());
        assert!(!fs.stat("a/b/f.txt").unwrap().is_dir());
        assert_eq!(fs.stat("a/b/f.txt").unwrap().size, 4);

        // parents are strict
        let err = fs.mkdir("missing/child").unwrap_err();
        assert_eq!(err.code, ErrorCode::Vfs(VfsCode::NotFound));
        let err = fs.write("missing/f.txt", b"x").unwrap_err();
        assert_eq!(err.code, ErrorCode::Vfs(VfsCode::NotFound));
    }

    #[test]
    fn test_mkdir_exists() {
        let fs = MemFs::new();
        fs.mkdir("a").unwrap();
        let err = fs.mkdir("a").unwrap_err();
        assert_eq!(err.code, ErrorCode::Vfs(VfsCode::Exists));
    }

    #[test]
    fn test_list_sorted() {
        let fs = MemFs::new();
        fs.mkdir("dir").unwrap();
        fs.write("b.txt", b"").unwrap();
        fs.write("a.txt", b"").unwrap();

        let names: Vec<(String, NodeKind)> =
            fs.list(".").unwrap().into_iter().map(|e| (e.name, e.kind)).collect();
        assert_eq!(
            names,
            vec![
                (String::from("a.txt"), NodeKind::File),
                (String::from("b.txt"), NodeKind::File),
                (String::from("dir"), NodeKind::Dir),
            ]
        );
    }

    #[test]
    fn test_delete() {
        let fs = MemFs::new();
        fs.mkdir("a").unwrap();
        fs.write("a/f.txt", b"x").unwrap();

        // recursive by construction: dropping the dir drops children
        fs.delete("a").unwrap();
        assert_matches!(fs.stat("a"), Err(_));

        let err = fs.delete("a").unwrap_err();
        assert_eq!(err.code, ErrorCode::Vfs(VfsCode::NotFound));
    }

    #[test]
    fn test_walk_through_file() {
        let fs = MemFs::new();
        fs.write("f.txt", b"x").unwrap();
        let err = fs.stat("f.txt/child").unwrap_err();
        assert_eq!(err.code, ErrorCode::Vfs(VfsCode::NotADirectory));
    }

    #[test]
    fn test_root_stat() {
        let fs = MemFs::new();
        assert!(fs.stat(".").unwrap().is_dir());
        assert_eq!(fs.list(".").unwrap(), vec![]);
    }
}
