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

//! The session registry.
//!
//! A map from session ids to live session servers, plus the factory
//! that wires a new session to its workspace's VFS and the shared
//! command registry. Sessions are supervised in isolation: each one
//! runs its own worker threads, a crash inside one session is
//! contained by its monitor, and stopping one session never touches
//! its neighbors.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use shbox_protocol::{Error, ErrorCode, SessionCode};
use tracing::{info, instrument};

use crate::{
    backend::RegistryBackend,
    commands::Registry,
    hooks::Hooks,
    session::server::{SessionConfig, SessionServer},
    vfs::{MountTable, Vfs},
};

pub struct SessionRegistry {
    mounts: Arc<MountTable>,
    commands: Arc<Registry>,
    hooks: Arc<dyn Hooks + Send + Sync>,
    config: SessionConfig,
    sessions: Mutex<HashMap<String, SessionServer>>,
    counter: AtomicU64,
}

impl SessionRegistry {
    pub fn new(
        mounts: Arc<MountTable>,
        commands: Arc<Registry>,
        hooks: Arc<dyn Hooks + Send + Sync>,
        config: SessionConfig,
    ) -> Self {
        SessionRegistry {
            mounts,
            commands,
            hooks,
            config,
            sessions: Mutex::new(HashMap::new()),
            counter: AtomicU64::new(0),
        }
    }

    /// Create a fresh session against the given workspace with a
    /// generated id.
    #[instrument(skip_all, fields(ws = workspace))]
    pub fn create(&self, workspace: &str) -> SessionServer {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        self.create_with_id(workspace, &format!("sess-{n}"))
    }

    /// Create a fresh session with a caller-chosen id. If the id is
    /// already live, the existing session is returned instead, which
    /// is what lets clients re-attach by name.
    pub fn create_with_id(&self, workspace: &str, id: &str) -> SessionServer {
        let mut sessions = self.sessions.lock().unwrap();
        if let Some(existing) = sessions.get(id) {
            if !existing.is_stopped() {
                return existing.clone();
            }
        }

        info!("creating session {} in workspace {}", id, workspace);
        let backend = Arc::new(RegistryBackend::new(
            Arc::clone(&self.commands),
            Vfs::new(Arc::clone(&self.mounts), workspace),
        ));
        let server = SessionServer::new(
            id,
            workspace,
            backend,
            Arc::clone(&self.hooks),
            self.config.clone(),
        );
        sessions.insert(String::from(id), server.clone());
        drop(sessions);

        if let Err(e) = self.hooks.on_session_created(id) {
            tracing::warn!("hook error: {:?}", e);
        }
        server
    }

    /// Look a live session up by id.
    pub fn get(&self, id: &str) -> Result<SessionServer, Error> {
        let mut sessions = self.sessions.lock().unwrap();
        match sessions.get(id) {
            Some(server) if !server.is_stopped() => Ok(server.clone()),
            Some(_) => {
                // reap sessions that stopped behind our back
                sessions.remove(id);
                Err(not_found(id))
            }
            None => Err(not_found(id)),
        }
    }

    /// Stop a session and deregister it.
    pub fn remove(&self, id: &str) -> Result<(), Error> {
        let server = {
            let mut sessions = self.sessions.lock().unwrap();
            sessions.remove(id).ok_or_else(|| not_found(id))?
        };
        server.stop();
        Ok(())
    }

    pub fn list(&self) -> Vec<SessionServer> {
        let sessions = self.sessions.lock().unwrap();
        sessions.values().cloned().collect()
    }

    /// Stop every session and tear down the mounts of every
    /// workspace they were using. Owned adapter processes stop
    /// exactly once, courtesy of the mount table.
    #[instrument(skip_all)]
    pub fn stop_all(&self) {
        let drained: Vec<SessionServer> = {
            let mut sessions = self.sessions.lock().unwrap();
            sessions.drain().map(|(_, s)| s).collect()
        };
        let mut workspaces: HashSet<String> = HashSet::new();
        for server in drained.into_iter() {
            workspaces.insert(String::from(server.workspace_id()));
            server.stop();
        }
        for workspace in workspaces.into_iter() {
            self.mounts.unmount_workspace(&workspace, false);
        }
    }
}

fn not_found(id: &str) -> Error {
    Error::new(ErrorCode::Session(SessionCode::NotFound), format!("no such session: {id}"))
        .with("session_id", id)
}

//
// Unit Tests
//
