//! Directory-backed workspace store
//!
//! Each workspace lives in `<root>/workspaces/<name>/` with its state in
//! `state.json` and, while locked, a `state.lock` file holding the lock info.
//! Lock files are created with `create_new`, so two processes racing for the
//! same lock cannot both win.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use async_trait::async_trait;
use log::{debug, info};

use drydock_state::plugin::protocol::ops;
use drydock_state::{
    BackendError, BackendPlugin, BackendResult, DEFAULT_WORKSPACE, LockInfo, StateFile,
    StatePayload,
};

const STATE_FILE: &str = "state.json";
const LOCK_FILE: &str = "state.lock";

/// Local directory plugin for development and simple use cases
pub struct FsPlugin {
    /// Root directory, set by `configure`
    root: OnceLock<PathBuf>,
}

impl FsPlugin {
    /// Default root directory when the `path` setting is absent
    pub const DEFAULT_ROOT: &'static str = ".drydock/state";

    pub fn new() -> Self {
        Self {
            root: OnceLock::new(),
        }
    }

    fn workspaces_dir(&self) -> BackendResult<PathBuf> {
        self.root
            .get()
            .map(|root| root.join("workspaces"))
            .ok_or_else(|| BackendError::configuration("plugin has not been configured"))
    }

    fn workspace_dir(&self, operation: &str, workspace: &str) -> BackendResult<PathBuf> {
        if !is_valid_name(workspace) {
            return Err(BackendError::protocol(
                operation,
                format!("invalid workspace name: {:?}", workspace),
            ));
        }
        Ok(self.workspaces_dir()?.join(workspace))
    }

    fn read_lock(&self, lock_path: &Path) -> std::io::Result<Option<LockInfo>> {
        match fs::read_to_string(lock_path) {
            Ok(content) => Ok(serde_json::from_str(&content).ok()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl Default for FsPlugin {
    fn default() -> Self {
        Self::new()
    }
}

fn is_valid_name(workspace: &str) -> bool {
    !workspace.is_empty()
        && workspace != "."
        && workspace != ".."
        && !workspace.contains(['/', '\\'])
}

#[async_trait]
impl BackendPlugin for FsPlugin {
    async fn list_workspaces(&self) -> BackendResult<Vec<String>> {
        let dir = self.workspaces_dir()?;
        let entries = fs::read_dir(&dir).map_err(|e| {
            BackendError::protocol(
                ops::LIST_WORKSPACES,
                format!("Failed to read {}: {}", dir.display(), e),
            )
        })?;

        let mut workspaces = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| {
                BackendError::protocol(ops::LIST_WORKSPACES, format!("Failed to list workspaces: {}", e))
            })?;
            if !entry.path().join(STATE_FILE).is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                workspaces.push(name.to_string());
            }
        }
        workspaces.sort();
        Ok(workspaces)
    }

    async fn delete_workspace(&self, workspace: &str, force: bool) -> BackendResult<()> {
        if workspace == DEFAULT_WORKSPACE {
            return Err(BackendError::protocol(
                ops::DELETE_WORKSPACE,
                "cannot delete the default workspace",
            ));
        }

        let dir = self.workspace_dir(ops::DELETE_WORKSPACE, workspace)?;
        let content = match fs::read(dir.join(STATE_FILE)) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(BackendError::protocol(
                    ops::DELETE_WORKSPACE,
                    format!("workspace {} does not exist", workspace),
                ));
            }
            Err(e) => {
                return Err(BackendError::state_io(
                    workspace,
                    ops::DELETE_WORKSPACE,
                    format!("Failed to read state file: {}", e),
                ));
            }
        };

        if dir.join(LOCK_FILE).exists() {
            return match self.read_lock(&dir.join(LOCK_FILE)) {
                Ok(Some(holder)) => Err(BackendError::locked(workspace, &holder)),
                _ => Err(BackendError::lock(workspace, "workspace is locked")),
            };
        }

        let empty = StateFile::from_bytes(&content)
            .map(|state| state.is_empty())
            .unwrap_or(false);
        if !empty && !force {
            return Err(BackendError::protocol(
                ops::DELETE_WORKSPACE,
                format!("workspace {} is not empty", workspace),
            ));
        }

        fs::remove_dir_all(&dir).map_err(|e| {
            BackendError::state_io(
                workspace,
                ops::DELETE_WORKSPACE,
                format!("Failed to remove workspace directory: {}", e),
            )
        })?;
        info!("deleted workspace {}", workspace);
        Ok(())
    }

    async fn configure(&self, config: &HashMap<String, String>) -> BackendResult<()> {
        let root = config
            .get("path")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(Self::DEFAULT_ROOT));

        fs::create_dir_all(root.join("workspaces")).map_err(|e| {
            BackendError::configuration(format!(
                "Failed to create state directory {}: {}",
                root.display(),
                e
            ))
        })?;

        if let Some(existing) = self.root.get() {
            if existing != &root {
                return Err(BackendError::configuration(format!(
                    "plugin is already configured with path {}",
                    existing.display()
                )));
            }
            return Ok(());
        }
        let _ = self.root.set(root.clone());

        info!("storing workspace state under {}", root.display());
        Ok(())
    }

    async fn get_state_payload(&self, workspace: &str) -> BackendResult<Option<StatePayload>> {
        let path = self
            .workspace_dir(ops::GET_STATE_PAYLOAD, workspace)?
            .join(STATE_FILE);

        match fs::read(&path) {
            Ok(data) => Ok(Some(StatePayload::new(data))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(BackendError::state_io(
                workspace,
                ops::GET_STATE_PAYLOAD,
                format!("Failed to read state file: {}", e),
            )),
        }
    }

    async fn put_state(&self, workspace: &str, data: &[u8]) -> BackendResult<()> {
        let dir = self.workspace_dir(ops::PUT_STATE, workspace)?;
        let io_err = |e: std::io::Error| {
            BackendError::state_io(
                workspace,
                ops::PUT_STATE,
                format!("Failed to write state file: {}", e),
            )
        };

        fs::create_dir_all(&dir).map_err(io_err)?;

        // Write then rename, so readers never see a half-written document.
        // Each writer gets its own temp file.
        let tmp = dir.join(format!("{}.{}.tmp", STATE_FILE, uuid::Uuid::new_v4()));
        fs::write(&tmp, data).map_err(io_err)?;
        if let Err(e) = fs::rename(&tmp, dir.join(STATE_FILE)) {
            let _ = fs::remove_file(&tmp);
            return Err(io_err(e));
        }

        debug!("wrote {} bytes of state for {}", data.len(), workspace);
        Ok(())
    }

    async fn delete_state(&self, workspace: &str) -> BackendResult<()> {
        let path = self
            .workspace_dir(ops::DELETE_STATE, workspace)?
            .join(STATE_FILE);

        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BackendError::state_io(
                workspace,
                ops::DELETE_STATE,
                format!("Failed to remove state file: {}", e),
            )),
        }
    }

    async fn lock_state(&self, workspace: &str, info: &LockInfo) -> BackendResult<String> {
        let dir = self.workspace_dir(ops::LOCK_STATE, workspace)?;
        fs::create_dir_all(&dir).map_err(|e| {
            BackendError::lock(workspace, format!("Failed to create workspace directory: {}", e))
        })?;

        let lock_path = dir.join(LOCK_FILE);
        let mut file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lock_path)
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return match self.read_lock(&lock_path) {
                    Ok(Some(holder)) => Err(BackendError::locked(workspace, &holder)),
                    _ => Err(BackendError::lock(workspace, "workspace is already locked")),
                };
            }
            Err(e) => {
                return Err(BackendError::lock(
                    workspace,
                    format!("Failed to create lock file: {}", e),
                ));
            }
        };

        let token = if info.id.is_empty() {
            uuid::Uuid::new_v4().to_string()
        } else {
            info.id.clone()
        };
        let mut held = info.clone();
        held.id = token.clone();

        let written = serde_json::to_vec_pretty(&held)
            .map_err(|e| e.to_string())
            .and_then(|content| file.write_all(&content).map_err(|e| e.to_string()));
        if let Err(e) = written {
            let _ = fs::remove_file(&lock_path);
            return Err(BackendError::lock(
                workspace,
                format!("Failed to write lock file: {}", e),
            ));
        }

        debug!("locked {} for {} ({})", workspace, held.who, held.operation);
        Ok(token)
    }

    async fn unlock_state(&self, workspace: &str, token: &str) -> BackendResult<()> {
        let lock_path = self
            .workspace_dir(ops::UNLOCK_STATE, workspace)?
            .join(LOCK_FILE);

        let held = match self.read_lock(&lock_path) {
            Ok(Some(held)) => held,
            Ok(None) if !lock_path.exists() => {
                return Err(BackendError::lock(workspace, "no lock is held"));
            }
            Ok(None) => {
                return Err(BackendError::lock(workspace, "lock file is unreadable"));
            }
            Err(e) => {
                return Err(BackendError::lock(
                    workspace,
                    format!("Failed to read lock file: {}", e),
                ));
            }
        };

        if held.id != token {
            return Err(BackendError::lock(
                workspace,
                format!("lock ID mismatch: held by {}, got {}", held.id, token),
            ));
        }

        fs::remove_file(&lock_path).map_err(|e| {
            BackendError::lock(workspace, format!("Failed to remove lock file: {}", e))
        })?;
        debug!("unlocked {}", workspace);
        Ok(())
    }
}
