//! Project configuration and workspace selection

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use drydock_state::{BackendConfig, DEFAULT_WORKSPACE};

pub const DEFAULT_CONFIG_FILE: &str = "drydock.json";

/// Environment variable that overrides the selected workspace
pub const WORKSPACE_ENV: &str = "DRYDOCK_WORKSPACE";

const ENVIRONMENT_FILE: &str = ".drydock/environment";

/// Contents of `drydock.json`
#[derive(Debug, Deserialize)]
pub struct ProjectConfig {
    pub backend: BackendConfig,
}

impl ProjectConfig {
    pub fn load(path: &Path) -> Result<Self, String> {
        let content = fs::read_to_string(path)
            .map_err(|e| format!("Failed to read {}: {}", path.display(), e))?;
        let config: ProjectConfig = serde_json::from_str(&content)
            .map_err(|e| format!("Failed to parse {}: {}", path.display(), e))?;
        config
            .backend
            .validate()
            .map_err(|e| format!("{}: {}", path.display(), e))?;
        Ok(config)
    }
}

/// The file recording which workspace is selected for a project
pub struct WorkspaceFile {
    path: PathBuf,
}

impl WorkspaceFile {
    /// Selection file for the project whose config lives at `config_path`
    pub fn for_config(config_path: &Path) -> Self {
        let project_dir = match config_path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        Self {
            path: project_dir.join(ENVIRONMENT_FILE),
        }
    }

    pub fn read(&self) -> Result<Option<String>, String> {
        match fs::read_to_string(&self.path) {
            Ok(content) => {
                let name = content.trim();
                Ok((!name.is_empty()).then(|| name.to_string()))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(format!("Failed to read {}: {}", self.path.display(), e)),
        }
    }

    pub fn write(&self, workspace: &str) -> Result<(), String> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)
                .map_err(|e| format!("Failed to create {}: {}", dir.display(), e))?;
        }
        fs::write(&self.path, format!("{}\n", workspace))
            .map_err(|e| format!("Failed to write {}: {}", self.path.display(), e))
    }
}

/// Workspace named by `DRYDOCK_WORKSPACE`, if set
fn env_override() -> Option<String> {
    std::env::var(WORKSPACE_ENV)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Resolve the current workspace: override, then selection file, then default
fn current_workspace(
    override_name: Option<String>,
    file: &WorkspaceFile,
) -> Result<String, String> {
    if let Some(name) = override_name {
        return Ok(name);
    }
    Ok(file
        .read()?
        .unwrap_or_else(|| DEFAULT_WORKSPACE.to_string()))
}

/// The current workspace and where a new selection is recorded
pub struct Selection {
    file: WorkspaceFile,
    override_name: Option<String>,
}

impl Selection {
    pub fn new(file: WorkspaceFile, override_name: Option<String>) -> Self {
        Self {
            file,
            override_name,
        }
    }

    /// Selection for this process, honoring `DRYDOCK_WORKSPACE`
    pub fn from_env(file: WorkspaceFile) -> Self {
        Self::new(file, env_override())
    }

    pub fn current(&self) -> Result<String, String> {
        current_workspace(self.override_name.clone(), &self.file)
    }

    pub fn is_overridden(&self) -> bool {
        self.override_name.is_some()
    }

    /// Record `workspace` as the selected one
    pub fn select(&self, workspace: &str) -> Result<(), String> {
        self.file.write(workspace)
    }
}
