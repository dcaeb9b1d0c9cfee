mod config;

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use colored::Colorize;
use log::debug;

use drydock_state::{Backend, PluginBackend};

use config::{DEFAULT_CONFIG_FILE, ProjectConfig, Selection, WORKSPACE_ENV, WorkspaceFile};

#[derive(Parser)]
#[command(name = "drydock")]
#[command(about = "Workspace state management backed by storage plugins", long_about = None)]
struct Cli {
    /// Path to the project configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Workspace management commands
    Workspace {
        #[command(subcommand)]
        command: WorkspaceCommands,
    },
    /// State inspection commands
    State {
        #[command(subcommand)]
        command: StateCommands,
    },
    /// Release a stuck lock on the current workspace
    ForceUnlock {
        /// Lock ID reported by the failed operation
        token: String,
    },
}

#[derive(Subcommand)]
enum WorkspaceCommands {
    /// List workspaces, marking the current one
    List,
    /// Show the current workspace
    Show,
    /// Create a workspace and switch to it
    New {
        name: String,
    },
    /// Switch to an existing workspace
    Select {
        name: String,
    },
    /// Delete a workspace
    Delete {
        name: String,

        /// Delete even if the workspace still tracks resources
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand)]
enum StateCommands {
    /// Print the raw state document of the current workspace
    Pull,
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();
    let selection = Selection::from_env(WorkspaceFile::for_config(&cli.config));

    let result = match cli.command {
        Commands::Workspace { command } => match command {
            WorkspaceCommands::Show => run_workspace_show(&selection),
            command => run_workspace_command(&cli.config, &selection, command).await,
        },
        Commands::State {
            command: StateCommands::Pull,
        } => run_state_pull(&cli.config, &selection).await,
        Commands::ForceUnlock { token } => run_force_unlock(&cli.config, &selection, &token).await,
    };

    if let Err(e) = result {
        eprintln!("{} {}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}

async fn open_backend(config_path: &Path) -> Result<PluginBackend, String> {
    let config = ProjectConfig::load(config_path)?;
    debug!("starting backend plugin {}", config.backend.source);
    PluginBackend::configure(config.backend)
        .await
        .map_err(|e| e.to_string())
}

/// Stop the plugin, keeping the command's own error if there was one
async fn finish(backend: PluginBackend, result: Result<(), String>) -> Result<(), String> {
    let closed = backend.close().await.map_err(|e| e.to_string());
    result.and(closed)
}

fn run_workspace_show(selection: &Selection) -> Result<(), String> {
    println!("{}", selection.current()?);
    Ok(())
}

async fn run_workspace_command(
    config_path: &Path,
    selection: &Selection,
    command: WorkspaceCommands,
) -> Result<(), String> {
    let backend = open_backend(config_path).await?;
    let result = match command {
        WorkspaceCommands::List => run_workspace_list(&backend, selection).await,
        WorkspaceCommands::New { name } => run_workspace_new(&backend, selection, &name).await,
        WorkspaceCommands::Select { name } => {
            run_workspace_select(&backend, selection, &name).await
        }
        WorkspaceCommands::Delete { name, force } => {
            run_workspace_delete(&backend, selection, &name, force).await
        }
        WorkspaceCommands::Show => run_workspace_show(selection),
    };
    finish(backend, result).await
}

async fn run_workspace_list(backend: &PluginBackend, selection: &Selection) -> Result<(), String> {
    print!("{}", workspace_listing(backend, selection).await?);
    Ok(())
}

/// The full `workspace list` output; nothing is produced if listing fails
async fn workspace_listing(backend: &PluginBackend, selection: &Selection) -> Result<String, String> {
    let current = selection.current()?;
    let workspaces = backend.workspaces().await.map_err(|e| e.to_string())?;

    let mut output = format_workspace_list(&workspaces, &current);
    if selection.is_overridden() {
        output.push('\n');
        output.push_str(&format!(
            "{}\n",
            format!(
                "The active workspace is being overridden using the {} environment variable.",
                WORKSPACE_ENV
            )
            .yellow()
        ));
    }
    Ok(output)
}

fn format_workspace_list(workspaces: &[String], current: &str) -> String {
    workspaces
        .iter()
        .map(|name| {
            if name == current {
                format!("* {}\n", name)
            } else {
                format!("  {}\n", name)
            }
        })
        .collect()
}

async fn run_workspace_new(
    backend: &PluginBackend,
    selection: &Selection,
    name: &str,
) -> Result<(), String> {
    if name.trim().is_empty() {
        return Err("Workspace name must not be empty".to_string());
    }

    let workspaces = backend.workspaces().await.map_err(|e| e.to_string())?;
    if workspaces.iter().any(|w| w == name) {
        return Err(format!("Workspace \"{}\" already exists", name));
    }

    backend.state_mgr(name).await.map_err(|e| e.to_string())?;
    selection.select(name)?;

    println!(
        "{}",
        format!("Created and switched to workspace \"{}\"!", name).green()
    );
    warn_if_overridden(selection);
    Ok(())
}

async fn run_workspace_select(
    backend: &PluginBackend,
    selection: &Selection,
    name: &str,
) -> Result<(), String> {
    let workspaces = backend.workspaces().await.map_err(|e| e.to_string())?;
    if !workspaces.iter().any(|w| w == name) {
        return Err(format!(
            "Workspace \"{}\" doesn't exist. Use \"drydock workspace new\" to create it.",
            name
        ));
    }

    selection.select(name)?;
    println!("{}", format!("Switched to workspace \"{}\".", name).green());
    warn_if_overridden(selection);
    Ok(())
}

async fn run_workspace_delete(
    backend: &PluginBackend,
    selection: &Selection,
    name: &str,
    force: bool,
) -> Result<(), String> {
    if selection.current()? == name {
        return Err(format!(
            "Workspace \"{}\" is your active workspace. Select another workspace before deleting it.",
            name
        ));
    }

    backend
        .delete_workspace(name, force)
        .await
        .map_err(|e| e.to_string())?;
    println!("{}", format!("Deleted workspace \"{}\"!", name).green());
    Ok(())
}

async fn run_state_pull(config_path: &Path, selection: &Selection) -> Result<(), String> {
    let workspace = selection.current()?;
    let backend = open_backend(config_path).await?;

    let result = async {
        let mut state = backend
            .state_mgr(&workspace)
            .await
            .map_err(|e| e.to_string())?;
        state.refresh_state().await.map_err(|e| e.to_string())?;
        if let Some(data) = state.state() {
            println!("{}", String::from_utf8_lossy(data).trim_end());
        }
        Ok::<(), String>(())
    }
    .await;

    finish(backend, result).await
}

async fn run_force_unlock(
    config_path: &Path,
    selection: &Selection,
    token: &str,
) -> Result<(), String> {
    let workspace = selection.current()?;
    let backend = open_backend(config_path).await?;
    let result = unlock_workspace(&backend, &workspace, token).await;
    finish(backend, result).await
}

/// Release a lock without going through workspace creation, so a lock left
/// behind by an interrupted `workspace new` can be cleared too
async fn unlock_workspace(backend: &PluginBackend, workspace: &str, token: &str) -> Result<(), String> {
    backend
        .state_handle(workspace)
        .unlock(token)
        .await
        .map_err(|e| e.to_string())?;
    println!(
        "{}",
        format!("Workspace \"{}\" has been unlocked.", workspace).green()
    );
    Ok(())
}

fn warn_if_overridden(selection: &Selection) {
    if selection.is_overridden() {
        println!(
            "{}",
            format!(
                "Note: {} is set and takes precedence over the selected workspace.",
                WORKSPACE_ENV
            )
            .yellow()
        );
    }
}
