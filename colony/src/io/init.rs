//! State directory layout and `colony init` scaffolding.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};

use super::config::{ColonyConfig, ProjectConfig, write_config};

/// All canonical paths for a project root.
#[derive(Debug, Clone)]
pub struct ColonyPaths {
    pub root: PathBuf,
    pub state_dir: PathBuf,
    pub tasks_dir: PathBuf,
    pub agents_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub progress_path: PathBuf,
    pub gitignore_path: PathBuf,
    pub config_path: PathBuf,
}

impl ColonyPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let state_dir = root.join(".colony");
        Self {
            root: root.clone(),
            state_dir: state_dir.clone(),
            tasks_dir: state_dir.join("tasks"),
            agents_dir: state_dir.join("agents"),
            logs_dir: state_dir.join("logs"),
            progress_path: state_dir.join("progress.md"),
            gitignore_path: state_dir.join(".gitignore"),
            config_path: root.join("colony.toml"),
        }
    }

    /// Create the state directories if missing. Never touches records.
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [&self.tasks_dir, &self.agents_dir, &self.logs_dir] {
            fs::create_dir_all(dir).with_context(|| format!("create directory {}", dir.display()))?;
        }
        Ok(())
    }
}

/// Options for `init_colony`.
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// Overwrite an existing `colony.toml`.
    pub force: bool,
    /// Goal to stamp into a fresh config.
    pub goal: Option<String>,
}

/// Create `.colony/` and a starter `colony.toml` in `root`.
///
/// Existing task and agent records are never touched, even with `force`.
pub fn init_colony(root: &Path, options: &InitOptions) -> Result<ColonyPaths> {
    let paths = ColonyPaths::new(root);
    if paths.config_path.exists() && !options.force {
        return Err(anyhow!(
            "colony init: {} already exists (use --force to overwrite)",
            paths.config_path.display()
        ));
    }

    paths.ensure_dirs()?;
    write_file(&paths.gitignore_path, STATE_GITIGNORE)?;
    if !paths.progress_path.exists() {
        write_file(&paths.progress_path, PROGRESS_HEADER)?;
    }

    let cfg = ColonyConfig {
        project: ProjectConfig {
            goal: options
                .goal
                .clone()
                .unwrap_or_else(|| GOAL_PLACEHOLDER.to_string()),
        },
        ..ColonyConfig::default()
    };
    write_config(&paths.config_path, &cfg)?;
    Ok(paths)
}

fn write_file(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents).with_context(|| format!("write file {}", path.display()))
}

pub(crate) const PROGRESS_HEADER: &str = "# Progress\n\n";
const GOAL_PLACEHOLDER: &str = "Describe the overall project goal here.";
const STATE_GITIGNORE: &str = "*.lock\nlogs/\n";
