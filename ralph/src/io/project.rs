//! ralph home layout and the project registry.
//!
//! All state lives under `<home>/projects/<name>/`, outside every target
//! workspace:
//!
//! ```text
//! <home>/config.toml
//! <home>/projects/<name>/project.toml
//!                       /manifest.json
//!                       /progress.txt
//!                       /failures.jsonl
//!                       /run_state.json
//!                       /iterations/<n>/{transcript.md,verify.log,meta.json}
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::io::atomic::write_atomic;
use crate::io::ledger::ledger_preamble;
use crate::io::lock;
use crate::io::manifest_store::{load_manifest, write_manifest};
use crate::io::run_state::{RunState, write_run_state};
use crate::manifest::{Manifest, default_manifest};

/// Root of all ralph state.
#[derive(Debug, Clone)]
pub struct RalphHome {
    pub root: PathBuf,
}

impl RalphHome {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `explicit` (from `--home` / `RALPH_HOME`) or `~/.ralph`.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        if let Some(root) = explicit {
            return Ok(Self::new(root));
        }
        let dirs = directories::BaseDirs::new()
            .ok_or_else(|| anyhow!("cannot determine home directory (set RALPH_HOME)"))?;
        Ok(Self::new(dirs.home_dir().join(".ralph")))
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join("config.toml")
    }

    pub fn projects_dir(&self) -> PathBuf {
        self.root.join("projects")
    }

    pub fn project(&self, name: &str) -> Result<ProjectPaths> {
        validate_project_name(name)?;
        Ok(ProjectPaths::new(self.projects_dir().join(name), name))
    }
}

/// All canonical paths of one project's state directory.
#[derive(Debug, Clone)]
pub struct ProjectPaths {
    pub name: String,
    pub dir: PathBuf,
    pub project_file: PathBuf,
    pub manifest_path: PathBuf,
    pub progress_path: PathBuf,
    pub failures_path: PathBuf,
    pub run_state_path: PathBuf,
    pub lock_path: PathBuf,
    pub stop_path: PathBuf,
    pub iterations_dir: PathBuf,
}

impl ProjectPaths {
    pub fn new(dir: impl Into<PathBuf>, name: &str) -> Self {
        let dir = dir.into();
        Self {
            name: name.to_string(),
            project_file: dir.join("project.toml"),
            manifest_path: dir.join("manifest.json"),
            progress_path: dir.join("progress.txt"),
            failures_path: dir.join("failures.jsonl"),
            run_state_path: dir.join("run_state.json"),
            lock_path: dir.join("run.lock"),
            stop_path: dir.join("STOP"),
            iterations_dir: dir.join("iterations"),
            dir,
        }
    }

    pub fn exists(&self) -> bool {
        self.project_file.is_file()
    }

    /// Files the agent must never write.
    pub fn protected_paths(&self) -> Vec<PathBuf> {
        vec![
            self.manifest_path.clone(),
            self.progress_path.clone(),
            self.failures_path.clone(),
        ]
    }

    pub fn load_info(&self) -> Result<ProjectInfo> {
        if !self.exists() {
            return Err(anyhow!("unknown project '{}' (run `ralph init`)", self.name));
        }
        let contents = fs::read_to_string(&self.project_file)
            .with_context(|| format!("read {}", self.project_file.display()))?;
        toml::from_str(&contents).with_context(|| format!("parse {}", self.project_file.display()))
    }
}

/// Contents of `project.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectInfo {
    pub name: String,
    /// Absolute path of the target code workspace.
    pub target: PathBuf,
    pub created: String,
}

pub fn validate_project_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if !valid {
        return Err(anyhow!(
            "invalid project name '{name}' (use letters, digits, '-', '_' or '.')"
        ));
    }
    Ok(())
}

/// Options for `init_project`.
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// Manifest file to import instead of the starter template.
    pub manifest: Option<PathBuf>,
    /// If true, overwrite an existing project's state.
    pub force: bool,
    pub now: String,
}

/// Create a project state directory for `target`.
#[instrument(skip_all, fields(name, target = %target.display()))]
pub fn init_project(home: &RalphHome, name: &str, target: &Path, options: &InitOptions) -> Result<ProjectPaths> {
    let paths = home.project(name)?;
    if paths.dir.exists() && !options.force {
        return Err(anyhow!(
            "project '{name}' already exists (use --force to overwrite)"
        ));
    }
    let target = target
        .canonicalize()
        .with_context(|| format!("resolve target {}", target.display()))?;
    if !target.is_dir() {
        return Err(anyhow!("target {} is not a directory", target.display()));
    }
    fs::create_dir_all(&paths.dir)
        .with_context(|| format!("create directory {}", paths.dir.display()))?;
    let state_dir = paths
        .dir
        .canonicalize()
        .with_context(|| format!("resolve {}", paths.dir.display()))?;
    if state_dir.starts_with(&target) {
        return Err(anyhow!(
            "ralph home {} must live outside the target workspace {}",
            home.root.display(),
            target.display()
        ));
    }

    let mut manifest = match &options.manifest {
        Some(source) => load_manifest(source)?,
        None => default_manifest(name),
    };
    if manifest.created.is_none() {
        manifest.created = Some(options.now.clone());
    }
    write_manifest(&paths.manifest_path, &manifest)?;

    let info = ProjectInfo {
        name: name.to_string(),
        target,
        created: options.now.clone(),
    };
    let mut buf = toml::to_string_pretty(&info).context("serialize project.toml")?;
    buf.push('\n');
    write_atomic(&paths.project_file, buf.as_bytes())?;
    write_atomic(&paths.progress_path, ledger_preamble(name).as_bytes())?;
    write_atomic(&paths.failures_path, b"")?;
    write_run_state(&paths.run_state_path, &RunState::default())?;
    fs::create_dir_all(&paths.iterations_dir)
        .with_context(|| format!("create directory {}", paths.iterations_dir.display()))?;
    if paths.stop_path.exists() {
        fs::remove_file(&paths.stop_path)
            .with_context(|| format!("remove {}", paths.stop_path.display()))?;
    }

    info!(project = name, "project initialized");
    Ok(paths)
}

/// One row of `ralph list`.
#[derive(Debug, Clone)]
pub struct ProjectListing {
    pub info: ProjectInfo,
    /// `(done, total)`, or the load error.
    pub progress: Result<(usize, usize), String>,
}

/// Every project under the home, sorted by name.
pub fn list_projects(home: &RalphHome) -> Result<Vec<ProjectListing>> {
    let dir = home.projects_dir();
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut names = Vec::new();
    for entry in fs::read_dir(&dir).with_context(|| format!("read {}", dir.display()))? {
        let entry = entry.with_context(|| format!("read entry in {}", dir.display()))?;
        if let Some(name) = entry.file_name().to_str()
            && validate_project_name(name).is_ok()
        {
            names.push(name.to_string());
        }
    }
    names.sort();

    let mut listings = Vec::new();
    for name in names {
        let paths = home.project(&name)?;
        if !paths.exists() {
            debug!(name, "skipping directory without project.toml");
            continue;
        }
        let info = paths.load_info()?;
        let progress = load_manifest(&paths.manifest_path)
            .map(|manifest: Manifest| (manifest.done_count(), manifest.tasks.len()))
            .map_err(|err| format!("{err:#}"));
        listings.push(ProjectListing { info, progress });
    }
    Ok(listings)
}

/// Remove a project's state. The target workspace is never touched.
pub fn delete_project(home: &RalphHome, name: &str) -> Result<()> {
    let paths = home.project(name)?;
    if !paths.exists() {
        return Err(anyhow!("unknown project '{name}'"));
    }
    if !lock::clear_if_stale(&paths.lock_path)? {
        return Err(anyhow!(
            "project '{name}' is running (stop it first with `ralph stop {name}`)"
        ));
    }
    fs::remove_dir_all(&paths.dir).with_context(|| format!("remove {}", paths.dir.display()))?;
    info!(project = name, "project deleted");
    Ok(())
}

/// Ask a running loop to halt at its next poll.
pub fn request_stop(home: &RalphHome, name: &str) -> Result<PathBuf> {
    let paths = home.project(name)?;
    if !paths.exists() {
        return Err(anyhow!("unknown project '{name}'"));
    }
    write_atomic(&paths.stop_path, b"stop requested\n")?;
    Ok(paths.stop_path)
}
