//! Before/after snapshots of the target workspace.
//!
//! Inside a git repository only dirty paths and HEAD are recorded; elsewhere
//! every file is hashed. Either way `files_touched` reports workspace-relative
//! paths whose content changed across the agent call.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use tracing::{debug, instrument};

use crate::io::git::Git;

/// Directories never walked when hashing a plain workspace.
const SKIPPED_DIRS: &[&str] = &[".git", "target", "node_modules"];

const DELETED: &str = "<deleted>";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Mode {
    Git { head: Option<String> },
    Hashed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Footprint {
    mode: Mode,
    /// Relative path to content hash.
    files: BTreeMap<String, String>,
}

impl Footprint {
    fn empty() -> Self {
        Self {
            mode: Mode::Hashed,
            files: BTreeMap::new(),
        }
    }
}

/// Snapshot `workdir`. A missing directory yields an empty footprint.
#[instrument(skip_all, fields(workdir = %workdir.display()))]
pub fn snapshot(workdir: &Path) -> Result<Footprint> {
    if !workdir.is_dir() {
        debug!("workspace missing, empty footprint");
        return Ok(Footprint::empty());
    }
    let git = Git::new(workdir);
    if git.is_repo_root() {
        let head = git.head_sha()?;
        let mut files = BTreeMap::new();
        for entry in git.status_porcelain()? {
            let hash = hash_file(&workdir.join(&entry.path))?;
            files.insert(entry.path, hash);
        }
        return Ok(Footprint {
            mode: Mode::Git { head },
            files,
        });
    }

    let mut files = BTreeMap::new();
    walk(workdir, workdir, &mut files)?;
    Ok(Footprint {
        mode: Mode::Hashed,
        files,
    })
}

/// Sorted relative paths that differ between two snapshots of `workdir`.
pub fn files_touched(workdir: &Path, before: &Footprint, after: &Footprint) -> Result<Vec<String>> {
    let mut touched: BTreeSet<String> = BTreeSet::new();

    let keys: BTreeSet<&String> = before.files.keys().chain(after.files.keys()).collect();
    for key in keys {
        if before.files.get(key) != after.files.get(key) {
            touched.insert(key.clone());
        }
    }

    // Commits made by the agent clean the status, so diff HEADs as well.
    if let (Mode::Git { head: before_head }, Mode::Git { head: after_head }) =
        (&before.mode, &after.mode)
    {
        let git = Git::new(workdir);
        match (before_head, after_head) {
            (Some(from), Some(to)) if from != to => {
                touched.extend(git.changed_between(from, to)?);
            }
            (None, Some(to)) => touched.extend(git.tracked_at(to)?),
            _ => {}
        }
    }

    Ok(touched.into_iter().collect())
}

fn walk(root: &Path, dir: &Path, files: &mut BTreeMap<String, String>) -> Result<()> {
    let entries = fs::read_dir(dir).with_context(|| format!("read dir {}", dir.display()))?;
    for entry in entries {
        let entry = entry.with_context(|| format!("read entry in {}", dir.display()))?;
        let path = entry.path();
        let file_type = entry
            .file_type()
            .with_context(|| format!("file type {}", path.display()))?;
        if file_type.is_dir() {
            let name = entry.file_name();
            if SKIPPED_DIRS.iter().any(|skip| name == *skip) {
                continue;
            }
            walk(root, &path, files)?;
        } else if file_type.is_file() {
            let rel = path
                .strip_prefix(root)
                .with_context(|| format!("relativize {}", path.display()))?;
            let rel = rel.to_string_lossy().replace('\\', "/");
            files.insert(rel, hash_file(&path)?);
        }
    }
    Ok(())
}

fn hash_file(path: &Path) -> Result<String> {
    if path.is_dir() {
        return Ok("<dir>".to_string());
    }
    match fs::read(path) {
        Ok(bytes) => Ok(hex::encode(Sha256::digest(&bytes))),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(DELETED.to_string()),
        Err(err) => Err(err).with_context(|| format!("read {}", path.display())),
    }
}
