//! Git adapter used to observe the target workspace.
//!
//! The controller never commits or switches branches on the agent's behalf;
//! it only reads repository state to compute the file footprint of an iteration.

use std::path::PathBuf;
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument};

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    /// Path for the changed file.
    pub path: String,
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    /// True if the workdir is the top level of a git work tree.
    ///
    /// A target nested inside someone else's repository is treated as a plain
    /// directory, since porcelain paths would be relative to the outer root.
    pub fn is_repo_root(&self) -> bool {
        match self.run(&["rev-parse", "--show-toplevel"]) {
            Ok(out) if out.status.success() => {
                let top = PathBuf::from(String::from_utf8_lossy(&out.stdout).trim());
                match (top.canonicalize(), self.workdir.canonicalize()) {
                    (Ok(top), Ok(workdir)) => top == workdir,
                    _ => false,
                }
            }
            _ => false,
        }
    }

    /// Full HEAD sha, or `None` for a repository without commits.
    pub fn head_sha(&self) -> Result<Option<String>> {
        let out = self.run(&["rev-parse", "--verify", "--quiet", "HEAD"])?;
        if !out.status.success() {
            return Ok(None);
        }
        Ok(Some(String::from_utf8_lossy(&out.stdout).trim().to_string()))
    }

    /// Get status entries (including untracked) in porcelain format.
    pub fn status_porcelain(&self) -> Result<Vec<StatusEntry>> {
        let out = self.run_capture(&["status", "--porcelain=v1", "-z", "-uall"])?;
        parse_status_z(&out)
    }

    /// Paths changed between two commits.
    #[instrument(skip_all, fields(from, to))]
    pub fn changed_between(&self, from: &str, to: &str) -> Result<Vec<String>> {
        let out = self.run_capture(&["diff", "--name-only", "-z", from, to])?;
        let paths = split_nul(&out);
        debug!(count = paths.len(), "paths changed between commits");
        Ok(paths)
    }

    /// Every path tracked at `rev`.
    pub fn tracked_at(&self, rev: &str) -> Result<Vec<String>> {
        let out = self.run_capture(&["ls-tree", "-r", "-z", "--name-only", rev])?;
        Ok(split_nul(&out))
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

/// Parse `git status --porcelain -z` output.
///
/// Paths are verbatim (no quoting or octal escapes). A rename or copy is
/// followed by an extra field holding the original path, which is skipped.
fn parse_status_z(out: &str) -> Result<Vec<StatusEntry>> {
    let mut entries = Vec::new();
    let mut fields = out.split('\0').filter(|field| !field.is_empty());
    while let Some(field) = fields.next() {
        let (Some(code), Some(path)) = (field.get(..2), field.get(3..)) else {
            return Err(anyhow!("unexpected porcelain entry: '{field}'"));
        };
        if code.starts_with(['R', 'C']) {
            fields.next();
        }
        entries.push(StatusEntry {
            code: code.to_string(),
            path: path.to_string(),
        });
    }
    Ok(entries)
}

fn split_nul(out: &str) -> Vec<String> {
    out.split('\0')
        .filter(|path| !path.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_untracked_and_modified_entries() {
        let entries = parse_status_z("?? foo.txt\0 M src/main.rs\0").expect("parse");
        assert_eq!(
            entries,
            vec![
                StatusEntry {
                    code: "??".to_string(),
                    path: "foo.txt".to_string()
                },
                StatusEntry {
                    code: " M".to_string(),
                    path: "src/main.rs".to_string()
                },
            ]
        );
    }

    #[test]
    fn rename_uses_new_path_and_skips_original() {
        let entries = parse_status_z("R  new.txt\0old.txt\0?? b.txt\0").expect("parse");
        let paths: Vec<&str> = entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["new.txt", "b.txt"]);
    }

    #[test]
    fn paths_are_taken_verbatim() {
        let entries = parse_status_z("?? with space.txt\0?? café.rs\0").expect("parse");
        assert_eq!(entries[0].path, "with space.txt");
        assert_eq!(entries[1].path, "café.rs");
    }

    #[test]
    fn truncated_entry_is_an_error() {
        assert!(parse_status_z("M\0").is_err());
    }

    #[test]
    fn status_reports_non_ascii_paths_unescaped() {
        let temp = tempfile::tempdir().expect("tempdir");
        let status = Command::new("git")
            .arg("init")
            .current_dir(temp.path())
            .output()
            .expect("git init");
        assert!(status.status.success());
        std::fs::write(temp.path().join("café.rs"), "fn main() {}\n").expect("write");

        let git = Git::new(temp.path());
        assert!(git.is_repo_root());
        let entries = git.status_porcelain().expect("status");
        assert_eq!(
            entries,
            vec![StatusEntry {
                code: "??".to_string(),
                path: "café.rs".to_string()
            }]
        );
    }

    #[test]
    fn plain_directory_is_not_a_repo_root() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert!(!Git::new(temp.path()).is_repo_root());
    }
}
