//! Append-only failure log (`failures.jsonl`).
//!
//! Each upsert appends a new version of a record; readers collapse the log to
//! the latest version per issue.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::core::types::FailureRecord;
use crate::io::atomic::write_atomic;

/// Append one record version.
pub fn append_record(path: &Path, record: &FailureRecord) -> Result<()> {
    let mut contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(err) => {
            return Err(err).with_context(|| format!("read failure log {}", path.display()));
        }
    };
    if !contents.is_empty() && !contents.ends_with('\n') {
        contents.push('\n');
    }
    let line = serde_json::to_string(record).context("serialize failure record")?;
    contents.push_str(&line);
    contents.push('\n');
    write_atomic(path, contents.as_bytes())?;
    debug!(issue = %record.issue, occurrences = record.occurrences, "failure record appended");
    Ok(())
}

/// Every record version in append order. Unparseable lines are skipped.
pub fn read_log(path: &Path) -> Result<Vec<FailureRecord>> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => {
            return Err(err).with_context(|| format!("read failure log {}", path.display()));
        }
    };
    let mut records = Vec::new();
    for (idx, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<FailureRecord>(line) {
            Ok(record) => records.push(record),
            Err(err) => warn!(line = idx + 1, err = %err, "skipping malformed failure record"),
        }
    }
    Ok(records)
}

/// Latest version of each issue, in order of first appearance.
pub fn latest_records(path: &Path) -> Result<Vec<FailureRecord>> {
    Ok(collapse(read_log(path)?))
}

pub fn collapse(versions: Vec<FailureRecord>) -> Vec<FailureRecord> {
    let mut latest: Vec<FailureRecord> = Vec::new();
    for record in versions {
        match latest.iter_mut().find(|existing| existing.issue == record.issue) {
            Some(existing) => *existing = record,
            None => latest.push(record),
        }
    }
    latest
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::failure_tracker::record_occurrence;

    #[test]
    fn latest_version_wins_per_issue() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("failures.jsonl");

        let a1 = record_occurrence(None, "scope-creep", 1, "12 files");
        let b1 = record_occurrence(None, "verification-failed:1.1:test", 2, "exit 1");
        let a2 = record_occurrence(Some(&a1), "scope-creep", 3, "15 files");
        for record in [&a1, &b1, &a2] {
            append_record(&path, record).expect("append");
        }

        assert_eq!(read_log(&path).expect("log").len(), 3);
        let latest = latest_records(&path).expect("latest");
        assert_eq!(latest, vec![a2, b1]);
    }

    #[test]
    fn skips_garbage_lines() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("failures.jsonl");
        fs::write(&path, "not json\n").expect("write");
        let record = record_occurrence(None, "scope-creep", 1, "x");
        append_record(&path, &record).expect("append");
        assert_eq!(read_log(&path).expect("log"), vec![record]);
    }
}
