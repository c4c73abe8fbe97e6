//! Append-only progress ledger (`progress.txt`).
//!
//! One markdown section per iteration. The text is meant for humans; the only
//! reader in the crate is the failure tracker, which scans it back
//! heuristically and skips sections it cannot make sense of.

use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::Regex;
use tracing::{debug, instrument, warn};

use crate::core::types::{LoopKind, Outcome, ProgressEntry, Signal};
use crate::io::atomic::write_atomic;

/// Task ids are written in backticks so ids with spaces survive the scan.
/// Bare ids are still accepted for older ledgers.
static HEADER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^## Iteration (\d+) \| task (?:`([^`\r\n]+)`|(\S+)) \| (\S+)[ \t]*$")
        .expect("ledger header pattern should be valid")
});

/// First lines of a fresh ledger.
pub fn ledger_preamble(project: &str) -> String {
    format!("# Progress ledger: {project}\n\nOne section per iteration, appended by ralph.\n\n")
}

/// Render one entry as a ledger section.
pub fn render_entry(entry: &ProgressEntry) -> String {
    let mut out = format!(
        "## Iteration {} | task `{}` | {}\n",
        entry.iteration, entry.task_id, entry.timestamp
    );
    out.push_str(&format!("- loop: {}\n", entry.loop_kind.as_str()));
    out.push_str(&format!("- outcome: {}\n", entry.outcome.as_str()));
    out.push_str(&format!("- signal: {}\n", entry.signal.as_str()));
    out.push_str(&format!("- files: {}\n", entry.files_touched.join(", ")));
    let criteria: Vec<String> = entry
        .criteria_satisfied
        .iter()
        .map(ToString::to_string)
        .collect();
    out.push_str(&format!("- criteria: {}\n", criteria.join(", ")));
    if let Some(command) = &entry.failed_command {
        out.push_str(&format!("- failed_command: {command}\n"));
    }
    out.push_str("- learnings:\n");
    for line in entry.learnings.lines() {
        out.push_str("  ");
        out.push_str(line);
        out.push('\n');
    }
    out.push('\n');
    out
}

/// Append one section. The whole file is rewritten through a temp file so a
/// crash never leaves half a section behind.
#[instrument(skip_all, fields(path = %path.display(), iteration = entry.iteration))]
pub fn append_entry(path: &Path, entry: &ProgressEntry) -> Result<()> {
    let mut contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(err) => return Err(err).with_context(|| format!("read ledger {}", path.display())),
    };
    if !contents.is_empty() && !contents.ends_with('\n') {
        contents.push('\n');
    }
    contents.push_str(&render_entry(entry));
    write_atomic(path, contents.as_bytes())?;
    debug!(outcome = entry.outcome.as_str(), "ledger entry appended");
    Ok(())
}

/// Read every parseable entry, oldest first. A missing ledger is empty.
pub fn read_entries(path: &Path) -> Result<Vec<ProgressEntry>> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(parse_ledger(&text)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(err) => Err(err).with_context(|| format!("read ledger {}", path.display())),
    }
}

/// Number of iteration sections, parseable or not.
pub fn entry_count(path: &Path) -> Result<usize> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(HEADER_RE.find_iter(&text).count()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(err) => Err(err).with_context(|| format!("read ledger {}", path.display())),
    }
}

/// Heuristic scan of ledger text back into entries.
pub fn parse_ledger(text: &str) -> Vec<ProgressEntry> {
    let headers: Vec<_> = HEADER_RE.captures_iter(text).collect();
    let mut entries = Vec::with_capacity(headers.len());

    for (i, caps) in headers.iter().enumerate() {
        let Some(whole) = caps.get(0) else { continue };
        let body_end = headers
            .get(i + 1)
            .and_then(|next| next.get(0))
            .map_or(text.len(), |m| m.start());
        let body = &text[whole.end()..body_end];

        let Ok(iteration) = caps[1].parse::<u32>() else {
            warn!(header = whole.as_str(), "unparseable ledger iteration");
            continue;
        };
        let Some(task_id) = caps.get(2).or_else(|| caps.get(3)) else {
            continue;
        };
        match parse_body(iteration, task_id.as_str(), &caps[4], body) {
            Some(entry) => entries.push(entry),
            None => warn!(iteration, "skipping unparseable ledger section"),
        }
    }

    entries
}

fn parse_body(iteration: u32, task_id: &str, timestamp: &str, body: &str) -> Option<ProgressEntry> {
    let mut loop_kind = LoopKind::Default;
    let mut outcome = None;
    let mut signal = Signal::Continue;
    let mut files_touched = Vec::new();
    let mut criteria_satisfied = Vec::new();
    let mut failed_command = None;
    let mut learnings = Vec::new();
    let mut in_learnings = false;

    for line in body.lines() {
        if in_learnings {
            if let Some(text) = line.strip_prefix("  ") {
                learnings.push(text.to_string());
                continue;
            }
            in_learnings = false;
        }
        let Some(field) = line.strip_prefix("- ") else {
            continue;
        };
        let (key, value) = field.split_once(':').unwrap_or((field, ""));
        let value = value.trim();
        match key {
            "loop" => loop_kind = parse_loop_kind(value).unwrap_or(LoopKind::Default),
            "outcome" => outcome = value.parse::<Outcome>().ok(),
            "signal" => {
                signal = match value {
                    "complete" => Signal::Complete,
                    "gutter" => Signal::Gutter,
                    _ => Signal::Continue,
                }
            }
            "files" => files_touched = split_list(value),
            "criteria" => {
                criteria_satisfied = split_list(value)
                    .iter()
                    .filter_map(|idx| idx.parse::<usize>().ok())
                    .collect();
            }
            "failed_command" if !value.is_empty() => failed_command = Some(value.to_string()),
            "learnings" => in_learnings = true,
            _ => {}
        }
    }

    Some(ProgressEntry {
        iteration,
        task_id: task_id.to_string(),
        timestamp: timestamp.to_string(),
        loop_kind,
        outcome: outcome?,
        signal,
        files_touched,
        criteria_satisfied,
        failed_command,
        learnings: learnings.join("\n"),
    })
}

fn parse_loop_kind(value: &str) -> Option<LoopKind> {
    [
        LoopKind::Default,
        LoopKind::TestCoverage,
        LoopKind::Linting,
        LoopKind::Duplication,
        LoopKind::Entropy,
    ]
    .into_iter()
    .find(|kind| kind.as_str() == value)
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::progress_entry;

    fn sample(iteration: u32) -> ProgressEntry {
        let mut entry = progress_entry(iteration, "1.2", Outcome::VerificationFailed);
        entry.files_touched = vec!["src/a.rs".to_string(), "src/b.rs".to_string()];
        entry.criteria_satisfied = vec![1, 3];
        entry.failed_command = Some("test".to_string());
        entry.learnings = "first line\nsecond line".to_string();
        entry.loop_kind = LoopKind::TestCoverage;
        entry
    }

    #[test]
    fn appended_sections_scan_back() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("progress.txt");
        fs::write(&path, ledger_preamble("demo")).expect("preamble");

        append_entry(&path, &sample(1)).expect("append 1");
        append_entry(&path, &progress_entry(2, "1.2", Outcome::Committed)).expect("append 2");

        let entries = read_entries(&path).expect("read");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0], sample(1));
        assert_eq!(entries[1].outcome, Outcome::Committed);
        assert_eq!(entry_count(&path).expect("count"), 2);
    }

    #[test]
    fn section_text_is_human_readable() {
        let text = render_entry(&sample(4));
        assert!(text.starts_with("## Iteration 4 | task `1.2` | "));
        assert!(text.contains("- outcome: verification_failed\n"));
        assert!(text.contains("- files: src/a.rs, src/b.rs\n"));
        assert!(text.contains("  second line\n"));
    }

    #[test]
    fn malformed_sections_are_skipped_but_counted() {
        let text = "## Iteration 1 | task 1.1 | t\n- outcome: exploded\n\n\
                    ## Iteration 2 | task 1.1 | t\n- outcome: no_claim\n- files: a.rs\n";
        let entries = parse_ledger(text);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].iteration, 2);
        assert_eq!(entries[0].files_touched, vec!["a.rs"]);
    }

    #[test]
    fn task_ids_with_spaces_are_counted_and_scanned() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("progress.txt");
        for iteration in 1..=3 {
            let mut entry = progress_entry(iteration, "setup db", Outcome::NoClaim);
            entry.files_touched = vec!["db/schema.sql".to_string()];
            append_entry(&path, &entry).expect("append");
        }

        assert_eq!(entry_count(&path).expect("count"), 3);
        let entries = read_entries(&path).expect("read");
        assert_eq!(entries.len(), 3);
        assert!(entries.iter().all(|entry| entry.task_id == "setup db"));
        assert_eq!(entries[2].iteration, 3);
    }

    #[test]
    fn bare_task_ids_from_older_ledgers_still_scan() {
        let text = "## Iteration 7 | task 2.1 | t\n- outcome: committed\n";
        let entries = parse_ledger(text);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].task_id, "2.1");
        assert_eq!(entries[0].iteration, 7);
    }

    #[test]
    fn missing_ledger_is_empty() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("progress.txt");
        assert!(read_entries(&path).expect("read").is_empty());
        assert_eq!(entry_count(&path).expect("count"), 0);
    }
}
