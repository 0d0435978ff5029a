//! Boot-entry rewriting on the mounted boot partition.
//!
//! Each entry file matching the configured pattern is read, transformed in
//! memory, and written back atomically (temp file + rename), so an entry
//! is never left half-written. Entries are independent: one failing entry
//! is recorded in the outcome and the rest are still processed.

mod cmdline;

pub use cmdline::strip_unverified_root;

use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::errors::RewriteError;

/// Result of the rewrite stage.
#[derive(Debug, Default, Serialize)]
pub struct RewriteOutcome {
    /// Entries rewritten to boot through the verified mapping.
    pub rewritten: Vec<PathBuf>,
    /// Files in the entries directory that did not match the pattern.
    pub skipped: Vec<PathBuf>,
    /// Entries whose read or write failed; the rest were still processed.
    pub failures: Vec<EntryFailure>,
}

#[derive(Debug, Serialize)]
pub struct EntryFailure {
    pub path: PathBuf,
    pub error: String,
}

/// Rewrite every matching entry under `entries_dir`.
///
/// `initrd_ref` is the boot-partition-relative archive reference the
/// entries gain (e.g. `EFI/custom_initramfs.cpio.gz`). Only an invalid
/// pattern or a failure to list the directory itself aborts; per-entry
/// failures land in the outcome.
pub fn rewrite_entries(
    entries_dir: &Path,
    pattern: &str,
    initrd_ref: &str,
) -> Result<RewriteOutcome, RewriteError> {
    let pattern = glob::Pattern::new(pattern).map_err(|e| RewriteError::Pattern {
        pattern: pattern.to_string(),
        source: e,
    })?;

    let listing = std::fs::read_dir(entries_dir).map_err(|e| RewriteError::ListEntries {
        path: entries_dir.to_path_buf(),
        source: e,
    })?;

    let mut paths: Vec<PathBuf> = listing
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_ok_and(|t| t.is_file()))
        .map(|entry| entry.path())
        .collect();
    paths.sort();

    let mut outcome = RewriteOutcome::default();
    for path in paths {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if !pattern.matches(&name) {
            outcome.skipped.push(path);
            continue;
        }

        match rewrite_one(&path, initrd_ref) {
            Ok(()) => {
                tracing::info!(entry = %path.display(), "Rewrote boot entry");
                outcome.rewritten.push(path);
            }
            Err(e) => {
                tracing::warn!(entry = %path.display(), "Boot entry failed, continuing: {e}");
                outcome.failures.push(EntryFailure {
                    path,
                    error: e.to_string(),
                });
            }
        }
    }
    Ok(outcome)
}

fn rewrite_one(path: &Path, initrd_ref: &str) -> Result<(), RewriteError> {
    let content = std::fs::read_to_string(path).map_err(|e| RewriteError::ReadEntry {
        path: path.to_path_buf(),
        source: e,
    })?;

    let rewritten = transform_entry(&content, initrd_ref);
    if rewritten == content {
        return Ok(());
    }

    write_atomic(path, &rewritten).map_err(|e| RewriteError::WriteEntry {
        path: path.to_path_buf(),
        source: e,
    })
}

/// Transform one entry's text: filter the `options` command line, append
/// the initrd directive when missing.
///
/// Idempotent: transforming an already-rewritten entry is a no-op, since
/// the filtered line has nothing left to strip and the directive is only
/// appended once.
pub fn transform_entry(content: &str, initrd_ref: &str) -> String {
    let mut lines: Vec<String> = Vec::new();
    for line in content.lines() {
        match options_directive(line) {
            Some(cmdline) => {
                let filtered = strip_unverified_root(cmdline);
                if filtered.is_empty() {
                    lines.push("options".to_string());
                } else {
                    lines.push(format!("options {filtered}"));
                }
            }
            None => lines.push(line.to_string()),
        }
    }

    let initrd_line = format!("initrd {initrd_ref}");
    if !lines.iter().any(|line| line.trim() == initrd_line) {
        lines.push(initrd_line);
    }

    let mut out = lines.join("\n");
    out.push('\n');
    out
}

/// Return the command line of an `options` directive, or `None` for any
/// other line (`optionsfoo` is not a directive).
fn options_directive(line: &str) -> Option<&str> {
    let rest = line.strip_prefix("options")?;
    if rest.is_empty() || rest.starts_with(char::is_whitespace) {
        Some(rest)
    } else {
        None
    }
}

/// Write via a sibling temp file and rename, so the entry is replaced
/// all-or-nothing.
fn write_atomic(path: &Path, content: &str) -> io::Result<()> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{name}.tmp"));
    std::fs::write(&tmp, content)?;
    std::fs::rename(&tmp, path).inspect_err(|_| {
        let _ = std::fs::remove_file(&tmp);
    })
}
