//! External tool invocation with backup and rollback safety checks.
//!
//! The metadata updater and the formatter are black boxes: each is run as
//! a subprocess with captured output and an explicit timeout, and the
//! before/after DOI, title, and URL state is compared as a corruption
//! heuristic. A failed, timed-out, or suspicious run restores the file
//! from the backup taken just before the invocation.
//!
//! Outcomes are explicit values rather than swallowed exceptions so that
//! callers (and tests) can assert on the failure path.

use std::collections::HashMap;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use thiserror::Error;
use tracing::{info, warn};
use wait_timeout::ChildExt;

use crate::normalize::{normalize_doi, normalize_title, normalize_url};
use crate::{BibFile, fixes};

/// Non-standard fields dropped by the formatter invocation.
pub const FIELDS_TO_REMOVE: [&str; 13] = [
    "file",
    "urldate",
    "langid",
    "keywords",
    "abstract",
    "Bdsk-Url-1",
    "Bdsk-Url-2",
    "note",
    "annote",
    "comment",
    "timestamp",
    "date-added",
    "date-modified",
];

/// Backup suffix for the metadata-update step, removed on success.
const UPDATE_BACKUP_SUFFIX: &str = "bib.betterbib_backup";
/// Backup suffix for the formatter step, removed on success.
const FORMAT_BACKUP_SUFFIX: &str = "bib.bibfmt_backup";

/// Fewer shared significant words than this between an old and a new
/// title counts as a suspicious rewrite.
const MIN_SHARED_TITLE_WORDS: usize = 2;

/// Programs and timeouts for the external tool steps.
#[derive(Debug, Clone)]
pub struct Toolchain {
    /// Metadata updater; also provides the journal-abbreviation mode.
    pub metadata_program: String,
    /// In-place formatter.
    pub formatter_program: String,
    pub update_timeout: Duration,
    pub abbreviate_timeout: Duration,
    pub format_timeout: Duration,
}

impl Default for Toolchain {
    fn default() -> Self {
        Self {
            metadata_program: "betterbib".to_string(),
            formatter_program: "bibfmt".to_string(),
            update_timeout: Duration::from_secs(300),
            abbreviate_timeout: Duration::from_secs(60),
            format_timeout: Duration::from_secs(60),
        }
    }
}

/// What happened to a file handed to an external tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolOutcome {
    /// The tool ran and the result passed the sanity checks.
    Updated,
    /// The tool was not run at all (unparsable input, missing restore
    /// point); the file is untouched.
    Skipped(String),
    /// The tool failed but no rollback was attempted for this step.
    Failed(String),
    /// The tool failed or produced a suspicious diff; the file was
    /// restored from its pre-invocation backup.
    RolledBack(String),
}

#[derive(Debug, Error)]
enum RunError {
    #[error("failed to launch {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error("timed out after {0:?}")]
    TimedOut(Duration),
    #[error("crashed with signal {0}")]
    Signal(i32),
    #[error("{0}")]
    Unsuccessful(String),
}

/// Runs `program` with `args`, capturing output, killing it at `timeout`.
fn run_tool(program: &str, args: &[&std::ffi::OsStr], timeout: Duration) -> Result<(), RunError> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| RunError::Spawn {
            program: program.to_string(),
            source,
        })?;

    // drain pipes on their own threads so a chatty tool cannot deadlock
    // against a full pipe buffer
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let stdout_reader = std::thread::spawn(move || read_to_string_lossy(stdout));
    let stderr_reader = std::thread::spawn(move || read_to_string_lossy(stderr));

    let status = match child.wait_timeout(timeout) {
        Ok(Some(status)) => status,
        Ok(None) => {
            let _ = child.kill();
            let _ = child.wait();
            return Err(RunError::TimedOut(timeout));
        }
        Err(source) => {
            return Err(RunError::Spawn {
                program: program.to_string(),
                source,
            });
        }
    };
    let stdout = stdout_reader.join().unwrap_or_default();
    let stderr = stderr_reader.join().unwrap_or_default();

    if status.success() {
        return Ok(());
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return Err(RunError::Signal(signal));
        }
    }
    let message = [stderr.trim(), stdout.trim()]
        .into_iter()
        .find(|s| !s.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("return code {}", status.code().unwrap_or(-1)));
    Err(RunError::Unsuccessful(message))
}

fn read_to_string_lossy(pipe: Option<impl Read>) -> String {
    let mut buffer = Vec::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_end(&mut buffer);
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

/// Per-key DOI, title, and URL state captured around a tool invocation.
#[derive(Debug, Default)]
struct MetadataSnapshot {
    dois: HashMap<String, String>,
    titles: HashMap<String, String>,
    urls: HashMap<String, String>,
}

fn snapshot(file: &BibFile) -> MetadataSnapshot {
    let mut snap = MetadataSnapshot::default();
    for entry in file.entries() {
        let key = entry.key.clone();
        if let Some(doi) = entry.get("doi").and_then(normalize_doi) {
            snap.dois.insert(key.clone(), doi);
        }
        if let Some(title) = entry.get("title") {
            snap.titles.insert(key.clone(), normalize_title(title));
        }
        if let Some(url) = entry.get("url").and_then(normalize_url) {
            snap.urls.insert(key, url);
        }
    }
    snap
}

fn significant_words(title: &str) -> std::collections::HashSet<String> {
    title
        .split_whitespace()
        .map(|w| {
            w.chars()
                .filter(|c| c.is_alphanumeric())
                .collect::<String>()
        })
        .filter(|w| w.len() >= 4)
        .collect()
}

/// Compares two snapshots and returns a description of the first
/// suspicious difference, if any.
fn detect_suspicious_change(before: &MetadataSnapshot, after: &MetadataSnapshot) -> Option<String> {
    for (key, doi_after) in &after.dois {
        if let Some(doi_before) = before.dois.get(key)
            && doi_before != doi_after
        {
            return Some(format!(
                "DOI changed for {key} ({doi_before} -> {doi_after})"
            ));
        }
    }
    for (key, title_after) in &after.titles {
        let Some(title_before) = before.titles.get(key) else {
            continue;
        };
        if title_before == title_after {
            continue;
        }
        let shared = significant_words(title_before)
            .intersection(&significant_words(title_after))
            .count();
        if shared < MIN_SHARED_TITLE_WORDS {
            return Some(format!("title diverged for {key}"));
        }
    }
    for (key, url_after) in &after.urls {
        if let Some(url_before) = before.urls.get(key)
            && url_before != url_after
        {
            return Some(format!("URL changed unexpectedly for {key}"));
        }
    }
    None
}

fn backup_path(path: &Path, suffix: &str) -> PathBuf {
    path.with_extension(suffix)
}

fn restore_from(backup: &Path, path: &Path) {
    if let Err(err) = fs::copy(backup, path) {
        warn!(file = %path.display(), %err, "could not restore from backup");
        return;
    }
    let _ = fs::remove_file(backup);
}

/// Runs the metadata updater on `path` in update-in-place mode.
///
/// A restore point is taken first; the tool failing, timing out, or
/// producing a suspicious metadata diff rolls the file back. On success
/// any entries the tool commented out are recovered.
pub fn update_metadata(path: &Path, tools: &Toolchain) -> ToolOutcome {
    info!(file = %path.display(), tool = %tools.metadata_program, "updating entry metadata");

    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) => return ToolOutcome::Skipped(format!("unreadable input: {err}")),
    };
    let before = match BibFile::read(path) {
        Ok(before) => before,
        Err(err) => {
            return ToolOutcome::Skipped(format!("input looks unparsable: {err}"));
        }
    };
    if raw.contains('@') && before.is_empty() {
        return ToolOutcome::Skipped("input looks unparsable".to_string());
    }

    let backup = backup_path(path, UPDATE_BACKUP_SUFFIX);
    if let Err(err) = fs::copy(path, &backup) {
        return ToolOutcome::Skipped(format!("could not create restore point: {err}"));
    }
    let snapshot_before = snapshot(&before);

    let args = [
        std::ffi::OsStr::new("update"),
        std::ffi::OsStr::new("-i"),
        path.as_os_str(),
    ];
    if let Err(err) = run_tool(&tools.metadata_program, &args, tools.update_timeout) {
        warn!(%err, "metadata update failed; restoring backup");
        restore_from(&backup, path);
        return ToolOutcome::RolledBack(err.to_string());
    }

    if let Ok(after) = BibFile::read(path)
        && let Some(reason) = detect_suspicious_change(&snapshot_before, &snapshot(&after))
    {
        warn!(reason = %reason, "suspicious metadata change detected; restoring backup");
        restore_from(&backup, path);
        return ToolOutcome::RolledBack(reason);
    }

    let _ = fs::remove_file(&backup);
    if let Err(err) = fixes::uncomment_entries(path) {
        warn!(%err, "could not recover commented entries");
    }
    ToolOutcome::Updated
}

/// Runs the metadata tool's journal-abbreviation mode on `path`.
///
/// Lighter than [`update_metadata`]: the full-file backup taken at the
/// start of processing already covers this step, and the operation is
/// idempotent, so a failure is reported without rollback.
pub fn abbreviate_journals(path: &Path, tools: &Toolchain) -> ToolOutcome {
    info!(file = %path.display(), tool = %tools.metadata_program, "abbreviating journal names");
    let args = [
        std::ffi::OsStr::new("abbreviate-journal-names"),
        std::ffi::OsStr::new("-i"),
        path.as_os_str(),
    ];
    match run_tool(&tools.metadata_program, &args, tools.abbreviate_timeout) {
        Ok(()) => ToolOutcome::Updated,
        Err(err) => ToolOutcome::Failed(err.to_string()),
    }
}

/// Runs the formatter on `path`, dropping the non-standard fields.
///
/// Same contract as [`update_metadata`]: failure or a suspicious DOI or
/// title diff restores the pre-invocation state.
pub fn format_file(path: &Path, tools: &Toolchain) -> ToolOutcome {
    info!(file = %path.display(), tool = %tools.formatter_program, "formatting");

    let snapshot_before = BibFile::read(path).ok().map(|file| snapshot(&file));

    let backup = backup_path(path, FORMAT_BACKUP_SUFFIX);
    if let Err(err) = fs::copy(path, &backup) {
        return ToolOutcome::Skipped(format!("could not create restore point: {err}"));
    }

    let mut args: Vec<std::ffi::OsString> = vec![
        "-i".into(),
        "--indent".into(),
        "2".into(),
        "--align".into(),
        "14".into(),
        "-d".into(),
        "braces".into(),
    ];
    for field in FIELDS_TO_REMOVE {
        args.push("--drop".into());
        args.push(field.into());
    }
    args.push(path.as_os_str().to_os_string());
    let arg_refs: Vec<&std::ffi::OsStr> = args.iter().map(std::ffi::OsString::as_os_str).collect();

    if let Err(err) = run_tool(&tools.formatter_program, &arg_refs, tools.format_timeout) {
        warn!(%err, "formatting failed; restoring backup");
        restore_from(&backup, path);
        return ToolOutcome::RolledBack(err.to_string());
    }

    if let Some(snapshot_before) = snapshot_before
        && let Ok(after) = BibFile::read(path)
        && let Some(reason) = detect_suspicious_change(&snapshot_before, &snapshot(&after))
    {
        warn!(reason = %reason, "formatter altered metadata; restoring backup");
        restore_from(&backup, path);
        return ToolOutcome::RolledBack(reason);
    }

    let _ = fs::remove_file(&backup);
    ToolOutcome::Updated
}
