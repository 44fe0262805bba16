//! Validation checks and reporting.
//!
//! Everything here is read-only. Checks produce typed [`Issue`] values so
//! the CLI can render them and tests can assert on them; per-file coverage
//! statistics back the post-curation report.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use serde::Serialize;
use tracing::debug;

use crate::normalize::{normalize_doi, normalize_title, normalize_unicode};
use crate::regex::Regex;
use crate::{BibFile, project, tex};

/// `@comment{@article{Key,`: an entry the formatter commented out.
static COMMENTED_ENTRY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"@comment\s*\{@\w+\{([^,}]+)").unwrap());

/// A single validation finding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Issue {
    /// A `.tex` file has no discoverable companion bibliography.
    MissingBibFile { tex: PathBuf },
    /// A citation names a key no bibliography defines.
    MissingCitation { tex: PathBuf, key: String },
    /// A citation names a key that is commented out.
    CommentedCitation { tex: PathBuf, key: String },
    /// An entry's `crossref` points at a key no bibliography defines.
    DanglingCrossref { entry: String, target: String },
    /// The same key is defined in more than one place.
    DuplicateKey { key: String, occurrences: usize },
    /// The same DOI is shared by entries under different keys.
    DuplicateDoi { doi: String, keys: Vec<String> },
    /// The same normalized title appears on multiple entries.
    DuplicateTitle { title: String, count: usize },
    /// Lines containing an unescaped `%`.
    UnescapedPercent { file: PathBuf, lines: usize },
    /// The file could not be parsed at all.
    SyntaxError { file: PathBuf, message: String },
}

impl fmt::Display for Issue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Issue::MissingBibFile { tex } => {
                write!(f, "{}: no companion bib file", tex.display())
            }
            Issue::MissingCitation { tex, key } => {
                write!(f, "{}: missing citation {key}", tex.display())
            }
            Issue::CommentedCitation { tex, key } => {
                write!(f, "{}: cites commented-out entry {key}", tex.display())
            }
            Issue::DanglingCrossref { entry, target } => {
                write!(f, "missing crossref: {entry} -> {target}")
            }
            Issue::DuplicateKey { key, occurrences } => {
                write!(f, "duplicate key {key} ({occurrences} occurrences)")
            }
            Issue::DuplicateDoi { doi, keys } => {
                write!(f, "duplicate DOI {doi} across keys {}", keys.join(", "))
            }
            Issue::DuplicateTitle { title, count } => {
                write!(f, "duplicate title \"{title}\" ({count} entries)")
            }
            Issue::UnescapedPercent { file, lines } => {
                write!(f, "{}: unescaped % on {lines} line(s)", file.display())
            }
            Issue::SyntaxError { file, message } => {
                write!(f, "{}: {message}", file.display())
            }
        }
    }
}

/// Per-file entry counts and field coverage.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FileStats {
    pub path: PathBuf,
    pub entry_count: usize,
    pub with_doi: usize,
    pub with_title: usize,
    pub with_author: usize,
    pub with_year: usize,
}

/// Everything a validation run found.
#[derive(Debug, Default)]
pub struct ValidationReport {
    pub issues: Vec<Issue>,
    pub citations_total: usize,
    pub citations_valid: usize,
    pub stats: Vec<FileStats>,
}

impl ValidationReport {
    /// True when no issues were found.
    #[must_use]
    pub fn passed(&self) -> bool {
        self.issues.is_empty()
    }
}

/// Computes entry statistics for one loaded bibliography.
#[must_use]
pub fn file_stats(file: &BibFile) -> FileStats {
    let mut stats = FileStats {
        path: file.path().to_path_buf(),
        entry_count: file.len(),
        ..FileStats::default()
    };
    for entry in file.entries() {
        if entry.has("doi") {
            stats.with_doi += 1;
        }
        if entry.has("title") {
            stats.with_title += 1;
        }
        if entry.has("author") {
            stats.with_author += 1;
        }
        if entry.has("year") {
            stats.with_year += 1;
        }
    }
    stats
}

/// Counts lines with an unescaped `%` outside comment lines.
#[must_use]
pub fn count_unescaped_percent_lines(text: &str) -> usize {
    let mut lines = 0;
    for line in text.lines() {
        if line.trim_start().starts_with('%') {
            continue;
        }
        let mut backslashes = 0usize;
        for c in line.chars() {
            match c {
                '\\' => backslashes += 1,
                '%' => {
                    if backslashes % 2 == 0 {
                        lines += 1;
                        break;
                    }
                    backslashes = 0;
                }
                _ => backslashes = 0,
            }
        }
    }
    lines
}

/// Runs the complete validation suite over a project directory.
#[must_use]
pub fn validate_bibliography(root: &Path) -> ValidationReport {
    let bib_files = project::collect_bib_files(root);
    let tex_files = project::collect_tex_files(root);
    validate_project(root, &bib_files, &tex_files)
}

/// Runs the complete validation suite over explicit file lists.
#[must_use]
pub fn validate_project(
    root: &Path,
    bib_files: &[PathBuf],
    tex_files: &[PathBuf],
) -> ValidationReport {
    let mut report = ValidationReport::default();

    let mut all_keys: HashSet<String> = HashSet::new();
    let mut key_counts: BTreeMap<String, usize> = BTreeMap::new();
    let mut crossrefs: Vec<(String, String)> = Vec::new();
    let mut commented: HashSet<String> = HashSet::new();
    let mut doi_keys: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut title_counts: BTreeMap<String, usize> = BTreeMap::new();

    for path in bib_files {
        if let Ok(text) = fs::read_to_string(path) {
            for caps in COMMENTED_ENTRY.captures_iter(&text) {
                if let Some(key) = normalize_unicode(caps[1].trim()) {
                    commented.insert(key);
                }
            }
            let percent_lines = count_unescaped_percent_lines(&text);
            if percent_lines > 0 {
                report.issues.push(Issue::UnescapedPercent {
                    file: path.clone(),
                    lines: percent_lines,
                });
            }
        }

        let file = match BibFile::read(path) {
            Ok(file) => file,
            Err(err) => {
                report.issues.push(Issue::SyntaxError {
                    file: path.clone(),
                    message: err.to_string(),
                });
                continue;
            }
        };
        for entry in file.entries() {
            let Some(key) = normalize_unicode(&entry.key) else {
                continue;
            };
            *key_counts.entry(key.clone()).or_default() += 1;
            if let Some(target) = entry.get("crossref").and_then(normalize_unicode) {
                crossrefs.push((key.clone(), target));
            }
            if let Some(doi) = entry.get("doi").and_then(normalize_doi) {
                doi_keys.entry(doi).or_default().push(key.clone());
            }
            let title = normalize_title(entry.get("title").unwrap_or_default());
            if !title.is_empty() {
                *title_counts.entry(title).or_default() += 1;
            }
            all_keys.insert(key);
        }
        report.stats.push(file_stats(&file));
    }

    for path in tex_files {
        if project::get_corresponding_bib(path, root).is_none() {
            report.issues.push(Issue::MissingBibFile { tex: path.clone() });
            continue;
        }
        let citations = tex::extract_citations_from_tex(path);
        report.citations_total += citations.len();
        let mut invalid = 0;
        let mut missing: Vec<&String> = citations.difference(&all_keys).collect();
        missing.sort();
        for key in missing {
            invalid += 1;
            report.issues.push(Issue::MissingCitation {
                tex: path.clone(),
                key: key.clone(),
            });
        }
        let mut in_comments: Vec<&String> =
            citations.iter().filter(|k| commented.contains(*k)).collect();
        in_comments.sort();
        for key in in_comments {
            invalid += 1;
            report.issues.push(Issue::CommentedCitation {
                tex: path.clone(),
                key: key.clone(),
            });
        }
        report.citations_valid += citations.len().saturating_sub(invalid);
    }

    for (entry, target) in crossrefs {
        if !all_keys.contains(&target) {
            report
                .issues
                .push(Issue::DanglingCrossref { entry, target });
        }
    }

    for (key, occurrences) in key_counts {
        if occurrences > 1 {
            report.issues.push(Issue::DuplicateKey { key, occurrences });
        }
    }

    for (doi, mut keys) in doi_keys {
        keys.sort();
        keys.dedup();
        if keys.len() > 1 {
            report.issues.push(Issue::DuplicateDoi { doi, keys });
        }
    }

    for (title, count) in title_counts {
        if count > 1 {
            report.issues.push(Issue::DuplicateTitle { title, count });
        }
    }

    debug!(
        issues = report.issues.len(),
        citations = report.citations_total,
        "validation finished"
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn write(path: &Path, content: &str) {
        fs::write(path, content).unwrap();
    }

    fn project_with(
        bib: &str,
        tex: &str,
    ) -> (tempfile::TempDir, Vec<PathBuf>, Vec<PathBuf>) {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let bib_path = root.join("references.bib");
        let tex_path = root.join("main.tex");
        write(&bib_path, bib);
        write(&tex_path, tex);
        (dir, vec![bib_path], vec![tex_path])
    }

    #[test]
    fn test_clean_project_passes() {
        let (dir, bibs, texs) = project_with(
            "@article{Good2020,\n  title = {Fine Work},\n  doi = {10.1/g},\n}\n",
            r"Text \cite{Good2020}.",
        );
        let report = validate_project(dir.path(), &bibs, &texs);
        assert!(report.passed(), "issues: {:?}", report.issues);
        assert_eq!(report.citations_total, 1);
        assert_eq!(report.citations_valid, 1);
        assert_eq!(report.stats[0].entry_count, 1);
        assert_eq!(report.stats[0].with_doi, 1);
    }

    #[test]
    fn test_missing_citation_reported() {
        let (dir, bibs, texs) = project_with(
            "@article{Present,\n  title = {Here},\n}\n",
            r"See \cite{Present, Absent}.",
        );
        let report = validate_project(dir.path(), &bibs, &texs);
        assert!(report.issues.iter().any(|i| matches!(
            i,
            Issue::MissingCitation { key, .. } if key == "Absent"
        )));
        assert_eq!(report.citations_total, 2);
        assert_eq!(report.citations_valid, 1);
    }

    #[test]
    fn test_commented_citation_reported() {
        let (dir, bibs, texs) = project_with(
            "@article{Live,\n  title = {L},\n}\n@comment{@article{Dead,\n  title = {D},\n}}\n",
            r"\cite{Dead}",
        );
        let report = validate_project(dir.path(), &bibs, &texs);
        assert!(report.issues.iter().any(|i| matches!(
            i,
            Issue::CommentedCitation { key, .. } if key == "Dead"
        )));
    }

    #[test]
    fn test_dangling_crossref_reported() {
        let (dir, bibs, texs) = project_with(
            "@inproceedings{Child,\n  title = {C},\n  crossref = {Gone},\n}\n",
            r"\cite{Child}",
        );
        let report = validate_project(dir.path(), &bibs, &texs);
        assert!(report.issues.iter().any(|i| matches!(
            i,
            Issue::DanglingCrossref { target, .. } if target == "Gone"
        )));
    }

    #[test]
    fn test_duplicate_doi_and_title_reported() {
        let (dir, bibs, texs) = project_with(
            concat!(
                "@article{A,\n  title = {Shared Words},\n  doi = {10.1/s},\n}\n",
                "@article{B,\n  title = {shared   words},\n  doi = {doi:10.1/s},\n}\n",
            ),
            r"\cite{A,B}",
        );
        let report = validate_project(dir.path(), &bibs, &texs);
        assert!(
            report
                .issues
                .iter()
                .any(|i| matches!(i, Issue::DuplicateDoi { .. }))
        );
        assert!(report.issues.iter().any(|i| matches!(
            i,
            Issue::DuplicateTitle { title, count: 2 } if title == "shared words"
        )));
    }

    #[test]
    fn test_missing_companion_bib_reported() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir(root.join("sections")).unwrap();
        write(&root.join("sections/intro.tex"), r"\cite{X}");

        let report = validate_project(
            root,
            &[],
            &[root.join("sections/intro.tex")],
        );
        assert!(
            report
                .issues
                .iter()
                .any(|i| matches!(i, Issue::MissingBibFile { .. }))
        );
    }

    #[test]
    fn test_count_unescaped_percent_lines() {
        let text = "ok line\n50% bad\n\\% escaped\n% comment line\n";
        assert_eq!(count_unescaped_percent_lines(text), 1);
    }

    #[test]
    fn test_syntax_error_reported() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent.bib");
        let report = validate_project(dir.path(), &[missing], &[]);
        assert!(
            report
                .issues
                .iter()
                .any(|i| matches!(i, Issue::SyntaxError { .. }))
        );
    }

    #[test]
    fn test_issue_display() {
        let issue = Issue::DuplicateKey {
            key: "K".to_string(),
            occurrences: 3,
        };
        assert_eq!(issue.to_string(), "duplicate key K (3 occurrences)");
    }
}
