//! Citation index: extraction and rewriting of citation commands in
//! LaTeX sources.
//!
//! Any command whose name contains `cite` (`\cite`, `\citep`,
//! `\autocite`, and friends) followed by a brace-delimited,
//! comma-separated key list is recognized by a single pattern. Rewriting
//! substitutes keys through a rename mapping and collapses duplicate
//! targets within one command's key list, preserving first-occurrence
//! order.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use tracing::{info, warn};

use crate::RenameMap;
use crate::normalize::normalize_unicode;
use crate::regex::{Captures, Regex};

static CITE_COMMAND: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\\[A-Za-z]*cite[a-zA-Z]*\{([^}]+)\}").unwrap());

/// Extracts the normalized citation keys referenced in `content`.
#[must_use]
pub fn extract_citations(content: &str) -> HashSet<String> {
    let mut keys = HashSet::new();
    for caps in CITE_COMMAND.captures_iter(content) {
        for key in caps[1].split(',') {
            if let Some(normalized) = normalize_unicode(key.trim()) {
                keys.insert(normalized);
            }
        }
    }
    keys
}

/// Reads a `.tex` file and extracts its citation keys.
///
/// An unreadable file yields an empty set; the condition is logged, not
/// raised, because citation extraction is never a fatal step.
#[must_use]
pub fn extract_citations_from_tex(path: &Path) -> HashSet<String> {
    match fs::read_to_string(path) {
        Ok(content) => extract_citations(&content),
        Err(err) => {
            warn!(file = %path.display(), %err, "could not read tex source");
            HashSet::new()
        }
    }
}

/// Rewrites every citation command in `content` through `mapping`.
///
/// Keys absent from the mapping are left untouched. After substitution the
/// key list of each command is de-duplicated, keeping the first
/// occurrence. Returns the new content and whether anything changed.
///
/// # Examples
///
/// ```
/// use bibcurate::{RenameMap, tex::rewrite_citations};
///
/// let mapping: RenameMap = [
///     ("X".to_string(), "K".to_string()),
///     ("Y".to_string(), "K".to_string()),
/// ]
/// .into();
/// let (out, changed) = rewrite_citations(r"\cite{X,Y,Z}", &mapping);
/// assert_eq!(out, r"\cite{K, Z}");
/// assert!(changed);
/// ```
#[must_use]
pub fn rewrite_citations(content: &str, mapping: &RenameMap) -> (String, bool) {
    if mapping.is_empty() {
        return (content.to_string(), false);
    }
    let rewritten = CITE_COMMAND.replace_all(content, |caps: &Captures| {
        let full = &caps[0];
        let mut seen = HashSet::new();
        let mut keys = Vec::new();
        for key in caps[1].split(',') {
            let key = key.trim();
            let target = normalize_unicode(key)
                .and_then(|k| mapping.get(&k).cloned())
                .unwrap_or_else(|| key.to_string());
            if seen.insert(target.clone()) {
                keys.push(target);
            }
        }
        // rebuild from the command prefix so key text can never collide
        // with the command name
        let brace = full.find('{').unwrap_or(full.len());
        format!("{}{{{}}}", &full[..brace], keys.join(", "))
    });
    let changed = rewritten != content;
    (rewritten.into_owned(), changed)
}

/// Rewrites citation keys across a collection of `.tex` files.
///
/// Files that cannot be read or written are logged and skipped; the
/// remaining files are still processed.
pub fn update_tex_citations(tex_files: &[PathBuf], mapping: &RenameMap) {
    if mapping.is_empty() {
        return;
    }
    for path in tex_files {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) => {
                warn!(file = %path.display(), %err, "could not read tex source");
                continue;
            }
        };
        let (updated, changed) = rewrite_citations(&content, mapping);
        if !changed {
            continue;
        }
        match fs::write(path, updated) {
            Ok(()) => info!(file = %path.display(), "updated citations"),
            Err(err) => warn!(file = %path.display(), %err, "could not rewrite tex source"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn mapping(pairs: &[(&str, &str)]) -> RenameMap {
        pairs
            .iter()
            .map(|(a, b)| ((*a).to_string(), (*b).to_string()))
            .collect()
    }

    #[test]
    fn test_extract_citations_variants() {
        let content = r"
            Intro \cite{Alpha2020} and \citep{beta, gamma}.
            Also \autocite{delta} plus \textcite{epsilon}.
            Not a citation: \cited-out prose.
        ";
        let keys = extract_citations(content);
        for expected in ["Alpha2020", "beta", "gamma", "delta", "epsilon"] {
            assert!(keys.contains(expected), "missing {expected}");
        }
        assert_eq!(keys.len(), 5);
    }

    #[test]
    fn test_rewrite_collapses_merged_keys() {
        let map = mapping(&[("X", "K"), ("Y", "K")]);
        let (out, changed) = rewrite_citations(r"\cite{X,Y,Z}", &map);
        assert_eq!(out, r"\cite{K, Z}");
        assert!(changed);
    }

    #[test]
    fn test_rewrite_preserves_command_name() {
        let map = mapping(&[("old", "New2020")]);
        let (out, _) = rewrite_citations(r"\parencite{old} and \citeauthor{old}", &map);
        assert_eq!(out, r"\parencite{New2020} and \citeauthor{New2020}");
    }

    #[test]
    fn test_rewrite_leaves_unmapped_keys() {
        let map = mapping(&[("a", "b")]);
        let (out, changed) = rewrite_citations(r"\cite{x, y}", &map);
        assert_eq!(out, r"\cite{x, y}");
        assert!(!changed);
    }

    #[test]
    fn test_rewrite_key_named_like_command() {
        // a key that contains "cite" must not clobber the command name
        let map = mapping(&[("cite", "Ref2020")]);
        let (out, _) = rewrite_citations(r"\cite{cite}", &map);
        assert_eq!(out, r"\cite{Ref2020}");
    }

    #[test]
    fn test_update_tex_citations_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("main.tex");
        std::fs::write(&path, r"Before \cite{foo,Bar2020} after.").unwrap();

        update_tex_citations(&[path.clone()], &mapping(&[("foo", "Bar2020")]));

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, r"Before \cite{Bar2020} after.");
    }
}
