//! Repair passes for common bibliography defects.
//!
//! Two families live here. Entry-level passes take a loaded [`BibFile`],
//! mutate it in place, and return the number of fields or entries changed;
//! persisting is the caller's job. Source-level passes operate on the raw
//! file text or bytes because they exist to make a file parsable at all
//! (invalid UTF-8, HTML entities, entries commented out by the
//! formatter); these read and rewrite the file themselves.
//!
//! Every pass is idempotent: running it twice changes nothing the second
//! time.

use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use tracing::info;
use unicode_normalization::UnicodeNormalization;
use unicode_normalization::char::is_combining_mark;

use crate::normalize::normalize_keywords;
use crate::regex::{Captures, Regex};
use crate::{AbbreviationTable, BibFile, Result};

/// Fields whose text is cleaned by the accent and author repairs.
const TEXT_FIELDS: [&str; 6] = [
    "author",
    "editor",
    "translator",
    "title",
    "booktitle",
    "journal",
];

const ENTITY_REPLACEMENTS: [(&str, &str); 5] = [
    ("&amp;", r"\&"),
    ("&lt;", "<"),
    ("&gt;", ">"),
    ("&quot;", "\""),
    ("&apos;", "'"),
];

/// LaTeX accent macros of the form `\'{x}`, `\"{x}`, `\c{x}`, ...
static ACCENT_MACROS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"\\['"`^~=.uvHc]\{([^}]+)\}"#).unwrap());

/// A letter followed by a combining acute accent.
static COMBINING_ACUTE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(.)\x{0301}").unwrap());

static YEAR_DATE_PREFIX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(\d{4})[-/]").unwrap());

static UMLAUT_BACKSLASH_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([A-Za-z])\\{4,}([a-z]+)").unwrap());

static BACKSLASH_RUN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\\{4,}").unwrap());

static DANGLING_BACKSLASH_BEFORE_SEP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r",\s*\\+\s*([,}])").unwrap());

static DANGLING_BACKSLASH_AT_END: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([A-Za-z])\s*\\+\s*$").unwrap());

/// Unicode letters rewritten to their LaTeX escape in author fields.
const UNICODE_TO_LATEX: [(&str, &str); 14] = [
    ("ń", "\\'{n}"),
    ("á", "\\'{a}"),
    ("é", "\\'{e}"),
    ("í", "\\'{i}"),
    ("ó", "\\'{o}"),
    ("ú", "\\'{u}"),
    ("ü", "\\\"{u}"),
    ("ö", "\\\"{o}"),
    ("ł", "\\l{}"),
    ("ć", "\\'{c}"),
    ("ś", "\\'{s}"),
    ("ź", "\\'{z}"),
    ("ą", "\\'{a}"),
    ("ę", "\\'{e}"),
];

fn month_number(name: &str) -> Option<&'static str> {
    Some(match name {
        "jan" | "january" => "1",
        "feb" | "february" => "2",
        "mar" | "march" => "3",
        "apr" | "april" => "4",
        "may" => "5",
        "jun" | "june" => "6",
        "jul" | "july" => "7",
        "aug" | "august" => "8",
        "sep" | "sept" | "september" => "9",
        "oct" | "october" => "10",
        "nov" | "november" => "11",
        "dec" | "december" => "12",
        _ => return None,
    })
}

// ---------------------------------------------------------------------------
// entry-level passes
// ---------------------------------------------------------------------------

/// Escapes literal `%` characters in every field.
///
/// A percent is considered unescaped when preceded by an even number of
/// backslashes. Returns the number of fields changed.
pub fn fix_unescaped_percent(file: &mut BibFile) -> usize {
    file.transform_fields(|value| {
        let escaped = escape_percents(value);
        (escaped != value).then_some(escaped)
    })
}

pub(crate) fn escape_percents(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut backslashes = 0usize;
    for c in value.chars() {
        match c {
            '\\' => backslashes += 1,
            '%' => {
                if backslashes % 2 == 0 {
                    out.push('\\');
                }
                backslashes = 0;
            }
            _ => backslashes = 0,
        }
        out.push(c);
    }
    out
}

/// Removes accents from author names and other text fields.
///
/// LaTeX accent macros are unwrapped first, then any remaining combining
/// marks are dropped via NFD decomposition. Returns the number of fields
/// changed.
pub fn remove_accents_from_names(file: &mut BibFile) -> usize {
    let mut fixed = 0;
    for entry in file.entries_mut() {
        for field in TEXT_FIELDS {
            let Some(original) = entry.get(field).map(str::to_owned) else {
                continue;
            };
            let unwrapped = ACCENT_MACROS.replace_all(&original, "$1");
            let stripped: String = unwrapped
                .nfd()
                .filter(|c| !is_combining_mark(*c))
                .nfc()
                .collect();
            if stripped != original {
                entry.set(field, stripped);
                fixed += 1;
            }
        }
    }
    if fixed > 0 {
        info!(fixed, "removed accents from text fields");
    }
    fixed
}

/// Repairs malformed author fields: runs of stray backslashes, dangling
/// backslashes before separators, and raw Unicode letters that belong in
/// LaTeX escapes. Returns the number of entries changed.
pub fn fix_malformed_author_fields(file: &mut BibFile) -> usize {
    let mut fixed = 0;
    for entry in file.entries_mut() {
        let Some(original) = entry.get("author").map(str::to_owned) else {
            continue;
        };
        let mut value = UMLAUT_BACKSLASH_RUN
            .replace_all(&original, "${1}{\\\"u}${2}")
            .into_owned();
        value = BACKSLASH_RUN.replace_all(&value, "\\").into_owned();
        value = DANGLING_BACKSLASH_BEFORE_SEP
            .replace_all(&value, ",${1}")
            .into_owned();
        value = DANGLING_BACKSLASH_AT_END
            .replace_all(&value, "${1}")
            .into_owned();
        for (raw, latex) in UNICODE_TO_LATEX {
            if value.contains(raw) {
                value = value.replace(raw, latex);
            }
        }
        if value != original {
            entry.set("author", value);
            fixed += 1;
        }
    }
    if fixed > 0 {
        info!(fixed, "fixed malformed author fields");
    }
    fixed
}

/// Reduces year fields holding full dates (`2020-01-02`) to the year.
pub fn fix_legacy_year_fields(file: &mut BibFile) -> usize {
    let mut fixed = 0;
    for entry in file.entries_mut() {
        let Some(raw) = entry.get("year").map(str::to_owned) else {
            continue;
        };
        let cleaned = raw.trim().trim_matches(|c| c == '{' || c == '}');
        if cleaned.parse::<i64>().is_ok() {
            continue;
        }
        if let Some(caps) = YEAR_DATE_PREFIX.captures(cleaned) {
            entry.set("year", caps[1].to_string());
            fixed += 1;
        }
    }
    fixed
}

/// Converts month-name fields (`jan`, `September`) to month numbers.
pub fn fix_legacy_month_fields(file: &mut BibFile) -> usize {
    let mut fixed = 0;
    for entry in file.entries_mut() {
        let Some(raw) = entry.get("month").map(str::to_owned) else {
            continue;
        };
        let cleaned = raw
            .trim()
            .trim_matches(|c| c == '{' || c == '}')
            .to_lowercase();
        if cleaned.parse::<i64>().is_ok() {
            continue;
        }
        if let Some(number) = month_number(&cleaned) {
            entry.set("month", number);
            fixed += 1;
        }
    }
    fixed
}

/// Canonicalizes comma-separated keyword lists.
pub fn normalize_keyword_fields(file: &mut BibFile) -> usize {
    let mut fixed = 0;
    for entry in file.entries_mut() {
        let Some(raw) = entry.get("keywords").map(str::to_owned) else {
            continue;
        };
        if let Some(normalized) = normalize_keywords(&raw)
            && normalized != raw
        {
            entry.set("keywords", normalized);
            fixed += 1;
        }
    }
    fixed
}

/// Replaces full journal titles with their abbreviation from `table`.
///
/// Only exact (case-insensitive) matches are rewritten; unknown titles
/// are preserved rather than inventing an abbreviation. Returns the
/// number of entries changed.
pub fn abbreviate_journal_names(file: &mut BibFile, table: &AbbreviationTable) -> usize {
    let mut fixed = 0;
    for entry in file.entries_mut() {
        let Some(journal) = entry.get("journal").map(str::to_owned) else {
            continue;
        };
        if let Some(abbreviation) = table.abbreviation_for(&journal)
            && abbreviation != journal
        {
            entry.set("journal", abbreviation.to_string());
            fixed += 1;
        }
    }
    if fixed > 0 {
        info!(fixed, "abbreviated journal names");
    }
    fixed
}

// ---------------------------------------------------------------------------
// source-level passes
// ---------------------------------------------------------------------------

/// Repairs invalid UTF-8 byte sequences that break LaTeX compilation.
///
/// Handles doubled backslashes glued onto UTF-8 combining marks
/// (`Lo\\<U+0308>c` becomes `Lo\"c`) and a couple of recurring mangled
/// letters. Any remaining undecodable bytes are dropped. Returns the
/// number of sequences fixed.
///
/// # Errors
///
/// Returns an error if the file cannot be read or written back.
pub fn fix_invalid_utf8_bytes(path: &Path) -> Result<usize> {
    const PATTERNS: [(&[u8], &[u8]); 4] = [
        (b"\\\\\xcc\x88", b"\\\""),
        (b"\\\\\xcc\x81", b"\\'"),
        (b"\\\\\xc5\x9b", b"\\'{s}"),
        (b"\\\\\xc5\x82", b"\\l{}"),
    ];

    let mut content = fs::read(path)?;
    let mut fixed = 0;
    for (needle, replacement) in PATTERNS {
        fixed += replace_bytes(&mut content, needle, replacement);
    }
    if fixed == 0 {
        return Ok(0);
    }
    let decoded = String::from_utf8_lossy(&content).replace('\u{FFFD}', "");
    fs::write(path, decoded)?;
    info!(fixed, file = %path.display(), "fixed invalid UTF-8 byte sequences");
    Ok(fixed)
}

fn replace_bytes(haystack: &mut Vec<u8>, needle: &[u8], replacement: &[u8]) -> usize {
    let mut count = 0;
    let mut from = 0;
    while let Some(pos) = find_subsequence(haystack, needle, from) {
        haystack.splice(pos..pos + needle.len(), replacement.iter().copied());
        from = pos + replacement.len();
        count += 1;
    }
    count
}

fn find_subsequence(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from >= haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|pos| pos + from)
}

/// Repairs problematic Unicode characters that break LaTeX compilation:
/// box-drawing dashes become `--` and letters carrying a combining acute
/// become `\'{x}`. Comment lines are skipped. Returns the number of lines
/// changed.
///
/// # Errors
///
/// Returns an error if the file cannot be read or written back.
pub fn fix_problematic_unicode(path: &Path) -> Result<usize> {
    let content = fs::read_to_string(path)?;
    let mut fixed = 0;
    let lines: Vec<String> = content
        .split('\n')
        .map(|line| {
            let stripped = line.trim_start();
            if stripped.starts_with('%') {
                return line.to_string();
            }
            let mut new_line = line.to_string();
            if new_line.contains('\u{2500}') {
                new_line = new_line.replace('\u{2500}', "--");
            }
            if new_line.contains('\u{0301}') {
                new_line = COMBINING_ACUTE
                    .replace_all(&new_line, |caps: &Captures| {
                        let c = &caps[1];
                        if c.chars().next().is_some_and(char::is_alphabetic) {
                            format!("\\'{{{c}}}")
                        } else {
                            caps[0].to_string()
                        }
                    })
                    .into_owned();
            }
            if new_line != line {
                fixed += 1;
            }
            new_line
        })
        .collect();
    if fixed > 0 {
        fs::write(path, lines.join("\n"))?;
        info!(fixed, file = %path.display(), "fixed problematic Unicode characters");
    }
    Ok(fixed)
}

/// Converts HTML entities to their LaTeX equivalents and escapes bare `&`
/// characters inside brace-delimited values. Returns the number of fixes.
///
/// # Errors
///
/// Returns an error if the file cannot be read or written back.
pub fn fix_html_entities(path: &Path) -> Result<usize> {
    let mut content = fs::read_to_string(path)?;
    let mut fixed = 0;
    for (entity, replacement) in ENTITY_REPLACEMENTS {
        let count = content.matches(entity).count();
        if count > 0 {
            content = content.replace(entity, replacement);
            fixed += count;
        }
    }
    let (content, escaped) = escape_bare_ampersands(&content);
    fixed += escaped;
    if fixed > 0 {
        fs::write(path, content)?;
        info!(fixed, file = %path.display(), "fixed HTML entities and unescaped ampersands");
    }
    Ok(fixed)
}

fn escape_bare_ampersands(content: &str) -> (String, usize) {
    let mut out = String::with_capacity(content.len());
    let mut fixed = 0;
    let mut depth: i64 = 0;
    let mut backslashes = 0usize;
    for c in content.chars() {
        match c {
            '{' => {
                depth += 1;
                backslashes = 0;
            }
            '}' => {
                depth -= 1;
                backslashes = 0;
            }
            '\\' => backslashes += 1,
            '&' => {
                if depth > 0 && backslashes % 2 == 0 {
                    out.push('\\');
                    fixed += 1;
                }
                backslashes = 0;
            }
            _ => backslashes = 0,
        }
        out.push(c);
    }
    (out, fixed)
}

/// Restores entries that the formatter commented out.
///
/// The formatter wraps entries it cannot parse in `@comment{...}`. This
/// pass unwraps them and rebalances braces so the entry parses again.
/// Returns the number of entries restored.
///
/// # Errors
///
/// Returns an error if the file cannot be read or written back.
pub fn uncomment_entries(path: &Path) -> Result<usize> {
    let content = fs::read_to_string(path)?;
    if !content.contains("@comment{") {
        return Ok(0);
    }
    let (restored, count) = unwrap_commented_entries(&content);
    if count > 0 {
        fs::write(path, restored)?;
        info!(count, file = %path.display(), "uncommented entries");
    }
    Ok(count)
}

fn unwrap_commented_entries(content: &str) -> (String, usize) {
    const MARKER: &str = "@comment{";
    let mut out = String::with_capacity(content.len());
    let mut rest = content;
    let mut count = 0;
    while let Some(start) = rest.find(MARKER) {
        let after = &rest[start + MARKER.len()..];
        if !after.trim_start().starts_with('@') {
            // a genuine comment, not a wrapped entry
            out.push_str(&rest[..start + MARKER.len()]);
            rest = after;
            continue;
        }
        out.push_str(&rest[..start]);
        let mut depth = 1i32;
        let mut end = None;
        for (i, c) in after.char_indices() {
            match c {
                '{' => depth += 1,
                '}' => {
                    depth -= 1;
                    if depth == 0 {
                        end = Some(i);
                        break;
                    }
                }
                _ => {}
            }
        }
        let inner = match end {
            Some(i) => &after[..i],
            None => after,
        };
        out.push_str(&rebalance_braces(inner.trim()));
        out.push('\n');
        count += 1;
        rest = match end {
            Some(i) => &after[i + 1..],
            None => "",
        };
    }
    out.push_str(rest);
    (out, count)
}

fn rebalance_braces(entry: &str) -> String {
    let mut fixed = entry.trim_end().to_string();
    let open = fixed.matches('{').count();
    let close = fixed.matches('}').count();
    if open > close {
        for _ in 0..(open - close) {
            fixed.push('\n');
            fixed.push('}');
        }
    } else if close > open {
        let mut excess = close - open;
        while excess > 0 && fixed.ends_with('}') {
            fixed.pop();
            while fixed.ends_with(char::is_whitespace) {
                fixed.pop();
            }
            excess -= 1;
        }
    }
    fixed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Entry;
    use pretty_assertions::assert_eq;

    fn entry(key: &str, fields: &[(&str, &str)]) -> Entry {
        let mut e = Entry::new("article", key);
        for (name, value) in fields {
            e.set(*name, *value);
        }
        e
    }

    fn file_of(fields: &[(&str, &str)]) -> BibFile {
        BibFile::from_entries("test.bib", vec![entry("K", fields)])
    }

    #[test]
    fn test_escape_percents() {
        assert_eq!(escape_percents("50% of cases"), "50\\% of cases");
        assert_eq!(escape_percents("already \\% fine"), "already \\% fine");
        assert_eq!(escape_percents("odd \\\\% double"), "odd \\\\\\% double");
        assert_eq!(escape_percents("no percent"), "no percent");
    }

    #[test]
    fn test_fix_unescaped_percent_counts_fields() {
        let mut file = file_of(&[("title", "90% done"), ("note", "all fine")]);
        assert_eq!(fix_unescaped_percent(&mut file), 1);
        assert_eq!(file.entries()[0].get("title"), Some("90\\% done"));
        // idempotent
        assert_eq!(fix_unescaped_percent(&mut file), 0);
    }

    #[test]
    fn test_remove_accents_unwraps_macros_and_marks() {
        let mut file = file_of(&[
            ("author", "M\\\"{u}ller, Hans and Garc\u{ED}a, Ana"),
            ("title", "Unaccented"),
        ]);
        let fixed = remove_accents_from_names(&mut file);
        assert_eq!(fixed, 1);
        assert_eq!(
            file.entries()[0].get("author"),
            Some("Muller, Hans and Garcia, Ana")
        );
    }

    #[test]
    fn test_fix_malformed_author_backslash_runs() {
        let mut file = file_of(&[("author", "Do\\\\\\\\e, John and Smith\\\\\\\\, A")]);
        let fixed = fix_malformed_author_fields(&mut file);
        assert_eq!(fixed, 1);
        assert_eq!(
            file.entries()[0].get("author"),
            Some("Do{\\\"u}e, John and Smith\\, A")
        );
    }

    #[test]
    fn test_fix_malformed_author_unicode_to_latex() {
        let mut file = file_of(&[("author", "Kowalczyk, Michał")]);
        fix_malformed_author_fields(&mut file);
        assert_eq!(
            file.entries()[0].get("author"),
            Some("Kowalczyk, Micha\\l{}")
        );
    }

    #[test]
    fn test_fix_legacy_year_fields() {
        let mut file = file_of(&[("year", "2020-01-15")]);
        assert_eq!(fix_legacy_year_fields(&mut file), 1);
        assert_eq!(file.entries()[0].get("year"), Some("2020"));

        let mut plain = file_of(&[("year", "2020")]);
        assert_eq!(fix_legacy_year_fields(&mut plain), 0);
    }

    #[test]
    fn test_fix_legacy_month_fields() {
        let mut file = file_of(&[("month", "Sept")]);
        assert_eq!(fix_legacy_month_fields(&mut file), 1);
        assert_eq!(file.entries()[0].get("month"), Some("9"));

        let mut numeric = file_of(&[("month", "9")]);
        assert_eq!(fix_legacy_month_fields(&mut numeric), 0);
    }

    #[test]
    fn test_normalize_keyword_fields() {
        let mut file = file_of(&[("keywords", " Alpha, Beta ,gamma")]);
        assert_eq!(normalize_keyword_fields(&mut file), 1);
        assert_eq!(file.entries()[0].get("keywords"), Some("alpha,beta,gamma"));
    }

    #[test]
    fn test_abbreviate_journal_names_exact_match_only() {
        let mut table = AbbreviationTable::new();
        table.insert("Journal of Testing", "J. Test.");
        let mut file = BibFile::from_entries(
            "test.bib",
            vec![
                entry("K1", &[("journal", "Journal of Testing")]),
                entry("K2", &[("journal", "Obscure Quarterly")]),
            ],
        );

        assert_eq!(abbreviate_journal_names(&mut file, &table), 1);
        assert_eq!(file.entries()[0].get("journal"), Some("J. Test."));
        assert_eq!(file.entries()[1].get("journal"), Some("Obscure Quarterly"));
    }

    #[test]
    fn test_fix_invalid_utf8_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("raw.bib");
        let mut bytes = b"@article{K,\n  author = {Lo".to_vec();
        bytes.extend_from_slice(b"\\\\\xcc\x88");
        bytes.extend_from_slice(b"c},\n}\n");
        std::fs::write(&path, &bytes).unwrap();

        let fixed = fix_invalid_utf8_bytes(&path).unwrap();
        assert_eq!(fixed, 1);
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("Lo\\\"c"), "got: {content}");
    }

    #[test]
    fn test_fix_problematic_unicode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("u.bib");
        std::fs::write(
            &path,
            "@article{K,\n  title = {pages 1\u{2500}2},\n  author = {Garci\u{0301}a},\n}\n",
        )
        .unwrap();

        let fixed = fix_problematic_unicode(&path).unwrap();
        assert_eq!(fixed, 2);
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("pages 1--2"));
        assert!(content.contains("Garc\\'{i}a"));
    }

    #[test]
    fn test_fix_html_entities() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("h.bib");
        std::fs::write(
            &path,
            "@article{K,\n  title = {Salt &amp; Pepper & More},\n}\n",
        )
        .unwrap();

        let fixed = fix_html_entities(&path).unwrap();
        assert_eq!(fixed, 2);
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("Salt \\& Pepper \\& More"));
    }

    #[test]
    fn test_uncomment_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.bib");
        std::fs::write(
            &path,
            "@article{Good,\n  title = {Fine},\n}\n@comment{@article{Hidden,\n  title = {Recovered},\n}}\n",
        )
        .unwrap();

        let count = uncomment_entries(&path).unwrap();
        assert_eq!(count, 1);
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(!content.contains("@comment{"));
        assert!(content.contains("@article{Hidden,"));

        // a second run is a no-op
        assert_eq!(uncomment_entries(&path).unwrap(), 0);
    }

    #[test]
    fn test_uncomment_leaves_plain_comments() {
        let (out, count) = unwrap_commented_entries("@comment{just prose}\n@article{K,\n}\n");
        assert_eq!(count, 0);
        assert_eq!(out, "@comment{just prose}\n@article{K,\n}\n");
    }

    #[test]
    fn test_rebalance_braces() {
        assert_eq!(rebalance_braces("@article{K,"), "@article{K,\n}");
        assert_eq!(rebalance_braces("@article{K,\n}}"), "@article{K,\n}");
        assert_eq!(rebalance_braces("@article{K,\n}"), "@article{K,\n}");
    }
}
