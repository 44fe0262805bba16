//! Citation-key hygiene: sanitization and standardization.
//!
//! Both operations mutate the entry store in place and return the rename
//! mapping the caller must propagate into `.tex` sources. Neither
//! persists; the workflow layer writes the file once per step.

use std::collections::HashSet;
use std::sync::LazyLock;

use crate::normalize::normalize_unicode;
use crate::regex::Regex;
use crate::{BibFile, Entry, RenameMap};

static INVALID_KEY_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^A-Za-z0-9_:\-]+").unwrap());

/// Removes problematic characters from every citation key in `file`.
///
/// Characters outside `[A-Za-z0-9_:-]` are stripped. A key that would
/// become empty is left alone. Returns normalized-old-key to new-key
/// pairs for the keys that changed.
pub fn sanitize_citation_keys(file: &mut BibFile) -> RenameMap {
    let mut mapping = RenameMap::new();
    for entry in file.entries_mut() {
        let Some(original) = normalize_unicode(&entry.key) else {
            continue;
        };
        let sanitized = INVALID_KEY_CHARS.replace_all(&original, "").into_owned();
        if !sanitized.is_empty() && sanitized != original {
            entry.key = sanitized.clone();
            mapping.insert(original, sanitized);
        }
    }
    mapping
}

/// Builds a key in `AuthorYearJournalInitialsFirstTitleWord` form.
///
/// Missing fields simply contribute nothing. A key that would start with
/// a non-letter is prefixed with `k` so BibTeX accepts it.
#[must_use]
pub fn generate_citation_key(entry: &Entry) -> String {
    let author = entry.get("author").unwrap_or_default();
    let last: String = if author.is_empty() {
        String::new()
    } else {
        let first_author = author.split(" and ").next().unwrap_or_default().trim();
        let surname = if first_author.contains(',') {
            first_author.split(',').next().unwrap_or_default()
        } else {
            first_author.split_whitespace().last().unwrap_or_default()
        };
        surname.chars().filter(char::is_ascii_alphabetic).collect()
    };

    let year: String = entry
        .get("year")
        .unwrap_or_default()
        .chars()
        .filter(char::is_ascii_digit)
        .collect();

    let journal_initials: String = entry
        .get("journal")
        .unwrap_or_default()
        .split_whitespace()
        .filter_map(|word| word.chars().next())
        .filter(|c| c.is_alphabetic())
        .collect();

    let first_title_word: String = entry
        .get("title")
        .unwrap_or_default()
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .collect();

    let key = format!("{last}{year}{journal_initials}{first_title_word}");
    match key.chars().next() {
        Some(first) if !first.is_alphabetic() => format!("k{key}"),
        _ => key,
    }
}

/// Assigns canonical keys to every entry in `file`.
///
/// Keys already in canonical form are kept; collisions with keys already
/// assigned in this file are avoided by appending a counter. Returns
/// normalized-old-key to new-key pairs for the keys that changed.
pub fn standardize_citation_keys(file: &mut BibFile) -> RenameMap {
    let mut mapping = RenameMap::new();
    let mut used: HashSet<String> = HashSet::new();

    for entry in file.entries_mut() {
        let Some(current) = normalize_unicode(&entry.key) else {
            continue;
        };
        let candidate = generate_citation_key(entry);
        if candidate.is_empty() || candidate == current {
            used.insert(current);
            continue;
        }
        let mut new_key = candidate.clone();
        let mut counter = 1;
        while used.contains(&new_key) {
            new_key = format!("{candidate}{counter}");
            counter += 1;
        }
        entry.key = new_key.clone();
        mapping.insert(current, new_key.clone());
        used.insert(new_key);
    }
    mapping
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn entry(key: &str, fields: &[(&str, &str)]) -> Entry {
        let mut e = Entry::new("article", key);
        for (name, value) in fields {
            e.set(*name, *value);
        }
        e
    }

    #[test]
    fn test_sanitize_strips_invalid_characters() {
        let mut file = BibFile::from_entries(
            "test.bib",
            vec![
                entry("We/ird{Key}2020", &[("title", "T")]),
                entry("Fine_Key:2020", &[("title", "T2")]),
            ],
        );

        let mapping = sanitize_citation_keys(&mut file);

        assert_eq!(
            mapping.get("We/ird{Key}2020"),
            Some(&"WeirdKey2020".to_string())
        );
        assert_eq!(mapping.len(), 1);
        assert_eq!(file.entries()[0].key, "WeirdKey2020");
        assert_eq!(file.entries()[1].key, "Fine_Key:2020");
    }

    #[test]
    fn test_generate_citation_key_shapes() {
        let e = entry(
            "x",
            &[
                ("author", "Smith, John and Doe, Jane"),
                ("year", "2020"),
                ("journal", "Journal of Testing"),
                ("title", "Deep results on testing"),
            ],
        );
        assert_eq!(generate_citation_key(&e), "Smith2020JoTDeep");
    }

    #[test]
    fn test_generate_citation_key_without_comma_author() {
        let e = entry("x", &[("author", "John Smith"), ("year", "c. 2019")]);
        assert_eq!(generate_citation_key(&e), "Smith2019");
    }

    #[test]
    fn test_generate_citation_key_numeric_start() {
        let e = entry("x", &[("year", "1999"), ("title", "42 things")]);
        assert_eq!(generate_citation_key(&e), "k199942");
    }

    #[test]
    fn test_standardize_resolves_collisions() {
        let mut file = BibFile::from_entries(
            "test.bib",
            vec![
                entry("a1", &[("author", "Smith, J"), ("year", "2020"), ("title", "One")]),
                entry("a2", &[("author", "Smith, J"), ("year", "2020"), ("title", "One")]),
            ],
        );

        let mapping = standardize_citation_keys(&mut file);

        assert_eq!(file.entries()[0].key, "Smith2020One");
        assert_eq!(file.entries()[1].key, "Smith2020One1");
        assert_eq!(mapping.get("a1"), Some(&"Smith2020One".to_string()));
        assert_eq!(mapping.get("a2"), Some(&"Smith2020One1".to_string()));
    }

    #[test]
    fn test_standardize_keeps_canonical_keys() {
        let mut file = BibFile::from_entries(
            "test.bib",
            vec![entry(
                "Smith2020One",
                &[("author", "Smith, J"), ("year", "2020"), ("title", "One")],
            )],
        );

        let mapping = standardize_citation_keys(&mut file);
        assert!(mapping.is_empty());
        assert_eq!(file.entries()[0].key, "Smith2020One");
    }
}
