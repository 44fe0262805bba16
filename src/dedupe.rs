//! Duplicate-resolution engine.
//!
//! A module for reconciling bibliography entries that refer to the same
//! work across multiple files. Three equivalence relations are checked
//! independently and sequentially:
//!
//! 1. **Key equality**: the same normalized citation key in more than one
//!    place; resolved by synchronizing content onto the most complete
//!    entry ([`synchronize_duplicates`]).
//! 2. **DOI equality**: the same normalized DOI under different keys;
//!    resolved by electing a canonical key and entry
//!    ([`consolidate_duplicate_dois`]).
//! 3. **Title equality**: the same normalized title; resolved by keeping
//!    the most complete entry under its own key
//!    ([`consolidate_duplicate_titles`]).
//!
//! An entry resolved by an earlier pass is not reconsidered by a later
//! pass under its original key. The DOI and title passes emit a rename
//! mapping that the caller must propagate into `.tex` sources before the
//! next pass begins.
//!
//! Two coarser cleanups run ahead of the passes in the standard workflow:
//! [`remove_unused_entries`] (prunes entries never cited and never named
//! as a `crossref` target) and [`remove_duplicate_entries_across_files`]
//! (keeps one copy of a key, in the alphabetically-first file).
//!
//! ## Scoring
//!
//! Entry completeness is scored by counting the important fields (title,
//! author, year, journal, doi, pages, volume) plus a tenth of a point per
//! field present; ties go to the first entry seen. Candidate keys in DOI
//! groups are scored structurally (`Smith2020` shapes win); ties go to the
//! lexicographically smallest key so runs are deterministic.
//!
//! ## Failure semantics
//!
//! All passes are best-effort: a file that fails to persist is logged and
//! the remaining files are still written. No pass is transactional across
//! files.
//!
//! ## Usage
//!
//! ```no_run
//! use bibcurate::{BibFile, dedupe, tex};
//!
//! let mut files = vec![BibFile::read("references.bib").unwrap()];
//!
//! dedupe::synchronize_duplicates(&mut files);
//! let renames = dedupe::consolidate_duplicate_dois(&mut files);
//! tex::update_tex_citations(&[std::path::PathBuf::from("main.tex")], &renames);
//! ```

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::LazyLock;

use itertools::Itertools;
use tracing::{debug, info, warn};

use crate::normalize::{normalize_doi, normalize_title, normalize_unicode};
use crate::regex::Regex;
use crate::{BibFile, Entry, RenameMap};

/// Fields counted as whole points by [`score_entry`].
const IMPORTANT_FIELDS: [&str; 7] = [
    "title", "author", "year", "journal", "doi", "pages", "volume",
];

/// `Smith2020`-shaped keys: uppercase letter, lowercase letters, then four
/// digits. A prefix match by design, so `Smith2020long` also qualifies.
static WELL_FORMED_KEY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Z][a-z]+\d{4}").unwrap());

/// A position inside a set of bibliography files: (file index, entry index).
type Occurrence = (usize, usize);

/// Scores an entry by completeness.
///
/// One point per non-empty important field, plus 0.1 per field present, so
/// that among equally-complete entries the one carrying more metadata
/// wins.
#[must_use]
pub fn score_entry(entry: &Entry) -> f64 {
    let important = IMPORTANT_FIELDS.iter().filter(|f| entry.has(f)).count();
    important as f64 + 0.1 * entry.field_count() as f64
}

/// Scores a citation key by shape.
///
/// Uppercase first letter, a `Name2020` prefix, and the absence of
/// underscores are favoured; longer keys pay a small penalty.
#[must_use]
pub fn score_key(key: &str) -> f64 {
    let mut score = 0.0;
    if key.chars().next().is_some_and(char::is_uppercase) {
        score += 10.0;
    }
    if WELL_FORMED_KEY.is_match(key) {
        score += 20.0;
    }
    if !key.contains('_') {
        score += 5.0;
    }
    score - 0.1 * key.chars().count() as f64
}

/// The highest-scoring entry among `entries`; ties go to the first seen.
fn best_entry<'a>(entries: impl IntoIterator<Item = &'a Entry>) -> Option<&'a Entry> {
    let mut best: Option<(&Entry, f64)> = None;
    for entry in entries {
        let score = score_entry(entry);
        if best.is_none_or(|(_, top)| score > top) {
            best = Some((entry, score));
        }
    }
    best.map(|(entry, _)| entry)
}

/// The highest-scoring key among `keys`; ties go to the lexicographically
/// smallest, making the winner independent of iteration order.
fn best_key<'a>(keys: impl IntoIterator<Item = &'a str>) -> Option<String> {
    let mut best: Option<(&str, f64)> = None;
    for key in keys.into_iter().sorted() {
        let score = score_key(key);
        if best.is_none_or(|(_, top)| score > top) {
            best = Some((key, score));
        }
    }
    best.map(|(key, _)| key.to_string())
}

fn entry_at<'a>(files: &'a [BibFile], (fi, ei): Occurrence) -> &'a Entry {
    &files[fi].entries()[ei]
}

/// Persists every touched file, logging write failures without aborting.
fn write_files(files: &[BibFile], touched: &BTreeSet<usize>) {
    for &fi in touched {
        if let Err(err) = files[fi].write() {
            warn!(%err, "failed to persist bibliography");
        }
    }
}

/// Maps each normalized citation key that occurs in more than one
/// (file, entry) position to its occurrences, in file then entry order.
#[must_use]
pub fn find_duplicates(files: &[BibFile]) -> BTreeMap<String, Vec<Occurrence>> {
    let mut map: BTreeMap<String, Vec<Occurrence>> = BTreeMap::new();
    for (fi, file) in files.iter().enumerate() {
        for (ei, entry) in file.entries().iter().enumerate() {
            if let Some(key) = normalize_unicode(&entry.key) {
                map.entry(key).or_default().push((fi, ei));
            }
        }
    }
    map.retain(|_, occurrences| occurrences.len() > 1);
    map
}

/// Pass 1: same-key consolidation.
///
/// For every key occurring more than once, the most complete entry wins
/// and every occurrence is overwritten with a copy of it, preserving each
/// occurrence's original key string. No renames are produced; this pass
/// only synchronizes content. Modified files are persisted. Returns the
/// number of synchronized keys.
pub fn synchronize_duplicates(files: &mut [BibFile]) -> usize {
    let duplicates = find_duplicates(files);
    if duplicates.is_empty() {
        return 0;
    }
    let mut touched = BTreeSet::new();
    for (key, occurrences) in &duplicates {
        let Some(winner) = best_entry(occurrences.iter().map(|&occ| entry_at(files, occ))) else {
            continue;
        };
        let winner = winner.clone();
        info!(key = %key, copies = occurrences.len(), "synchronizing duplicate key");
        for &(fi, ei) in occurrences {
            let entry = &mut files[fi].entries_mut()[ei];
            let mut replacement = winner.clone();
            replacement.key = entry.key.clone();
            if *entry != replacement {
                *entry = replacement;
                touched.insert(fi);
            }
        }
    }
    write_files(files, &touched);
    duplicates.len()
}

/// Maps each normalized DOI shared by more than one distinct normalized
/// key to its occurrences.
#[must_use]
pub fn find_duplicate_dois(files: &[BibFile]) -> BTreeMap<String, Vec<Occurrence>> {
    let mut map: BTreeMap<String, Vec<Occurrence>> = BTreeMap::new();
    for (fi, file) in files.iter().enumerate() {
        for (ei, entry) in file.entries().iter().enumerate() {
            let Some(doi) = entry.get("doi").and_then(normalize_doi) else {
                continue;
            };
            map.entry(doi).or_default().push((fi, ei));
        }
    }
    map.retain(|_, occurrences| {
        occurrences
            .iter()
            .filter_map(|&occ| normalize_unicode(&entry_at(files, occ).key))
            .unique()
            .count()
            > 1
    });
    map
}

/// Pass 2: DOI consolidation.
///
/// Entries sharing a DOI under different keys collapse onto a single
/// elected key and a single most-complete entry. Every touched file ends
/// up with exactly one instance under the winning key; all other group
/// members are deleted. Returns the old-key to new-key mapping for the
/// caller to propagate into `.tex` sources.
pub fn consolidate_duplicate_dois(files: &mut [BibFile]) -> RenameMap {
    let groups = find_duplicate_dois(files);
    let mut mapping = RenameMap::new();
    if groups.is_empty() {
        return mapping;
    }

    // Elect winners up front: group members are disjoint across DOIs, so
    // later mutations cannot change a group's scoring inputs.
    struct Plan {
        doi: String,
        winner_key: String,
        canonical: Entry,
        old_keys: Vec<String>,
        file_indices: BTreeSet<usize>,
    }
    let mut plans = Vec::with_capacity(groups.len());
    for (doi, occurrences) in &groups {
        let distinct_keys: Vec<String> = occurrences
            .iter()
            .filter_map(|&occ| normalize_unicode(&entry_at(files, occ).key))
            .unique()
            .collect();
        let Some(winner_key) = best_key(distinct_keys.iter().map(String::as_str)) else {
            continue;
        };
        let Some(winner) = best_entry(occurrences.iter().map(|&occ| entry_at(files, occ)))
        else {
            continue;
        };
        let mut canonical = winner.clone();
        canonical.key = winner_key.clone();
        plans.push(Plan {
            doi: doi.clone(),
            winner_key,
            canonical,
            old_keys: distinct_keys,
            file_indices: occurrences.iter().map(|&(fi, _)| fi).collect(),
        });
    }

    let mut touched = BTreeSet::new();
    for plan in plans {
        info!(doi = %plan.doi, key = %plan.winner_key, "consolidating duplicate DOI");
        for old in &plan.old_keys {
            if *old != plan.winner_key {
                mapping
                    .entry(old.clone())
                    .or_insert_with(|| plan.winner_key.clone());
            }
        }
        for &fi in &plan.file_indices {
            let file = &mut files[fi];
            // Re-derive membership by DOI: earlier groups may have shifted
            // entry indices through deletions.
            let members: Vec<usize> = file
                .entries()
                .iter()
                .enumerate()
                .filter(|(_, e)| {
                    e.get("doi").and_then(normalize_doi).as_deref() == Some(plan.doi.as_str())
                })
                .map(|(i, _)| i)
                .collect();
            if members.is_empty() {
                continue;
            }
            let keeper = match file.position_of_key(&plan.winner_key) {
                Some(existing) => {
                    file.entries_mut()[existing] = plan.canonical.clone();
                    existing
                }
                None => {
                    let first = members[0];
                    file.entries_mut()[first] = plan.canonical.clone();
                    first
                }
            };
            let mut to_delete: Vec<usize> =
                members.iter().copied().filter(|&i| i != keeper).collect();
            to_delete.sort_unstable();
            for index in to_delete.into_iter().rev() {
                let dropped = file.remove_entry(index);
                debug!(key = %dropped.key, "removed consolidated entry");
            }
            touched.insert(fi);
        }
    }
    write_files(files, &touched);
    info!(
        groups = groups.len(),
        renames = mapping.len(),
        "consolidated duplicate DOIs"
    );
    mapping
}

/// Pass 3: title consolidation.
///
/// Entries with the same normalized title are duplicates regardless of
/// their keys. The most complete entry wins and keeps its own key; every
/// other group member is deleted and its key recorded in the returned
/// rename mapping.
pub fn consolidate_duplicate_titles(files: &mut [BibFile]) -> RenameMap {
    let mut title_map: BTreeMap<String, Vec<Occurrence>> = BTreeMap::new();
    for (fi, file) in files.iter().enumerate() {
        for (ei, entry) in file.entries().iter().enumerate() {
            let title = normalize_title(entry.get("title").unwrap_or_default());
            if !title.is_empty() {
                title_map.entry(title).or_default().push((fi, ei));
            }
        }
    }
    title_map.retain(|_, occurrences| occurrences.len() > 1);

    let mut mapping = RenameMap::new();
    if title_map.is_empty() {
        debug!("no duplicate titles to consolidate");
        return mapping;
    }

    struct Plan {
        title: String,
        winner_key: String,
        canonical: Entry,
        old_keys: Vec<String>,
        file_indices: BTreeSet<usize>,
    }
    let mut plans = Vec::with_capacity(title_map.len());
    for (title, occurrences) in &title_map {
        let Some(winner) = best_entry(occurrences.iter().map(|&occ| entry_at(files, occ)))
        else {
            continue;
        };
        let canonical = winner.clone();
        let Some(winner_key) = normalize_unicode(&canonical.key) else {
            continue;
        };
        let old_keys: Vec<String> = occurrences
            .iter()
            .filter_map(|&occ| normalize_unicode(&entry_at(files, occ).key))
            .unique()
            .filter(|k| *k != winner_key)
            .collect();
        plans.push(Plan {
            title: title.clone(),
            winner_key,
            canonical,
            old_keys,
            file_indices: occurrences.iter().map(|&(fi, _)| fi).collect(),
        });
    }

    let mut touched = BTreeSet::new();
    for plan in plans {
        info!(title = %plan.title, key = %plan.winner_key, "consolidating duplicate title");
        for old in &plan.old_keys {
            mapping
                .entry(old.clone())
                .or_insert_with(|| plan.canonical.key.clone());
        }
        for &fi in &plan.file_indices {
            let file = &mut files[fi];
            let members: Vec<usize> = file
                .entries()
                .iter()
                .enumerate()
                .filter(|(_, e)| {
                    normalize_title(e.get("title").unwrap_or_default()) == plan.title
                })
                .map(|(i, _)| i)
                .collect();
            if members.is_empty() {
                continue;
            }
            // the first member under the winning key keeps the canonical
            // content; every other member (including surplus same-key
            // copies) is deleted so per-file key uniqueness holds
            let mut kept = false;
            let mut to_delete = Vec::new();
            for &index in &members {
                let is_winner = normalize_unicode(&file.entries()[index].key).as_deref()
                    == Some(plan.winner_key.as_str());
                if is_winner && !kept {
                    file.entries_mut()[index] = plan.canonical.clone();
                    kept = true;
                } else {
                    to_delete.push(index);
                }
            }
            to_delete.sort_unstable();
            for index in to_delete.into_iter().rev() {
                let dropped = file.remove_entry(index);
                debug!(key = %dropped.key, "removed duplicate-title entry");
            }
            touched.insert(fi);
        }
    }
    write_files(files, &touched);
    info!(
        groups = title_map.len(),
        renames = mapping.len(),
        "consolidated duplicate titles"
    );
    mapping
}

/// Deletes entries that are neither cited in the `.tex` corpus nor named
/// as a `crossref` target by any entry.
///
/// `cited` holds the normalized citation keys extracted from every `.tex`
/// source. Crossref targets are collected here so parent entries cited
/// only indirectly survive. Returns the number of entries removed.
pub fn remove_unused_entries(files: &mut [BibFile], cited: &HashSet<String>) -> usize {
    let mut keep = cited.clone();
    for file in files.iter() {
        for entry in file.entries() {
            if let Some(target) = entry.get("crossref").and_then(normalize_unicode) {
                keep.insert(target);
            }
        }
    }

    let mut removed = 0;
    let mut touched = BTreeSet::new();
    for (fi, file) in files.iter_mut().enumerate() {
        let before = file.len();
        file.retain_entries(|entry| {
            normalize_unicode(&entry.key).is_some_and(|key| keep.contains(&key))
        });
        let dropped = before - file.len();
        if dropped > 0 {
            info!(file = %file.path().display(), dropped, "removed unused entries");
            removed += dropped;
            touched.insert(fi);
        }
    }
    write_files(files, &touched);
    removed
}

/// Keeps a single copy of each citation key across a set of files.
///
/// Independent of content: the occurrence in the alphabetically-first file
/// name survives and the copies elsewhere are deleted. Returns the number
/// of entries removed.
pub fn remove_duplicate_entries_across_files(files: &mut [BibFile]) -> usize {
    let mut key_files: BTreeMap<String, BTreeSet<usize>> = BTreeMap::new();
    for (fi, file) in files.iter().enumerate() {
        for entry in file.entries() {
            if let Some(key) = normalize_unicode(&entry.key) {
                key_files.entry(key).or_default().insert(fi);
            }
        }
    }

    let mut removed = 0;
    let mut touched = BTreeSet::new();
    for (key, indices) in &key_files {
        if indices.len() < 2 {
            continue;
        }
        let keeper = *indices
            .iter()
            .min_by_key(|&&fi| files[fi].path().file_name().map(std::ffi::OsStr::to_os_string))
            .expect("non-empty index set");
        for &fi in indices {
            if fi == keeper {
                continue;
            }
            let file = &mut files[fi];
            let before = file.len();
            file.retain_entries(|entry| {
                normalize_unicode(&entry.key).as_deref() != Some(key.as_str())
            });
            removed += before - file.len();
            touched.insert(fi);
        }
        debug!(
            key = %key,
            keeper = %files[keeper].path().display(),
            copies = indices.len() - 1,
            "removed cross-file duplicate"
        );
    }
    write_files(files, &touched);
    if removed > 0 {
        info!(removed, "removed duplicate entries across files");
    }
    removed
}
