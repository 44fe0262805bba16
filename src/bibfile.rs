//! Entry store: one bibliography file loaded into a mutable entry list.
//!
//! Parsing is delegated to the `biblatex` crate; serialization is done
//! here so the on-disk field order stays stable across runs. Writing goes
//! through a temporary file plus rename to avoid partial writes on crash.
//!
//! # Example
//!
//! ```no_run
//! use bibcurate::BibFile;
//!
//! let mut file = BibFile::read("references.bib").unwrap();
//! if let Some(entry) = file.entries_mut().first_mut() {
//!     entry.set("year", "2024");
//! }
//! file.write().unwrap();
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use biblatex::{Bibliography, ChunksExt};
use indexmap::IndexMap;

use crate::normalize::normalize_unicode;
use crate::{CurationError, Entry, Result};

/// Common fields serialized first, in this order. Anything else follows in
/// the order it is stored on the entry.
const DISPLAY_ORDER: [&str; 10] = [
    "title",
    "author",
    "journal",
    "year",
    "volume",
    "number",
    "pages",
    "doi",
    "url",
    "publisher",
];

/// A bibliography file and its parsed entries, in document order.
#[derive(Debug, Clone)]
pub struct BibFile {
    path: PathBuf,
    entries: Vec<Entry>,
}

impl BibFile {
    /// Loads and parses a bibliography file.
    ///
    /// # Errors
    ///
    /// Returns [`CurationError::Parse`] when the file cannot be read or its
    /// syntax cannot be interpreted. Callers in the curation workflow treat
    /// both the same way: skip the file and continue.
    pub fn read(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let content = fs::read_to_string(&path).map_err(|err| CurationError::Parse {
            path: path.clone(),
            message: err.to_string(),
        })?;
        let bibliography =
            Bibliography::parse(&content).map_err(|err| CurationError::Parse {
                path: path.clone(),
                message: err.to_string(),
            })?;
        let entries = bibliography.iter().map(convert_entry).collect();
        Ok(Self { path, entries })
    }

    /// Builds a store from already-constructed entries, mostly for tests
    /// and for callers that assemble bibliographies programmatically.
    #[must_use]
    pub fn from_entries(path: impl Into<PathBuf>, entries: Vec<Entry>) -> Self {
        Self {
            path: path.into(),
            entries,
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn entries_mut(&mut self) -> &mut Vec<Entry> {
        &mut self.entries
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Removes and returns the entry at `index`.
    pub fn remove_entry(&mut self, index: usize) -> Entry {
        self.entries.remove(index)
    }

    /// Keeps only the entries for which `keep` returns true.
    pub fn retain_entries(&mut self, keep: impl FnMut(&Entry) -> bool) {
        self.entries.retain(keep);
    }

    /// Index of the first entry whose normalized key equals `normalized_key`.
    #[must_use]
    pub fn position_of_key(&self, normalized_key: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| normalize_unicode(&e.key).as_deref() == Some(normalized_key))
    }

    /// Applies `transform` to every field value of every entry.
    ///
    /// The transform returns `Some(new_value)` to replace a value and
    /// `None` to leave it untouched. Returns the number of fields changed.
    pub fn transform_fields(&mut self, transform: impl Fn(&str) -> Option<String>) -> usize {
        let mut changed = 0;
        for entry in &mut self.entries {
            for value in entry.fields.values_mut() {
                if let Some(replacement) = transform(value)
                    && replacement != *value
                {
                    *value = replacement;
                    changed += 1;
                }
            }
        }
        changed
    }

    /// Serializes the entries back to the file.
    ///
    /// Writes to a sibling temporary file first, then renames it over the
    /// target, so a crash mid-write cannot leave a truncated bibliography.
    ///
    /// # Errors
    ///
    /// Returns [`CurationError::Write`] on any I/O failure.
    pub fn write(&self) -> Result<()> {
        let rendered = self.render();
        let tmp = self.path.with_extension("bib.tmp");
        fs::write(&tmp, rendered)
            .and_then(|()| fs::rename(&tmp, &self.path))
            .map_err(|err| CurationError::Write {
                path: self.path.clone(),
                message: err.to_string(),
            })
    }

    /// Renders all entries to BibTeX source.
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::new();
        for entry in &self.entries {
            out.push_str(&render_entry(entry));
            out.push('\n');
        }
        out
    }
}

fn convert_entry(entry: &biblatex::Entry) -> Entry {
    let mut fields = IndexMap::with_capacity(entry.fields.len());
    for (name, chunks) in &entry.fields {
        fields.insert(name.clone(), chunks.format_verbatim());
    }
    Entry {
        key: entry.key.clone(),
        entry_type: entry.entry_type.to_string().to_lowercase(),
        fields,
    }
}

fn render_entry(entry: &Entry) -> String {
    let mut out = format!("@{}{{{},\n", entry.entry_type, entry.key);
    for name in DISPLAY_ORDER {
        if let Some(value) = entry.get(name) {
            render_field(&mut out, name, value);
        }
    }
    for (name, value) in &entry.fields {
        if !DISPLAY_ORDER.contains(&name.as_str()) {
            render_field(&mut out, name, value);
        }
    }
    out.push_str("}\n");
    out
}

fn render_field(out: &mut String, name: &str, value: &str) {
    out.push_str("  ");
    out.push_str(name);
    out.push_str(" = {");
    out.push_str(value);
    out.push_str("},\n");
}
