//! A library for curating and validating BibTeX bibliography databases.
//!
//! `bibcurate` reconciles citation keys between LaTeX sources and their
//! `.bib` databases. It focuses on accurate duplicate resolution, repair of
//! malformed text, and safe orchestration of external formatting tools.
//!
//! # Key Features
//!
//! - **Duplicate Resolution**:
//!   - Same-key synchronization across files
//!   - DOI-based consolidation with citation-key scoring
//!   - Normalized-title consolidation
//!   - Deterministic, documented tie-breaks
//!
//! - **Citation Reconciliation**:
//!   - Extraction of `\cite`-style commands from `.tex` sources
//!   - Key-rename propagation with in-command de-duplication
//!   - Unused-entry pruning that protects `crossref` targets
//!
//! - **Repair Passes**:
//!   - Invalid UTF-8 byte sequences and problematic Unicode
//!   - HTML entities and unescaped `%` / `&`
//!   - Legacy year/month fields, malformed author fields
//!   - Journal-name abbreviation from a bundled table
//!
//! # Basic Usage
//!
//! ```no_run
//! use bibcurate::{BibFile, dedupe};
//!
//! let mut files = vec![
//!     BibFile::read("sections/intro.bib").unwrap(),
//!     BibFile::read("sections/methods.bib").unwrap(),
//! ];
//!
//! // Entries sharing a DOI under different keys collapse onto one key;
//! // the returned mapping drives `.tex` rewriting.
//! let renames = dedupe::consolidate_duplicate_dois(&mut files);
//! for (old, new) in &renames {
//!     println!("{old} -> {new}");
//! }
//! ```
//!
//! # Error Handling
//!
//! The library uses a custom [`Result`] type that wraps [`CurationError`].
//! Per-file failures (unparsable input, failed writes) are handled at the
//! file granularity by the workflow layer and never abort a whole run.
//!
//! # Thread Safety
//!
//! The curation pipeline is single-threaded by design: the three
//! duplicate-resolution passes mutate a shared rename mapping and must
//! observe each other's completed file state.

use std::path::PathBuf;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

extern crate csv as csv_crate;

pub mod abbrev;
pub mod bibfile;
pub mod curate;
pub mod dedupe;
pub mod fixes;
pub mod keys;
pub mod normalize;
pub mod project;
mod regex;
pub mod tex;
pub mod tools;
pub mod validate;

// Reexports
pub use abbrev::AbbreviationTable;
pub use bibfile::BibFile;
pub use curate::{CurateOptions, curate_bibliography};
pub use tools::{ToolOutcome, Toolchain};
pub use validate::{Issue, ValidationReport};

/// A specialized Result type for curation operations.
pub type Result<T> = std::result::Result<T, CurationError>;

/// Accumulated old-key to new-key mapping produced by consolidation passes.
///
/// Keys are normalized old citation keys; values are the replacement keys
/// exactly as they appear in the winning entries. The map is append-only
/// within one curation run: a key renamed by an earlier pass is never
/// redirected to a different target by a later one.
pub type RenameMap = std::collections::BTreeMap<String, String>;

/// Represents errors that can occur while curating bibliographies.
#[derive(Error, Debug)]
pub enum CurationError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("parse error in {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("error writing {path}: {message}")]
    Write { path: PathBuf, message: String },

    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("no bibliography files found")]
    NoBibliographies,
}

impl From<csv_crate::Error> for CurationError {
    fn from(err: csv_crate::Error) -> Self {
        CurationError::InvalidData(err.to_string())
    }
}

/// A single bibliographic record: a citation key, an entry type, and an
/// ordered field map.
///
/// Field names are lowercase after parsing; values are plain strings with
/// the brace markup already resolved. The key is stored outside the field
/// map and is the identifier both for in-file uniqueness and for `.tex`
/// citation commands.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    /// Citation key, unique within the owning file.
    pub key: String,
    /// Entry type (`article`, `book`, ...); not interpreted by the engine.
    pub entry_type: String,
    /// Field name to value, in serialization order.
    pub fields: IndexMap<String, String>,
}

impl Entry {
    /// Creates an empty entry of the given type under the given key.
    #[must_use]
    pub fn new(entry_type: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            entry_type: entry_type.into(),
            fields: IndexMap::new(),
        }
    }

    /// Returns the value of `field`, if present.
    #[must_use]
    pub fn get(&self, field: &str) -> Option<&str> {
        self.fields.get(field).map(String::as_str)
    }

    /// Sets `field` to `value`, inserting or overwriting.
    pub fn set(&mut self, field: impl Into<String>, value: impl Into<String>) {
        self.fields.insert(field.into(), value.into());
    }

    /// Removes `field` and returns its previous value.
    pub fn remove(&mut self, field: &str) -> Option<String> {
        self.fields.shift_remove(field)
    }

    /// Number of fields present on the entry.
    #[must_use]
    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    /// Returns true if `field` is present with a non-empty value.
    #[must_use]
    pub fn has(&self, field: &str) -> bool {
        self.get(field).is_some_and(|v| !v.is_empty())
    }
}
