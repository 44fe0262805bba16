//! Journal-name abbreviation backed by a bundled lookup table.
//!
//! The table ships as CSV reference data compiled into the binary. It is
//! modelled as an explicitly-constructed, injectable object rather than
//! process-wide mutable state; [`default_table`] provides the documented
//! load-once-at-process-start default.

use std::collections::HashMap;
use std::sync::LazyLock;

use crate::Result;

const BUNDLED_CSV: &str = include_str!("../data/journal_abbreviations.csv");

static DEFAULT_TABLE: LazyLock<AbbreviationTable> = LazyLock::new(|| {
    AbbreviationTable::from_csv(BUNDLED_CSV).expect("bundled abbreviation data is valid")
});

/// Lookup from full journal title to its conventional abbreviation.
///
/// Lookups are case-insensitive on the full title; abbreviations are
/// returned exactly as stored. Callers may extend the table with their
/// own mappings before handing it to the repair pass.
#[derive(Debug, Clone, Default)]
pub struct AbbreviationTable {
    lookup: HashMap<String, String>,
}

impl AbbreviationTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a table from CSV rows of `full name,abbreviation`.
    ///
    /// Rows with fewer than two columns or empty cells are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`crate::CurationError::InvalidData`] if the CSV itself is
    /// malformed.
    pub fn from_csv(data: &str) -> Result<Self> {
        let mut table = Self::new();
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(data.as_bytes());
        for record in reader.records() {
            let record = record?;
            let (Some(full), Some(short)) = (record.get(0), record.get(1)) else {
                continue;
            };
            let (full, short) = (full.trim(), short.trim());
            if !full.is_empty() && !short.is_empty() {
                table.insert(full, short);
            }
        }
        Ok(table)
    }

    /// Adds or replaces a mapping.
    pub fn insert(&mut self, full: &str, abbreviation: &str) {
        self.lookup
            .insert(full.to_lowercase(), abbreviation.to_string());
    }

    /// Looks up the abbreviation for `journal`, case-insensitively.
    #[must_use]
    pub fn abbreviation_for(&self, journal: &str) -> Option<&str> {
        self.lookup.get(&journal.to_lowercase()).map(String::as_str)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lookup.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lookup.is_empty()
    }
}

/// The bundled table, loaded once per process on first use.
#[must_use]
pub fn default_table() -> &'static AbbreviationTable {
    &DEFAULT_TABLE
}
