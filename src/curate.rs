//! High-level curation workflows.
//!
//! [`curate_bibliography`] sequences the per-file repairs, the external
//! tools, the duplicate-resolution engine, and citation propagation:
//!
//! 1. per-file processing (backup, metadata update, repairs, formatting)
//! 2. key hygiene (sanitize, standardize) with immediate `.tex` rewriting
//! 3. unused-entry pruning
//! 4. cross-file same-key copy removal
//! 5. same-key content synchronization
//! 6. DOI consolidation, then `.tex` rewriting
//! 7. title consolidation, then `.tex` rewriting
//! 8. a final formatting and repair pass
//!
//! Every step is best-effort at file granularity; the workflow always
//! processes all requested files and reports what it could not do.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::abbrev::{AbbreviationTable, default_table};
use crate::{BibFile, RenameMap, Result, dedupe, fixes, keys, project, tex, tools};

/// Environment variable that disables the external-tool steps for a run.
pub const NO_TOOLS_ENV: &str = "BIBCURATE_NO_TOOLS";

/// Knobs for a curation run.
#[derive(Debug, Clone)]
pub struct CurateOptions {
    /// Create a persistent `.bib.backup` sibling before touching a file.
    pub create_backups: bool,
    /// Do not modify citation keys (skips sanitization, standardization,
    /// and the key-renaming consolidation passes).
    pub preserve_keys: bool,
    /// Invoke the external metadata and formatter tools.
    pub use_external_tools: bool,
}

impl Default for CurateOptions {
    fn default() -> Self {
        Self {
            create_backups: true,
            preserve_keys: false,
            use_external_tools: true,
        }
    }
}

/// Copies `path` to a persistent `.bib.backup` sibling.
///
/// # Errors
///
/// Returns an error if the copy fails.
pub fn create_backup(path: &Path) -> Result<PathBuf> {
    let backup = path.with_extension("bib.backup");
    fs::copy(path, &backup)?;
    info!(backup = %backup.display(), "created backup");
    Ok(backup)
}

fn report_outcome(step: &str, outcome: &tools::ToolOutcome) {
    match outcome {
        tools::ToolOutcome::Updated => info!("{step} completed"),
        tools::ToolOutcome::Skipped(reason) => warn!(reason = %reason, "{step} skipped"),
        tools::ToolOutcome::Failed(reason) => warn!(reason = %reason, "{step} had issues"),
        tools::ToolOutcome::RolledBack(reason) => {
            warn!(reason = %reason, "{step} rolled back");
        }
    }
}

/// Applies the raw-text repairs that must run before parsing.
fn apply_source_fixes(path: &Path) -> usize {
    let mut changed = 0;
    for result in [
        fixes::fix_invalid_utf8_bytes(path),
        fixes::fix_html_entities(path),
        fixes::fix_problematic_unicode(path),
    ] {
        match result {
            Ok(count) => changed += count,
            Err(err) => warn!(file = %path.display(), %err, "source repair failed"),
        }
    }
    changed
}

/// Applies the entry-level repairs to a loaded file.
fn apply_entry_fixes(file: &mut BibFile, table: &AbbreviationTable) -> usize {
    let mut changed = 0;
    changed += fixes::fix_malformed_author_fields(file);
    changed += fixes::remove_accents_from_names(file);
    changed += fixes::abbreviate_journal_names(file, table);
    changed += fixes::fix_unescaped_percent(file);
    changed += fixes::normalize_keyword_fields(file);
    changed += fixes::fix_legacy_year_fields(file);
    changed += fixes::fix_legacy_month_fields(file);
    changed
}

/// Loads `path`, applies the entry-level repairs, and writes back if
/// anything changed. This is the single adapter between path-based
/// callers and the `&mut BibFile` repair signatures.
fn repair_entries_on_disk(path: &Path, table: &AbbreviationTable) {
    match BibFile::read(path) {
        Ok(mut file) => {
            if apply_entry_fixes(&mut file, table) > 0
                && let Err(err) = file.write()
            {
                warn!(file = %path.display(), %err, "could not persist repairs");
            }
        }
        Err(err) => warn!(%err, "skipping entry-level repairs"),
    }
}

/// Applies the standard series of fixes and tool invocations to one file.
pub fn process_bib_file(
    path: &Path,
    options: &CurateOptions,
    toolchain: &tools::Toolchain,
    table: &AbbreviationTable,
) {
    info!(file = %path.display(), "processing bibliography");
    if options.create_backups
        && let Err(err) = create_backup(path)
    {
        warn!(%err, "could not create backup");
    }
    if options.use_external_tools {
        report_outcome("metadata update", &tools::update_metadata(path, toolchain));
        report_outcome(
            "journal abbreviation",
            &tools::abbreviate_journals(path, toolchain),
        );
    } else {
        info!("skipping external tool steps");
    }
    apply_source_fixes(path);
    repair_entries_on_disk(path, table);
    if options.use_external_tools {
        report_outcome("formatting", &tools::format_file(path, toolchain));
    }
    if let Err(err) = fixes::uncomment_entries(path) {
        warn!(file = %path.display(), %err, "could not recover commented entries");
    }
    info!(file = %path.display(), "completed processing");
}

/// Loads every parsable bibliography, skipping failures with a warning.
fn load_all(bib_files: &[PathBuf]) -> Vec<BibFile> {
    let mut files = Vec::with_capacity(bib_files.len());
    for path in bib_files {
        match BibFile::read(path) {
            Ok(file) => files.push(file),
            Err(err) => warn!(%err, "skipping unparsable bibliography"),
        }
    }
    files
}

/// Runs the full curation workflow on a list of files.
pub fn curate_bibliography(root: &Path, bib_files: &[PathBuf], options: &CurateOptions) {
    info!("starting bibliography curation");
    let mut options = options.clone();
    if std::env::var_os(NO_TOOLS_ENV).is_some() {
        options.use_external_tools = false;
    }
    let toolchain = tools::Toolchain::default();
    let table = default_table();

    for path in bib_files {
        process_bib_file(path, &options, &toolchain, table);
    }

    let tex_files = project::collect_tex_files(root);

    if !options.preserve_keys {
        let has_main = tex_files
            .iter()
            .any(|t| t.file_name().is_some_and(|n| n == "main.tex"));
        if has_main {
            info!("key standardization will run (main.tex present)");
        } else {
            info!("skipping citation key standardization (no main.tex found)");
        }

        let mut renames = RenameMap::new();
        for path in bib_files {
            match BibFile::read(path) {
                Ok(mut file) => {
                    let mut mapping = keys::sanitize_citation_keys(&mut file);
                    if has_main {
                        for (old, new) in keys::standardize_citation_keys(&mut file) {
                            mapping.entry(old).or_insert(new);
                        }
                    }
                    if mapping.is_empty() {
                        continue;
                    }
                    if let Err(err) = file.write() {
                        warn!(%err, "could not persist key changes");
                        continue;
                    }
                    for (old, new) in mapping {
                        renames.entry(old).or_insert(new);
                    }
                }
                Err(err) => warn!(%err, "skipping key hygiene"),
            }
        }
        tex::update_tex_citations(&tex_files, &renames);
    }

    let mut files = load_all(bib_files);

    let mut cited: HashSet<String> = HashSet::new();
    for path in &tex_files {
        cited.extend(tex::extract_citations_from_tex(path));
    }

    dedupe::remove_unused_entries(&mut files, &cited);
    dedupe::remove_duplicate_entries_across_files(&mut files);
    dedupe::synchronize_duplicates(&mut files);

    if !options.preserve_keys {
        let doi_renames = dedupe::consolidate_duplicate_dois(&mut files);
        tex::update_tex_citations(&tex_files, &doi_renames);
        let title_renames = dedupe::consolidate_duplicate_titles(&mut files);
        tex::update_tex_citations(&tex_files, &title_renames);
    }

    // final formatting and fix pass after everything settles
    for path in bib_files {
        if options.use_external_tools {
            report_outcome("formatting", &tools::format_file(path, &toolchain));
        }
        apply_source_fixes(path);
        repair_entries_on_disk(path, table);
        if let Err(err) = fixes::uncomment_entries(path) {
            warn!(file = %path.display(), %err, "could not recover commented entries");
        }
        info!(file = %path.display(), "all fixes applied");
    }

    info!("curation complete");
}
