//! Project file discovery conventions.
//!
//! Bibliographies live preferentially under `sections/`, then as
//! `references.bib`/`bibliography.bib` at the project root, then as any
//! root `*.bib` that is not a backup. LaTeX sources are `sections/*.tex`
//! plus a root `main.tex`.

use std::fs;
use std::path::{Path, PathBuf};

/// Conventional root bibliography names, checked in order.
const ROOT_BIB_NAMES: [&str; 2] = ["references.bib", "bibliography.bib"];

fn files_with_suffix(dir: &Path, suffix: &str) -> Vec<PathBuf> {
    let Ok(iter) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut paths: Vec<PathBuf> = iter
        .filter_map(std::result::Result::ok)
        .map(|e| e.path())
        .filter(|p| {
            p.is_file()
                && p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.ends_with(suffix))
        })
        .collect();
    paths.sort();
    paths
}

/// Returns every `.bib` file the workflow should process, sorted.
///
/// Backup files (`*.backup`) are never included.
#[must_use]
pub fn collect_bib_files(root: &Path) -> Vec<PathBuf> {
    let mut list = files_with_suffix(&root.join("sections"), ".bib");

    for name in ROOT_BIB_NAMES {
        let candidate = root.join(name);
        if candidate.exists() {
            list.push(candidate);
        }
    }

    if list.is_empty() {
        list = files_with_suffix(root, ".bib");
    }

    list.sort();
    list
}

/// Returns every `.tex` file the workflow should inspect.
#[must_use]
pub fn collect_tex_files(root: &Path) -> Vec<PathBuf> {
    let mut list = files_with_suffix(&root.join("sections"), ".tex");
    let main = root.join("main.tex");
    if main.exists() {
        list.push(main);
    }
    list
}

/// Returns the bibliography expected to accompany `tex_file`, if any.
///
/// A sibling `<stem>.bib` wins; for `main.tex` the conventional root names
/// are tried next, then any other root `.bib` in sorted order.
#[must_use]
pub fn get_corresponding_bib(tex_file: &Path, root: &Path) -> Option<PathBuf> {
    let sibling = tex_file.with_extension("bib");
    if sibling.exists() {
        return Some(sibling);
    }

    if tex_file.file_stem().is_some_and(|s| s == "main") {
        for name in ROOT_BIB_NAMES {
            let candidate = root.join(name);
            if candidate.exists() {
                return Some(candidate);
            }
        }
        let others: Vec<PathBuf> = files_with_suffix(root, ".bib")
            .into_iter()
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| !ROOT_BIB_NAMES.contains(&n))
            })
            .collect();
        return others.into_iter().next();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(path: &Path) {
        fs::write(path, "").unwrap();
    }

    #[test]
    fn test_collect_bib_prefers_sections_and_root_names() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir(root.join("sections")).unwrap();
        touch(&root.join("sections/b.bib"));
        touch(&root.join("sections/a.bib"));
        touch(&root.join("references.bib"));
        touch(&root.join("stray.bib"));

        let found = collect_bib_files(root);
        let names: Vec<String> = found
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        // stray.bib is ignored because conventional locations matched
        assert_eq!(names, vec!["a.bib", "b.bib", "references.bib"]);
    }

    #[test]
    fn test_collect_bib_falls_back_to_any_root_bib() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        touch(&root.join("mine.bib"));
        touch(&root.join("mine.bib.backup"));

        let found = collect_bib_files(root);
        assert_eq!(found, vec![root.join("mine.bib")]);
    }

    #[test]
    fn test_collect_tex_files() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir(root.join("sections")).unwrap();
        touch(&root.join("sections/intro.tex"));
        touch(&root.join("main.tex"));
        touch(&root.join("notes.tex"));

        let found = collect_tex_files(root);
        assert_eq!(
            found,
            vec![root.join("sections/intro.tex"), root.join("main.tex")]
        );
    }

    #[test]
    fn test_corresponding_bib_sibling() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir(root.join("sections")).unwrap();
        touch(&root.join("sections/intro.tex"));
        touch(&root.join("sections/intro.bib"));

        let found = get_corresponding_bib(&root.join("sections/intro.tex"), root);
        assert_eq!(found, Some(root.join("sections/intro.bib")));
    }

    #[test]
    fn test_corresponding_bib_for_main() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        touch(&root.join("main.tex"));
        touch(&root.join("bibliography.bib"));

        let found = get_corresponding_bib(&root.join("main.tex"), root);
        assert_eq!(found, Some(root.join("bibliography.bib")));
    }

    #[test]
    fn test_corresponding_bib_missing() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir(root.join("sections")).unwrap();
        touch(&root.join("sections/orphan.tex"));

        assert_eq!(
            get_corresponding_bib(&root.join("sections/orphan.tex"), root),
            None
        );
    }
}
