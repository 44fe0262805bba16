//! Pure normalization helpers used as the universal comparison functions.
//!
//! Every equality check in the curation engine (key, DOI, title, keyword,
//! URL) goes through one of these functions. They are total and
//! idempotent: re-normalizing a normalized value is a no-op.

use std::sync::LazyLock;

use unicode_normalization::UnicodeNormalization;

use crate::regex::Regex;

static DASH_RUNS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[-–—]+").unwrap());

static WHITESPACE_RUNS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

static URL_SCHEME: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[A-Za-z]+://").unwrap());

/// DOI prefixes stripped during normalization, checked case-insensitively.
const DOI_PREFIXES: [&str; 3] = ["doi:", "http://dx.doi.org/", "https://doi.org/"];

/// Normalizes a string to composed-form (NFC) Unicode for comparison.
///
/// Returns `None` for empty input to make caller logic simpler.
#[must_use]
pub fn normalize_unicode(text: &str) -> Option<String> {
    if text.is_empty() {
        return None;
    }
    Some(text.nfc().collect())
}

/// Normalizes a DOI to a canonical lowercase form without URL prefixes.
///
/// Returns `None` for empty or whitespace-only input.
///
/// # Examples
///
/// ```
/// use bibcurate::normalize::normalize_doi;
///
/// assert_eq!(
///     normalize_doi("https://doi.org/10.1000/Test"),
///     Some("10.1000/test".to_string())
/// );
/// assert_eq!(normalize_doi("  "), None);
/// ```
#[must_use]
pub fn normalize_doi(doi: &str) -> Option<String> {
    let doi = doi.trim().to_lowercase();
    if doi.is_empty() {
        return None;
    }
    let mut rest = doi.as_str();
    for prefix in DOI_PREFIXES {
        if let Some(stripped) = rest.strip_prefix(prefix) {
            rest = stripped;
            break;
        }
    }
    let rest = rest.trim();
    if rest.is_empty() {
        None
    } else {
        Some(rest.to_string())
    }
}

/// Canonicalizes a title for loose comparison.
///
/// Removes braces, collapses dash and whitespace runs, and lowercases the
/// result. Unlike the other helpers this never returns `None`; an empty
/// title normalizes to the empty string.
#[must_use]
pub fn normalize_title(title: &str) -> String {
    let without_braces: String = title.chars().filter(|c| *c != '{' && *c != '}').collect();
    let dashed = DASH_RUNS.replace_all(&without_braces, " ");
    let collapsed = WHITESPACE_RUNS.replace_all(&dashed, " ");
    collapsed.trim().to_lowercase()
}

/// Canonicalizes a comma-separated keyword list.
///
/// Splits on commas, trims and lowercases each component, drops empty
/// components, and rejoins with a single comma. Returns `None` if nothing
/// remains.
#[must_use]
pub fn normalize_keywords(keywords: &str) -> Option<String> {
    let parts: Vec<String> = keywords
        .split(',')
        .map(|k| k.trim().to_lowercase())
        .filter(|k| !k.is_empty())
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join(","))
    }
}

/// Basic URL cleaning: trims whitespace and lowercases the scheme only.
#[must_use]
pub fn normalize_url(url: &str) -> Option<String> {
    let url = url.trim();
    if url.is_empty() {
        return None;
    }
    let cleaned = URL_SCHEME.replace(url, |caps: &crate::regex::Captures| caps[0].to_lowercase());
    Some(cleaned.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::*;

    #[test]
    fn test_normalize_unicode_composes() {
        // "e" + combining acute composes to a single scalar
        let decomposed = "Garci\u{0301}a";
        assert_eq!(normalize_unicode(decomposed), Some("Garc\u{ED}a".to_string()));
        assert_eq!(normalize_unicode(""), None);
    }

    #[rstest]
    #[case("10.1000/test", Some("10.1000/test"))]
    #[case("doi:10.1000/test", Some("10.1000/test"))]
    #[case("DOI:10.1000/TEST", Some("10.1000/test"))]
    #[case("http://dx.doi.org/10.1000/test", Some("10.1000/test"))]
    #[case("https://doi.org/10.1000/test", Some("10.1000/test"))]
    #[case("  10.1000/test  ", Some("10.1000/test"))]
    #[case("", None)]
    #[case("   ", None)]
    #[case("doi:", None)]
    fn test_normalize_doi(#[case] input: &str, #[case] expected: Option<&str>) {
        assert_eq!(normalize_doi(input), expected.map(String::from));
    }

    #[test]
    fn test_normalize_doi_strips_one_prefix_only() {
        // a second prefix embedded in the DOI body is left alone
        assert_eq!(
            normalize_doi("doi:10.1000/doi:inner"),
            Some("10.1000/doi:inner".to_string())
        );
    }

    #[rstest]
    #[case("Same Title", "same title")]
    #[case("same   title", "same title")]
    #[case("{Same} Title", "same title")]
    #[case("Self-Attention \u{2014} Revisited", "self attention revisited")]
    #[case("", "")]
    fn test_normalize_title(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(normalize_title(input), expected);
    }

    #[test]
    fn test_normalize_keywords() {
        assert_eq!(
            normalize_keywords(" Alpha, beta ,, GAMMA "),
            Some("alpha,beta,gamma".to_string())
        );
        assert_eq!(normalize_keywords(" , ,"), None);
        assert_eq!(normalize_keywords(""), None);
    }

    #[test]
    fn test_normalize_url() {
        assert_eq!(
            normalize_url("HTTPS://Example.org/Path"),
            Some("https://Example.org/Path".to_string())
        );
        assert_eq!(normalize_url(""), None);
    }

    #[rstest]
    #[case("doi:10.1000/Test")]
    #[case("https://doi.org/10.1000/x")]
    #[case("10.1000/plain")]
    fn test_normalize_doi_idempotent(#[case] input: &str) {
        let once = normalize_doi(input).unwrap();
        assert_eq!(normalize_doi(&once), Some(once.clone()));
    }

    #[rstest]
    #[case("A {Braced} Title - or two")]
    #[case("plain")]
    #[case("")]
    fn test_normalize_title_idempotent(#[case] input: &str) {
        let once = normalize_title(input);
        assert_eq!(normalize_title(&once), once);
    }

    #[test]
    fn test_normalize_unicode_idempotent() {
        let once = normalize_unicode("Garci\u{0301}a").unwrap();
        assert_eq!(normalize_unicode(&once), Some(once.clone()));
    }
}
