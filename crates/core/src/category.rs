//! Allowed upload categories and file-name sanitization.

use crate::error::{Error, Result};
use std::collections::BTreeSet;

/// Maximum length of a sanitized file name, in characters.
const MAX_FILE_NAME_CHARS: usize = 200;

/// Fallback used when nothing usable survives sanitization.
const FALLBACK_FILE_NAME: &str = "file";

/// The fixed set of categories uploads may be filed under.
///
/// Categories become a directory component of the artifact path, so each one
/// must be a single safe path segment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CategorySet(BTreeSet<String>);

impl CategorySet {
    /// Build a category set, rejecting anything that is not a safe path segment.
    pub fn new<I, S>(categories: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut set = BTreeSet::new();
        for category in categories {
            let category = category.into();
            validate_segment(&category)?;
            set.insert(category);
        }
        Ok(Self(set))
    }

    pub fn contains(&self, category: &str) -> bool {
        self.0.contains(category)
    }

    /// Check that `category` is a member of the set.
    pub fn validate(&self, category: &str) -> Result<()> {
        if self.contains(category) {
            Ok(())
        } else {
            Err(Error::InvalidCategory(category.to_string()))
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

fn validate_segment(category: &str) -> Result<()> {
    if category.is_empty() {
        return Err(Error::InvalidCategory("empty category".to_string()));
    }
    if category == "." || category == ".." {
        return Err(Error::InvalidCategory(format!(
            "{category}: reserved path segment"
        )));
    }
    if category
        .chars()
        .any(|c| c == '/' || c == '\\' || c == '\0' || c.is_control())
    {
        return Err(Error::InvalidCategory(format!(
            "{category:?}: contains path separator or control character"
        )));
    }
    Ok(())
}

/// Reduce a client-supplied file name to a single safe path segment.
///
/// Directory components are dropped, characters other than alphanumerics,
/// `.`, `-` and `_` become `_`, leading dots are stripped so the result is
/// never hidden or a relative segment, and the length is capped.
pub fn sanitize_file_name(name: &str) -> String {
    let base = name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default();

    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();

    let trimmed: String = cleaned
        .trim_start_matches('.')
        .chars()
        .take(MAX_FILE_NAME_CHARS)
        .collect();

    if trimmed.chars().all(|c| c == '_' || c == '.') {
        FALLBACK_FILE_NAME.to_string()
    } else {
        trimmed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_membership() {
        let set = CategorySet::new(["开发工具", "文档"]).unwrap();
        assert!(set.contains("开发工具"));
        assert!(set.validate("文档").is_ok());
        assert!(matches!(
            set.validate("malware"),
            Err(Error::InvalidCategory(_))
        ));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_category_rejects_path_segments() {
        assert!(CategorySet::new([".."]).is_err());
        assert!(CategorySet::new(["a/b"]).is_err());
        assert!(CategorySet::new(["a\\b"]).is_err());
        assert!(CategorySet::new([""]).is_err());
    }

    #[test]
    fn test_sanitize_keeps_plain_names() {
        assert_eq!(sanitize_file_name("report.pdf"), "report.pdf");
        assert_eq!(sanitize_file_name("报告-2024_v1.pdf"), "报告-2024_v1.pdf");
    }

    #[test]
    fn test_sanitize_strips_directories() {
        assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_file_name("C:\\Users\\x\\a.txt"), "a.txt");
        assert_eq!(sanitize_file_name("dir/"), "file");
    }

    #[test]
    fn test_sanitize_replaces_specials() {
        assert_eq!(sanitize_file_name("my file (1).txt"), "my_file__1_.txt");
        assert_eq!(sanitize_file_name(".hidden"), "hidden");
        assert_eq!(sanitize_file_name(".."), "file");
        assert_eq!(sanitize_file_name("???"), "file");
    }

    #[test]
    fn test_sanitize_caps_length() {
        let long = "a".repeat(500);
        assert_eq!(sanitize_file_name(&long).chars().count(), 200);
    }
}
