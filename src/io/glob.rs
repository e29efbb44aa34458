//! Local file set expansion: glob patterns and directory listings.
//!
//! Both return regular files only, in sorted order, so a multi-file input
//! always concatenates the same way.
//!
//! ```no_run
//! use bulkflow::io::glob::{expand_glob, list_dir};
//!
//! let files = expand_glob("exports/2024-*/events-*.jsonl.gz")?;
//! let same_dir = list_dir("exports/2024-01".as_ref())?;
//! # Ok::<(), anyhow::Error>(())
//! ```

use anyhow::{Context, Result, bail};
use glob::glob;
use std::path::{Path, PathBuf};

/// True if `s` contains glob metacharacters.
#[must_use]
pub fn has_glob_chars(s: &str) -> bool {
    s.contains(['*', '?', '['])
}

/// Expand a glob pattern into a sorted vector of matching file paths.
///
/// Supports `*`, `?`, `**`, `[abc]` and `[!abc]`. Directories that match are
/// skipped. Zero matches is not an error here; see [`expand_glob_required`].
///
/// # Errors
/// Returns an error if the pattern is invalid or a match cannot be read.
pub fn expand_glob(pattern: &str) -> Result<Vec<PathBuf>> {
    let paths = glob(pattern).with_context(|| format!("invalid glob pattern: {pattern}"))?;

    let mut result = Vec::new();
    for entry in paths {
        let path =
            entry.with_context(|| format!("error reading glob entry for pattern: {pattern}"))?;
        if path.is_file() && !is_hidden(&path) {
            result.push(path);
        }
    }
    result.sort();
    Ok(result)
}

/// Like [`expand_glob`], but zero matches is an error.
///
/// # Errors
/// As for [`expand_glob`], plus when nothing matches.
pub fn expand_glob_required(pattern: &str) -> Result<Vec<PathBuf>> {
    let files = expand_glob(pattern)?;
    if files.is_empty() {
        bail!("no files found matching pattern: {pattern}");
    }
    Ok(files)
}

/// List the regular, non-hidden files directly inside `dir`, sorted.
///
/// # Errors
/// Returns an error if the directory cannot be read.
pub fn list_dir(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries =
        std::fs::read_dir(dir).with_context(|| format!("read directory {}", dir.display()))?;
    let mut result = Vec::new();
    for entry in entries {
        let entry = entry.with_context(|| format!("read entry in {}", dir.display()))?;
        let path = entry.path();
        if path.is_file() && !is_hidden(&path) {
            result.push(path);
        }
    }
    result.sort();
    Ok(result)
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with('.'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn listing_skips_hidden_and_dirs() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("b.jsonl"), "{}\n").unwrap();
        fs::write(dir.path().join("a.jsonl"), "{}\n").unwrap();
        fs::write(dir.path().join(".DS_Store"), "").unwrap();
        fs::create_dir(dir.path().join("nested")).unwrap();

        let files = list_dir(dir.path()).unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, ["a.jsonl", "b.jsonl"]);
    }

    #[test]
    fn glob_matches_sorted() {
        let dir = tempfile::tempdir().unwrap();
        for n in ["2.csv", "1.csv", "x.json"] {
            fs::write(dir.path().join(n), "a,b\n1,2\n").unwrap();
        }
        let pattern = format!("{}/*.csv", dir.path().display());
        let files = expand_glob(&pattern).unwrap();
        assert_eq!(files.len(), 2);
        assert!(files[0] < files[1]);
        assert!(expand_glob_required(&format!("{}/*.tsv", dir.path().display())).is_err());
    }

    #[test]
    fn glob_chars() {
        assert!(has_glob_chars("data/*.json"));
        assert!(!has_glob_chars("data/file.json"));
    }
}
