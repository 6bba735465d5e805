//! Ignore filter (component K): gitignore-style basename exclusion read from
//! `~/.syncignore`, applied to the sender side before `FILE_ANNOUNCE`/
//! `FILES_INLINE`.

use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::Path;

/// A compiled set of basename-matching glob patterns. Directory-intent
/// entries (a trailing `/`) are recorded but never change matching: files are
/// always flattened to basenames, so a directory-only ignore entry can never
/// match anything and is a no-op rather than an error.
pub struct IgnoreFilter {
    set: GlobSet,
}

impl IgnoreFilter {
    /// Parses gitignore-style `source`: blank lines and `#` comments are
    /// skipped; a directory-intent entry (trailing `/`) is skipped entirely
    /// rather than matched as a file, since files are flattened to
    /// basenames and a directory-only entry can never match one.
    pub fn parse(source: &str) -> Self {
        let mut builder = GlobSetBuilder::new();
        for raw_line in source.lines() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') || line.ends_with('/') {
                continue;
            }
            if let Ok(glob) = Glob::new(line) {
                builder.add(glob);
            }
        }
        let set = builder.build().unwrap_or_else(|_| GlobSetBuilder::new().build().unwrap());
        Self { set }
    }

    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(source) => Self::parse(&source),
            Err(_) => Self::parse(""),
        }
    }

    /// Whether `name` (a basename, not a path) matches any pattern.
    pub fn is_ignored(&self, name: &str) -> bool {
        self.set.is_match(name)
    }

    /// Filters a list of basenames, dropping any that match. Spec.md §4.K:
    /// if the result is empty, the caller sends no frame at all.
    pub fn filter<'a>(&self, names: impl IntoIterator<Item = &'a str>) -> Vec<&'a str> {
        names.into_iter().filter(|n| !self.is_ignored(n)).collect()
    }
}

impl Default for IgnoreFilter {
    fn default() -> Self {
        Self::parse("")
    }
}
