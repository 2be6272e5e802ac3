use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// An ordered list of code locations handed to a worker.
///
/// Order is significant: earlier entries take precedence when the worker
/// resolves executables and libraries. Duplicates are dropped on insertion,
/// keeping the first occurrence.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClassPath {
    entries: Vec<PathBuf>,
}

impl ClassPath {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flatten several path groups into one classpath, preserving the order in
    /// which entries first appear.
    pub fn flatten<I, G, P>(groups: I) -> Self
    where
        I: IntoIterator<Item = G>,
        G: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        let mut cp = Self::new();
        for group in groups {
            cp.extend(group);
        }
        cp
    }

    /// Append a single entry unless it is already present.
    pub fn push(&mut self, entry: impl Into<PathBuf>) {
        let entry = entry.into();
        if !self.entries.contains(&entry) {
            self.entries.push(entry);
        }
    }

    /// Append every entry from `other`, skipping ones already present.
    pub fn extend<P: Into<PathBuf>>(&mut self, other: impl IntoIterator<Item = P>) {
        let mut seen: HashSet<PathBuf> = self.entries.iter().cloned().collect();
        for entry in other {
            let entry = entry.into();
            if seen.insert(entry.clone()) {
                self.entries.push(entry);
            }
        }
    }

    pub fn entries(&self) -> &[PathBuf] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Join into a platform search-path string (`:` on Unix, `;` on Windows).
    pub fn to_search_path(&self) -> Result<OsString> {
        std::env::join_paths(&self.entries)
            .context("Classpath entry contains the platform path separator")
    }

    /// Parse a platform search-path string back into a classpath.
    pub fn from_search_path(value: &std::ffi::OsStr) -> Self {
        Self::flatten([std::env::split_paths(value).filter(|p| p != Path::new(""))])
    }
}

impl<P: Into<PathBuf>> FromIterator<P> for ClassPath {
    fn from_iter<T: IntoIterator<Item = P>>(iter: T) -> Self {
        let mut cp = Self::new();
        cp.extend(iter);
        cp
    }
}

impl<'a> IntoIterator for &'a ClassPath {
    type Item = &'a PathBuf;
    type IntoIter = std::slice::Iter<'a, PathBuf>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}
