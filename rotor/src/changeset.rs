// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tag to generated value mapping produced by one mutation run
//!
//! The human-readable encoding is keyed by the inbound tag as written in the
//! service document (`v10-vless-ws`). The storage encoding swaps hyphens for
//! underscores so the keys are valid SQL column names (`v10_vless_ws`).
//! Both are views over the same entries, so their values always agree.

use std::collections::BTreeMap;
use std::path::Path;

use crate::error::{Result, RotorError};

/// Generated values keyed by inbound tag
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    entries: BTreeMap<String, String>,
}

/// Column name used by the audit store for `tag`
pub fn storage_key(tag: &str) -> String {
    tag.replace('-', "_")
}

impl ChangeSet {
    /// Empty change set
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the value generated for `tag`. Tags are unique per run.
    pub(crate) fn insert(&mut self, tag: &str, value: impl Into<String>) -> Result<()> {
        if self.entries.contains_key(tag) {
            return Err(RotorError::DuplicateTag {
                tag: tag.to_string(),
            });
        }
        self.entries.insert(tag.to_string(), value.into());
        Ok(())
    }

    /// Value recorded for `tag`
    pub fn get(&self, tag: &str) -> Option<&str> {
        self.entries.get(tag).map(String::as_str)
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the run produced nothing
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries keyed by hyphenated tag, in tag order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Human-readable encoding
    pub fn readable(&self) -> &BTreeMap<String, String> {
        &self.entries
    }

    /// Storage-safe encoding keyed by column name
    pub fn storage(&self) -> BTreeMap<String, String> {
        self.entries
            .iter()
            .map(|(tag, value)| (storage_key(tag), value.clone()))
            .collect()
    }

    /// Write the human-readable encoding as a flat JSON object
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        crate::write_json_pretty(path.as_ref(), &self.entries)
    }

    /// Read a side file written by [`ChangeSet::save`]
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| RotorError::io(path, e))?;
        let entries: BTreeMap<String, String> = serde_json::from_str(&contents)?;
        Ok(Self { entries })
    }
}

impl FromIterator<(String, String)> for ChangeSet {
    /// Later duplicates replace earlier ones; use for fixtures and side files.
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}
