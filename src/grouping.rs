//! Display grouping for classified messages.
//!
//! A JSON file maps message substrings to a display group and a friendly
//! name:
//!
//! ```json
//! {
//!   "Uploads": { "NextCloud": "Cloud share", "Dropbox": "Dropbox sync" },
//!   "Rendering": { "RenderException": "Renderer crash" }
//! }
//! ```
//!
//! Matching is a case-insensitive substring test. When several patterns
//! match, the longest one wins. Only presentation depends on this; a message
//! with no match is simply shown ungrouped.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;

/// Result of a grouping lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DisplayGroup {
    pub group: String,
    pub friendly_name: String,
}

#[derive(Debug, Clone)]
struct Entry {
    pattern_lower: String,
    group: String,
    friendly_name: String,
}

#[derive(Debug, Clone, Default)]
pub struct GroupMap {
    entries: Vec<Entry>,
}

impl GroupMap {
    /// Parse the JSON mapping.
    pub fn from_json(json: &str) -> Result<Self> {
        let raw: BTreeMap<String, BTreeMap<String, String>> =
            serde_json::from_str(json).context("invalid group map JSON")?;
        let entries = raw
            .into_iter()
            .flat_map(|(group, patterns)| {
                patterns
                    .into_iter()
                    .filter(|(pattern, _)| !pattern.is_empty())
                    .map(move |(pattern, friendly_name)| Entry {
                        pattern_lower: pattern.to_lowercase(),
                        group: group.clone(),
                        friendly_name,
                    })
            })
            .collect();
        Ok(Self { entries })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read group map {}", path.display()))?;
        Self::from_json(&contents).with_context(|| format!("failed to parse {}", path.display()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Find the group for `message`; longest matching pattern wins.
    pub fn lookup(&self, message: &str) -> Option<DisplayGroup> {
        let lower = message.to_lowercase();
        self.entries
            .iter()
            .filter(|e| lower.contains(&e.pattern_lower))
            .max_by_key(|e| e.pattern_lower.len())
            .map(|e| DisplayGroup {
                group: e.group.clone(),
                friendly_name: e.friendly_name.clone(),
            })
    }
}
