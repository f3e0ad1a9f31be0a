//! Interactive pause detection.
//!
//! Batch scripts stall on `pause`-style prompts ("Press any key to
//! continue . . .") that are frequently not newline-terminated. The
//! reassembler scans the pending line against these patterns and acknowledges
//! a match by injecting input.

use regex::{Regex, RegexBuilder};
use tracing::warn;

/// Patterns recognised by default, matched case-insensitively against
/// ANSI-stripped text.
pub const DEFAULT_PAUSE_PATTERNS: &[&str] = &[
    r"press\s+any\s+key",
    r"press\s+a\s+key",
    r"press\s+enter",
    r"press\s+return",
    r"hit\s+enter",
];

/// A detected pause prompt.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectedPause {
    pub matched_text: String,
}

/// Compiled pause prompt patterns.
pub struct PausePatterns {
    patterns: Vec<Regex>,
}

impl PausePatterns {
    /// Compile the given patterns. Invalid patterns are logged and skipped so
    /// a typo in the config file cannot disable the remaining ones.
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Self {
        let patterns = patterns
            .iter()
            .filter_map(|p| {
                match RegexBuilder::new(p.as_ref()).case_insensitive(true).build() {
                    Ok(re) => Some(re),
                    Err(e) => {
                        warn!(pattern = p.as_ref(), error = %e, "ignoring invalid pause pattern");
                        None
                    }
                }
            })
            .collect();
        Self { patterns }
    }

    /// Scan ANSI-stripped text for a pause prompt. Returns the first match.
    pub fn detect(&self, text: &str) -> Option<DetectedPause> {
        self.patterns.iter().find_map(|re| {
            re.find(text).map(|m| DetectedPause {
                matched_text: m.as_str().to_string(),
            })
        })
    }
}

impl Default for PausePatterns {
    fn default() -> Self {
        Self::new(DEFAULT_PAUSE_PATTERNS)
    }
}
