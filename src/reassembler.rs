//! Line reassembly and pause detection over raw pseudo-console chunks.
//!
//! Chunks arrive split at arbitrary byte positions (inside words, inside
//! escape sequences, between `\r` and `\n`). The reassembler buffers them,
//! hands out complete ANSI-stripped lines, and watches the pending line for
//! interactive pause prompts that will never be newline-terminated.

use tracing::{debug, warn};

use crate::ansi::{ColorHint, color_hint, sequence_end, strip_ansi};
use crate::prompt::{DetectedPause, PausePatterns};

/// Default hard ceiling on buffered, not yet line-terminated output.
pub const DEFAULT_CAPACITY: usize = 64 * 1024;

/// Longest escape sequence we bother to keep intact when trimming.
const MAX_SEQUENCE_LOOKBEHIND: usize = 64;

/// One complete, cleaned output line.
#[derive(Debug, Clone, PartialEq)]
pub struct LogLine {
    /// Trimmed, ANSI-stripped content. Never empty.
    pub text: String,
    /// Whether the stripped line started with whitespace before trimming.
    pub indented: bool,
    /// Foreground colour the raw line ended in.
    pub hint: Option<ColorHint>,
}

impl LogLine {
    /// Build a line from already clean text. Mostly useful in tests and for
    /// feeding the classifier from sources other than a pseudo-console.
    pub fn plain(text: &str) -> Self {
        Self {
            text: text.trim().to_string(),
            indented: text.starts_with(char::is_whitespace),
            hint: None,
        }
    }

    pub fn with_hint(mut self, hint: ColorHint) -> Self {
        self.hint = Some(hint);
        self
    }
}

/// Something the reassembler produced from a chunk.
#[derive(Debug, Clone, PartialEq)]
pub enum Reassembled {
    Line(LogLine),
    /// A pause prompt was found. The buffer has been cleared and the caller
    /// should acknowledge the prompt by sending input.
    Paused(DetectedPause),
}

pub struct LineReassembler {
    buffer: String,
    capacity: usize,
    patterns: PausePatterns,
}

impl LineReassembler {
    pub fn new(capacity: usize, patterns: PausePatterns) -> Self {
        Self {
            buffer: String::new(),
            capacity: capacity.max(1),
            patterns,
        }
    }

    /// Bytes currently held back waiting for a line terminator.
    pub fn pending(&self) -> &str {
        &self.buffer
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// Append a chunk and return everything it completed, in output order.
    ///
    /// Lines ahead of a pause prompt are emitted before the pause so that the
    /// result does not depend on where the chunk boundaries fell.
    pub fn push(&mut self, chunk: &str) -> Vec<Reassembled> {
        self.buffer.push_str(chunk);
        self.enforce_capacity();

        let mut out = Vec::new();
        loop {
            let newline = self.buffer.find('\n');
            let pending_end = newline.unwrap_or(self.buffer.len());

            let cleaned = strip_ansi(&self.buffer[..pending_end]);
            if let Some(pause) = self.patterns.detect(&cleaned) {
                debug!(
                    prompt = %pause.matched_text,
                    discarded = self.buffer.len(),
                    "pause prompt detected"
                );
                self.buffer.clear();
                out.push(Reassembled::Paused(pause));
                break;
            }

            let Some(newline) = newline else {
                break;
            };

            let raw: String = self.buffer.drain(..=newline).collect();
            let raw = raw.trim_end_matches('\n');
            let raw = raw.strip_suffix('\r').unwrap_or(raw);
            if let Some(line) = clean_line(raw) {
                out.push(Reassembled::Line(line));
            }
        }
        out
    }

    /// Trim from the front so the buffer never exceeds its capacity. The cut
    /// is moved forward to a char boundary and past any escape sequence it
    /// would otherwise split.
    fn enforce_capacity(&mut self) {
        if self.buffer.len() <= self.capacity {
            return;
        }

        let mut cut = self.buffer.len() - self.capacity;
        while !self.buffer.is_char_boundary(cut) {
            cut += 1;
        }

        let window_start = cut.saturating_sub(MAX_SEQUENCE_LOOKBEHIND);
        if let Some(offset) = self.buffer[window_start..cut].rfind('\x1b') {
            let esc = window_start + offset;
            if let Some(end) = sequence_end(&self.buffer, esc) {
                if end > cut {
                    cut = end;
                }
            }
        }

        warn!(
            dropped = cut,
            capacity = self.capacity,
            "reassembly buffer over capacity, dropping oldest output"
        );
        self.buffer.drain(..cut);
    }
}

impl Default for LineReassembler {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, PausePatterns::default())
    }
}

fn clean_line(raw: &str) -> Option<LogLine> {
    let stripped = strip_ansi(raw);
    let text = stripped.trim();
    if text.is_empty() {
        return None;
    }
    Some(LogLine {
        text: text.to_string(),
        indented: stripped.starts_with(char::is_whitespace),
        hint: color_hint(raw),
    })
}
