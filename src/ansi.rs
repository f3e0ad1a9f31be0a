//! ANSI escape handling for pseudo-console output.
//!
//! This is deliberately not a terminal emulator. It removes complete escape
//! sequences, turns cursor-forward moves into spaces (the Windows
//! pseudo-console uses them instead of literal runs of blanks), and recovers
//! the foreground colour a line was printed in.

use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde::Serialize;

/// Matches CSI sequences (ESC [ params final), OSC sequences (ESC ] ... BEL or
/// ST) and two-byte escapes. An unterminated sequence never matches, so it is
/// left in place until the rest of it arrives.
static ANSI_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\x1b\[([0-9;?<=>]*)([A-Za-z@`~])|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[^\[\]]")
        .expect("ANSI regex is valid")
});

static SGR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1b\[([0-9;]*)m").expect("SGR regex is valid"));

/// Foreground colour recovered from SGR codes on a raw line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ColorHint {
    Red,
    Green,
    Yellow,
}

/// Strip ANSI escape sequences, expanding cursor-forward (`ESC [ n C`) into
/// `n` spaces.
pub fn strip_ansi(input: &str) -> String {
    if !input.contains('\x1b') {
        return input.to_string();
    }
    ANSI_RE
        .replace_all(input, |caps: &Captures| {
            match (caps.get(1), caps.get(2)) {
                (Some(params), Some(fin)) if fin.as_str() == "C" => {
                    let n = params.as_str().parse::<usize>().unwrap_or(1).max(1);
                    " ".repeat(n.min(512))
                }
                _ => String::new(),
            }
        })
        .into_owned()
}

/// End offset of the complete escape sequence starting at `start`, or `None`
/// when `start` is not an escape or the sequence is still unterminated.
pub(crate) fn sequence_end(text: &str, start: usize) -> Option<usize> {
    ANSI_RE
        .find_at(text, start)
        .filter(|m| m.start() == start)
        .map(|m| m.end())
}

/// Colour in effect at the end of the line, if any.
///
/// Walks every SGR sequence in order so a trailing reset clears an earlier
/// colour. Extended colours (`38;5;n`, `38;2;r;g;b`) are skipped over.
pub fn color_hint(raw: &str) -> Option<ColorHint> {
    let mut current = None;
    for caps in SGR_RE.captures_iter(raw) {
        let params = caps.get(1).map(|m| m.as_str()).unwrap_or("");
        if params.is_empty() {
            current = None;
            continue;
        }
        let mut codes = params.split(';').map(|p| p.parse::<u16>().unwrap_or(0));
        while let Some(code) = codes.next() {
            match code {
                0 | 39 => current = None,
                31 | 91 => current = Some(ColorHint::Red),
                32 | 92 => current = Some(ColorHint::Green),
                33 | 93 => current = Some(ColorHint::Yellow),
                30 | 34..=37 | 90 | 94..=97 => current = None,
                38 | 48 => match codes.next() {
                    Some(5) => {
                        codes.next();
                    }
                    Some(2) => {
                        codes.next();
                        codes.next();
                        codes.next();
                    }
                    _ => {}
                },
                _ => {}
            }
        }
    }
    current
}
