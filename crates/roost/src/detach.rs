//! Detach keys and the input-side automaton that recognizes them.
//!
//! Two kinds of key exist: a control byte (1..=31) that detaches anywhere in
//! the stream, and an SSH-style escape sequence `<c>.` recognized only at the
//! start of a freshly rendered line. The automaton tracks three pieces of
//! state (the buffered escape char, whether the cursor sits after a newline,
//! and whether the host terminal is mid-CSI/SS3 sequence) so `~.` stays
//! reliable without mangling prose that contains `~`.

use crate::error::{Error, Result};

// ── Key model ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetachKey {
    /// A single control byte, matched anywhere in the input stream.
    Control(u8),
    /// `<esc_char>` followed by `.`, matched only after a newline.
    Escape(u8),
}

impl DetachKey {
    /// Parse the textual grammar: `"<c>."` for an escape-sequence key,
    /// `"ctrl-<x>"` or `"^<x>"` for a control byte. `ctrl-` is tried first,
    /// so `"^."` is an escape key with esc char `^` while `"^a"` is Ctrl+A.
    pub fn parse(s: &str) -> Result<Self> {
        if s.is_empty() {
            return Err(Error::DetachKey(s.to_string()));
        }

        let lower = s.to_ascii_lowercase();
        if let Some(rest) = lower.strip_prefix("ctrl-") {
            return control_token(rest).ok_or_else(|| Error::DetachKey(s.to_string()));
        }

        let bytes = s.as_bytes();
        if bytes.len() == 2 && bytes[1] == b'.' {
            return Ok(DetachKey::Escape(bytes[0]));
        }

        if let Some(rest) = lower.strip_prefix('^') {
            if !rest.is_empty() {
                return control_token(rest).ok_or_else(|| Error::DetachKey(s.to_string()));
            }
        }

        Err(Error::DetachKey(s.to_string()))
    }

    /// Human-readable rendition for status lines.
    pub fn label(&self) -> String {
        match *self {
            DetachKey::Escape(c) => format!("{}.", c as char),
            DetachKey::Control(b) => match b {
                1..=26 => format!("Ctrl+{}", (b'A' + b - 1) as char),
                27 => "Ctrl+[".to_string(),
                28 => "Ctrl+\\".to_string(),
                29 => "Ctrl+]".to_string(),
                30 => "Ctrl+^".to_string(),
                31 => "Ctrl+_".to_string(),
                _ => format!("0x{b:02x}"),
            },
        }
    }
}

/// Map a `ctrl-`/`^` suffix token to its control byte.
fn control_token(token: &str) -> Option<DetachKey> {
    let byte = match token {
        "[" => 27,
        "\\" | "backslash" => 28,
        "]" => 29,
        "^" | "caret" => 30,
        "_" | "underscore" => 31,
        _ => {
            let [c] = token.as_bytes() else { return None };
            match c {
                b'a'..=b'z' => c - b'a' + 1,
                _ => return None,
            }
        }
    };
    Some(DetachKey::Control(byte))
}

/// Ordered, non-empty detach-key configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetachKeys(Vec<DetachKey>);

impl DetachKeys {
    pub fn parse_all<S: AsRef<str>>(specs: &[S]) -> Result<Self> {
        let keys = specs
            .iter()
            .map(|s| DetachKey::parse(s.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        if keys.is_empty() {
            Ok(Self::default())
        } else {
            Ok(Self(keys))
        }
    }

    fn control_matches(&self, b: u8) -> bool {
        self.0.iter().any(|k| matches!(k, DetachKey::Control(c) if *c == b))
    }

    fn escape_matches(&self, b: u8) -> bool {
        self.0.iter().any(|k| matches!(k, DetachKey::Escape(c) if *c == b))
    }

    /// Joined labels for the attach/create status lines.
    pub fn label(&self) -> String {
        self.0
            .iter()
            .map(DetachKey::label)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl Default for DetachKeys {
    fn default() -> Self {
        Self(vec![DetachKey::Escape(b'~')])
    }
}

// ── Input automaton ─────────────────────────────────────────────────

/// What a scan pass concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scan {
    /// Keep forwarding; no key matched.
    Forward,
    /// A detach key matched; the matching bytes were not emitted.
    Detach,
}

/// Per-byte recognizer for the configured detach keys.
///
/// Feed terminal input through [`scan`](Self::scan); bytes to forward to the
/// server accumulate in the caller's buffer. Feed rendered output through
/// [`note_output`](Self::note_output) so line-start detection follows what
/// the user actually sees.
#[derive(Debug)]
pub struct DetachScanner {
    keys: DetachKeys,
    after_newline: bool,
    pending_esc: u8,
    in_esc_seq: bool,
}

impl DetachScanner {
    pub fn new(keys: DetachKeys) -> Self {
        Self {
            keys,
            // `~.` immediately after attach counts as line start.
            after_newline: true,
            pending_esc: 0,
            in_esc_seq: false,
        }
    }

    /// Run `input` through the automaton, appending forwardable bytes to
    /// `out`. Stops at the first detach match; bytes after the match are
    /// dropped with the session about to end.
    pub fn scan(&mut self, input: &[u8], out: &mut Vec<u8>) -> Scan {
        for &b in input {
            if self.keys.control_matches(b) {
                return Scan::Detach;
            }

            if self.pending_esc != 0 {
                let esc = self.pending_esc;
                self.pending_esc = 0;
                if b == b'.' {
                    return Scan::Detach;
                }
                if b == esc {
                    // Doubled escape char sends a single literal copy.
                    out.push(esc);
                } else {
                    out.push(esc);
                    out.push(b);
                }
                self.after_newline = b == b'\n' || b == b'\r';
                continue;
            }

            if self.after_newline && self.keys.escape_matches(b) {
                self.pending_esc = b;
                self.after_newline = false;
                continue;
            }

            out.push(b);
            if b == 0x1b {
                self.in_esc_seq = true;
            } else if self.in_esc_seq {
                // Arrow keys and the like end with a letter; a terminal
                // escape sequence never moves the line-start marker.
                if b.is_ascii_alphabetic() {
                    self.in_esc_seq = false;
                }
            } else if b == b'\n' || b == b'\r' {
                self.after_newline = true;
            } else if (0x20..=0x7e).contains(&b) {
                self.after_newline = false;
            }
        }
        Scan::Forward
    }

    /// Track rendered output: any newline in the payload means the next
    /// input byte sits at the start of a fresh line.
    pub fn note_output(&mut self, payload: &[u8]) {
        if payload.iter().any(|&b| b == b'\n' || b == b'\r') {
            self.after_newline = true;
        }
    }
}

// ── Unit tests ──────────────────────────────────────────────────────
