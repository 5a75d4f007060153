//! Output framing — raw REPL output into discrete response units.
//!
//! A REPL's stdout is an unstructured stream: command echoes, the
//! response payload, and idle prompts all interleave, split across
//! arbitrary read chunks. The framer accumulates chunks and segments
//! them at the prompt sentinel, so that exactly one `ResponseUnit`
//! comes out per submitted command. Echo and prompt noise is stripped
//! from the cleaned payload; the raw slice is kept for the transaction
//! log.
//!
//! The sentinel is not hardcoded. It is calibrated once at session
//! start (see [`detect_sentinel`]) by probing the REPL and taking the
//! unterminated trailing fragment it leaves when idle (e.g. `tau> `).

use std::sync::LazyLock;

use regex::Regex;

use crate::error::ReplError;

/// Strip ANSI escape sequences from REPL output.
pub fn strip_ansi(input: &str) -> String {
    // Matches CSI sequences (ESC [ ... final byte), OSC sequences (ESC ] ... ST),
    // and simple two-byte escapes (ESC + one char).
    static ANSI_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"\x1b\[[0-9;?]*[A-Za-z]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[^\[\]]").unwrap()
    });
    ANSI_RE.replace_all(input, "").to_string()
}

/// One complete, framed response to one submitted command.
///
/// Immutable once constructed. `raw` is the sentinel-delimited slice as
/// the child produced it (ANSI-stripped); `cleaned` additionally has the
/// command echo and stray prompts removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseUnit {
    pub raw: String,
    pub cleaned: String,
}

/// Establish the prompt sentinel from the REPL's startup/probe output.
///
/// An idle line-based REPL leaves its prompt as an unterminated trailing
/// fragment (`tau> ` with no newline). That fragment, trimmed, is the
/// sentinel. Some REPLs terminate the prompt line; for those, fall back
/// to the last non-empty line. Returns `None` when the output carries no
/// usable marker at all.
pub fn detect_sentinel(output: &str) -> Option<String> {
    let stripped = strip_ansi(output);
    let fragment = stripped.rsplit('\n').next().unwrap_or("").trim();
    if !fragment.is_empty() {
        return Some(fragment.to_string());
    }
    stripped
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(str::to_string)
}

/// Remove echo and prompt noise from a framed payload.
///
/// Drops lines that are just the sentinel, and at most one *leading*
/// line that echoes the submitted command (either bare or in the
/// `<sentinel> <command>` form the REPL prints when echoing input after
/// its prompt). Everything else is preserved verbatim apart from
/// trailing whitespace, so cleaning an already-cleaned payload is a
/// no-op.
pub fn clean_payload(payload: &str, echo: Option<&str>, sentinel: &str) -> String {
    let mut out: Vec<&str> = Vec::new();
    let mut echo_pending = echo.map(str::trim).filter(|c| !c.is_empty());

    for line in payload.lines() {
        let trimmed = line.trim();
        if trimmed == sentinel {
            continue;
        }
        if out.is_empty() {
            if let Some(cmd) = echo_pending {
                if trimmed == cmd || trimmed == format!("{sentinel} {cmd}") {
                    echo_pending = None;
                    continue;
                }
            }
        }
        out.push(line);
    }

    out.join("\n").trim_end().to_string()
}

enum Boundary {
    /// A complete line holding only the sentinel: payload ends at the
    /// first offset, the buffer resumes at the second.
    Line(usize, usize),
    /// An unterminated trailing fragment holding only the sentinel.
    Fragment(usize),
}

/// Accumulates raw output and segments it into [`ResponseUnit`]s.
pub struct Framer {
    sentinel: String,
    buf: String,
    limit: usize,
}

impl Framer {
    pub fn new(sentinel: impl Into<String>, limit: usize) -> Self {
        Self {
            sentinel: sentinel.into(),
            buf: String::new(),
            limit,
        }
    }

    pub fn sentinel(&self) -> &str {
        &self.sentinel
    }

    /// Append a raw chunk and return any response units it completes.
    ///
    /// `echo` is the most recently submitted command, used to strip its
    /// echo from the cleaned payload. A partial sentinel split across
    /// chunks stays buffered until the rest arrives. If the buffer
    /// exceeds its bound without a sentinel the accumulated text is
    /// discarded and `FramingOverflow` is surfaced — almost always a
    /// sign of sentinel miscalibration, not of a long response.
    pub fn push(
        &mut self,
        chunk: &str,
        echo: Option<&str>,
    ) -> Result<Vec<ResponseUnit>, ReplError> {
        self.buf.push_str(&strip_ansi(chunk));

        let mut units = Vec::new();
        loop {
            match self.find_boundary() {
                Some(Boundary::Line(payload_end, rest_start)) => {
                    let payload = self.buf[..payload_end].to_string();
                    self.buf = self.buf.split_off(rest_start);
                    units.push(self.make_unit(payload, echo));
                }
                Some(Boundary::Fragment(payload_end)) => {
                    let payload = self.buf[..payload_end].to_string();
                    self.buf.clear();
                    units.push(self.make_unit(payload, echo));
                    break;
                }
                None => break,
            }
        }

        if units.is_empty() && self.buf.len() > self.limit {
            self.buf.clear();
            return Err(ReplError::FramingOverflow { limit: self.limit });
        }
        Ok(units)
    }

    /// Bytes currently buffered without a terminating sentinel.
    pub fn pending_len(&self) -> usize {
        self.buf.len()
    }

    fn find_boundary(&self) -> Option<Boundary> {
        let mut offset = 0;
        for piece in self.buf.split_inclusive('\n') {
            let terminated = piece.ends_with('\n');
            let content = piece.trim_end_matches(['\n', '\r']);
            if content.trim() == self.sentinel {
                return Some(if terminated {
                    Boundary::Line(offset, offset + piece.len())
                } else {
                    Boundary::Fragment(offset)
                });
            }
            offset += piece.len();
        }
        None
    }

    fn make_unit(&self, payload: String, echo: Option<&str>) -> ResponseUnit {
        let cleaned = clean_payload(&payload, echo, &self.sentinel);
        let raw = payload.trim_end_matches(['\n', '\r']).to_string();
        ResponseUnit { raw, cleaned }
    }
}
