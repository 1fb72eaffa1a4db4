use crate::report::tail_chars;
use once_cell::sync::Lazy;
use regex::Regex;

static ANSI_ESCAPE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\x1B\[[0-?]*[ -/]*[@-~]").expect("valid ansi escape regex"));

/// Upper bound for an unterminated line held between chunks.
pub const MAX_PENDING_LINE_BYTES: usize = 64 * 1024;

pub fn strip_terminal_codes(value: &str) -> String {
    ANSI_ESCAPE_RE.replace_all(value, "").replace('\r', "")
}

/// Reassembles complete lines from arbitrarily split output chunks.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: String,
    dropped_bytes: usize,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &str) -> Vec<String> {
        self.pending.push_str(chunk);

        let mut lines = Vec::new();
        while let Some(index) = self.pending.find(['\n', '\r']) {
            let line: String = self.pending[..index].to_string();
            let advance = if self.pending[index..].starts_with("\r\n") { 2 } else { 1 };
            self.pending.drain(..index + advance);
            if !line.is_empty() {
                lines.push(line);
            }
        }

        if self.pending.len() > MAX_PENDING_LINE_BYTES {
            let mut cut = self.pending.len() - MAX_PENDING_LINE_BYTES;
            while !self.pending.is_char_boundary(cut) {
                cut += 1;
            }
            self.pending.drain(..cut);
            self.dropped_bytes = self.dropped_bytes.saturating_add(cut);
        }

        lines
    }

    pub fn take_dropped_bytes(&mut self) -> usize {
        std::mem::take(&mut self.dropped_bytes)
    }

    /// Returns the trailing partial line, if any.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.pending);
        if rest.trim().is_empty() {
            None
        } else {
            Some(rest)
        }
    }
}

/// Rolling window over the last `limit` characters of a process stream.
#[derive(Debug)]
pub struct OutputTail {
    text: String,
    limit: usize,
}

impl OutputTail {
    pub fn new(limit: usize) -> Self {
        Self {
            text: String::new(),
            limit,
        }
    }

    pub fn push(&mut self, chunk: &str) {
        self.text.push_str(chunk);
        // Compact only once the window doubles so pushes stay amortized.
        if self.text.len() > self.limit.saturating_mul(2).max(1024) {
            self.text = tail_chars(&self.text, self.limit).to_string();
        }
    }

    pub fn as_str(&self) -> &str {
        tail_chars(&self.text, self.limit)
    }
}
