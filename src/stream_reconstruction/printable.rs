//! Printable-ASCII rendering of raw payload bytes and byte-budgeted text.

/// Stand-in for bytes outside the printable range.
pub const PLACEHOLDER: char = '.';

pub fn is_printable(byte: u8) -> bool {
    matches!(byte, 0x20..=0x7e | b'\r' | b'\n' | b'\t')
}

/// Printable range verbatim, CR/LF/TAB kept, everything else [`PLACEHOLDER`].
pub fn render(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|&b| if is_printable(b) { b as char } else { PLACEHOLDER })
        .collect()
}

/// Text that stops growing at `limit` bytes and remembers that it did.
#[derive(Debug, Clone)]
pub struct BudgetedText {
    text: String,
    limit: usize,
    truncated: bool,
}

impl BudgetedText {
    pub fn new(limit: usize) -> Self {
        Self {
            text: String::new(),
            limit,
            truncated: false,
        }
    }

    /// Appends what fits. Returns `false` once the budget is exhausted.
    pub fn push_str(&mut self, s: &str) -> bool {
        if self.truncated {
            return false;
        }
        let room = self.limit.saturating_sub(self.text.len());
        if s.len() <= room {
            self.text.push_str(s);
            return true;
        }
        let mut cut = room;
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        self.text.push_str(&s[..cut]);
        self.truncated = true;
        false
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    pub fn ends_with_newline(&self) -> bool {
        self.text.ends_with('\n')
    }

    pub fn into_parts(self) -> (String, bool) {
        (self.text, self.truncated)
    }
}
