//! Tokenizer for the dissector's quoted, tab-separated field output
//! (`-T fields -E separator=\t -E quote=d -E header=y`).
//!
//! Fields may be wrapped in double quotes. Inside quotes the separator and
//! newlines are literal, `""` is an escaped quote, and a quote that is not
//! followed by a separator or end of line is kept as a literal character
//! (the dissector does not escape quotes embedded in decoded values).

use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    FieldStart,
    Unquoted,
    Quoted,
    /// Just saw a quote inside a quoted field: either a closing quote or the
    /// first half of `""`.
    QuoteInQuoted,
}

/// Assembles records from lines, carrying quoted fields across line breaks.
#[derive(Debug)]
pub struct FieldReader {
    separator: char,
    quote: char,
    state: State,
    current: String,
    fields: Vec<String>,
}

impl Default for FieldReader {
    fn default() -> Self {
        Self::new('\t', '"')
    }
}

impl FieldReader {
    pub fn new(separator: char, quote: char) -> Self {
        Self {
            separator,
            quote,
            state: State::FieldStart,
            current: String::new(),
            fields: Vec::new(),
        }
    }

    /// Feeds one line (without terminator). Returns a record once it is complete.
    pub fn push_line(&mut self, line: &str) -> Option<Vec<String>> {
        if self.state == State::Quoted {
            // The previous line ended inside quotes.
            self.current.push('\n');
        }
        for ch in line.chars() {
            self.push_char(ch);
        }
        match self.state {
            State::Quoted => None,
            _ => Some(self.take_record()),
        }
    }

    /// Flushes a record left open by an unterminated quote at end of input.
    pub fn finish(&mut self) -> Option<Vec<String>> {
        if self.state == State::Quoted || !self.current.is_empty() || !self.fields.is_empty() {
            Some(self.take_record())
        } else {
            None
        }
    }

    fn push_char(&mut self, ch: char) {
        match self.state {
            State::FieldStart => {
                if ch == self.quote {
                    self.state = State::Quoted;
                } else if ch == self.separator {
                    self.end_field();
                } else {
                    self.current.push(ch);
                    self.state = State::Unquoted;
                }
            }
            State::Unquoted => {
                if ch == self.separator {
                    self.end_field();
                } else {
                    self.current.push(ch);
                }
            }
            State::Quoted => {
                if ch == self.quote {
                    self.state = State::QuoteInQuoted;
                } else {
                    self.current.push(ch);
                }
            }
            State::QuoteInQuoted => {
                if ch == self.quote {
                    self.current.push(self.quote);
                    self.state = State::Quoted;
                } else if ch == self.separator {
                    self.end_field();
                } else {
                    self.current.push(self.quote);
                    self.current.push(ch);
                    self.state = State::Quoted;
                }
            }
        }
    }

    fn end_field(&mut self) {
        self.fields.push(std::mem::take(&mut self.current));
        self.state = State::FieldStart;
    }

    fn take_record(&mut self) -> Vec<String> {
        self.fields.push(std::mem::take(&mut self.current));
        self.state = State::FieldStart;
        std::mem::take(&mut self.fields)
    }
}

/// Column lookup built from the header record.
#[derive(Debug, Clone, Default)]
pub struct HeaderIndex {
    columns: HashMap<String, usize>,
}

impl HeaderIndex {
    pub fn new(header: &[String]) -> Self {
        let columns = header
            .iter()
            .enumerate()
            .map(|(idx, name)| (name.trim().to_string(), idx))
            .collect();
        Self { columns }
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Trimmed value of `name` in `record`; empty values read as absent.
    pub fn get<'r>(&self, record: &'r [String], name: &str) -> Option<&'r str> {
        let idx = *self.columns.get(name)?;
        record
            .get(idx)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    pub fn get_u64(&self, record: &[String], name: &str) -> Option<u64> {
        self.get(record, name)?.parse().ok()
    }

    pub fn get_f64(&self, record: &[String], name: &str) -> Option<f64> {
        self.get(record, name)?
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(lines: &[&str]) -> Vec<Vec<String>> {
        let mut reader = FieldReader::default();
        let mut out: Vec<Vec<String>> = lines.iter().filter_map(|l| reader.push_line(l)).collect();
        out.extend(reader.finish());
        out
    }

    #[test]
    fn quoted_tab_separated_fields() {
        let rows = parse(&["\"1\"\t\"1700000000.5\"\t\"\"\t\"eth:ip:tcp\""]);
        assert_eq!(rows, vec![vec!["1", "1700000000.5", "", "eth:ip:tcp"]]);
    }

    #[test]
    fn separator_inside_quotes_is_literal() {
        let rows = parse(&["\"a\tb\"\t\"c\""]);
        assert_eq!(rows, vec![vec!["a\tb", "c"]]);
    }

    #[test]
    fn doubled_quote_is_an_escaped_quote() {
        let rows = parse(&["\"say \"\"hi\"\"\"\t\"x\""]);
        assert_eq!(rows, vec![vec!["say \"hi\"", "x"]]);
    }

    #[test]
    fn unescaped_embedded_quote_is_kept() {
        let rows = parse(&["\"GET /?q=\"x\" HTTP\"\t\"2\""]);
        assert_eq!(rows, vec![vec!["GET /?q=\"x\" HTTP", "2"]]);
    }

    #[test]
    fn quoted_newline_spans_lines() {
        let rows = parse(&["\"first", "second\"\t\"3\"", "\"4\"\t\"5\""]);
        assert_eq!(
            rows,
            vec![vec!["first\nsecond", "3"], vec!["4", "5"]]
        );
    }

    #[test]
    fn unquoted_and_empty_fields() {
        let rows = parse(&["1\t\t3"]);
        assert_eq!(rows, vec![vec!["1", "", "3"]]);
    }

    #[test]
    fn header_lookup_treats_blank_as_missing() {
        let header = HeaderIndex::new(&["frame.number".to_string(), "ip.src".to_string()]);
        let record = vec!["42".to_string(), "  ".to_string()];
        assert_eq!(header.get_u64(&record, "frame.number"), Some(42));
        assert_eq!(header.get(&record, "ip.src"), None);
        assert_eq!(header.get(&record, "tcp.srcport"), None);
    }
}
