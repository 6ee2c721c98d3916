//! Record-level model of an `exports` object
//!
//! An `exports` attribute holds the key/value pairs a context hands to the
//! consuming process. To add or overwrite a single export without disturbing
//! anything else, the object's raw text is split into an ordered list of
//! [ExportRecord]s, one per line: real entries, comment lines and blank
//! lines all become records, so re-serializing the list reproduces the
//! original bytes except for the records that were deliberately changed.
//!
//! Parsing is a small state machine over lines. `AtKey` consumes text up to
//! the first `=`; everything after it is the value. Two transitions leave
//! the ordinary path: a comment or blank line becomes a pass-through record,
//! and a value opening a heredoc switches to `InHeredoc`, which copies lines
//! verbatim until the closing marker.
//!
//! This layer does not validate syntax and does not reject duplicate keys;
//! the document is expected to have gone through the outer parser first, and
//! duplicate handling is the mutation layer's call.

use crate::diagnostics::{Diagnostic, Diagnostics};
use crate::raw;
use hcl_edit::expr::Expression;
use once_cell::sync::Lazy;
use regex::Regex;

static EXPORT_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new("^[A-Z_][A-Z0-9_]+$").expect("export name pattern must compile")
});

/// An export must be usable as an environment variable name: uppercase
/// letters, digits and underscores, not starting with a digit, at least two
/// characters.
pub fn validate_export_name(name: &str) -> bool {
    EXPORT_NAME.is_match(name)
}

/// One line of an `exports` object
///
/// When `value` is empty the record is a pass-through (comment or blank
/// line) and `name` holds the full line to reproduce verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportRecord {
    pub name: String,
    pub value: String,
    pub is_comment: bool,
}

impl ExportRecord {
    fn entry(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            is_comment: false,
        }
    }

    fn passthrough(line: impl Into<String>) -> Self {
        Self {
            name: line.into(),
            value: String::new(),
            is_comment: true,
        }
    }

    /// Replace the value, leaving name and kind untouched.
    pub fn set_value(&mut self, value: impl Into<String>) {
        self.value = value.into();
    }

    fn line(&self) -> String {
        if self.value.is_empty() {
            format!("{}\n", self.name)
        } else {
            format!("{}={}\n", self.name, self.value)
        }
    }
}

/// Parser state, one variant per named state.
enum ScanState {
    /// At the start of a record, looking for key text and the first `=`.
    AtKey,
    /// Inside a heredoc value; lines pass through until the marker closes it.
    InHeredoc { marker: String },
}

/// Ordered list of [ExportRecord]s plus the object's own brace formatting
#[derive(Debug, Clone, Default)]
pub struct ExportRecordList {
    /// Text from the start of the object through the newline after `{`.
    head: String,
    records: Vec<ExportRecord>,
    /// The closing line, usually indentation followed by `}`.
    tail: String,
}

impl ExportRecordList {
    /// Split the raw text of an exports object into records.
    ///
    /// Order is preserved, duplicates are kept; first-match versus
    /// last-match is a policy decision for callers.
    pub fn parse(object_text: &str) -> Self {
        let Some(open) = object_text.find('{') else {
            return Self {
                head: object_text.to_string(),
                records: Vec::new(),
                tail: String::new(),
            };
        };
        let close = object_text.rfind('}').unwrap_or(object_text.len());

        let head_end = match object_text[open..close].find('\n') {
            Some(offset) => open + offset + 1,
            None => {
                // single-line object; everything between the braces is one
                // record line and serialization will spread it out
                let inner = &object_text[open + 1..close];
                let mut list = Self {
                    head: object_text[..=open].to_string(),
                    records: Vec::new(),
                    tail: object_text[close..].to_string(),
                };
                if !inner.trim().is_empty() {
                    list.scan(inner);
                }
                return list;
            }
        };

        let tail_start = object_text[..close]
            .rfind('\n')
            .map(|idx| idx + 1)
            .unwrap_or(close);

        let mut list = Self {
            head: object_text[..head_end].to_string(),
            records: Vec::new(),
            tail: object_text[tail_start..].to_string(),
        };

        let inner = &object_text[head_end..tail_start];
        list.scan(inner.strip_suffix('\n').unwrap_or(inner));
        list
    }

    fn scan(&mut self, inner: &str) {
        if inner.is_empty() {
            return;
        }

        let mut state = ScanState::AtKey;
        let mut pending: Option<ExportRecord> = None;

        for line in inner.split('\n') {
            state = self.step(state, line, &mut pending);
        }

        // unterminated heredoc; keep what we have rather than losing it
        if let Some(record) = pending.take() {
            self.records.push(record);
        }
    }

    /// One transition of the scanner: consume a line, return the next state.
    fn step(
        &mut self,
        state: ScanState,
        line: &str,
        pending: &mut Option<ExportRecord>,
    ) -> ScanState {
        match state {
            ScanState::AtKey => {
                let trimmed = line.trim_start();

                if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with("//") {
                    self.records.push(ExportRecord::passthrough(line));
                    return ScanState::AtKey;
                }

                let Some(eq) = line.find('=') else {
                    // stray text; keep it so nothing is silently dropped
                    self.records.push(ExportRecord::passthrough(line));
                    return ScanState::AtKey;
                };

                let key = &line[..eq];
                let value = &line[eq + 1..];

                match heredoc_marker(value) {
                    Some(marker) => {
                        *pending = Some(ExportRecord::entry(key, value));
                        ScanState::InHeredoc { marker }
                    }
                    None => {
                        self.records.push(ExportRecord::entry(key, value));
                        ScanState::AtKey
                    }
                }
            }
            ScanState::InHeredoc { marker } => {
                let record = pending.as_mut().expect("heredoc state implies a record");
                record.value.push('\n');
                record.value.push_str(line);

                if line.trim() == marker {
                    self.records
                        .push(pending.take().expect("record present"));
                    ScanState::AtKey
                } else {
                    ScanState::InHeredoc { marker }
                }
            }
        }
    }

    pub fn records(&self) -> &[ExportRecord] {
        &self.records
    }

    pub fn records_mut(&mut self) -> &mut [ExportRecord] {
        &mut self.records
    }

    /// Names of all real (non pass-through) records, trimmed, in order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.records
            .iter()
            .filter(|record| !record.is_comment)
            .map(|record| record.name.trim())
    }

    /// Whether an export with this (trimmed) name exists.
    pub fn exists(&self, export_name: &str) -> bool {
        self.names().any(|name| name == export_name)
    }

    /// Names that occur more than once.
    pub fn duplicate_names(&self) -> Vec<String> {
        let mut seen = indexmap::IndexMap::<&str, usize>::new();
        for name in self.names() {
            *seen.entry(name).or_default() += 1;
        }
        seen.into_iter()
            .filter(|(_, count)| *count > 1)
            .map(|(name, _)| name.to_string())
            .collect()
    }

    /// Indentation used by existing entries, for appended records.
    fn entry_indent(&self) -> String {
        self.records
            .iter()
            .find(|record| !record.is_comment)
            .map(|record| {
                record
                    .name
                    .chars()
                    .take_while(|c| c.is_whitespace())
                    .collect()
            })
            .unwrap_or_else(|| "    ".to_string())
    }

    /// Append a new entry, matching the indentation of its neighbors.
    pub fn append(&mut self, export_name: &str, value: &str) {
        let name = format!("{}{} ", self.entry_indent(), export_name);
        self.records.push(ExportRecord::entry(name, value));
    }

    /// The object as raw text, braces and all.
    pub fn to_object_text(&self) -> String {
        let mut text = self.head.clone();
        if !text.ends_with('\n') && !(self.records.is_empty() && self.tail == "}") {
            text.push('\n');
        }
        for record in &self.records {
            text.push_str(&record.line());
        }
        text.push_str(&self.tail);
        text
    }

    /// Re-serialize to an expression.
    ///
    /// Every record is re-tokenized individually first; a record that does
    /// not parse on its own contributes a diagnostic and fails the whole
    /// serialization, so a bad record can never be half-written.
    pub fn to_expression(&self) -> Result<Expression, Diagnostics> {
        let mut diagnostics = Diagnostics::new();
        for record in &self.records {
            if let Err(record_diagnostics) = raw::parse_fragment(&record.line()) {
                let mut diagnostic = Diagnostic::error(
                    "cannot re-serialize export record",
                    format!("record does not tokenize: {}", record.line().trim_end()),
                );
                if let Some(cause) = record_diagnostics.iter().next() {
                    diagnostic.detail = format!("{}: {}", diagnostic.detail, cause.detail);
                }
                diagnostics.push(diagnostic);
            }
        }
        if diagnostics.has_errors() {
            return Err(diagnostics);
        }

        let fragment = format!("exports = {}\n", self.to_object_text());
        raw::attribute_value_expr(&fragment, "exports")?.ok_or_else(|| {
            Diagnostic::error(
                "cannot re-serialize exports object",
                "re-serialized object did not parse back as an attribute value",
            )
            .into()
        })
    }
}

fn heredoc_marker(value: &str) -> Option<String> {
    let trimmed = value.trim_start();
    let rest = trimmed.strip_prefix("<<")?;
    let rest = rest.strip_prefix('-').unwrap_or(rest);
    let marker = rest.trim();
    if marker.is_empty() {
        return None;
    }
    Some(marker.to_string())
}
