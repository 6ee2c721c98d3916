//! Structured error and warning reporting
//!
//! Operations on a config document rarely fail with a single bare error.
//! Decoding a document can surface several independent problems at once and
//! we want to report all of them, not just the first. A [Diagnostic] is one
//! such problem; [Diagnostics] is the ordered collection an operation hands
//! back to its caller.
//!
//! The presence of any [Severity::Error] entry means the operation did not
//! complete and no file was written.

use std::fmt;

/// How bad it is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

/// Approximate location in the source document, in lines
///
/// Line numbers are 1-based. Positions derived from heredoc-stripped text
/// carry an offset adjustment and may be off by a line or two.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceRange {
    pub start_line: usize,
    pub end_line: usize,
}

/// A single problem found while parsing, editing or evaluating a document
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    pub summary: String,
    pub detail: String,
    pub range: Option<SourceRange>,
}

impl Diagnostic {
    pub fn error(summary: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            summary: summary.into(),
            detail: detail.into(),
            range: None,
        }
    }

    pub fn warning(summary: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            summary: summary.into(),
            detail: detail.into(),
            range: None,
        }
    }

    pub fn with_range(mut self, range: SourceRange) -> Self {
        self.range = Some(range);
        self
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let severity = match self.severity {
            Severity::Error => "error",
            Severity::Warning => "warning",
        };
        write!(f, "{severity}: {}", self.summary)?;
        if !self.detail.is_empty() {
            write!(f, "; {}", self.detail)?;
        }
        if let Some(range) = &self.range {
            write!(f, " (around line {})", range.start_line)?;
        }
        Ok(())
    }
}

/// Ordered collection of [Diagnostic]s produced by one operation
#[derive(Debug, Clone, Default, derive_new::new)]
pub struct Diagnostics {
    #[new(default)]
    entries: Vec<Diagnostic>,
}

impl Diagnostics {
    pub fn push(&mut self, diagnostic: Diagnostic) {
        tracing::trace!(%diagnostic, "diagnostic recorded");
        self.entries.push(diagnostic);
    }

    pub fn extend(&mut self, other: Diagnostics) {
        self.entries.extend(other.entries);
    }

    pub fn has_errors(&self) -> bool {
        self.entries
            .iter()
            .any(|d| d.severity == Severity::Error)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.entries.iter()
    }
}

impl From<Diagnostic> for Diagnostics {
    fn from(value: Diagnostic) -> Self {
        let mut diagnostics = Diagnostics::new();
        diagnostics.push(value);
        diagnostics
    }
}

impl IntoIterator for Diagnostics {
    type Item = Diagnostic;
    type IntoIter = std::vec::IntoIter<Diagnostic>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl std::error::Error for Diagnostics {}

impl fmt::Display for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for entry in &self.entries {
            if !first {
                writeln!(f)?;
            }
            write!(f, "{entry}")?;
            first = false;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn error_entries_are_detected() {
        let mut diagnostics = Diagnostics::new();
        assert!(!diagnostics.has_errors());

        diagnostics.push(Diagnostic::warning("just a warning", ""));
        assert!(!diagnostics.has_errors());

        diagnostics.push(Diagnostic::error("cannot overwrite export", "detail"));
        assert!(diagnostics.has_errors());
        assert_eq!(diagnostics.len(), 2);
    }

    #[test]
    fn display_includes_summary_and_detail() {
        let diagnostic = Diagnostic::error(
            "cannot execute command",
            "command \"exit 1\" returned 1",
        );
        assert_eq!(
            diagnostic.to_string(),
            "error: cannot execute command; command \"exit 1\" returned 1"
        );
    }
}
