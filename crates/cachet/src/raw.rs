//! Raw text fragment utilities
//!
//! The editing side of this crate works on raw, re-serializable text rather
//! than on evaluated values. These helpers wrap [hcl_edit::parser] so higher
//! layers can turn a text fragment into structure (and back) without losing
//! a single byte of the original formatting.
//!
//! All functions here are pure; they never touch the filesystem.

use crate::diagnostics::{Diagnostic, Diagnostics};
use hcl_edit::expr::Expression;
use hcl_edit::structure::{Block, Body, Structure};

/// Parse a standalone text fragment as a complete mini-document.
///
/// The fragment must be valid on its own; a syntax error is returned as a
/// single error diagnostic carrying the parser's message.
pub fn parse_fragment(text: &str) -> Result<Body, Diagnostics> {
    hcl_edit::parser::parse_body(text).map_err(|err| {
        Diagnostic::error("cannot parse fragment", err.to_string()).into()
    })
}

/// Parse a fragment that contains exactly one top-level block.
pub fn parse_single_block(text: &str) -> Result<Block, Diagnostics> {
    let body = parse_fragment(text)?;
    let mut blocks = body.into_iter().filter_map(|structure| match structure {
        Structure::Block(block) => Some(block),
        Structure::Attribute(_) => None,
    });

    match (blocks.next(), blocks.next()) {
        (Some(block), None) => Ok(block),
        _ => Err(Diagnostic::error(
            "cannot parse fragment",
            "expected exactly one block in fragment",
        )
        .into()),
    }
}

/// Return the expression on the right-hand side of the named attribute.
///
/// `text` is parsed as a fragment containing top-level attributes. `Ok(None)`
/// means the fragment is well-formed but the attribute is absent, so callers
/// can tell "malformed" from "not present".
pub fn attribute_value_expr(
    text: &str,
    attribute_name: &str,
) -> Result<Option<Expression>, Diagnostics> {
    let body = parse_fragment(text)?;
    Ok(body
        .get_attribute(attribute_name)
        .map(|attribute| attribute.value.clone()))
}

/// Like [attribute_value_expr] but returns the raw expression text, with
/// surrounding trivia trimmed.
pub fn attribute_value_text(
    text: &str,
    attribute_name: &str,
) -> Result<Option<String>, Diagnostics> {
    Ok(attribute_value_expr(text, attribute_name)?
        .map(|expression| expression.to_string().trim().to_string()))
}

/// The literal text of a string or heredoc expression, with quote and
/// heredoc delimiters removed.
///
/// Removing a heredoc delimiter removes a source line, so the returned
/// offsets record how far the content has shifted relative to the original
/// expression: `start` counts removed lines before the content, `end` counts
/// removed lines after it. Positions adjusted this way are approximate.
pub fn literal_text_with_offsets(
    expression_text: &str,
) -> Result<(String, i64, i64), Diagnostics> {
    let text = expression_text.trim();

    if let Some(rest) = text.strip_prefix("<<") {
        // `<<-EOT\n ... \n  EOT`: drop the opening marker line and the
        // closing marker line, keep everything in between verbatim.
        let rest = rest.strip_prefix('-').unwrap_or(rest);
        let Some((_marker, body)) = rest.split_once('\n') else {
            return Err(Diagnostic::error(
                "cannot extract literal text",
                format!("heredoc without content: {text}"),
            )
            .into());
        };
        let content = match body.rsplit_once('\n') {
            Some((content, _closing)) => content,
            None => "",
        };
        return Ok((content.trim().to_string(), 1, -1));
    }

    if text.len() >= 2 && text.starts_with('"') && text.ends_with('"') {
        let inner = &text[1..text.len() - 1];
        return Ok((unescape_quotes(inner).trim().to_string(), 0, 0));
    }

    Err(Diagnostic::error(
        "cannot extract literal text",
        format!("expected a quoted string or heredoc, got: {text}"),
    )
    .into())
}

/// The payload of a heredoc carrying an encoded blob: delimiters dropped,
/// all whitespace and line breaks squeezed out.
pub fn heredoc_payload(expression_text: &str) -> Result<String, Diagnostics> {
    let (content, _, _) = literal_text_with_offsets(expression_text)?;
    Ok(content.chars().filter(|c| !c.is_whitespace()).collect())
}

fn unescape_quotes(text: &str) -> String {
    text.replace("\\\"", "\"")
}

/// 1-based line number of a byte offset in `source`.
pub fn line_of_offset(source: &str, offset: usize) -> usize {
    let offset = offset.min(source.len());
    source[..offset].matches('\n').count() + 1
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn fragment_parses() {
        let body = parse_fragment("name = \"tim\"\n").expect("fragment must parse");
        assert!(body.get_attribute("name").is_some());
    }

    #[test]
    fn fragment_syntax_error_is_a_diagnostic() {
        let diagnostics = parse_fragment("not = valid = hcl").expect_err("must fail");
        assert!(diagnostics.has_errors());
    }

    #[test]
    fn attribute_value_of_present_attribute() {
        let text = attribute_value_text(
            "DB_PASSWORD = decrypt(\"DEV\", \"c3VwZXJTZWNyZXRQcm9k\")\n",
            "DB_PASSWORD",
        )
        .expect("fragment must parse")
        .expect("attribute must exist");
        assert_eq!(text, "decrypt(\"DEV\", \"c3VwZXJTZWNyZXRQcm9k\")");
    }

    #[test]
    fn absent_attribute_is_none_not_an_error() {
        let result = attribute_value_text("first_name = \"tim\"\n", "last_name")
            .expect("fragment must parse");
        assert_eq!(result, None);
    }

    #[test]
    fn quoted_literal_is_unescaped() {
        let (text, start, end) =
            literal_text_with_offsets(r#""echo \"Hello, ${name}.\"""#).unwrap();
        assert_eq!(text, r#"echo "Hello, ${name}.""#);
        assert_eq!((start, end), (0, 0));
    }

    #[test]
    fn heredoc_literal_keeps_content_lines() {
        let (text, start, end) = literal_text_with_offsets(
            "<<-EOT\n    echo \"one\"\n    echo \"two\"\n  EOT",
        )
        .unwrap();
        assert_eq!(text, "echo \"one\"\n    echo \"two\"");
        assert_eq!((start, end), (1, -1));
    }

    #[test]
    fn heredoc_payload_squeezes_whitespace() {
        let payload = heredoc_payload("<<-EOT\n    aGVs\n    bG8=\n  EOT").unwrap();
        assert_eq!(payload, "aGVsbG8=");
    }

    #[test]
    fn bare_expression_is_rejected() {
        let diagnostics = literal_text_with_offsets("[1, 2]").expect_err("must fail");
        assert!(diagnostics.has_errors());
    }

    #[test]
    fn parses_a_single_block() {
        let block = parse_single_block("public_key \"DEV2022\" {\n}\n").unwrap();
        assert_eq!(block.ident.value().as_str(), "public_key");
        assert_eq!(block.labels.len(), 1);
    }
}
