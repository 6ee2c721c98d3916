//! Format-preserving edits to a config document
//!
//! [DocumentEditor] mutates a config file in place: importing a public key,
//! adding an encrypted secret to a context, or re-sorting the top-level
//! blocks into the canonical section order. Everything the edit does not
//! touch must come back out byte-for-byte, comments and blank lines
//! included, which is why all edits go through [hcl_edit] and the raw-text
//! record model rather than an evaluated representation.
//!
//! An editor instance parses its file once, on first use, and caches the
//! result. Instances are not meant to be shared; one edit operation, one
//! editor, one writer at a time. The file write replaces the whole document
//! through a temp file in the same directory, so other readers observe
//! either the old document or the new one, never a half-written file.

use crate::crypto::Encryptor;
use crate::diagnostics::{Diagnostic, Diagnostics};
use crate::exports::{validate_export_name, ExportRecordList};
use crate::raw;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hcl_edit::repr::Decorate;
use hcl_edit::structure::{AttributeMut, Block, BlockLabel, Body, Structure};
use once_cell::sync::Lazy;
use regex::Regex;
use std::io::Write;
use std::path::{Path, PathBuf};

static PUBLIC_KEY_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new("^[A-Z][A-Z0-9]+$").expect("public key name pattern must compile")
});

/// Key material labels are uppercase letters and digits, starting with a
/// letter, at least two characters.
pub fn validate_public_key_name(name: &str) -> bool {
    PUBLIC_KEY_NAME.is_match(name)
}

fn block_label(block: &Block) -> &str {
    block.labels.first().map(BlockLabel::as_str).unwrap_or("")
}

fn is_block_named(block: &Block, block_type: &str, name: &str) -> bool {
    block.ident.value().as_str() == block_type && block_label(block) == name
}

#[derive(Debug)]
struct ParsedDocument {
    body: Body,
    source: String,
}

/// Editor over one config file, parsed lazily and cached.
#[derive(Debug)]
pub struct DocumentEditor {
    path: PathBuf,
    parsed: Option<ParsedDocument>,
}

impl DocumentEditor {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            parsed: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Parse the file on first use. The file must exist and be readable.
    fn parse(&mut self) -> Result<(), Diagnostics> {
        if self.parsed.is_some() {
            return Ok(());
        }

        let source = std::fs::read_to_string(&self.path).map_err(|err| {
            Diagnostics::from(Diagnostic::error(
                "cannot read config file",
                format!(
                    "error reading config file at path {}: {err}",
                    self.path.display()
                ),
            ))
        })?;
        let body = raw::parse_fragment(&source)?;

        self.parsed = Some(ParsedDocument { body, source });
        Ok(())
    }

    fn parsed(&self) -> &ParsedDocument {
        self.parsed.as_ref().expect("parse() populates the cache")
    }

    /// Add (or with `overwrite` replace) a `public_key` block holding the
    /// base64 of `key_material`, then re-sort and rewrite the file.
    pub fn add_public_key(
        &mut self,
        pubkey_name: &str,
        key_material: &[u8],
        overwrite: bool,
    ) -> Result<(), Diagnostics> {
        if !validate_public_key_name(pubkey_name) {
            return Err(Diagnostic::error(
                "invalid public key name",
                format!(
                    "cannot add public key \"{pubkey_name}\" to config file, name of public key must consist of uppercase letters and numbers"
                ),
            )
            .into());
        }

        self.parse()?;

        let exists = self
            .parsed()
            .body
            .iter()
            .any(|structure| match structure {
                Structure::Block(block) => is_block_named(block, "public_key", pubkey_name),
                _ => false,
            });
        if exists && !overwrite {
            return Err(Diagnostic::error(
                "cannot overwrite public_key block",
                format!("cannot overwrite existing public_key block named {pubkey_name}"),
            )
            .into());
        }

        let block = public_key_block(pubkey_name, key_material)?;

        let parsed = self.parsed.take().expect("parse() populates the cache");
        let mut body = Body::default();
        for structure in parsed.body {
            if let Structure::Block(existing) = &structure {
                if is_block_named(existing, "public_key", pubkey_name) {
                    // being replaced
                    continue;
                }
            }
            body.push(structure);
        }
        body.push(Structure::Block(block));

        let sorted = sorted_source(body);
        self.write(&sorted)?;
        self.parsed = Some(ParsedDocument {
            body: raw::parse_fragment(&sorted)?,
            source: sorted,
        });
        Ok(())
    }

    /// Encrypt `secret` under the named public key and set it as the value
    /// of `export_name` inside `context_name`'s exports.
    ///
    /// Nothing is written unless every step before the write succeeded.
    pub fn add_secret(
        &mut self,
        context_name: &str,
        export_name: &str,
        secret: &str,
        pubkey_name: &str,
        overwrite: bool,
    ) -> Result<(), Diagnostics> {
        self.parse()?;

        let keyset_json = {
            let key_material = public_key_material(&self.parsed().body, pubkey_name)?;
            String::from_utf8(key_material).map_err(|_| {
                Diagnostics::from(Diagnostic::error(
                    "invalid public_key block",
                    format!("key material of public_key \"{pubkey_name}\" is not valid UTF-8"),
                ))
            })?
        };

        let encryptor = Encryptor::new(&keyset_json).map_err(|err| {
            Diagnostics::from(Diagnostic::error(
                "could not encrypt",
                format!("could not encrypt secret using public_key \"{pubkey_name}\": {err}"),
            ))
        })?;
        let ciphertext = encryptor.encrypt(secret.as_bytes(), None).map_err(|err| {
            Diagnostics::from(Diagnostic::error(
                "could not encrypt",
                format!("could not encrypt secret using public_key \"{pubkey_name}\": {err}"),
            ))
        })?;
        let encrypted_b64 = BASE64.encode(&ciphertext);

        {
            let parsed = self.parsed.as_mut().expect("parse() populates the cache");
            let mut exports = ExportsEditor::new(&mut parsed.body, context_name);
            exports.set_encrypted_value(export_name, pubkey_name, &encrypted_b64, overwrite)?;
        }

        let source = self.parsed().body.to_string();
        self.write(&source)?;
        self.parsed.as_mut().expect("parse() populates the cache").source = source;
        Ok(())
    }

    /// Labels of all `context` blocks, in file order.
    pub fn context_names(&mut self) -> Result<Vec<String>, Diagnostics> {
        self.labels_of("context")
    }

    /// Labels of all `public_key` blocks, in file order.
    pub fn public_key_names(&mut self) -> Result<Vec<String>, Diagnostics> {
        self.labels_of("public_key")
    }

    fn labels_of(&mut self, block_type: &str) -> Result<Vec<String>, Diagnostics> {
        self.parse()?;
        Ok(self
            .parsed()
            .body
            .iter()
            .filter_map(|structure| match structure {
                Structure::Block(block)
                    if block.ident.value().as_str() == block_type
                        && !block.labels.is_empty() =>
                {
                    Some(block_label(block).to_string())
                }
                _ => None,
            })
            .collect())
    }

    /// Names of the exports inside one context, in file order.
    pub fn export_names(&mut self, context_name: &str) -> Result<Vec<String>, Diagnostics> {
        self.parse()?;
        let parsed = self.parsed.as_mut().expect("parse() populates the cache");
        let mut exports = ExportsEditor::new(&mut parsed.body, context_name);
        exports.export_names()
    }

    /// Re-sort the document's blocks into the canonical section order and
    /// rewrite the file.
    pub fn sort(&mut self) -> Result<(), Diagnostics> {
        self.parse()?;
        let parsed = self.parsed.take().expect("parse() populates the cache");
        let sorted = sorted_source(parsed.body);
        self.write(&sorted)?;
        self.parsed = Some(ParsedDocument {
            body: raw::parse_fragment(&sorted)?,
            source: sorted,
        });
        Ok(())
    }

    /// Replace the file through a temp file in the same directory; readers
    /// see the old or the new document, never a mix.
    fn write(&self, contents: &str) -> Result<(), Diagnostics> {
        let directory = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };

        let io_diag = |err: std::io::Error| {
            Diagnostics::from(Diagnostic::error(
                "cannot write config file",
                format!("error writing config file {}: {err}", self.path.display()),
            ))
        };

        let mut temp = tempfile::NamedTempFile::new_in(directory).map_err(io_diag)?;
        temp.write_all(contents.as_bytes()).map_err(io_diag)?;
        if let Ok(metadata) = std::fs::metadata(&self.path) {
            std::fs::set_permissions(temp.path(), metadata.permissions()).map_err(io_diag)?;
        }
        temp.persist(&self.path).map_err(|err| {
            Diagnostics::from(Diagnostic::error(
                "cannot write config file",
                format!("error writing config file {}: {err}", self.path.display()),
            ))
        })?;

        tracing::info!(path = %self.path.display(), "config file written");
        Ok(())
    }
}

/// Build a `public_key` block with the key material wrapped like PEM: a
/// heredoc of base64 at 64 columns per line.
fn public_key_block(pubkey_name: &str, key_material: &[u8]) -> Result<Block, Diagnostics> {
    let encoded = BASE64.encode(key_material);

    let mut text = format!("public_key \"{pubkey_name}\" {{\n  base64 = <<-EOT\n");
    for chunk in encoded.as_bytes().chunks(64) {
        text.push_str("    ");
        text.push_str(std::str::from_utf8(chunk).expect("base64 output is ascii"));
        text.push('\n');
    }
    text.push_str("  EOT\n}\n");

    raw::parse_single_block(&text)
}

/// Find a `public_key` block and base64-decode its key material.
fn public_key_material(body: &Body, pubkey_name: &str) -> Result<Vec<u8>, Diagnostics> {
    let block = body
        .iter()
        .find_map(|structure| match structure {
            Structure::Block(block) if is_block_named(block, "public_key", pubkey_name) => {
                Some(block)
            }
            _ => None,
        })
        .ok_or_else(|| {
            Diagnostics::from(Diagnostic::error(
                "invalid public_key block",
                format!("a public_key block named {pubkey_name} cannot be found"),
            ))
        })?;

    let attribute = block.body.get_attribute("base64").ok_or_else(|| {
        Diagnostics::from(Diagnostic::error(
            "invalid public_key block",
            format!("public_key \"{pubkey_name}\" has no \"base64\" attribute"),
        ))
    })?;

    let payload = raw::heredoc_payload(&attribute.value.to_string())?;
    BASE64.decode(&payload).map_err(|err| {
        Diagnostics::from(Diagnostic::error(
            "cannot base64 decode",
            format!(
                "while processing public_key \"{pubkey_name}\", could not base64 decode \"{payload}\": {err}"
            ),
        ))
    })
}

/// Mutates one context's `exports` object through the record model.
///
/// Lives for a single edit operation; the record list parsed from the
/// current document is cached for the operation's duration.
pub struct ExportsEditor<'a> {
    body: &'a mut Body,
    context_name: &'a str,
    records: Option<ExportRecordList>,
}

impl<'a> ExportsEditor<'a> {
    pub fn new(body: &'a mut Body, context_name: &'a str) -> Self {
        Self {
            body,
            context_name,
            records: None,
        }
    }

    fn exports_text(&self) -> Result<String, Diagnostics> {
        let block = self
            .body
            .iter()
            .find_map(|structure| match structure {
                Structure::Block(block)
                    if is_block_named(block, "context", self.context_name) =>
                {
                    Some(block)
                }
                _ => None,
            })
            .ok_or_else(|| {
                Diagnostics::from(Diagnostic::error(
                    "could not find context block",
                    format!("the context block {} cannot be found", self.context_name),
                ))
            })?;

        let attribute = block.body.get_attribute("exports").ok_or_else(|| {
            Diagnostics::from(Diagnostic::error(
                "could not find exports object",
                format!(
                    "the object \"exports\" cannot be found in the \"{}\" context block",
                    self.context_name
                ),
            ))
        })?;

        // trim surrounding trivia so the record model always sees text that
        // starts at `{`; the attribute's own decor is carried over separately
        // when the expression is replaced
        Ok(attribute.value.to_string().trim().to_string())
    }

    fn records(&mut self) -> Result<&ExportRecordList, Diagnostics> {
        if self.records.is_none() {
            let text = self.exports_text()?;
            self.records = Some(ExportRecordList::parse(&text));
        }
        Ok(self.records.as_ref().expect("records cached above"))
    }

    pub fn export_names(&mut self) -> Result<Vec<String>, Diagnostics> {
        Ok(self
            .records()?
            .names()
            .map(str::to_string)
            .collect())
    }

    /// Set `export_name` to `decrypt("<pubkey>", "<encrypted>")`.
    ///
    /// An existing export is only replaced when `overwrite` is set; a name
    /// that appears more than once is rejected outright rather than
    /// guessing which occurrence was meant.
    pub fn set_encrypted_value(
        &mut self,
        export_name: &str,
        pubkey_name: &str,
        encrypted_b64: &str,
        overwrite: bool,
    ) -> Result<(), Diagnostics> {
        if !validate_export_name(export_name) {
            return Err(Diagnostic::error(
                "invalid export name",
                format!(
                    "the export named \"{export_name}\" in context block \"{}\" cannot be added/overwritten in config file; an export must be a valid environment variable name",
                    self.context_name
                ),
            )
            .into());
        }

        let mut records = self.records()?.clone();

        let duplicates = records.duplicate_names();
        if duplicates.iter().any(|name| name == export_name) {
            return Err(Diagnostic::error(
                "duplicate export",
                format!(
                    "export \"{export_name}\" appears more than once in context \"{}\"; remove the duplicates before editing",
                    self.context_name
                ),
            )
            .into());
        }

        let exists = records.exists(export_name);
        if exists && !overwrite {
            return Err(Diagnostic::error(
                "cannot overwrite export",
                format!("export \"{export_name}\" already exists, and overwrite not requested"),
            )
            .into());
        }

        let value = format!(" decrypt(\"{pubkey_name}\", \"{encrypted_b64}\")");
        if exists {
            for record in records.records_mut() {
                if !record.is_comment && record.name.trim() == export_name {
                    record.set_value(value.clone());
                }
            }
        } else {
            records.append(export_name, &value);
        }

        let mut new_expression = records.to_expression()?;

        let mut attribute = self
            .exports_attribute_mut()
            .expect("exports attribute located earlier");
        *new_expression.decor_mut() = attribute.value.decor().clone();
        *attribute.value_mut() = new_expression;

        self.records = Some(records);
        Ok(())
    }

    fn exports_attribute_mut(&mut self) -> Option<AttributeMut<'_>> {
        self.body.blocks_mut().find_map(|block| {
            if block.ident.value().as_str() == "context"
                && block.labels.first().map(BlockLabel::as_str) == Some(self.context_name)
            {
                block.body.get_attribute_mut("exports")
            } else {
                None
            }
        })
    }
}

/// Serialize a body with its blocks re-sorted into the canonical order.
///
/// Blocks are grouped by type (`custom_function`, then `public_key`, then
/// `context`, then everything else) and sorted alphabetically by first
/// label within each group, stably. Comments attached to a block move with
/// it; consecutive blocks are separated by exactly one blank line. Applying
/// the sort to already-sorted output reproduces it byte-for-byte.
pub fn sorted_source(body: Body) -> String {
    let mut attributes = Vec::new();
    let mut custom_functions = Vec::new();
    let mut public_keys = Vec::new();
    let mut contexts = Vec::new();
    let mut others = Vec::new();

    for structure in body {
        match structure {
            Structure::Attribute(attribute) => attributes.push(attribute),
            Structure::Block(block) => match block.ident.value().as_str() {
                "custom_function" => custom_functions.push(block),
                "public_key" => public_keys.push(block),
                "context" => contexts.push(block),
                _ => others.push(block),
            },
        }
    }

    for bucket in [
        &mut custom_functions,
        &mut public_keys,
        &mut contexts,
        &mut others,
    ] {
        bucket.sort_by(|a, b| block_label(a).cmp(block_label(b)));
    }

    let mut out = String::new();

    for mut attribute in attributes {
        let (prefix, suffix) = take_decor(&mut attribute);
        out.push_str(&trim_leading_blank_lines(&prefix));
        out.push_str(&Body::from(vec![Structure::Attribute(attribute)]).to_string());
        out.push_str(&suffix);
        out.push('\n');
    }

    for bucket in [custom_functions, public_keys, contexts, others] {
        for mut block in bucket {
            if !out.is_empty() {
                out.push('\n');
            }
            let (prefix, suffix) = take_decor(&mut block);
            out.push_str(&trim_leading_blank_lines(&prefix));
            out.push_str(&Body::from(vec![Structure::Block(block)]).to_string());
            out.push_str(&suffix);
            out.push('\n');
        }
    }

    out
}

/// Sort the blocks of a document given as text.
pub fn sort_source_text(source: &str) -> Result<String, Diagnostics> {
    Ok(sorted_source(raw::parse_fragment(source)?))
}

fn take_decor(node: &mut impl Decorate) -> (String, String) {
    let prefix = node
        .decor()
        .prefix()
        .map(|raw| raw.to_string())
        .unwrap_or_default();
    let suffix = node
        .decor()
        .suffix()
        .map(|raw| raw.to_string())
        .unwrap_or_default();
    node.decor_mut().set_prefix("");
    node.decor_mut().set_suffix("");
    (prefix, suffix)
}

/// Drop blank lines from the start of a decor string, keeping comments.
fn trim_leading_blank_lines(decor: &str) -> String {
    let mut rest = decor;
    loop {
        match rest.split_once('\n') {
            Some((first, tail)) if first.trim().is_empty() => rest = tail,
            _ => break,
        }
    }
    if rest.trim().is_empty() {
        String::new()
    } else {
        rest.to_string()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn valid_public_key_names() {
        let cases = [
            ("DEV2022", true),
            ("Dev2022", false),
            ("a", false),
            ("De", false),
            ("A", false),
            ("AB", true),
        ];
        for (name, want) in cases {
            assert_eq!(validate_public_key_name(name), want, "name: {name}");
        }
    }

    #[test]
    fn sort_groups_and_orders_blocks() {
        let input = r#"// context z
context "z" {}

// public_key z
public_key "z" {}

// context a
context "a" {}

// custom_function z
custom_function "z" {}

// public_key a
public_key "a" {}

// custom_function a
custom_function "a" {}
"#;
        let want = r#"// custom_function a
custom_function "a" {}

// custom_function z
custom_function "z" {}

// public_key a
public_key "a" {}

// public_key z
public_key "z" {}

// context a
context "a" {}

// context z
context "z" {}
"#;
        let got = sort_source_text(input).expect("input must parse");
        assert_eq!(got, want);
    }

    #[test]
    fn sort_is_idempotent() {
        let input = r#"context "z" {
  exports = {
    A = "1"
  }
}

public_key "B" {}

custom_function "c" {
  params = []
  command = "true"
}
"#;
        let once = sort_source_text(input).unwrap();
        let twice = sort_source_text(&once).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn sort_keeps_block_bodies_untouched() {
        let input = r#"context "dev" {
  # keep me
  exports = {
    DB_USER = "user"
  }
}
"#;
        let sorted = sort_source_text(input).unwrap();
        assert!(sorted.contains("# keep me"));
        assert!(sorted.contains("DB_USER = \"user\""));
    }

    #[test]
    fn set_encrypted_value_rejects_duplicates_in_document() {
        let source = r#"context "dev" {
  exports = {
    DB_USER = "one"
    DB_USER = "two"
  }
}
"#;
        let mut body = raw::parse_fragment(source).unwrap();
        let mut exports = ExportsEditor::new(&mut body, "dev");
        let diagnostics = exports
            .set_encrypted_value("DB_USER", "KP1", "s3cr3t", true)
            .expect_err("must fail");
        assert!(diagnostics.to_string().contains("duplicate export"));
    }

    #[test]
    fn set_encrypted_value_requires_overwrite() {
        let source = r#"
context "dev" {
  exports = {
    DB_NAME = "app1"
    DB_USER = "db"
    DB_PASSWORD = decrypt("DEV", "c3VwZXJTZWNyZXRQcm9k")
  }
}
"#;
        let mut body = raw::parse_fragment(source).unwrap();
        let mut exports = ExportsEditor::new(&mut body, "dev");
        assert!(exports.export_names().unwrap().contains(&"DB_PASSWORD".to_string()));

        let diagnostics = exports
            .set_encrypted_value("DB_PASSWORD", "KP1", "s3cr3t", false)
            .expect_err("must fail");
        assert!(diagnostics.to_string().contains("cannot overwrite export"));
    }

    #[test]
    fn overwrite_with_identical_value_changes_nothing() {
        let source = r#"context "dev" {
  # database of app1
  exports = {
    DB_NAME = "app1"
    DB_PASSWORD = decrypt("DEV", "c3VwZXJTZWNyZXRQcm9k")
  }
}
"#;
        let mut body = raw::parse_fragment(source).unwrap();
        {
            let mut exports = ExportsEditor::new(&mut body, "dev");
            exports
                .set_encrypted_value("DB_PASSWORD", "DEV", "c3VwZXJTZWNyZXRQcm9k", true)
                .expect("overwrite must succeed");
        }
        assert_eq!(body.to_string(), source);
    }

    #[test]
    fn new_export_is_appended_with_matching_indentation() {
        let source = r#"context "dev" {
  exports = {
    DB_NAME = "app1"
  }
}
"#;
        let mut body = raw::parse_fragment(source).unwrap();
        {
            let mut exports = ExportsEditor::new(&mut body, "dev");
            exports
                .set_encrypted_value("DB_PASSWORD", "DEV", "AQBd", false)
                .expect("add must succeed");
        }
        assert_eq!(
            body.to_string(),
            r#"context "dev" {
  exports = {
    DB_NAME = "app1"
    DB_PASSWORD = decrypt("DEV", "AQBd")
  }
}
"#
        );
    }

    #[test]
    fn missing_context_is_reported() {
        let source = "context \"dev\" {\n  exports = {\n  }\n}\n";
        let mut body = raw::parse_fragment(source).unwrap();
        let mut exports = ExportsEditor::new(&mut body, "staging");
        let diagnostics = exports
            .set_encrypted_value("DB_USER", "KP1", "s3cr3t", false)
            .expect_err("must fail");
        assert!(diagnostics
            .to_string()
            .contains("could not find context block"));
    }

    #[test]
    fn public_key_block_wraps_base64_at_64_columns() {
        let key_material = vec![b'k'; 120];
        let block = public_key_block("DEV2022", &key_material).unwrap();
        let text = Body::from(vec![Structure::Block(block)]).to_string();

        assert!(text.starts_with("public_key \"DEV2022\" {"));
        assert!(text.contains("base64 = <<-EOT"));
        // 4 spaces of indentation plus at most 64 base64 characters
        for line in text.lines() {
            assert!(line.len() <= 68, "line too long: {line}");
        }

        let roundtrip = public_key_material(
            &raw::parse_fragment(&format!("{text}\n")).unwrap(),
            "DEV2022",
        )
        .unwrap();
        assert_eq!(roundtrip, key_material);
    }
}
