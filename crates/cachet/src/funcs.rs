//! Document-declared, shell-backed functions
//!
//! A config document may declare its own functions whose bodies are shell
//! commands:
//!
//! ```hcl
//! custom_function "greet" {
//!   params  = [name]
//!   command = "echo \"Hello, ${name}.\""
//! }
//! ```
//!
//! Decoding is a two-stage pipeline. Stage one happens once per document:
//! the literal command text is recovered from the source without evaluating
//! it, producing an immutable [FunctionDeclaration]. This matters because
//! the command references parameters that are not bound at decode time; if
//! the expression were evaluated like any other attribute the whole document
//! would fail on the unknown variables. Stage two happens per call: the
//! declaration's template is interpolated against a fresh scope holding
//! only that call's arguments, never the document's own variables, and the
//! result runs under the user's shell.
//!
//! Recovering the literal text drops quote and heredoc delimiter lines, so
//! source positions reported for command errors are adjusted by the number
//! of removed lines and are only approximately right.
//!
//! Invocation blocks the calling thread until the subprocess exits; there is
//! no timeout, so a hung command hangs the evaluation with it.

use crate::diagnostics::{Diagnostic, Diagnostics, SourceRange};
use crate::raw;
use hcl::eval::{Context, Evaluate};
use hcl_edit::expr::Expression;
use hcl_edit::repr::Span;
use hcl_edit::structure::{Body, Structure};
use indexmap::IndexMap;
use std::process::Command;

/// Block type that declares a custom function.
pub const BLOCK_TYPE: &str = "custom_function";

/// Function names reserved by the evaluator.
///
/// A custom function must not shadow one of these; decoding the document
/// fails outright if it tries.
pub const BUILTIN_FUNCTION_NAMES: &[&str] = &["decrypt", "base64encode", "base64decode"];

/// One decoded `custom_function` block, immutable after creation.
///
/// `command_template` is the literal, pre-interpolation text of the
/// `command` attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionDeclaration {
    pub name: String,
    pub params: Vec<String>,
    pub command_template: String,
    pub source_range: SourceRange,
}

/// A callable built from one [FunctionDeclaration].
///
/// Each invocation interpolates and executes independently; the only state
/// shared between calls is the read-only declaration.
#[derive(Debug, Clone, derive_new::new)]
pub struct CallableFunction {
    declaration: FunctionDeclaration,
}

impl CallableFunction {
    pub fn declaration(&self) -> &FunctionDeclaration {
        &self.declaration
    }

    /// Interpolate the command template with `args` and run it.
    ///
    /// The argument count must match the parameter list exactly. The scope
    /// used for interpolation contains nothing but the bound parameters, so
    /// a reference to anything else produces one diagnostic per unresolved
    /// name. The command runs under `$SHELL` (default `/bin/sh`); stdout and
    /// stderr are captured together, and on success the result is that
    /// output with one trailing newline removed. The result is never null.
    pub fn invoke(&self, args: &[String]) -> Result<String, Diagnostics> {
        let declaration = &self.declaration;

        if args.len() != declaration.params.len() {
            return Err(Diagnostic::error(
                "wrong argument count",
                format!(
                    "custom_function \"{}\" takes {} argument(s), got {}",
                    declaration.name,
                    declaration.params.len(),
                    args.len()
                ),
            )
            .with_range(declaration.source_range)
            .into());
        }

        let mut scope = Context::new();
        for (param, value) in declaration.params.iter().zip(args) {
            scope.declare_var(hcl::Identifier::unchecked(param.as_str()), value.as_str());
        }

        let template_expr =
            hcl::TemplateExpr::QuotedString(declaration.command_template.clone());
        let template = hcl::Template::from_expr(&template_expr).map_err(|err| {
            Diagnostics::from(
                Diagnostic::error(
                    "cannot parse command template",
                    format!(
                        "custom_function \"{}\": {err}",
                        declaration.name
                    ),
                )
                .with_range(declaration.source_range),
            )
        })?;

        // probe with an in-place evaluation first; it reports every
        // unresolved reference instead of only the first
        let mut probe = template.clone();
        if let Err(errors) = probe.evaluate_in_place(&scope) {
            let mut diagnostics = Diagnostics::new();
            for error in errors.iter() {
                diagnostics.push(
                    Diagnostic::error(
                        "cannot interpolate command",
                        format!("custom_function \"{}\": {error}", declaration.name),
                    )
                    .with_range(declaration.source_range),
                );
            }
            return Err(diagnostics);
        }

        let command_str = template.evaluate(&scope).map_err(|err| {
            Diagnostics::from(
                Diagnostic::error(
                    "cannot interpolate command",
                    format!("custom_function \"{}\": {err}", declaration.name),
                )
                .with_range(declaration.source_range),
            )
        })?;

        let shell = std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string());
        tracing::debug!(command = %command_str, shell = %shell, "running custom function command");

        let output = Command::new(&shell)
            .arg("-c")
            .arg(&command_str)
            .output()
            .map_err(|err| {
                Diagnostics::from(
                    Diagnostic::error(
                        "cannot execute command",
                        format!(
                            "command \"{command_str}\" defined by the custom_function \"{}\" could not be launched: {err}",
                            declaration.name
                        ),
                    )
                    .with_range(declaration.source_range),
                )
            })?;

        let mut combined = output.stdout;
        combined.extend_from_slice(&output.stderr);
        let combined = String::from_utf8_lossy(&combined).into_owned();
        let exit_code = output.status.code().unwrap_or(-1);
        tracing::debug!(command = %command_str, exit_code, "command finished");

        if !output.status.success() {
            return Err(Diagnostic::error(
                "cannot execute command",
                format!(
                    "command \"{}\" defined by the custom_function \"{}\" returned non-zero ({exit_code}), stdout_stderr={combined}",
                    declaration.command_template, declaration.name
                ),
            )
            .with_range(declaration.source_range)
            .into());
        }

        let result = combined
            .strip_suffix('\n')
            .map(str::to_string)
            .unwrap_or(combined);
        Ok(result)
    }
}

/// All custom functions of one document, in declaration order.
#[derive(Debug, Clone, Default)]
pub struct Functions {
    map: IndexMap<String, CallableFunction>,
}

impl Functions {
    pub fn get(&self, name: &str) -> Option<&CallableFunction> {
        self.map.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.map.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Decode every `custom_function` block in `source`.
///
/// A declaration with problems (missing label, missing or malformed
/// `params`/`command`) is skipped with diagnostics; the remaining
/// declarations still decode. Shadowing a built-in function is fatal for the
/// whole document and returns `Err` immediately, as does unparseable source.
pub fn decode_functions(source: &str) -> Result<(Functions, Diagnostics), Diagnostics> {
    let body = raw::parse_fragment(source)?;

    let mut functions = Functions::default();
    let mut diagnostics = Diagnostics::new();

    for structure in body.iter() {
        let Structure::Block(block) = structure else {
            continue;
        };
        if block.ident.value().as_str() != BLOCK_TYPE {
            continue;
        }

        let Some(label) = block.labels.first() else {
            diagnostics.push(Diagnostic::error(
                "invalid custom_function block",
                "custom_function block has no name label",
            ));
            continue;
        };
        let name = label.as_str().to_string();

        if BUILTIN_FUNCTION_NAMES.contains(&name.as_str()) {
            return Err(Diagnostic::error(
                "cannot override built-in function",
                format!(
                    "custom function named \"{name}\" collides with a built-in function"
                ),
            )
            .into());
        }

        let Some(params) = decode_params(&block.body, &name, &mut diagnostics) else {
            continue;
        };

        let Some((command_template, source_range)) =
            decode_command(source, &block.body, &name, &mut diagnostics)
        else {
            continue;
        };

        let declaration = FunctionDeclaration {
            name: name.clone(),
            params,
            command_template,
            source_range,
        };
        tracing::trace!(function = %name, "decoded custom function");
        functions
            .map
            .insert(name, CallableFunction::new(declaration));
    }

    Ok((functions, diagnostics))
}

fn decode_params(body: &Body, name: &str, diagnostics: &mut Diagnostics) -> Option<Vec<String>> {
    let Some(attribute) = body.get_attribute("params") else {
        diagnostics.push(Diagnostic::error(
            "invalid custom_function block",
            format!("in custom_function \"{name}\", could not find attribute \"params\""),
        ));
        return None;
    };

    let Expression::Array(array) = &attribute.value else {
        diagnostics.push(Diagnostic::error(
            "invalid params element",
            format!("in custom_function \"{name}\", \"params\" must be a list of identifiers"),
        ));
        return None;
    };

    let mut params = Vec::new();
    for element in array.iter() {
        let Expression::Variable(ident) = element else {
            diagnostics.push(Diagnostic::error(
                "invalid params element",
                format!(
                    "in custom_function \"{name}\", each parameter name must be an identifier"
                ),
            ));
            return None;
        };
        params.push(ident.value().as_str().to_string());
    }

    Some(params)
}

fn decode_command(
    source: &str,
    body: &Body,
    name: &str,
    diagnostics: &mut Diagnostics,
) -> Option<(String, SourceRange)> {
    let Some(attribute) = body.get_attribute("command") else {
        diagnostics.push(Diagnostic::error(
            "invalid custom_function block",
            format!("in custom_function \"{name}\", could not find attribute \"command\""),
        ));
        return None;
    };

    let expression_text = attribute.value.to_string();
    let (command_template, start_offset, end_offset) =
        match raw::literal_text_with_offsets(&expression_text) {
            Ok(extracted) => extracted,
            Err(extract_diagnostics) => {
                for diagnostic in extract_diagnostics {
                    diagnostics.push(Diagnostic {
                        detail: format!(
                            "in custom_function \"{name}\": {}",
                            diagnostic.detail
                        ),
                        ..diagnostic
                    });
                }
                return None;
            }
        };

    let source_range = attribute
        .value
        .span()
        .map(|span| {
            let start = raw::line_of_offset(source, span.start) as i64 + start_offset;
            let end = raw::line_of_offset(source, span.end) as i64 + end_offset;
            SourceRange {
                start_line: start.max(1) as usize,
                end_line: end.max(1) as usize,
            }
        })
        .unwrap_or(SourceRange {
            start_line: 1,
            end_line: 1,
        });

    Some((command_template, source_range))
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    fn decode(source: &str) -> (Functions, Diagnostics) {
        decode_functions(source).expect("decode must not be fatal")
    }

    fn invoke(source: &str, name: &str, args: &[&str]) -> Result<String, Diagnostics> {
        let (functions, diagnostics) = decode(source);
        assert!(
            !diagnostics.has_errors(),
            "unexpected decode diagnostics: {diagnostics}"
        );
        let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        functions
            .get(name)
            .unwrap_or_else(|| panic!("function {name} must decode"))
            .invoke(&args)
    }

    #[test]
    fn quoted_command_interpolates_and_runs() {
        let source = r#"
custom_function "greet" {
  params = [name]
  command = "echo \"Hello, ${name}.\""
}
"#;
        assert_eq!(invoke(source, "greet", &["Peter"]).unwrap(), "Hello, Peter.");
    }

    #[test]
    fn heredoc_command_runs() {
        let source = "
custom_function \"greet_heredoc\" {
  params = [name]
  command = <<EOT
echo \"Hello, ${name}.\"
EOT
}
";
        assert_eq!(
            invoke(source, "greet_heredoc", &["Peter"]).unwrap(),
            "Hello, Peter."
        );
    }

    #[test]
    fn indented_heredoc_command_runs() {
        let source = "
custom_function \"greet_heredoc2\" {
  params = [name]
  command = <<-EOT
    echo \"Hello, ${name}.\"
  EOT
}
";
        assert_eq!(
            invoke(source, "greet_heredoc2", &["Peter"]).unwrap(),
            "Hello, Peter."
        );
    }

    #[test]
    fn multiline_heredoc_keeps_lines() {
        let source = "
custom_function \"greet_multiline\" {
  params = [name]
  command = <<-EOT
    echo \"Hello, ${name}.\"
    echo \"Hello again, ${name}.\"
  EOT
}
";
        assert_eq!(
            invoke(source, "greet_multiline", &["Peter"]).unwrap(),
            "Hello, Peter.\nHello again, Peter."
        );
    }

    #[test]
    fn multiline_pipe_heredoc() {
        let source = "
custom_function \"greet_pipe\" {
  params = [name]
  command = <<-EOT
    (echo \"Hello, ${name}.\"
     echo \"Hello again, ${name}.\") |
    grep again
  EOT
}
";
        assert_eq!(
            invoke(source, "greet_pipe", &["Peter"]).unwrap(),
            "Hello again, Peter."
        );
    }

    #[test]
    fn empty_params_list_is_fine() {
        let source = "
custom_function \"greet_empty\" {
  params = []
  command = <<-EOT
    echo \"Hello.\"
  EOT
}
";
        assert_eq!(invoke(source, "greet_empty", &[]).unwrap(), "Hello.");
    }

    #[test]
    fn missing_argument_is_one_diagnostic() {
        let source = r#"
custom_function "greet" {
  params = [name]
  command = "echo \"Hello, ${name}.\""
}
"#;
        let diagnostics = invoke(source, "greet", &[]).expect_err("must fail");
        assert_eq!(diagnostics.len(), 1);
        assert!(diagnostics.to_string().contains("wrong argument count"));
    }

    #[test]
    fn extra_argument_is_one_diagnostic() {
        let source = r#"
custom_function "greet" {
  params = [name]
  command = "echo \"Hello, ${name}.\""
}
"#;
        let diagnostics = invoke(source, "greet", &["Peter", "extra"]).expect_err("must fail");
        assert_eq!(diagnostics.len(), 1);
    }

    #[test]
    fn unresolved_reference_is_one_diagnostic() {
        let source = r#"
custom_function "missing_var" {
  params = []
  command = "echo \"${nonexist}\""
}
"#;
        let diagnostics = invoke(source, "missing_var", &[]).expect_err("must fail");
        assert_eq!(diagnostics.len(), 1);
        assert!(diagnostics.to_string().contains("cannot interpolate command"));
    }

    #[test]
    fn unresolved_reference_in_heredoc() {
        let source = "
custom_function \"missing_var_heredoc\" {
  params = []
  command = <<EOT
echo \"${nonexist}\"
EOT
}
";
        let diagnostics = invoke(source, "missing_var_heredoc", &[]).expect_err("must fail");
        assert_eq!(diagnostics.len(), 1);
    }

    #[test]
    fn failing_command_is_reported_with_exit_code() {
        let source = r#"
custom_function "failed" {
  params = []
  command = "exit 1"
}
"#;
        let diagnostics = invoke(source, "failed", &[]).expect_err("must fail");
        assert_eq!(diagnostics.len(), 1);
        let rendered = diagnostics.to_string();
        assert!(rendered.contains("cannot execute command"));
        assert!(rendered.contains("non-zero (1)"));
    }

    #[test]
    fn stderr_of_failing_command_is_captured() {
        let source = "
custom_function \"failed_stderr\" {
  params = []
  command = <<-EOT
    echo \"something went wrong\" >&2
    exit 1
  EOT
}
";
        let diagnostics = invoke(source, "failed_stderr", &[]).expect_err("must fail");
        assert!(diagnostics.to_string().contains("something went wrong"));
    }

    #[test]
    fn stderr_of_successful_command_is_part_of_the_result() {
        let source = "
custom_function \"stderr_ok\" {
  params = [name]
  command = <<-EOT
    echo \"Hello ${name}! stderr\" 1>&2
    exit 0
  EOT
}
";
        assert_eq!(
            invoke(source, "stderr_ok", &["Peter"]).unwrap(),
            "Hello Peter! stderr"
        );
    }

    #[test]
    fn missing_command_attribute_skips_only_that_function() {
        let source = r#"
custom_function "broken" {
  params = [name]
  commnd = "echo hi"
}

custom_function "works" {
  params = []
  command = "echo ok"
}
"#;
        let (functions, diagnostics) = decode(source);
        assert!(diagnostics.has_errors());
        assert!(functions.get("broken").is_none());
        assert_eq!(functions.get("works").unwrap().invoke(&[]).unwrap(), "ok");
    }

    #[test]
    fn non_identifier_param_skips_the_function() {
        let source = r#"
custom_function "bad_params" {
  params = ["name"]
  command = "echo ${name}"
}
"#;
        let (functions, diagnostics) = decode(source);
        assert!(diagnostics.has_errors());
        assert!(functions.get("bad_params").is_none());
    }

    #[test]
    fn builtin_collision_is_fatal() {
        let source = r#"
custom_function "decrypt" {
  params = []
  command = "echo nope"
}
"#;
        let diagnostics = decode_functions(source).expect_err("must be fatal");
        assert!(diagnostics
            .to_string()
            .contains("cannot override built-in function"));
    }

    #[test]
    fn declaration_keeps_literal_template() {
        let source = r#"
custom_function "greet" {
  params = [name]
  command = "echo \"Hello, ${name}.\""
}
"#;
        let (functions, _) = decode(source);
        let declaration = functions.get("greet").unwrap().declaration();
        assert_eq!(declaration.params, vec!["name".to_string()]);
        assert_eq!(declaration.command_template, "echo \"Hello, ${name}.\"");
    }
}
