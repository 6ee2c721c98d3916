//! Decoding a whole config document into its contexts
//!
//! A document groups its runtime configuration into `context` blocks:
//!
//! ```hcl
//! context "dev" {
//!   vars = {
//!     region = "eu-west-1"
//!   }
//!   exports = {
//!     DB_USER     = "user"
//!     DB_PASSWORD = decrypt("DEV2022", "AQBd...")
//!   }
//! }
//! ```
//!
//! Evaluation wires the two extension points together: the built-in
//! functions (`decrypt` and the base64 pair) are declared on the evaluation
//! context, while calls to document-declared custom functions are resolved
//! by walking each expression, evaluating the call's arguments, invoking the
//! callable and splicing its string result back in before the final
//! evaluation pass. Document variables never leak into the command bodies;
//! the custom function machinery builds its own scope per call.
//!
//! `decrypt(name, b64)` reads the private keyset from the
//! `PRIVATE_JSON_KEYSET_<name>` environment variable (base64 encoded).
//! Custom function calls must appear as direct call expressions; calls
//! buried inside string templates are not resolved.

use crate::crypto::Decryptor;
use crate::diagnostics::{Diagnostic, Diagnostics};
use crate::funcs::{self, Functions};
use crate::visit::{VisitFuncCallsMut, VisitMut};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hcl::eval::{Context as EvalContext, FuncArgs, FuncDef, ParamType};
use hcl::eval::Evaluate;
use hcl::{Expression, Value};
use indexmap::IndexMap;
use serde::Serialize;
use std::path::Path;

/// Default location of the config document.
pub const DEFAULT_CONFIG_PATH: &str = "config.cachet.hcl";

/// One decoded `context` block.
#[derive(Debug, Clone, Serialize)]
pub struct ConfigContext {
    pub name: String,
    pub vars: IndexMap<String, String>,
    /// environment variables handed to the consuming process
    pub exports: IndexMap<String, String>,
}

/// A fully decoded config document.
#[derive(Debug)]
pub struct ConfigDocument {
    pub contexts: Vec<ConfigContext>,
    functions: Functions,
}

impl ConfigDocument {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, Diagnostics> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|err| {
            Diagnostics::from(Diagnostic::error(
                "cannot read config file",
                format!("error reading config file at path {}: {err}", path.display()),
            ))
        })?;
        Self::from_str(&source)
    }

    pub fn from_str(source: &str) -> Result<Self, Diagnostics> {
        let (functions, mut diagnostics) = funcs::decode_functions(source)?;
        if diagnostics.has_errors() {
            return Err(diagnostics);
        }

        let body = hcl::parse(source).map_err(|err| {
            Diagnostics::from(Diagnostic::error(
                "cannot parse config file",
                err.to_string(),
            ))
        })?;

        let ctx = builtin_context();
        let mut contexts = Vec::new();

        for block in body.blocks() {
            if block.identifier.as_str() != "context" {
                continue;
            }
            let Some(label) = block.labels.first() else {
                diagnostics.push(Diagnostic::error(
                    "invalid context block",
                    "context block has no name label",
                ));
                continue;
            };
            let name = label.as_str().to_string();

            let vars = match attribute_expr(&block.body, "vars") {
                Some(expr) => {
                    evaluate_string_map(&name, "vars", expr, &ctx, &functions, &mut diagnostics)
                }
                None => IndexMap::new(),
            };

            let exports = match attribute_expr(&block.body, "exports") {
                Some(expr) => evaluate_string_map(
                    &name,
                    "exports",
                    expr,
                    &ctx,
                    &functions,
                    &mut diagnostics,
                ),
                None => {
                    diagnostics.push(Diagnostic::error(
                        "could not find exports object",
                        format!(
                            "the object \"exports\" cannot be found in the \"{name}\" context block"
                        ),
                    ));
                    continue;
                }
            };

            contexts.push(ConfigContext {
                name,
                vars,
                exports,
            });
        }

        if diagnostics.has_errors() {
            return Err(diagnostics);
        }

        Ok(Self {
            contexts,
            functions,
        })
    }

    pub fn context(&self, name: &str) -> Option<&ConfigContext> {
        self.contexts.iter().find(|context| context.name == name)
    }

    pub fn functions(&self) -> &Functions {
        &self.functions
    }
}

fn attribute_expr<'b>(body: &'b hcl::Body, key: &str) -> Option<&'b Expression> {
    body.attributes()
        .find(|attribute| attribute.key.as_str() == key)
        .map(|attribute| &attribute.expr)
}

fn evaluate_string_map(
    context_name: &str,
    attribute_name: &str,
    expression: &Expression,
    ctx: &EvalContext,
    functions: &Functions,
    diagnostics: &mut Diagnostics,
) -> IndexMap<String, String> {
    let mut map = IndexMap::new();

    let Expression::Object(object) = expression else {
        diagnostics.push(Diagnostic::error(
            format!("invalid {attribute_name} object"),
            format!(
                "\"{attribute_name}\" in context block \"{context_name}\" must be an object"
            ),
        ));
        return map;
    };

    for (key, value_expression) in object.iter() {
        let key = object_key_text(key);
        let mut expression = value_expression.clone();

        let mut rewriter = CustomCallRewriter {
            functions,
            ctx,
            diagnostics: Diagnostics::new(),
        };
        expression.visit_func_calls_mut(&mut rewriter);
        if rewriter.diagnostics.has_errors() {
            diagnostics.extend(rewriter.diagnostics);
            continue;
        }

        match expression.evaluate(ctx) {
            Ok(value) => match value_to_string(&value) {
                Some(text) => {
                    map.insert(key, text);
                }
                None => diagnostics.push(Diagnostic::error(
                    format!("invalid {attribute_name} value"),
                    format!(
                        "\"{key}\" in context block \"{context_name}\" does not evaluate to a string"
                    ),
                )),
            },
            Err(err) => diagnostics.push(Diagnostic::error(
                format!("cannot evaluate {attribute_name} value"),
                format!("\"{key}\" in context block \"{context_name}\": {err}"),
            )),
        }
    }

    map
}

fn object_key_text(key: &hcl::ObjectKey) -> String {
    match key {
        hcl::ObjectKey::Identifier(ident) => ident.to_string(),
        hcl::ObjectKey::Expression(Expression::String(text)) => text.clone(),
        other => other.to_string(),
    }
}

fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(boolean) => Some(boolean.to_string()),
        _ => None,
    }
}

/// Replaces calls to document-declared functions with their results.
struct CustomCallRewriter<'a, 'c> {
    functions: &'a Functions,
    ctx: &'a EvalContext<'c>,
    diagnostics: Diagnostics,
}

impl VisitMut<Expression> for CustomCallRewriter<'_, '_> {
    fn visit_mut(&mut self, expression: &mut Expression) {
        let (name, arg_expressions) = match &*expression {
            Expression::FuncCall(call) => (call.name.to_string(), call.args.clone()),
            _ => return,
        };
        let Some(function) = self.functions.get(&name) else {
            return;
        };

        let mut args = Vec::with_capacity(arg_expressions.len());
        for arg_expression in arg_expressions {
            match arg_expression.evaluate(self.ctx) {
                Ok(value) => match value_to_string(&value) {
                    Some(text) => args.push(text),
                    None => {
                        self.diagnostics.push(Diagnostic::error(
                            "invalid custom function argument",
                            format!(
                                "argument of custom_function \"{name}\" does not evaluate to a string"
                            ),
                        ));
                        return;
                    }
                },
                Err(err) => {
                    self.diagnostics.push(Diagnostic::error(
                        "cannot evaluate custom function argument",
                        format!("custom_function \"{name}\": {err}"),
                    ));
                    return;
                }
            }
        }

        match function.invoke(&args) {
            Ok(output) => *expression = Expression::String(output),
            Err(invoke_diagnostics) => self.diagnostics.extend(invoke_diagnostics),
        }
    }
}

/// Evaluation context carrying the built-in functions.
fn builtin_context() -> EvalContext<'static> {
    let mut ctx = EvalContext::new();
    ctx.declare_func(
        "decrypt",
        FuncDef::builder()
            .param(ParamType::String)
            .param(ParamType::String)
            .build(decrypt_builtin),
    );
    ctx.declare_func(
        "base64encode",
        FuncDef::builder()
            .param(ParamType::String)
            .build(base64encode_builtin),
    );
    ctx.declare_func(
        "base64decode",
        FuncDef::builder()
            .param(ParamType::String)
            .build(base64decode_builtin),
    );
    ctx
}

/// `decrypt(keypairName, encryptedBase64Str)`
///
/// The private keyset comes from `PRIVATE_JSON_KEYSET_<keypairName>` so the
/// document itself never holds key material that can open secrets.
fn decrypt_builtin(args: FuncArgs) -> Result<Value, String> {
    let keypair_name = args[0]
        .as_str()
        .ok_or("keypair name must be a string")?;
    let encrypted_b64 = args[1]
        .as_str()
        .ok_or("encrypted value must be a string")?;

    let env_name = format!("PRIVATE_JSON_KEYSET_{keypair_name}");
    let keyset_b64 = std::env::var(&env_name)
        .map_err(|_| format!("env var {env_name} must be set"))?;
    let keyset_bytes = BASE64
        .decode(keyset_b64.trim())
        .map_err(|err| format!("could not base64 decode string in env var \"{env_name}\": {err}"))?;
    let keyset_json = String::from_utf8(keyset_bytes)
        .map_err(|_| format!("keyset in env var \"{env_name}\" is not valid UTF-8"))?;

    let ciphertext = BASE64
        .decode(encrypted_b64)
        .map_err(|err| format!("could not base64 decode ciphertext \"{encrypted_b64}\": {err}"))?;

    let decryptor = Decryptor::new(&keyset_json).map_err(|err| err.to_string())?;
    let plaintext = decryptor
        .decrypt(&ciphertext, None)
        .map_err(|err| format!("could not decrypt: {err}"))?;
    let plaintext =
        String::from_utf8(plaintext).map_err(|_| "decrypted value is not valid UTF-8".to_string())?;

    Ok(Value::String(plaintext))
}

fn base64encode_builtin(args: FuncArgs) -> Result<Value, String> {
    let input = args[0].as_str().ok_or("input must be a string")?;
    Ok(Value::String(BASE64.encode(input)))
}

fn base64decode_builtin(args: FuncArgs) -> Result<Value, String> {
    let input = args[0].as_str().ok_or("input must be a string")?;
    let decoded = BASE64
        .decode(input)
        .map_err(|err| format!("could not base64 decode \"{input}\": {err}"))?;
    String::from_utf8(decoded)
        .map(Value::String)
        .map_err(|_| "decoded value is not valid UTF-8".to_string())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::crypto::{generate_keyset, Encryptor};
    use pretty_assertions::assert_eq;

    #[test]
    fn decodes_contexts_with_literal_exports() {
        let source = r#"// dev context
context "dev" {
  exports = {
    DB_USER = "user"
    DB_PASSWORD = "pass"
  }
}

context "prod" {
  exports = {
    DB_USER = "user"
    DB_PASSWORD = "pass"
  }
}
"#;
        let document = ConfigDocument::from_str(source).expect("document must decode");
        assert_eq!(document.contexts.len(), 2);

        for name in ["dev", "prod"] {
            let context = document.context(name).expect("context must exist");
            assert_eq!(context.exports.get("DB_USER").unwrap(), "user");
            assert_eq!(context.exports.get("DB_PASSWORD").unwrap(), "pass");
        }
    }

    #[test]
    fn vars_are_decoded_when_present() {
        let source = r#"
context "dev" {
  vars = {
    region = "eu-west-1"
  }
  exports = {
    REGION = "static"
  }
}
"#;
        let document = ConfigDocument::from_str(source).unwrap();
        let context = document.context("dev").unwrap();
        assert_eq!(context.vars.get("region").unwrap(), "eu-west-1");
    }

    #[test]
    fn custom_function_call_in_export() {
        let source = r#"
custom_function "greet" {
  params = [name]
  command = "echo \"Hello, ${name}.\""
}

context "dev" {
  exports = {
    GREETING = greet("Peter")
  }
}
"#;
        let document = ConfigDocument::from_str(source).unwrap();
        let context = document.context("dev").unwrap();
        assert_eq!(context.exports.get("GREETING").unwrap(), "Hello, Peter.");
    }

    #[test]
    fn decrypt_call_in_export() {
        let (public, private) = generate_keyset();
        let public_json = serde_json::to_string(&public).unwrap();
        let private_json = serde_json::to_string(&private).unwrap();

        let encryptor = Encryptor::new(&public_json).unwrap();
        let ciphertext = encryptor.encrypt(b"s3cr3t", None).unwrap();
        let encrypted_b64 = BASE64.encode(&ciphertext);

        std::env::set_var(
            "PRIVATE_JSON_KEYSET_CFGTESTKEY",
            BASE64.encode(private_json.as_bytes()),
        );

        let source = format!(
            r#"
context "dev" {{
  exports = {{
    DB_PASSWORD = decrypt("CFGTESTKEY", "{encrypted_b64}")
  }}
}}
"#
        );
        let document = ConfigDocument::from_str(&source).unwrap();
        let context = document.context("dev").unwrap();
        assert_eq!(context.exports.get("DB_PASSWORD").unwrap(), "s3cr3t");
    }

    #[test]
    fn missing_exports_is_an_error() {
        let source = r#"
context "dev" {
  vars = {
    region = "eu-west-1"
  }
}
"#;
        let diagnostics = ConfigDocument::from_str(source).expect_err("must fail");
        assert!(diagnostics
            .to_string()
            .contains("could not find exports object"));
    }

    #[test]
    fn missing_private_keyset_is_an_error() {
        let source = r#"
context "dev" {
  exports = {
    DB_PASSWORD = decrypt("NOSUCHKEYSET", "AAAA")
  }
}
"#;
        let diagnostics = ConfigDocument::from_str(source).expect_err("must fail");
        assert!(diagnostics
            .to_string()
            .contains("PRIVATE_JSON_KEYSET_NOSUCHKEYSET"));
    }

    #[test]
    fn base64_builtins_roundtrip() {
        let source = r#"
context "dev" {
  exports = {
    ENCODED = base64encode("hello")
    DECODED = base64decode("aGVsbG8=")
  }
}
"#;
        let document = ConfigDocument::from_str(source).unwrap();
        let context = document.context("dev").unwrap();
        assert_eq!(context.exports.get("ENCODED").unwrap(), "aGVsbG8=");
        assert_eq!(context.exports.get("DECODED").unwrap(), "hello");
    }
}
