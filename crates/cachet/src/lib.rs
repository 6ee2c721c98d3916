//! # cachet - encrypted secrets inside plain configuration files
//!
//! For CLI usage see the `cachet` binary's help output.
//!
//! ## Introduction for developers
//!
//! Read this to understand how `cachet` works internally.
//!
//! ### The document
//!
//! A config document is ordinary HCL with three block types that matter to
//! us:
//!
//! ```hcl
//! custom_function "greet" {
//!   params  = [name]
//!   command = "echo \"Hello, ${name}.\""
//! }
//!
//! public_key "DEV2022" {
//!   base64 = <<-EOT
//!     eyJrZXlfaWQiOjEyMyw...
//!   EOT
//! }
//!
//! context "dev" {
//!   vars = {
//!     region = "eu-west-1"
//!   }
//!   exports = {
//!     DB_USER     = "user"
//!     DB_PASSWORD = decrypt("DEV2022", "AQBdqk1S...")
//!   }
//! }
//! ```
//!
//! Plaintext configuration and encrypted secrets live side by side: anyone
//! with the document can add a secret (the public keyset is right there),
//! only holders of the matching private keyset can evaluate it.
//!
//! ### Editing without breaking the document
//!
//! The tools that add keys and secrets must not reformat the file, reorder
//! unrelated entries or eat anybody's comments. Edits therefore never go
//! through an evaluated representation. [editor::DocumentEditor] works on
//! the [hcl_edit] tree, which round-trips byte-for-byte, and the one
//! attribute that actually changes (`exports`) is taken apart line by line
//! by [exports::ExportRecordList] so the edit touches exactly one record.
//! [raw] holds the fragment helpers both of them use to turn text into
//! structure and back.
//!
//! The editor also knows one deliberate exception to "do not reorder":
//! [editor::sorted_source] re-sorts the top-level blocks into a canonical
//! section order (functions, then public keys, then contexts, then the
//! rest). The sort is idempotent, so running it twice changes nothing.
//!
//! ### Evaluating
//!
//! [config::ConfigDocument] decodes the `context` blocks into plain string
//! maps. Expressions are evaluated with [hcl::eval]; the built-in
//! `decrypt(name, b64)` function fetches the private keyset from the
//! `PRIVATE_JSON_KEYSET_<name>` environment variable and defers to
//! [crypto::Decryptor].
//!
//! Custom functions need more care. Their command bodies reference
//! parameters that do not exist at decode time, so [funcs] first recovers
//! the literal command text from the source without evaluating it (stage
//! one, once per document), and each call later interpolates that template
//! against a scope holding nothing but the call's own arguments before
//! running it under the shell (stage two, per call). Calls are spliced into
//! export expressions by walking the expression tree with
//! [VisitFuncCallsMut] and replacing each resolved call with its string
//! result.
//!
//! ### Failure reporting
//!
//! Anything that can go half-wrong reports through
//! [diagnostics::Diagnostics], an ordered list of errors and warnings. An
//! operation that produced an error-severity diagnostic has not written
//! anything to disk.
pub mod config;
pub mod crypto;
pub mod diagnostics;
pub mod editor;
pub mod exports;
pub mod funcs;
pub mod raw;
mod visit;

pub use visit::{VisitFuncCallsMut, VisitMut};
