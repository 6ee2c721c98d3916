//! cachet cli interface

use clap::{Parser, Subcommand, ValueEnum};
use std::fmt::Formatter;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to the config document
    #[clap(
        short = 'f',
        long = "file",
        global(true),
        env = "CACHET_CONFIG",
        default_value = cachet::config::DEFAULT_CONFIG_PATH
    )]
    pub file: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Import a public keyset into the config document
    ///
    /// The keyset JSON is read from a file (see `keygen`), base64 encoded
    /// and stored as a public_key block. The document is re-sorted into its
    /// canonical section order on the way out.
    AddPubkey(AddPubkeyCommand),

    /// Encrypt a secret and store it as an export of a context
    AddSecret(AddSecretCommand),

    /// List the context names defined in the config document
    Contexts,

    /// List the public_key names defined in the config document
    Pubkeys,

    /// List the export names of one context
    Exports(ExportsCommand),

    /// Evaluate one context and print its exports
    ///
    /// Decrypting secrets requires the matching PRIVATE_JSON_KEYSET_<NAME>
    /// environment variable to be set (base64 of the private keyset JSON).
    Render(RenderCommand),

    /// Re-sort the document's blocks into the canonical section order
    Sort,

    /// Generate a fresh keypair as two JSON keyset files
    Keygen(KeygenCommand),
}

#[derive(Parser, Debug)]
pub struct AddPubkeyCommand {
    /// Name of the public key, uppercase letters and numbers
    pub name: String,

    /// Path to the public keyset JSON
    pub keyset: PathBuf,

    /// Replace an existing public_key block of the same name
    #[clap(long)]
    pub overwrite: bool,
}

#[derive(Parser, Debug)]
pub struct AddSecretCommand {
    /// Context receiving the export
    pub context: String,

    /// Name of the public key to encrypt with
    pub pubkey: String,

    /// Name of the export, a valid environment variable name
    pub export: String,

    /// The secret value to encrypt
    pub secret: String,

    /// Overwrite the export if it already exists
    #[clap(long)]
    pub overwrite: bool,
}

#[derive(Parser, Debug)]
pub struct ExportsCommand {
    /// Context to list
    pub context: String,
}

#[derive(Parser, Debug)]
pub struct RenderCommand {
    /// Context to evaluate
    pub context: String,

    #[arg(short = 'F', long = "output-format", default_value_t)]
    pub format: OutputFormat,
}

#[derive(ValueEnum, Clone, Default, Debug)]
pub enum OutputFormat {
    Json,
    #[default]
    Yaml,
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputFormat::Json => f.write_str("json"),
            OutputFormat::Yaml => f.write_str("yaml"),
        }
    }
}

#[derive(Parser, Debug)]
pub struct KeygenCommand {
    /// Where to write the private keyset JSON
    #[clap(long = "private-out", default_value = "private_keyset.json")]
    pub private_out: PathBuf,

    /// Where to write the public keyset JSON
    #[clap(long = "public-out", default_value = "public_keyset.json")]
    pub public_out: PathBuf,
}
