mod cli;

use cachet::config::ConfigDocument;
use cachet::editor::DocumentEditor;

fn main() {
    use clap::Parser;
    let cli = cli::Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_env("CACHET_LOG"))
        .with_writer(std::io::stderr)
        .init();

    let command_result = match cli.command {
        cli::Command::AddPubkey(ref command) => add_pubkey(&cli.file, command),
        cli::Command::AddSecret(ref command) => add_secret(&cli.file, command),
        cli::Command::Contexts => contexts(&cli.file),
        cli::Command::Pubkeys => pubkeys(&cli.file),
        cli::Command::Exports(ref command) => exports(&cli.file, command),
        cli::Command::Render(ref command) => render(&cli.file, command),
        cli::Command::Sort => sort(&cli.file),
        cli::Command::Keygen(ref command) => keygen(command),
    };

    if let Err(e) = command_result {
        for error in e.chain() {
            eprintln!("{error}")
        }
        std::process::exit(1);
    }
}

fn add_pubkey(file: &std::path::Path, command: &cli::AddPubkeyCommand) -> anyhow::Result<()> {
    let keyset = std::fs::read(&command.keyset).map_err(|err| {
        anyhow::anyhow!(
            "could not read keyset file {}: {err}",
            command.keyset.display()
        )
    })?;

    let mut editor = DocumentEditor::new(file);
    editor.add_public_key(&command.name, &keyset, command.overwrite)?;

    println!("added public_key \"{}\" to {}", command.name, file.display());
    Ok(())
}

fn add_secret(file: &std::path::Path, command: &cli::AddSecretCommand) -> anyhow::Result<()> {
    let mut editor = DocumentEditor::new(file);
    editor.add_secret(
        &command.context,
        &command.export,
        &command.secret,
        &command.pubkey,
        command.overwrite,
    )?;

    println!(
        "added export \"{}\" to context \"{}\" in {}",
        command.export,
        command.context,
        file.display()
    );
    Ok(())
}

fn contexts(file: &std::path::Path) -> anyhow::Result<()> {
    let mut editor = DocumentEditor::new(file);
    for name in editor.context_names()? {
        println!("{name}");
    }
    Ok(())
}

fn pubkeys(file: &std::path::Path) -> anyhow::Result<()> {
    let mut editor = DocumentEditor::new(file);
    for name in editor.public_key_names()? {
        println!("{name}");
    }
    Ok(())
}

fn exports(file: &std::path::Path, command: &cli::ExportsCommand) -> anyhow::Result<()> {
    let mut editor = DocumentEditor::new(file);
    for name in editor.export_names(&command.context)? {
        println!("{name}");
    }
    Ok(())
}

fn render(file: &std::path::Path, command: &cli::RenderCommand) -> anyhow::Result<()> {
    let document = ConfigDocument::from_file(file)?;
    let context = document
        .context(&command.context)
        .ok_or_else(|| anyhow::anyhow!("no context named \"{}\"", command.context))?;

    match command.format {
        cli::OutputFormat::Yaml => serde_yaml::to_writer(std::io::stdout(), &context.exports)?,
        cli::OutputFormat::Json => {
            serde_json::to_writer_pretty(std::io::stdout(), &context.exports)?
        }
    };

    Ok(())
}

fn sort(file: &std::path::Path) -> anyhow::Result<()> {
    let mut editor = DocumentEditor::new(file);
    editor.sort()?;
    println!("sorted {}", file.display());
    Ok(())
}

fn keygen(command: &cli::KeygenCommand) -> anyhow::Result<()> {
    let (public_keyset, private_keyset) = cachet::crypto::generate_keyset();

    std::fs::write(
        &command.private_out,
        serde_json::to_string_pretty(&private_keyset)?,
    )?;
    std::fs::write(
        &command.public_out,
        serde_json::to_string_pretty(&public_keyset)?,
    )?;

    println!(
        "wrote {} and {}",
        command.private_out.display(),
        command.public_out.display()
    );
    println!("keep the private keyset out of version control; import the public one with add-pubkey");
    Ok(())
}
