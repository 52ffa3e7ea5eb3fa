use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::{fs, path::PathBuf};

#[derive(Parser)]
#[command(name = "xtask", about = "agentry workspace tasks")]
struct Cli {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Validate provider JSON documents against schemas/providers.schema.json
    ValidateProviders {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.cmd {
        Cmd::ValidateProviders { files } => {
            let mut failed = false;
            for file in &files {
                failed |= !validate_providers(file)?;
            }
            if failed {
                std::process::exit(1);
            }
            Ok(())
        }
    }
}

fn validate_providers(path: &PathBuf) -> Result<bool> {
    let schema_text = include_str!("../../schemas/providers.schema.json");
    let schema: serde_json::Value = serde_json::from_str(schema_text)?;
    let compiled = jsonschema::validator_for(&schema)?;
    let data_text = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let data: serde_json::Value =
        serde_json::from_str(&data_text).with_context(|| format!("parse {}", path.display()))?;
    let errors: Vec<_> = compiled.iter_errors(&data).collect();
    if !errors.is_empty() {
        eprintln!("Invalid: {}", path.display());
        for e in errors {
            eprintln!("- {e}");
        }
        return Ok(false);
    }
    println!("OK: {}", path.display());
    Ok(true)
}
