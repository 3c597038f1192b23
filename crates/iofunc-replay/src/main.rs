// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

mod script;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use iofunc_core::MountConfig;
use iofunc_logging::CliLoggingArgs;

use crate::script::{replay, Script};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Replay client sessions against an in-memory iofunc resource manager"
)]
struct Cli {
    /// Mount configuration (TOML or JSON); defaults apply when omitted
    #[arg(long, env = "IOFUNC_MOUNT_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(flatten)]
    logging: CliLoggingArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a script and print one JSON record per reply, deferred reply or event
    Run {
        /// Script file, '-' for stdin
        #[arg(long)]
        script: PathBuf,
        /// Pretty-print records
        #[arg(long)]
        pretty: bool,
    },
    /// Validate a mount configuration and print it with defaults filled in
    CheckConfig,
}

fn load_config(path: Option<&Path>) -> Result<MountConfig> {
    match path {
        Some(path) => MountConfig::load(path)
            .with_context(|| format!("loading mount config {}", path.display())),
        None => Ok(MountConfig::default()),
    }
}

fn read_script(path: &Path) -> Result<String> {
    if path == Path::new("-") {
        return std::io::read_to_string(std::io::stdin()).context("reading script from stdin");
    }
    std::fs::read_to_string(path).with_context(|| format!("reading script {}", path.display()))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    cli.logging.clone().init("iofunc-replay")?;
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Command::Run { script, pretty } => {
            let parsed = Script::from_json(&read_script(&script)?)?;
            tracing::info!(
                steps = parsed.steps.len(),
                nodes = parsed.nodes.len(),
                "replaying script"
            );
            for record in replay(config, &parsed)? {
                let value = record.to_json();
                if pretty {
                    println!("{}", serde_json::to_string_pretty(&value)?);
                } else {
                    println!("{value}");
                }
            }
        }
        Command::CheckConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }
    Ok(())
}
