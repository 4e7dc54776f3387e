//! CLI module; subcommands live here.

use clap::{CommandFactory, Parser, Subcommand};

use crate::Result;

pub mod config;

#[derive(Debug, Clone)]
pub enum Command {
    Config(config::ConfigArgs),
    None,
}

#[derive(Debug, Clone)]
pub struct CliArgs {
    pub command: Command,
}

impl Default for CliArgs {
    fn default() -> Self {
        Self {
            command: Command::None,
        }
    }
}

pub fn dispatch(args: CliArgs) -> Result<()> {
    match args.command {
        Command::Config(c) => config::execute(c),
        Command::None => Ok(()),
    }
}

#[derive(Parser, Debug)]
#[command(name = "obsfs", version, about = "object-store filesystem engine")]
struct Cli {
    #[command(subcommand)]
    command: Option<Subcommands>,
}

#[derive(Subcommand, Debug)]
enum Subcommands {
    /// Resolve and print the effective engine configuration (file plus flag
    /// overrides) after validation.
    Config(config::ConfigArgs),
}

/// Parse CLI arguments into internal representation.
pub fn parse_args<I, S>(args: I) -> Result<CliArgs>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let argv: Vec<String> = args.into_iter().map(Into::into).collect();
    let cli = Cli::parse_from(argv);
    let command = match cli.command {
        Some(Subcommands::Config(args)) => Command::Config(args),
        None => Command::None,
    };

    Ok(CliArgs { command })
}

/// Build the underlying clap `Command` (useful for help/usage contract tests).
pub fn clap_command() -> clap::Command {
    Cli::command()
}
