use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cli;

use cli::config::ConfigCommand;
use cli::place::PlaceCommand;
use cli::precheck::PrecheckCommand;
use cli::up::UpCommand;

#[derive(Parser)]
#[command(name = "netcluster")]
#[command(about = "Run an emulated network topology across several servers", long_about = None)]
struct Cli {
    /// Configuration file (defaults to the platform config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log every command sent to a server
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    Config(ConfigCommand),
    Precheck(PrecheckCommand),
    Place(PlaceCommand),
    Up(UpCommand),
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let config = cli.config.as_deref();
    match cli.command {
        Commands::Config(cmd) => cmd.execute(config),
        Commands::Precheck(cmd) => cmd.execute(config),
        Commands::Place(cmd) => cmd.execute(config),
        Commands::Up(cmd) => cmd.execute(config),
    }
}
