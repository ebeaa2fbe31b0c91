use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::Level;

use crate::{config::Config, server::DEFAULT_PORT};

/// The command line interface for the serial portal.
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Cli {
    /// Path to a configuration file
    pub config: Option<PathBuf>,

    /// Port to serve on
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Least severe level logged to stdout (`RUST_LOG` takes precedence)
    #[arg(long, default_value_t = Level::INFO)]
    pub log_level: Level,

    /// Also log to daily rotated files in this directory
    #[arg(long)]
    pub log_dir: Option<PathBuf>,

    /// Serve loopback mock devices with these names instead of real serial ports
    #[arg(long)]
    pub mock: Vec<String>,

    /// Subcommands
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Commands available in the command line interface.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Examples for user convenience.
    #[clap(subcommand)]
    Examples(Examples),
}

/// Helpful examples for users.
#[derive(Subcommand, Debug, Clone)]
pub enum Examples {
    /// Show an example of a configuration file's contents.
    Config,
}

/// Run a command which does not need the server.
pub fn handle_command(command: Commands) {
    match command {
        Commands::Examples(Examples::Config) => {
            println!("{}", Config::example().serialize_pretty())
        }
    }
}
