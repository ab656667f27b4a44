//! CLI command definitions and handlers.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

pub mod client;
pub mod server;

/// Torrxfer - directory-watching file transfer
#[derive(Parser)]
#[command(name = "torrxfer")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// The command to execute
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands
#[derive(Subcommand)]
pub enum Command {
    /// Watch directories and stream settled files to the configured servers
    Client(ClientArgs),

    /// Receive file streams beneath the media root (configured via
    /// TORRXFER_SERVER_* environment variables)
    Server(ServerArgs),
}

/// Arguments for the client command
#[derive(Parser)]
pub struct ClientArgs {
    /// Path to the JSON configuration file
    #[arg(short, long)]
    pub config: PathBuf,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// Arguments for the server command
#[derive(Parser)]
pub struct ServerArgs {}
