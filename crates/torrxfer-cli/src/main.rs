//! Torrxfer CLI - directory-watching file transfer
//!
//! The client watches directories for settled media files and streams them
//! to one or more servers; the server receives the streams beneath its
//! media root and resumes interrupted uploads.
//!
//! ## Quick start
//!
//! ```bash
//! # On the receiving box
//! TORRXFER_SERVER_MEDIADIR=/srv/media torrxfer server
//!
//! # On the downloading box
//! torrxfer client --config client.json
//! ```

use anyhow::Result;
use clap::Parser;

mod commands;

use commands::{Cli, Command};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Client(args) => commands::client::run(args).await,
        Command::Server(args) => commands::server::run(args).await,
    }
}
