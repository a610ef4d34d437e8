use clap::{Parser, Subcommand};
use evfetch::config::ByteSize;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "evfetch")]
#[command(about = "Concurrent URL fetcher on a single-threaded event loop", long_about = None)]
pub struct Cli {
    /// Configuration file (overrides EVFETCH_CONFIG)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Fetch URLs concurrently
    Fetch(FetchArgs),
    /// Print the resolved configuration as TOML
    Config,
}

#[derive(clap::Args, Debug)]
pub struct FetchArgs {
    /// URLs to fetch
    #[arg(required = true)]
    pub urls: Vec<String>,

    /// Write each body to a file in this directory
    #[arg(long)]
    pub output_dir: Option<PathBuf>,

    /// Abort bodies larger than this (e.g. "10MB"); defaults to transfer.max_body_bytes
    #[arg(long)]
    pub max_body: Option<ByteSize>,

    /// Print reports as JSON
    #[arg(long)]
    pub json: bool,
}
