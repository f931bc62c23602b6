use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::transfer::CacheDirective;

#[derive(Debug, Clone, Parser)]
#[command(name = "fetchstore", about = "Fetch URLs over HTTP through a byte-range object cache")]
pub struct Cli {
    /// Path to the configuration file (defaults to ./fetchstore.toml if present).
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Overrides the configured log format.
    #[arg(long, value_enum)]
    pub log: Option<LogFormat>,

    /// How cached copies may be used.
    #[arg(long, value_enum, default_value_t = CacheDirective::UseCache)]
    pub directive: CacheDirective,

    /// Sends the given form data as a POST body.
    #[arg(long)]
    pub post: Option<String>,

    /// Writes the body of the last URL here instead of stdout.
    #[arg(long, short)]
    pub output: Option<PathBuf>,

    /// Follows redirects up to the configured limit.
    #[arg(long, short = 'L')]
    pub follow_redirects: bool,

    /// Prints cache statistics and entries after fetching.
    #[arg(long)]
    pub stats: bool,

    /// URLs to fetch, in order.
    #[arg(required = true)]
    pub urls: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Text,
}
