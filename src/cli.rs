//! CLI definitions for the `tweetstore` inspection tool.
//!
//! Uses clap for argument parsing with derive macros.

use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// tweetstore - inspect and check a tweet store
#[derive(Parser, Debug)]
#[command(name = "tweetstore")]
#[command(version)]
#[command(about = "Inspect and check a tweetstore database")]
#[command(long_about = r#"
tweetstore reads the SQLite file written by the tweetstore engine, decodes
its compressed columns and reports on its health.

Examples:
  tweetstore stats
  tweetstore tweet 1234567890
  tweetstore doctor --db ~/backup/tweets.sqlite3
"#)]
pub struct Cli {
    /// Path to the store file
    #[arg(long, env = "TWEETSTORE_DB", global = true)]
    pub db: Option<PathBuf>,

    /// Read configuration from this file instead of the user config
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Output format
    #[arg(long, short = 'f', default_value = "text", global = true)]
    pub format: OutputFormat,

    /// Be verbose (show debug info)
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,

    /// Be quiet (suppress non-error output)
    #[arg(long, short = 'q', global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Show row counts and store details
    Stats,

    /// Decode and show one tweet
    Tweet(TweetArgs),

    /// Decode and show one user profile
    User(UserArgs),

    /// List account rows
    Accounts,

    /// Check store integrity and decode every compressed column
    Doctor(DoctorArgs),

    /// Show the effective configuration
    Config(ConfigArgs),
}

#[derive(Args, Debug)]
pub struct TweetArgs {
    /// Tweet id
    pub id: u64,
}

#[derive(Args, Debug)]
pub struct UserArgs {
    /// User id
    pub id: u64,
}

#[derive(Args, Debug)]
pub struct DoctorArgs {
    /// Maximum number of corrupt values to list
    #[arg(long, default_value = "20")]
    pub limit: usize,
}

#[derive(Args, Debug)]
pub struct ConfigArgs {
    /// Print the built-in defaults instead
    #[arg(long)]
    pub default: bool,

    /// Print the user config file path
    #[arg(long)]
    pub path: bool,

    /// Write the effective configuration to the user config file
    #[arg(long, conflicts_with_all = ["default", "path"])]
    pub init: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
    JsonPretty,
}

impl OutputFormat {
    #[must_use]
    pub const fn is_json(self) -> bool {
        matches!(self, Self::Json | Self::JsonPretty)
    }
}
