//! tweetstore - inspect a tweet store from the command line
//!
//! Main entry point for the `tweetstore` binary.

use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;
use serde::Serialize;
use tracing::debug;

use tweetstore::cli::{Cli, Commands, ConfigArgs, DoctorArgs, OutputFormat, TweetArgs, UserArgs};
use tweetstore::doctor::{self, CheckStatus};
use tweetstore::logging::init_cli_logging;
use tweetstore::storage::Storage;
use tweetstore::{
    Config, UserProfile, format_bytes, format_error, format_number, format_timestamp,
};

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_cli_logging(cli.quiet, cli.verbose);

    match &cli.command {
        Commands::Stats => cmd_stats(&cli),
        Commands::Tweet(args) => cmd_tweet(&cli, args),
        Commands::User(args) => cmd_user(&cli, args),
        Commands::Accounts => cmd_accounts(&cli),
        Commands::Doctor(args) => cmd_doctor(&cli, args),
        Commands::Config(args) => cmd_config(&cli, args),
    }
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => {
            let mut config = Config::load_from_file(path)?
                .with_context(|| format!("Config file not found: {}", path.display()))?;
            config.apply_env_overrides();
            config
        }
        None => Config::load(),
    };
    if let Some(db) = &cli.db {
        config.paths.db = Some(db.clone());
    }
    Ok(config)
}

fn open_store(cli: &Cli) -> Result<Storage> {
    let config = load_config(cli)?;
    let path = config.db_path();
    if !path.exists() {
        anyhow::bail!(
            "No store found at {}. Pass --db or set TWEETSTORE_DB.",
            path.display()
        );
    }
    debug!(path = %path.display(), "opening store");
    Storage::open_read_only(&path, &config.store).map_err(|e| {
        let explanation = format!("{}: {e}", path.display());
        let suggestions: Vec<&str> = e.suggestion().into_iter().collect();
        anyhow::anyhow!(format_error("Failed to open store", &explanation, &suggestions))
    })
}

fn print_json<T: Serialize>(format: OutputFormat, value: &T) -> Result<()> {
    let json = if format == OutputFormat::JsonPretty {
        serde_json::to_string_pretty(value)?
    } else {
        serde_json::to_string(value)?
    };
    println!("{json}");
    Ok(())
}

#[derive(Serialize)]
struct StatsOutput {
    path: String,
    file_size: u64,
    schema_version: i32,
    threadsafe: bool,
    tweets: i64,
    users: i64,
    accounts: i64,
}

fn cmd_stats(cli: &Cli) -> Result<()> {
    let storage = open_store(cli)?;
    let counts = storage.counts()?;
    let file_size = std::fs::metadata(storage.path()).map(|m| m.len()).unwrap_or(0);
    let schema_version = storage.schema_version()?;
    let stats = StatsOutput {
        path: storage.path().display().to_string(),
        file_size,
        schema_version,
        threadsafe: storage.library_is_threadsafe(),
        tweets: counts.tweets,
        users: counts.users,
        accounts: counts.accounts,
    };

    if cli.format.is_json() {
        return print_json(cli.format, &stats);
    }

    println!("{}", "Store Statistics".bold().cyan());
    println!("{}", "─".repeat(40));
    println!("  {:<20} {:>10}", "Tweets:", format_number(stats.tweets));
    println!("  {:<20} {:>10}", "Users:", format_number(stats.users));
    println!("  {:<20} {:>10}", "Accounts:", format_number(stats.accounts));
    println!("{}", "─".repeat(40));
    println!("  File:           {}", stats.path.dimmed());
    println!("  Size:           {}", format_bytes(stats.file_size));
    println!("  Schema version: {}", stats.schema_version);
    let threading = if stats.threadsafe {
        "thread-safe".green()
    } else {
        "single-threaded".yellow()
    };
    println!("  SQLite:         {threading}");
    Ok(())
}

fn cmd_tweet(cli: &Cli, args: &TweetArgs) -> Result<()> {
    let mut storage = open_store(cli)?;
    let Some(tweet) = storage.get_tweet(args.id)? else {
        anyhow::bail!("Tweet not found: {}", args.id);
    };

    if cli.format.is_json() {
        return print_json(cli.format, &tweet);
    }

    println!("{} {}", "Tweet".bold().cyan(), tweet.id.to_string().bold());
    println!("{}", "─".repeat(40));
    println!("  Author:    {}", tweet.author_id);
    if tweet.recipient_id != 0 {
        println!("  Recipient: {}", tweet.recipient_id);
    }
    println!("  Time:      {}", format_timestamp(tweet.timestamp));
    println!("  Flags:     {:#x}", tweet.flags);
    println!("{}", "Statics".bold());
    println!("  {}", tweet.statics_json);
    println!("{}", "Dynamic".bold());
    println!("  {}", tweet.dyn_json);
    Ok(())
}

fn cmd_user(cli: &Cli, args: &UserArgs) -> Result<()> {
    let storage = open_store(cli)?;
    let Some(row) = storage.get_user(args.id)? else {
        anyhow::bail!("User not found: {}", args.id);
    };

    if cli.format.is_json() {
        return print_json(cli.format, &row);
    }

    let profile = UserProfile::from_row(row);
    let attrs = &profile.attributes;
    let handle = if attrs.screen_name.is_empty() {
        "(no screen name)".dimmed().to_string()
    } else {
        format!("@{}", attrs.screen_name).bold().to_string()
    };
    println!("{} {} {}", "User".bold().cyan(), profile.id, handle);
    println!("{}", "─".repeat(40));
    if !attrs.name.is_empty() {
        println!("  Name:        {}", attrs.name);
    }
    if !attrs.description.is_empty() {
        println!("  Description: {}", attrs.description);
    }
    println!("  Followers:   {}", format_count(attrs.followers_count));
    println!("  Following:   {}", format_count(attrs.friends_count));
    if attrs.protected {
        println!("  {}", "Protected".yellow());
    }
    if !profile.cached_img_url.is_empty() {
        println!("  Image:       {}", profile.cached_img_url.dimmed());
    }
    println!("  Updated:     {}", format_timestamp(profile.last_update));
    Ok(())
}

fn format_count(value: u64) -> String {
    format_number(i64::try_from(value).unwrap_or(i64::MAX))
}

fn cmd_accounts(cli: &Cli) -> Result<()> {
    let storage = open_store(cli)?;
    let accounts = storage.load_accounts()?;

    if cli.format.is_json() {
        return print_json(cli.format, &accounts);
    }

    if accounts.is_empty() {
        println!("{}", "No accounts stored.".dimmed());
        return Ok(());
    }
    println!("{}", "Accounts".bold().cyan());
    println!("{}", "─".repeat(40));
    for account in &accounts {
        println!(
            "  {:>4}  {:<20} {} tweets, {} DMs",
            account.id,
            account.name.bold(),
            account.tweet_ids.len(),
            account.dm_ids.len()
        );
    }
    Ok(())
}

fn cmd_doctor(cli: &Cli, args: &DoctorArgs) -> Result<()> {
    let storage = open_store(cli)?;
    let report = doctor::run_checks(&storage, args.limit);

    if cli.format.is_json() {
        print_json(cli.format, &report)?;
    } else {
        println!("{}", "Store Health".bold().cyan());
        println!("{}", "─".repeat(40));
        for check in &report.checks {
            let mark = match check.status {
                CheckStatus::Pass => "✓".green(),
                CheckStatus::Warning => "!".yellow(),
                CheckStatus::Error => "✗".red(),
            };
            println!("  {mark} {:<26} {}", check.name, check.message);
            if let Some(suggestion) = &check.suggestion {
                if !check.status.is_ok() {
                    println!("      {}", suggestion.dimmed());
                }
            }
        }
        if !report.corrupt.is_empty() {
            println!();
            println!("{}", "Corrupt values".bold().red());
            for value in &report.corrupt {
                println!(
                    "  {}.{} row {}: {}",
                    value.table, value.column, value.row_id, value.reason
                );
            }
        }
    }

    if report.has_errors() {
        std::process::exit(1);
    }
    Ok(())
}

fn cmd_config(cli: &Cli, args: &ConfigArgs) -> Result<()> {
    if args.path {
        match Config::user_config_path() {
            Some(path) => println!("{}", path.display()),
            None => anyhow::bail!("Could not determine config directory"),
        }
        return Ok(());
    }
    if args.default {
        print!("{}", Config::default_config_content());
        return Ok(());
    }

    let config = load_config(cli)?;
    if args.init {
        config.save()?;
        if !cli.quiet {
            println!("{}", "Configuration saved.".green());
        }
        return Ok(());
    }
    if cli.format.is_json() {
        return print_json(cli.format, &config);
    }
    let content = toml::to_string_pretty(&config).context("Failed to render config")?;
    print!("{content}");
    Ok(())
}
