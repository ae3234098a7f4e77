//! Command-line front end for the medical care form dictionary.
//!
//! # Responsibility
//! - Resolve settings from a config file, environment and flags.
//! - Run one dictionary operation and print its result as JSON on stdout.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use log::info;
use refdict_core::{
    init_logging, open_store, parse_feed_date, DictionaryDto, RecordId, ServiceConfig,
    SqliteDictionaryService, EARLIEST_DATE, OPEN_ENDED,
};
use serde::Serialize;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "refdict")]
#[command(about = "Medical care form reference dictionary", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// JSON config file; flags and environment override its values
    #[arg(short, long, env = "REFDICT_CONFIG")]
    config: Option<PathBuf>,

    /// SQLite database file
    #[arg(long, env = "REFDICT_DB")]
    db: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, env = "REFDICT_LOG_LEVEL")]
    log_level: Option<String>,

    /// Absolute directory for rolling log files
    #[arg(long, env = "REFDICT_LOG_DIR")]
    log_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Replace the whole dictionary with an XML snapshot
    Import {
        /// Feed file to import
        file: PathBuf,
    },
    /// List live entries
    List,
    /// Show one live entry
    Get { id: RecordId },
    /// Add an entry with a storage-assigned id
    Add(EntryArgs),
    /// Overwrite a live entry
    Update {
        id: RecordId,
        #[command(flatten)]
        entry: EntryArgs,
    },
    /// Soft-delete a live entry
    Delete { id: RecordId },
    /// List every stored row including tombstones
    History,
}

#[derive(Args)]
struct EntryArgs {
    #[arg(long)]
    code: i32,
    #[arg(long)]
    name: String,
    /// Validity start (DD.MM.YYYY or YYYY-MM-DD); omitted means 0001-01-01
    #[arg(long, value_parser = parse_date_arg)]
    begin: Option<NaiveDate>,
    /// Validity end; omitted means open-ended
    #[arg(long, value_parser = parse_date_arg)]
    end: Option<NaiveDate>,
}

impl EntryArgs {
    fn into_dto(self) -> DictionaryDto {
        DictionaryDto {
            id: 0,
            code: self.code,
            name: self.name,
            begin_date: self.begin.unwrap_or(EARLIEST_DATE),
            end_date: self.end.unwrap_or(OPEN_ENDED),
        }
    }
}

fn parse_date_arg(value: &str) -> Result<NaiveDate, String> {
    parse_feed_date(value).ok_or_else(|| format!("`{value}` is not a DD.MM.YYYY or YYYY-MM-DD date"))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = resolve_config(&cli)?;

    if let Some(log_dir) = &config.log_dir {
        init_logging(&config.log_level, log_dir, true)?;
    }
    info!(
        "event=cli_start module=cli status=ok version={}",
        refdict_core::core_version()
    );

    let conn = open_store(&config.store_target(), config.busy_timeout())
        .context("failed to open dictionary store")?;
    let mut service = SqliteDictionaryService::open(&conn, &config)?;

    match cli.command {
        Commands::Import { file } => {
            let bytes = std::fs::read(&file)
                .with_context(|| format!("failed to read feed `{}`", file.display()))?;
            print_json(&service.upload(&bytes)?)
        }
        Commands::List => print_json(&service.get_all()?),
        Commands::Get { id } => print_json(&service.get(id)?),
        Commands::Add(entry) => print_json(&service.create(&entry.into_dto())?),
        Commands::Update { id, entry } => print_json(&service.update(id, &entry.into_dto())?),
        Commands::Delete { id } => print_json(&service.delete(id)?),
        Commands::History => print_json(&service.history()?),
    }
}

/// Config file first, then environment and flags on top.
fn resolve_config(cli: &Cli) -> Result<ServiceConfig> {
    let mut config = match &cli.config {
        Some(path) => ServiceConfig::load(path)?,
        None => ServiceConfig::default(),
    };
    if let Some(db) = &cli.db {
        config.db_path = Some(db.clone());
    }
    if let Some(level) = &cli.log_level {
        config.log_level = level.clone();
    }
    if let Some(dir) = &cli.log_dir {
        config.log_dir = Some(dir.clone());
    }
    config.validate()?;
    Ok(config)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
