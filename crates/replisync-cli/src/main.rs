//! # replisync CLI
//!
//! Offline inspection and maintenance of a replica's SQLite store.

use anyhow::{bail, Context, Result};
use replisync_agent::context::{LAST_SYNCED_ATTRIBUTE, REPLICA_ID_ATTRIBUTE};
use replisync_agent::SqliteStore;
use replisync_core::{now_millis, DocumentCollection, LastWriteWinMap, TombstoneMap};
use std::env;
use std::path::Path;
use std::sync::Arc;

const DEFAULT_PAGE_SIZE: usize = 100;

fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_help();
        return Ok(());
    }

    match args[1].as_str() {
        "inspect" => {
            if args.len() < 4 {
                eprintln!("Usage: replisync inspect <db> <collection>");
                std::process::exit(1);
            }
            inspect(Path::new(&args[2]), &args[3])?;
        }
        "changes" => {
            if args.len() < 5 {
                eprintln!("Usage: replisync changes <db> <collection> <since> [offset] [size]");
                std::process::exit(1);
            }
            let since = args[4].parse().context("Invalid <since>")?;
            let offset = args
                .get(5)
                .map(|v| v.parse())
                .transpose()
                .context("Invalid [offset]")?
                .unwrap_or(0);
            let size = args
                .get(6)
                .map(|v| v.parse())
                .transpose()
                .context("Invalid [size]")?
                .unwrap_or(DEFAULT_PAGE_SIZE);
            changes(Path::new(&args[2]), &args[3], since, offset, size)?;
        }
        "gc" => {
            if args.len() < 5 {
                eprintln!("Usage: replisync gc <db> <collection> <ttl-ms>");
                std::process::exit(1);
            }
            let ttl: i64 = args[4].parse().context("Invalid <ttl-ms>")?;
            if ttl < 0 {
                bail!("<ttl-ms> must not be negative");
            }
            gc(Path::new(&args[2]), &args[3], ttl)?;
        }
        "help" | "--help" | "-h" => {
            print_help();
        }
        cmd => {
            eprintln!("Unknown command: {cmd}");
            print_help();
            std::process::exit(1);
        }
    }

    Ok(())
}

fn open(db: &Path, collection: &str) -> Result<Arc<SqliteStore>> {
    if !db.exists() {
        bail!("{} does not exist", db.display());
    }
    let store = SqliteStore::open(db, collection)
        .with_context(|| format!("Failed to open {}", db.display()))?;
    Ok(Arc::new(store))
}

fn merge_engine(store: &Arc<SqliteStore>) -> LastWriteWinMap {
    LastWriteWinMap::new(store.clone(), store.clone())
}

fn format_millis(millis: i64) -> String {
    chrono::DateTime::from_timestamp_millis(millis)
        .map_or_else(|| millis.to_string(), |t| t.to_rfc3339())
}

fn inspect(db: &Path, collection: &str) -> Result<()> {
    let store = open(db, collection)?;

    let replica_id = store
        .attribute(REPLICA_ID_ATTRIBUTE)?
        .unwrap_or_else(|| "(not assigned)".to_string());
    let last_synced = match store.attribute(LAST_SYNCED_ATTRIBUTE)? {
        Some(value) => {
            let millis: i64 = value
                .parse()
                .with_context(|| format!("Corrupt {LAST_SYNCED_ATTRIBUTE} '{value}'"))?;
            format!("{} ({millis})", format_millis(millis))
        }
        None => "never".to_string(),
    };

    println!("Collection:   {collection}");
    println!("Replica id:   {replica_id}");
    println!("Last synced:  {last_synced}");
    println!("Documents:    {}", DocumentCollection::len(store.as_ref())?);
    println!("Tombstones:   {}", TombstoneMap::len(store.as_ref())?);

    let others: Vec<String> = store
        .collections()?
        .into_iter()
        .filter(|name| name != collection)
        .collect();
    if !others.is_empty() {
        println!("Other collections: {}", others.join(", "));
    }
    Ok(())
}

fn changes(db: &Path, collection: &str, since: i64, offset: usize, size: usize) -> Result<()> {
    let store = open(db, collection)?;
    let state = merge_engine(&store)
        .get_changes_since(since, offset, size)
        .context("Failed to read changes")?;
    println!("{}", serde_json::to_string_pretty(&state)?);
    Ok(())
}

fn gc(db: &Path, collection: &str, ttl_ms: i64) -> Result<()> {
    let store = open(db, collection)?;
    let before = now_millis().saturating_sub(ttl_ms);
    let removed = merge_engine(&store)
        .collect_garbage(before)
        .context("Failed to collect tombstones")?;

    println!(
        "Removed {} tombstone(s) deleted before {}",
        removed.len(),
        format_millis(before)
    );
    for id in removed {
        println!("  {id}");
    }
    Ok(())
}

fn print_help() {
    println!(
        r#"replisync CLI

USAGE:
    replisync <COMMAND> [OPTIONS]

COMMANDS:
    inspect <db> <collection>                          Show replica id, checkpoint, and counts
    changes <db> <collection> <since> [offset] [size]  Print one page of changes as JSON
    gc <db> <collection> <ttl-ms>                      Drop tombstones older than the TTL
    help                                               Show this help message

EXAMPLES:
    replisync inspect ./replisync.db todos
    replisync changes ./replisync.db todos 0 0 50
    replisync gc ./replisync.db todos 604800000
"#
    );
}
