//! Cache command - inspect and maintain the cache tables

use crate::cache::{self, CacheEntry, CacheTable};
use crate::cli::args::{CacheAction, CacheArgs, OutputFormat, TableKind};
use crate::config::{Config, ConfigManager};
use crate::error::{WardenError, WardenResult};
use crate::fsutil;
use chrono::Utc;
use console::style;
use std::path::PathBuf;
use tracing::debug;

/// Execute the cache command
pub async fn execute(args: CacheArgs, config: &Config) -> WardenResult<()> {
    let tables = Tables::load(config)?;

    match args.action {
        CacheAction::List { kind, format } => list_caches(&tables, kind, format),
        CacheAction::Gc { dry_run } => gc_caches(&tables, config, dry_run),
        CacheAction::Evict { key, kind } => evict_cache(&tables, &key, kind),
    }
}

/// Both cache tables as persisted by the worker
struct Tables {
    files: CacheTable,
    directories: CacheTable,
    files_path: PathBuf,
    directories_path: PathBuf,
    caches_dir: PathBuf,
}

impl Tables {
    fn load(config: &Config) -> WardenResult<Self> {
        let files_path = ConfigManager::file_caches_path(config);
        let directories_path = ConfigManager::directory_caches_path(config);
        let caches_dir = ConfigManager::caches_dir(config);

        let files = CacheTable::load(
            "file",
            &files_path,
            &ConfigManager::downloads_dir(config),
        )?;
        let directories = CacheTable::load("directory", &directories_path, &caches_dir)?;

        Ok(Self {
            files,
            directories,
            files_path,
            directories_path,
            caches_dir,
        })
    }

    fn selected(&self, kind: TableKind) -> Vec<&CacheTable> {
        let mut tables = Vec::new();
        if kind.includes_files() {
            tables.push(&self.files);
        }
        if kind.includes_directories() {
            tables.push(&self.directories);
        }
        tables
    }

    fn save(&self) -> WardenResult<()> {
        self.files.save(&self.files_path)?;
        self.directories.save(&self.directories_path)?;
        fsutil::secure_files(&[&self.files_path, &self.directories_path])
            .map_err(|e| WardenError::io("restricting cache table permissions", e))
    }

    fn free_space(&self) -> WardenResult<u64> {
        fsutil::free_space(&self.caches_dir).map_err(|e| {
            WardenError::io(
                format!("reading free space of {}", self.caches_dir.display()),
                e,
            )
        })
    }
}

/// List cache entries
fn list_caches(tables: &Tables, kind: TableKind, format: OutputFormat) -> WardenResult<()> {
    let rows: Vec<(&str, CacheEntry)> = tables
        .selected(kind)
        .into_iter()
        .flat_map(|table| {
            table
                .entries()
                .into_iter()
                .map(move |entry| (table.name(), entry))
        })
        .collect();

    if rows.is_empty() && !matches!(format, OutputFormat::Json) {
        println!("No caches found.");
        return Ok(());
    }

    match format {
        OutputFormat::Table => print_cache_table(&rows),
        OutputFormat::Json => print_cache_json(&rows)?,
        OutputFormat::Plain => print_cache_plain(&rows),
    }

    Ok(())
}

fn print_cache_table(rows: &[(&str, CacheEntry)]) {
    println!(
        "{:<10} {:<48} {:>6} {:<10} {:<20}",
        "TABLE", "KEY", "HITS", "AGE", "CREATED"
    );
    println!("{}", "-".repeat(98));

    for (table, entry) in rows {
        let age_days = (Utc::now() - entry.created).num_days();
        let age = if age_days == 0 {
            style("today".to_string()).green().to_string()
        } else {
            style(format!("{}d", age_days)).dim().to_string()
        };

        println!(
            "{:<10} {:<48} {:>6} {:<10} {:<20}",
            table,
            truncate(&entry.key, 48),
            entry.hits,
            age,
            entry.created.format("%Y-%m-%d %H:%M")
        );
    }

    println!();
    println!("Total: {} cache(s)", rows.len());
}

fn print_cache_json(rows: &[(&str, CacheEntry)]) -> WardenResult<()> {
    #[derive(serde::Serialize)]
    struct CacheJson<'a> {
        table: &'a str,
        key: &'a str,
        location: String,
        hits: u64,
        sha256: Option<&'a str>,
        created: String,
    }

    let json_caches: Vec<CacheJson<'_>> = rows
        .iter()
        .map(|(table, entry)| CacheJson {
            table,
            key: &entry.key,
            location: entry.location.display().to_string(),
            hits: entry.hits,
            sha256: entry.sha256.as_deref(),
            created: entry.created.to_rfc3339(),
        })
        .collect();

    println!("{}", serde_json::to_string_pretty(&json_caches)?);
    Ok(())
}

fn print_cache_plain(rows: &[(&str, CacheEntry)]) {
    for (_, entry) in rows {
        println!("{}", entry.key);
    }
}

fn truncate(key: &str, width: usize) -> String {
    if key.chars().count() <= width {
        return key.to_string();
    }
    let kept: String = key.chars().take(width.saturating_sub(3)).collect();
    format!("{}...", kept)
}

/// Evict caches until the configured free space is available
fn gc_caches(tables: &Tables, config: &Config, dry_run: bool) -> WardenResult<()> {
    let required = config.mounts.required_free_space_bytes();
    let free = tables.free_space()?;

    println!(
        "Free space: {} MB (required: {} MB)",
        free / 1024 / 1024,
        config.mounts.required_free_space_mb
    );

    if free >= required {
        println!("Nothing to collect.");
        return Ok(());
    }

    let candidates = cache::gc_candidates(&tables.files, &tables.directories);

    if dry_run {
        println!("Eviction order:");
        for resource in &candidates {
            println!("  {} {:?}", style("•").red(), resource);
        }
        println!();
        println!("Dry run - no caches removed.");
        return Ok(());
    }

    let result = cache::run_garbage_collection(candidates, required, || tables.free_space());
    // Evictions that happened before a failure must still be persisted
    tables.save()?;
    let evicted = result?;

    println!("{} evicted {} cache(s)", style("✓").green(), evicted);
    Ok(())
}

/// Evict a single entry by key
fn evict_cache(tables: &Tables, key: &str, kind: TableKind) -> WardenResult<()> {
    let mut evicted = false;
    for table in tables.selected(kind) {
        if table.evict(key)? {
            debug!("Evicted {} from the {} table", key, table.name());
            evicted = true;
        }
    }

    if !evicted {
        return Err(WardenError::User(format!("No cache with key {}", key)));
    }

    tables.save()?;
    println!("{} evicted {}", style("✓").green(), key);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_keeps_short_keys() {
        assert_eq!(truncate("gradle", 10), "gradle");
        assert_eq!(truncate("urlcontent:https://example.com", 12), "urlconten...");
    }
}
