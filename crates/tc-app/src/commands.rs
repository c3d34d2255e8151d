//! Command implementations

use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tc_core::{ContentSource, Dataset, RowRecord, TableReader};
use tc_data::{CacheConfig, CacheManager, LayeredContentSource, LiveTableReader, RebuildOutcome, SizeGuard};
use tc_sync::{rebuild_on_change, RefreshCoordinator, WatchConfig};
use tracing::info;

use crate::{Cli, Command, TableArgs};

/// Everything a command needs, resolved from global flags
struct AppContext {
    config: CacheConfig,
    source: Arc<dyn ContentSource>,
}

impl AppContext {
    fn from_cli(cli: &Cli) -> Result<Self> {
        let mut config = match &cli.config {
            Some(path) => CacheConfig::load(path).with_context(|| format!("loading {}", path.display()))?,
            None => CacheConfig::default(),
        };
        if let Some(root) = &cli.cache_root {
            config.cache_root = root.clone();
        }

        let mut source = LayeredContentSource::new()
            .with_synced_dir(&cli.data_dir)
            .with_size_guard(SizeGuard::new(config.size_limits.clone()));
        if let Some(bundled) = &cli.bundled_dir {
            source = source.with_bundled_dir(bundled);
        }

        Ok(Self {
            config,
            source: Arc::new(source),
        })
    }

    fn manager(&self) -> CacheManager {
        CacheManager::new(self.config.clone())
    }
}

pub fn run(cli: Cli) -> Result<()> {
    let ctx = AppContext::from_cli(&cli)?;
    match cli.command {
        Command::Build { table, page_size, force } => build(&ctx, &table, page_size, force),
        Command::Read { table, start, count, live } => read(&ctx, &table, start, count, live),
        Command::Search { table, query, column } => search(&ctx, &table, &query, column.as_deref()),
        Command::Status { table } => status(&ctx, &table),
        Command::Watch { table, interval } => watch(ctx, &table, interval),
        Command::Evict => evict(&ctx),
    }
}

fn dataset(table: &TableArgs) -> Dataset {
    Dataset::new(table.path.clone(), table.table.clone())
}

fn build(ctx: &AppContext, table: &TableArgs, page_size: Option<usize>, force: bool) -> Result<()> {
    let manager = ctx.manager();
    let dataset = dataset(table);
    // Without an explicit size, keep whatever layout the cache already has
    let page_size = page_size.unwrap_or_else(|| manager.effective_page_size(&dataset));

    let outcome = if force {
        manager.force_rebuild(&dataset, page_size, ctx.source.as_ref(), |_| {})
    } else {
        manager.rebuild_if_stale(&dataset, page_size, ctx.source.as_ref(), |_| {})
    }
    .with_context(|| format!("building cache for {}", dataset))?;

    match outcome {
        RebuildOutcome::Rebuilt(report) => println!(
            "built {}: {} rows, {} pages, {} bytes",
            dataset, report.rows, report.pages, report.bytes
        ),
        RebuildOutcome::UpToDate => println!("{} is up to date", dataset),
        RebuildOutcome::Joined => println!("{} was rebuilt by a concurrent build", dataset),
    }
    Ok(())
}

/// A reader for `table`: the cache (built on demand) or the origin itself
fn open_reader(ctx: &AppContext, table: &TableArgs, live: bool) -> Result<Box<dyn TableReader>> {
    let dataset = dataset(table);
    if live {
        let mut bytes = Vec::new();
        ctx.source
            .open(&dataset.origin_path)?
            .read_to_end(&mut bytes)
            .with_context(|| format!("reading {}", dataset.origin_path))?;
        let reader = LiveTableReader::open_with_config(io::Cursor::new(bytes), &dataset.table_name, &ctx.config)?;
        return Ok(Box::new(reader));
    }

    let reader = ctx
        .manager()
        .open_or_build(&dataset, ctx.source.as_ref())
        .with_context(|| format!("opening cache for {}", dataset))?;
    Ok(Box::new(reader))
}

fn print_rows(rows: &[RowRecord]) -> Result<()> {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    for row in rows {
        serde_json::to_writer(&mut out, row)?;
        writeln!(out)?;
    }
    Ok(())
}

fn read(ctx: &AppContext, table: &TableArgs, start: usize, count: usize, live: bool) -> Result<()> {
    let mut reader = open_reader(ctx, table, live)?;
    let rows = reader.read_range(start, count)?;
    print_rows(&rows)?;
    reader.close();
    Ok(())
}

fn search(ctx: &AppContext, table: &TableArgs, query: &str, column: Option<&str>) -> Result<()> {
    let reader = open_reader(ctx, table, false)?;
    let rows = reader.search(query, column)?;
    info!("{} rows match '{}'", rows.len(), query);
    print_rows(&rows)
}

fn status(ctx: &AppContext, table: &TableArgs) -> Result<()> {
    let manager = ctx.manager();
    let dataset = dataset(table);
    println!("dataset:   {}", dataset);
    println!("directory: {}", manager.dataset_dir(&dataset).display());
    println!("status:    {}", manager.status(&dataset));
    let page_size = manager.effective_page_size(&dataset);
    println!("page size: {}", page_size);
    match manager.stale_reason(&dataset, page_size, ctx.source.as_ref()) {
        Ok(None) => println!("stale:     no"),
        Ok(Some(reason)) => println!("stale:     yes ({:?})", reason),
        Err(e) => println!("stale:     unknown ({})", e),
    }
    Ok(())
}

fn watch(ctx: AppContext, table: &TableArgs, interval: u64) -> Result<()> {
    if interval == 0 {
        bail!("--interval must be at least 1 second");
    }
    let dataset = dataset(table);
    let manager = Arc::new(ctx.manager());
    let runtime = tokio::runtime::Runtime::new()?;

    runtime.block_on(async move {
        let coordinator = RefreshCoordinator::with_current_runtime(
            ctx.source.clone(),
            WatchConfig::with_interval(Duration::from_secs(interval)),
        )?;

        // Bring the cache up to date before waiting for changes
        let initial = Arc::clone(&manager)
            .spawn_rebuild(dataset.clone(), ctx.source.clone(), false)
            .await
            .with_context(|| format!("initial build of {}", dataset))?;
        info!("Initial build of {}: {:?}", dataset, initial);

        coordinator.start_watching(&dataset, rebuild_on_change(manager, ctx.source.clone()))?;
        info!("Watching {}; press Ctrl-C to stop", dataset);

        tokio::signal::ctrl_c().await?;
        coordinator.cleanup();
        info!("Stopped");
        Ok::<(), anyhow::Error>(())
    })
}

fn evict(ctx: &AppContext) -> Result<()> {
    let guard = SizeGuard::new(ctx.config.size_limits.clone());
    let root: PathBuf = ctx.config.cache_root.clone();
    let report = guard.enforce_limit(&root)?;
    println!(
        "{} files deleted, {} bytes freed ({} -> {} bytes)",
        report.files_deleted, report.bytes_freed, report.total_before, report.total_after
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(dir: &std::path::Path) -> AppContext {
        let cli = Cli {
            cache_root: Some(dir.join("cache")),
            config: None,
            data_dir: dir.join("data"),
            bundled_dir: None,
            command: Command::Evict,
        };
        AppContext::from_cli(&cli).unwrap()
    }

    fn table() -> TableArgs {
        TableArgs {
            path: "book.xlsx".into(),
            table: "Data".into(),
        }
    }

    fn write_book(dir: &std::path::Path) {
        std::fs::create_dir_all(dir.join("data")).unwrap();
        let mut book = rust_xlsxwriter::Workbook::new();
        let sheet = book.add_worksheet();
        sheet.set_name("Data").unwrap();
        sheet.write_string(0, 0, "Tag").unwrap();
        sheet.write_string(1, 0, "PT-101").unwrap();
        sheet.write_string(2, 0, "TT-202").unwrap();
        book.save(dir.join("data").join("book.xlsx")).unwrap();
    }

    #[test]
    fn cached_and_live_readers_agree() {
        let dir = tempfile::tempdir().unwrap();
        write_book(dir.path());
        let ctx = context(dir.path());

        build(&ctx, &table(), Some(1), false).unwrap();
        let manager = ctx.manager();
        let built = manager.open_if_valid(&dataset(&table())).unwrap().build_id();

        let cached = open_reader(&ctx, &table(), false).unwrap();
        let live = open_reader(&ctx, &table(), true).unwrap();
        assert_eq!(cached.read_range(0, 10).unwrap(), live.read_range(0, 10).unwrap());
        assert_eq!(cached.search("tt-", Some("tag")).unwrap().len(), 1);

        // Reading reuses the cache as built, page size included
        assert_eq!(manager.open_if_valid(&dataset(&table())).unwrap().build_id(), built);
        assert_eq!(manager.effective_page_size(&dataset(&table())), 1);
        build(&ctx, &table(), None, false).unwrap();
        assert_eq!(manager.open_if_valid(&dataset(&table())).unwrap().build_id(), built);
    }

    #[test]
    fn config_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("cache.json");
        std::fs::write(&config_path, r#"{ "page_size": 7 }"#).unwrap();

        let cli = Cli {
            cache_root: None,
            config: Some(config_path),
            data_dir: dir.path().to_path_buf(),
            bundled_dir: None,
            command: Command::Evict,
        };
        let ctx = AppContext::from_cli(&cli).unwrap();
        assert_eq!(ctx.config.page_size, 7);
    }

    #[test]
    fn missing_origin_fails_with_context() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let err = build(&ctx, &table(), None, false).unwrap_err();
        assert!(format!("{:#}", err).contains("building cache for book.xlsx::Data"));
    }
}
