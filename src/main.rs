//! CLI entry point for cyberdrop-dl.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use reqwest::cookie::Jar;
use tracing::{debug, info, warn};
use url::Url;

use cyberdrop_dl::config::{self, HashingMode, Settings, DEBUG_ENV};
use cyberdrop_dl::download::{DownloadCoordinator, DownloaderEnv, FileLocksVault};
use cyberdrop_dl::hashing::{HashClient, HashStore};
use cyberdrop_dl::history::HistoryStore;
use cyberdrop_dl::http::{
    load_cookie_files, DownloadClient, Flaresolverr, ResponseCache, ScraperClient,
};
use cyberdrop_dl::limits::RateLimitFabric;
use cyberdrop_dl::progress::RunStats;
use cyberdrop_dl::scrape::ScraperEngine;
use cyberdrop_dl::state::RunState;
use cyberdrop_dl::storage::StorageMonitor;
use cyberdrop_dl::Database;
use cyberdrop_dl::FailureLog;

mod cli;

use cli::Args;

fn main() -> ExitCode {
    let args = Args::parse();

    // Priority: RUST_LOG env var > CDL_DEBUG > quiet flag > verbose flag.
    let default_level = if std::env::var(DEBUG_ENV).is_ok_and(|v| !v.is_empty() && v != "0") {
        "trace"
    } else if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(error) => {
            eprintln!("failed to start runtime: {error}");
            return ExitCode::from(1);
        }
    };
    match runtime.block_on(run(args)) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(2),
        Err(error) => {
            eprintln!("fatal: {error:#}");
            ExitCode::from(1)
        }
    }
}

/// Runs the engine. Returns `Ok(false)` when partial failures were logged.
async fn run(args: Args) -> Result<bool> {
    let mut settings = Settings::load(args.config.as_deref()).context("loading config")?;
    if let Some(mode) = args.hash {
        settings.dupe_cleanup.hashing = mode;
    }
    if args.ignore_history {
        settings.runtime.ignore_history = true;
    }
    let settings = Arc::new(settings);

    let config_dir = config::config_dir();
    std::fs::create_dir_all(&config_dir)
        .with_context(|| format!("creating config dir {}", config_dir.display()))?;
    let download_folder = args
        .download_folder
        .clone()
        .unwrap_or_else(|| std::path::PathBuf::from("Downloads"));
    std::fs::create_dir_all(&download_folder)
        .with_context(|| format!("creating download folder {}", download_folder.display()))?;

    // Parse and filter input URLs.
    let mut urls: Vec<Url> = Vec::new();
    for raw in &args.urls {
        match Url::parse(raw) {
            Ok(url) => {
                let host = url.host_str().unwrap_or_default();
                if args.host_allowed(host) {
                    urls.push(url);
                } else {
                    info!(%url, "skipping URL per host filters");
                }
            }
            Err(_) => warn!(input = %raw, "skipping unparsable input"),
        }
    }
    if urls.is_empty() {
        info!("No URLs to process. Pass URLs as arguments.");
        return Ok(true);
    }
    info!(urls = urls.len(), "starting run");

    // Shared infrastructure.
    let db = Database::new(&config_dir.join("cyberdrop.db"))
        .await
        .context("opening database")?;
    let history = HistoryStore::new(db.clone());
    let hash_store = HashStore::new(db.clone());
    let stats = Arc::new(RunStats::new());
    let state = RunState::new();

    let jar = Arc::new(Jar::default());
    let installed = load_cookie_files(&jar, &config::cookies_dir(&config_dir));
    if installed > 0 {
        info!(cookies = installed, "cookie files imported");
    }

    let fabric = Arc::new(RateLimitFabric::new(&settings.rate_limiting));
    let cache = Arc::new(
        ResponseCache::open(config_dir.join("request_cache")).context("opening response cache")?,
    );
    let solver_host = settings
        .general
        .flaresolverr
        .as_deref()
        .map(Url::parse)
        .transpose()
        .context("parsing flaresolverr host")?;
    let solver = Arc::new(
        Flaresolverr::new(solver_host, Arc::clone(&jar), settings.general.user_agent.clone())
            .context("building flaresolverr client")?,
    );
    let scraper_client = Arc::new(
        ScraperClient::new(
            Arc::clone(&jar),
            Arc::clone(&fabric),
            Arc::clone(&cache),
            Arc::clone(&solver),
            &settings,
        )
        .context("building scraper client")?,
    );
    let download_client =
        Arc::new(DownloadClient::new(Arc::clone(&jar), &settings).context("building download client")?);

    let storage = Arc::new(StorageMonitor::new(state.clone(), &settings));
    storage.start();

    let hasher = Arc::new(HashClient::new(hash_store, &settings, Arc::clone(&stats)));
    let failure_log = Arc::new(FailureLog::new(download_folder.join("downloader_errors.csv")));

    let env = DownloaderEnv {
        client: download_client,
        fabric: Arc::clone(&fabric),
        history: history.clone(),
        hasher: Arc::clone(&hasher),
        storage: Arc::clone(&storage),
        state: state.clone(),
        locks: Arc::new(FileLocksVault::new()),
        stats: Arc::clone(&stats),
        failure_log: Arc::clone(&failure_log),
        settings: Arc::clone(&settings),
    };
    let coordinator = Arc::new(DownloadCoordinator::new(env));

    let engine = Arc::new(ScraperEngine::new(
        scraper_client,
        history,
        download_folder.clone(),
        Arc::clone(&failure_log),
        Arc::clone(&stats),
    ));
    // Host-specific extractors register here; unknown hosts fall back to
    // the generic direct-file extractor.

    // Scrape and download run concurrently: the engine pushes media items
    // into the coordinator's channel and dropping the sender ends the run.
    let (media_tx, media_rx) = tokio::sync::mpsc::unbounded_channel();
    let download_driver = tokio::spawn(Arc::clone(&coordinator).run(media_rx));
    engine.run(urls, media_tx).await;
    download_driver.await.context("download task group")?;

    // Post-run hashing and dedup cleanup.
    if hasher.mode() == HashingMode::PostRun {
        let completed = coordinator.completed_items().await;
        hasher.hash_completed_items(&completed).await;
    }
    match hasher.cleanup_dupes().await {
        Ok(removed) => debug!(removed, "dedup cleanup done"),
        Err(error) => warn!(%error, "dedup cleanup failed"),
    }

    storage.close();
    solver.destroy_session().await;
    db.close().await;

    info!(
        completed = stats.completed(),
        previously_completed = stats.previously_completed(),
        skipped = stats.skipped(),
        failed = stats.failed(),
        scrape_failures = stats.scrape_failures(),
        removed_duplicates = stats.removed_files(),
        "run finished"
    );
    Ok(!stats.has_failures())
}
