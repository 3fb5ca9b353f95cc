use std::env;
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use tokio::sync::broadcast;

use mapvault::download::DownloadConfig;
use mapvault::pipeline::{
    monitor_stage, tile_counts, total_tiles, StageProgress, TileCuller, TileDownloader,
    TileEnumerator, TileSet,
};
use mapvault::spec::{parse_spec, resolve_region};
use mapvault::{LayerRegistry, TileStore};

fn env_usize(name: &str, default: usize, min: usize, max: usize) -> usize {
    env::var(name)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(default)
        .clamp(min, max)
}

fn env_path(name: &str, default: &str) -> PathBuf {
    env::var(name).map(PathBuf::from).unwrap_or_else(|_| PathBuf::from(default))
}

/// Read the spec from the path given on the command line, or stdin.
fn read_spec_source() -> Result<String> {
    match env::args().nth(1).filter(|a| a != "-") {
        Some(path) => {
            std::fs::read_to_string(&path).with_context(|| format!("cannot read {path}"))
        }
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("cannot read spec from stdin")?;
            Ok(buf)
        }
    }
}

fn stage_bar(prefix: &str) -> Result<ProgressBar> {
    let pb = ProgressBar::new(0);
    pb.set_prefix(prefix.to_string());
    pb.set_style(
        ProgressStyle::with_template(
            "{prefix:12} [{bar:40.cyan/blue}] {pos}/{len} ({percent}%) {msg}",
        )?
        .progress_chars("##-"),
    );
    pb.set_draw_target(ProgressDrawTarget::stdout_with_hz(10));
    Ok(pb)
}

async fn run_monitored(pb: &ProgressBar, progress: &StageProgress) {
    monitor_stage(progress, |p| {
        let (processed, total, errors) = p.status();
        pb.set_length(total as u64);
        pb.set_position(processed as u64);
        if errors > 0 {
            let last = p.last_error().unwrap_or_default();
            pb.set_message(format!("[errors: {errors}] {last}"));
        }
    })
    .await;
}

fn print_tile_counts(counts: &[usize], header: &str) {
    println!("Zoom  {header}");
    for (z, count) in counts.iter().enumerate() {
        println!("{z:>4}  {count}");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let registry = Arc::new(LayerRegistry::builtin());

    let source = read_spec_source()?;
    let spec = match parse_spec(&source, &registry) {
        Ok(spec) => spec,
        Err(err) => bail!("{err}"),
    };

    let db_path = env_path("MAPVAULT_DB", "./data/mapvault.db");
    let tile_root = env_path("MAPVAULT_TILE_ROOT", "./data/tiles");
    let store = Arc::new(
        TileStore::open(&db_path, &tile_root, vec![3])
            .await
            .context("cannot open tile store")?,
    );

    let region = match resolve_region(&spec, &store).await {
        Ok(region) => region,
        Err(err) => bail!("{err}"),
    };
    println!(
        "Downloading region '{}' ({} layers)",
        region.name(),
        spec.layers.len()
    );

    // Ctrl-C stops the stages at their next suspension point.
    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    {
        let shutdown_tx = shutdown_tx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("interrupted; shutting down...");
                let _ = shutdown_tx.send(());
            }
        });
    }

    // --- enumerate ---
    let enumerator = TileEnumerator::start(
        region.merc_polys(),
        spec.layers.clone(),
        Arc::clone(&registry),
        shutdown_tx.clone(),
    );
    let pb = stage_bar("Enumerating")?;
    run_monitored(&pb, &enumerator.progress).await;
    pb.finish();
    let enumerated: TileSet = enumerator.finish().await;
    print_tile_counts(&tile_counts(&enumerated), "Tiles in region");

    // --- cull ---
    let culler = TileCuller::start(
        enumerated,
        spec.layers.clone(),
        Arc::clone(&store),
        Arc::clone(&registry),
        shutdown_tx.clone(),
    );
    let pb = stage_bar("Culling")?;
    run_monitored(&pb, &culler.progress).await;
    pb.finish();
    let to_fetch = culler.finish().await;
    print_tile_counts(&tile_counts(&to_fetch), "Tiles to download");

    // --- download ---
    let config = DownloadConfig {
        workers: env_usize("MAPVAULT_WORKERS", 10, 1, 100),
        queue_limit: env_usize("MAPVAULT_QUEUE_LIMIT", 100, 1, 10_000),
        ..DownloadConfig::default()
    };
    let total = total_tiles(&to_fetch);
    let downloader = TileDownloader::start(
        to_fetch,
        Arc::clone(&store),
        Arc::clone(&registry),
        config,
        shutdown_tx.clone(),
    );
    let pb = stage_bar("Downloading")?;
    run_monitored(&pb, &downloader.progress).await;
    let (processed, _, errors) = downloader.progress.status();
    let last_error = downloader.progress.last_error();
    pb.finish();
    downloader.finish().await;

    println!("Done: {processed}/{total} tiles processed, {errors} errors");
    if errors > 0 {
        if let Some(last) = last_error {
            eprintln!("last error: {last}");
        }
    }
    Ok(())
}
