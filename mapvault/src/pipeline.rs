//! The bulk download pipeline: enumerate -> cull -> download/persist.
//!
//! Each stage runs as a task and publishes `(processed, total, errors)`
//! plus the most recent error message for whatever is monitoring the run.
//! Stages stop early when the shutdown channel fires.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::rngs::StdRng;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::download::{DownloadConfig, DownloadManager, DownloadResult, TileKey};
use crate::layers::LayerRegistry;
use crate::mercator::TileCoord;
use crate::polygon::MultiPoly;
use crate::store::{now_ms, TileStore};
use crate::tessellate::RegionTessellation;
use crate::walk::random_walk;

/// Tiles to fetch, per layer.
pub type TileSet = HashMap<String, HashSet<TileCoord>>;

/// How many tiles to test for existence per index query.
const CULL_CHUNK: usize = 100;

/// Per-layer entry of a download request.
#[derive(Debug, Clone)]
pub struct LayerRequest {
    pub layer: String,
    pub max_zoom: u8,
    pub refresh: Refresh,
}

/// Refresh policy for tiles already present in the cache.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Refresh {
    /// Any cached row counts; never refetch.
    Never,
    /// Rows older than this many days are refetched.
    Days(f64),
    /// Refetch everything.
    Always,
}

/// Shared progress counters for one monitorable stage.
#[derive(Default)]
pub struct StageProgress {
    processed: AtomicUsize,
    total: AtomicUsize,
    errors: AtomicUsize,
    last_error: Mutex<Option<String>>,
    finished: AtomicBool,
}

impl StageProgress {
    /// `(processed, total, errors)` for display.
    pub fn status(&self) -> (usize, usize, usize) {
        (
            self.processed.load(Ordering::Relaxed),
            self.total.load(Ordering::Relaxed),
            self.errors.load(Ordering::Relaxed),
        )
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().unwrap().clone()
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Relaxed)
    }

    fn add_processed(&self, n: usize) {
        self.processed.fetch_add(n, Ordering::Relaxed);
    }

    fn set_total(&self, n: usize) {
        self.total.store(n, Ordering::Relaxed);
    }

    fn record_error(&self, message: String) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        *self.last_error.lock().unwrap() = Some(message);
    }

    fn finish(&self) {
        self.finished.store(true, Ordering::Relaxed);
    }
}

fn shutdown_requested(rx: &mut broadcast::Receiver<()>) -> bool {
    !matches!(rx.try_recv(), Err(broadcast::error::TryRecvError::Empty))
}

/// Tiles per zoom level, for the monitor's count table.
pub fn tile_counts(tiles: &TileSet) -> Vec<usize> {
    let mut counts = Vec::new();
    for set in tiles.values() {
        for t in set {
            let z = t.z as usize;
            if counts.len() <= z {
                counts.resize(z + 1, 0);
            }
            counts[z] += 1;
        }
    }
    counts
}

pub fn total_tiles(tiles: &TileSet) -> usize {
    tiles.values().map(HashSet::len).sum()
}

// ---- stage 1: enumerate ----

pub struct TileEnumerator {
    pub progress: Arc<StageProgress>,
    handle: JoinHandle<TileSet>,
}

impl TileEnumerator {
    /// Tessellate the region once per requested layer, at that layer's
    /// max zoom and min-depth floor. The progress total starts as the
    /// size estimate and becomes exact on completion.
    pub fn start(
        poly: MultiPoly,
        requests: Vec<LayerRequest>,
        registry: Arc<LayerRegistry>,
        shutdown: broadcast::Sender<()>,
    ) -> Self {
        let progress = Arc::new(StageProgress::default());
        let task_progress = Arc::clone(&progress);
        let mut shutdown_rx = shutdown.subscribe();

        let handle = tokio::spawn(async move {
            let estimate: u64 = requests
                .iter()
                .map(|req| {
                    let min_depth = registry.get(&req.layer).map(|l| l.min_depth).unwrap_or(0);
                    RegionTessellation::new(&poly, req.max_zoom, min_depth).size_estimate()
                })
                .sum();
            task_progress.set_total(estimate as usize);

            let mut out: TileSet = HashMap::new();
            'outer: for req in &requests {
                let min_depth = registry.get(&req.layer).map(|l| l.min_depth).unwrap_or(0);
                let set = out.entry(req.layer.clone()).or_default();
                for (i, t) in
                    RegionTessellation::new(&poly, req.max_zoom, min_depth).enumerate()
                {
                    if set.insert(t) {
                        task_progress.add_processed(1);
                    }
                    if i % 4096 == 0 {
                        if shutdown_requested(&mut shutdown_rx) {
                            break 'outer;
                        }
                        tokio::task::yield_now().await;
                    }
                }
            }

            task_progress.set_total(task_progress.status().0);
            task_progress.finish();
            out
        });

        Self { progress, handle }
    }

    pub async fn finish(self) -> TileSet {
        self.handle.await.unwrap_or_default()
    }
}

// ---- stage 2: cull ----

pub struct TileCuller {
    pub progress: Arc<StageProgress>,
    handle: JoinHandle<TileSet>,
}

impl TileCuller {
    /// Reduce the enumerated set to the tiles actually needing a fetch,
    /// according to each layer's refresh policy.
    pub fn start(
        tiles: TileSet,
        requests: Vec<LayerRequest>,
        store: Arc<TileStore>,
        registry: Arc<LayerRegistry>,
        shutdown: broadcast::Sender<()>,
    ) -> Self {
        let progress = Arc::new(StageProgress::default());
        let task_progress = Arc::clone(&progress);
        let mut shutdown_rx = shutdown.subscribe();

        let handle = tokio::spawn(async move {
            task_progress.set_total(total_tiles(&tiles));
            let mut out: TileSet = HashMap::new();

            'outer: for req in &requests {
                let Some(set) = tiles.get(&req.layer) else {
                    continue;
                };

                let cutoffs = match req.refresh {
                    Refresh::Always => {
                        // nothing can count as present; skip the queries
                        task_progress.add_processed(set.len());
                        out.insert(req.layer.clone(), set.clone());
                        continue;
                    }
                    Refresh::Never => (None, None),
                    Refresh::Days(days) => {
                        let window_ms = (days * 86_400_000.0) as i64;
                        let missing_ms = registry
                            .get(&req.layer)
                            .and_then(|l| l.refresh_missing)
                            .map(|w| w.as_millis() as i64)
                            .unwrap_or(window_ms);
                        (Some(now_ms() - window_ms), Some(now_ms() - missing_ms))
                    }
                };

                let mut existing: HashSet<TileCoord> = HashSet::new();
                let all: Vec<TileCoord> = set.iter().copied().collect();
                for chunk in all.chunks(CULL_CHUNK) {
                    if shutdown_requested(&mut shutdown_rx) {
                        break 'outer;
                    }
                    match store
                        .existing_in(&req.layer, chunk, cutoffs.0, cutoffs.1)
                        .await
                    {
                        Ok(have) => existing.extend(have),
                        Err(err) => {
                            task_progress.record_error(format!("cull query failed: {err}"))
                        }
                    }
                    task_progress.add_processed(chunk.len());
                }

                out.insert(
                    req.layer.clone(),
                    set.difference(&existing).copied().collect(),
                );
            }

            task_progress.finish();
            out
        });

        Self { progress, handle }
    }

    pub async fn finish(self) -> TileSet {
        self.handle.await.unwrap_or_default()
    }
}

// ---- stage 3: download + persist ----

/// What a download result means for the cache.
#[derive(Debug, Clone, PartialEq)]
pub enum TileOutcome {
    /// 200: real tile data.
    Data(Vec<u8>),
    /// 404, or a redirect to some generic placeholder: record as missing.
    Missing,
    /// 403: the server probably banned us. Not persisted.
    Banned,
    /// Retries exhausted without a status line.
    TransportFailed(String),
    /// A status outside the terminal set survived the retry loop.
    Unrecognized(u16),
}

/// Classify a finished download. Redirects are treated as missing tiles:
/// no competent tile server redirects for normal tiles, so a 302 is
/// assumed to point at a generic "no imagery" placeholder.
pub fn classify(result: &DownloadResult) -> TileOutcome {
    match result.status {
        Some(200) => match &result.data {
            Some(data) => TileOutcome::Data(data.clone()),
            None => TileOutcome::TransportFailed("empty 200 response".to_string()),
        },
        Some(404) | Some(302) => TileOutcome::Missing,
        Some(403) => TileOutcome::Banned,
        Some(code) => TileOutcome::Unrecognized(code),
        None => TileOutcome::TransportFailed(
            result
                .error
                .clone()
                .unwrap_or_else(|| "download error".to_string()),
        ),
    }
}

/// Persist one classified result through the store. Returns a display
/// message for failures the monitor should count.
pub(crate) async fn persist_outcome(
    store: &TileStore,
    registry: &LayerRegistry,
    key: &TileKey,
    outcome: &TileOutcome,
) -> std::result::Result<(), String> {
    let (layer, coord) = key;
    let tile_label = || format!("{layer}/{}/{}/{}", coord.z, coord.x, coord.y);
    let file_type = registry
        .get(layer)
        .map(|l| l.file_type.clone())
        .unwrap_or_default();

    match outcome {
        TileOutcome::Data(bytes) => store
            .save(layer, *coord, Some(bytes), &file_type)
            .await
            .map(|_| ())
            .map_err(|_| format!("{}: could not write file", tile_label())),
        TileOutcome::Missing => store
            .save(layer, *coord, None, &file_type)
            .await
            .map(|_| ())
            .map_err(|_| format!("{}: could not write file", tile_label())),
        TileOutcome::Banned => Err("Warning: we may have been banned".to_string()),
        TileOutcome::TransportFailed(err) => {
            Err(format!("Tile {}: download error {err}", tile_label()))
        }
        TileOutcome::Unrecognized(code) => Err(format!(
            "Unrecognized response code {code} (tile {})",
            tile_label()
        )),
    }
}

pub struct TileDownloader {
    pub progress: Arc<StageProgress>,
    handle: JoinHandle<()>,
}

impl TileDownloader {
    /// Feed the culled set through the download manager in random-walk
    /// order and persist every result through a single consumer.
    pub fn start(
        tiles: TileSet,
        store: Arc<TileStore>,
        registry: Arc<LayerRegistry>,
        config: DownloadConfig,
        shutdown: broadcast::Sender<()>,
    ) -> Self {
        let progress = Arc::new(StageProgress::default());
        let task_progress = Arc::clone(&progress);

        let handle = tokio::spawn(async move {
            let expected = total_tiles(&tiles);
            task_progress.set_total(expected);

            let mut manager = DownloadManager::new(config);
            let mut results = manager.take_results();

            // driver: random-walk order into the bounded input queue
            let driver = {
                let registry = Arc::clone(&registry);
                let progress = Arc::clone(&task_progress);
                let mut shutdown_rx = shutdown.subscribe();
                let manager = &manager;
                let tiles = &tiles;
                async move {
                    let mut layer_ids: Vec<&String> = tiles.keys().collect();
                    layer_ids.sort();
                    // thread-local rngs are not Send; this future hops threads
                    let mut rng: StdRng = rand::make_rng();
                    'outer: for layer in layer_ids {
                        let order = random_walk(&tiles[layer], &mut rng);
                        for t in order {
                            if shutdown_requested(&mut shutdown_rx) {
                                break 'outer;
                            }
                            match registry.tile_url(layer, t.z, t.x, t.y) {
                                Ok(url) => {
                                    if manager.enqueue((layer.clone(), t), url).await.is_err() {
                                        break 'outer;
                                    }
                                }
                                Err(err) => {
                                    // never reaches the consumer; account here
                                    progress.add_processed(1);
                                    progress.record_error(format!("{err}"));
                                }
                            }
                        }
                    }
                }
            };

            // consumer: serialize persistence through the store
            let consumer = {
                let progress = Arc::clone(&task_progress);
                let store = Arc::clone(&store);
                let registry = Arc::clone(&registry);
                let mut shutdown_rx = shutdown.subscribe();
                async move {
                    loop {
                        if progress.status().0 >= expected {
                            break;
                        }
                        let result = tokio::select! {
                            biased;
                            _ = shutdown_rx.recv() => break,
                            r = results.recv() => match r {
                                Some(r) => r,
                                None => break,
                            },
                            // re-check the completion count: tiles the
                            // driver accounted for never produce a result
                            _ = tokio::time::sleep(Duration::from_millis(50)) => continue,
                        };
                        let outcome = classify(&result);
                        if let Err(msg) =
                            persist_outcome(&store, &registry, &result.key, &outcome).await
                        {
                            progress.record_error(msg);
                        }
                        progress.add_processed(1);
                    }
                }
            };

            tokio::join!(driver, consumer);

            manager.terminate();
            manager.join().await;
            task_progress.finish();
        });

        Self { progress, handle }
    }

    pub async fn finish(self) {
        let _ = self.handle.await;
    }
}

/// Poll a stage until it finishes, invoking `observe` with its status at
/// roughly 100 Hz (the monitor cadence).
pub async fn monitor_stage<F: FnMut(&StageProgress)>(progress: &StageProgress, mut observe: F) {
    while !progress.is_finished() {
        observe(progress);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    observe(progress);
}
