//! The download manager: a pool of worker tasks fed by a bounded input
//! queue, producing into a bounded output queue.
//!
//! Both queues are bounded and the producer must block when they fill;
//! that backpressure is the only thing keeping memory independent of the
//! size of the download set.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::connection::{HostConnections, DEFAULT_USER_AGENT};
use crate::mercator::TileCoord;

/// Identity of a queued tile: layer id plus coordinates.
pub type TileKey = (String, TileCoord);

/// Statuses that end the retry loop: the server has answered for this
/// tile, one way or another.
pub const TERMINAL_STATUSES: [u16; 4] = [200, 404, 302, 403];

/// Outcome of one download job. `status` None means the transport never
/// produced a status line (all attempts failed).
#[derive(Debug, Clone)]
pub struct DownloadResult {
    pub key: TileKey,
    pub status: Option<u16>,
    pub data: Option<Vec<u8>>,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DownloadConfig {
    pub workers: usize,
    /// Attempts per job, counting IO failures and non-terminal statuses.
    pub retries: u32,
    /// Capacity of the input and output queues.
    pub queue_limit: usize,
    pub terminal_statuses: Vec<u16>,
    pub user_agent: String,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            workers: 10,
            retries: 5,
            queue_limit: 100,
            terminal_statuses: TERMINAL_STATUSES.to_vec(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

/// A frontend for the downloading worker tasks.
pub struct DownloadManager {
    in_tx: mpsc::Sender<(TileKey, String)>,
    out_rx: Option<mpsc::Receiver<DownloadResult>>,
    shutdown_tx: broadcast::Sender<()>,
    workers: Vec<JoinHandle<()>>,
    queued: Arc<AtomicUsize>,
}

impl DownloadManager {
    pub fn new(config: DownloadConfig) -> Self {
        let (in_tx, in_rx) = mpsc::channel::<(TileKey, String)>(config.queue_limit);
        let (out_tx, out_rx) = mpsc::channel::<DownloadResult>(config.queue_limit);
        let (shutdown_tx, _) = broadcast::channel(1);
        let in_rx = Arc::new(Mutex::new(in_rx));
        let queued = Arc::new(AtomicUsize::new(0));

        let workers = (0..config.workers)
            .map(|_| {
                let in_rx = Arc::clone(&in_rx);
                let out_tx = out_tx.clone();
                let queued = Arc::clone(&queued);
                let shutdown_rx = shutdown_tx.subscribe();
                let retries = config.retries;
                let terminal = config.terminal_statuses.clone();
                let user_agent = config.user_agent.clone();
                tokio::spawn(worker_loop(
                    in_rx,
                    out_tx,
                    queued,
                    shutdown_rx,
                    retries,
                    terminal,
                    user_agent,
                ))
            })
            .collect();

        Self {
            in_tx,
            out_rx: Some(out_rx),
            shutdown_tx,
            workers,
            queued,
        }
    }

    /// Queue a download; blocks while the input queue is full.
    pub async fn enqueue(&self, key: TileKey, url: String) -> Result<(), ()> {
        self.queued.fetch_add(1, Ordering::SeqCst);
        self.in_tx.send((key, url)).await.map_err(|_| {
            self.queued.fetch_sub(1, Ordering::SeqCst);
        })
    }

    /// The result queue. Call once; the consumer owns it from then on.
    pub fn take_results(&mut self) -> mpsc::Receiver<DownloadResult> {
        self.out_rx.take().expect("results already taken")
    }

    /// Stop all workers at their next suspension point. Jobs already in
    /// flight still deliver their results.
    pub fn terminate(&self) {
        if self.queued.load(Ordering::SeqCst) > 0 {
            tracing::warn!("shutting down downloaders before queue empty");
        }
        let _ = self.shutdown_tx.send(());
    }

    /// Block until all workers have exited.
    pub async fn join(self) {
        for handle in self.workers {
            let _ = handle.await;
        }
    }
}

async fn worker_loop(
    in_rx: Arc<Mutex<mpsc::Receiver<(TileKey, String)>>>,
    out_tx: mpsc::Sender<DownloadResult>,
    queued: Arc<AtomicUsize>,
    mut shutdown_rx: broadcast::Receiver<()>,
    retries: u32,
    terminal: Vec<u16>,
    user_agent: String,
) {
    let mut conns = HostConnections::new(user_agent);
    loop {
        let job = {
            let mut rx = in_rx.lock().await;
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => None,
                job = rx.recv() => job,
            }
        };
        let Some((key, url)) = job else {
            break;
        };
        queued.fetch_sub(1, Ordering::SeqCst);

        let result = download_one(&mut conns, key, &url, retries, &terminal).await;
        if out_tx.send(result).await.is_err() {
            break;
        }
    }
}

/// Attempt a single job up to `retries` times; IO failures and
/// non-terminal statuses are both retryable.
async fn download_one(
    conns: &mut HostConnections,
    key: TileKey,
    url: &str,
    retries: u32,
    terminal: &[u16],
) -> DownloadResult {
    let mut outcome = None;
    for _ in 0..retries.max(1) {
        let attempt = conns.get(url).await;
        let done = matches!(attempt.status, Some(s) if terminal.contains(&s));
        outcome = Some(attempt);
        if done {
            break;
        }
    }
    let outcome = outcome.unwrap();
    DownloadResult {
        key,
        status: outcome.status,
        data: outcome.data,
        error: outcome.error,
    }
}
