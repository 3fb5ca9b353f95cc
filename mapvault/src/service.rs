//! On-demand tile fetching for interactive read-through caching.
//!
//! A thin, single-request-at-a-time wrapper around the download manager:
//! callers submit one tile and await the bytes (or None for a missing
//! tile). With `cache` set the result is persisted exactly like the bulk
//! pipeline; with `overwrite` unset an existing row is left alone.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::download::{DownloadConfig, DownloadManager};
use crate::error::{CacheError, Result};
use crate::layers::LayerRegistry;
use crate::mercator::TileCoord;
use crate::pipeline::{classify, persist_outcome, TileOutcome};
use crate::store::TileStore;

#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub layer: String,
    pub coord: TileCoord,
    pub url: String,
    /// Persist the response through the tile store.
    pub cache: bool,
    /// Replace an existing row; otherwise an already-cached tile skips
    /// persistence.
    pub overwrite: bool,
}

type Reply = oneshot::Sender<Option<Vec<u8>>>;

/// Async tile fetch service sharing the bulk download machinery.
pub struct TileFetchService {
    req_tx: mpsc::Sender<(FetchRequest, Reply)>,
    handle: JoinHandle<()>,
}

impl TileFetchService {
    pub fn new(store: Arc<TileStore>, registry: Arc<LayerRegistry>) -> Self {
        let (req_tx, mut req_rx) = mpsc::channel::<(FetchRequest, Reply)>(16);

        let handle = tokio::spawn(async move {
            // one worker, one slot: strictly one request in flight
            let mut manager = DownloadManager::new(DownloadConfig {
                workers: 1,
                queue_limit: 1,
                ..DownloadConfig::default()
            });
            let mut results = manager.take_results();

            while let Some((req, reply)) = req_rx.recv().await {
                let key = (req.layer.clone(), req.coord);
                if manager.enqueue(key, req.url.clone()).await.is_err() {
                    let _ = reply.send(None);
                    break;
                }
                let Some(result) = results.recv().await else {
                    let _ = reply.send(None);
                    break;
                };

                let outcome = classify(&result);
                let data = match &outcome {
                    TileOutcome::Data(bytes) => Some(bytes.clone()),
                    _ => None,
                };

                if req.cache
                    && matches!(outcome, TileOutcome::Data(_) | TileOutcome::Missing)
                {
                    let exists = match store.get(&req.layer, req.coord).await {
                        Ok(row) => row.is_some(),
                        Err(err) => {
                            tracing::warn!("on-demand cache lookup failed: {err}");
                            true // do not write over an unknown state
                        }
                    };
                    if req.overwrite || !exists {
                        if let Err(msg) =
                            persist_outcome(&store, &registry, &result.key, &outcome).await
                        {
                            tracing::warn!("on-demand persist failed: {msg}");
                        }
                    }
                }

                // the oneshot hops the result back onto the caller's task
                let _ = reply.send(data);
            }

            manager.terminate();
            manager.join().await;
        });

        Self { req_tx, handle }
    }

    /// Fetch one tile; resolves with the bytes, or None when the tile is
    /// missing or the fetch ultimately failed.
    pub async fn fetch(&self, req: FetchRequest) -> Result<Option<Vec<u8>>> {
        let (tx, rx) = oneshot::channel();
        self.req_tx
            .send((req, tx))
            .await
            .map_err(|_| CacheError::ShutDown)?;
        rx.await.map_err(|_| CacheError::ShutDown)
    }

    /// Drain pending requests and stop the service.
    pub async fn shutdown(self) {
        drop(self.req_tx);
        let _ = self.handle.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::LayerDef;
    use crate::store::{digest, TileData};
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn spawn_server<F>(respond: F) -> String
    where
        F: Fn(&str) -> (u16, Vec<u8>) + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let respond = Arc::new(respond);
        tokio::spawn(async move {
            while let Ok((mut sock, _)) = listener.accept().await {
                let respond = Arc::clone(&respond);
                tokio::spawn(async move {
                    let mut buf = Vec::new();
                    let mut chunk = [0u8; 1024];
                    let path = loop {
                        let n = match sock.read(&mut chunk).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => n,
                        };
                        buf.extend_from_slice(&chunk[..n]);
                        if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                            let head = String::from_utf8_lossy(&buf[..end]).to_string();
                            let line = head.lines().next().unwrap_or("").to_string();
                            break line.split_whitespace().nth(1).unwrap_or("/").to_string();
                        }
                    };
                    let (code, body) = respond(&path);
                    let head = format!(
                        "HTTP/1.1 {code} X\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                        body.len()
                    );
                    let _ = sock.write_all(head.as_bytes()).await;
                    let _ = sock.write_all(&body).await;
                });
            }
        });
        format!("http://{addr}")
    }

    async fn service() -> (TempDir, Arc<TileStore>, TileFetchService) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(
            TileStore::open_memory(&dir.path().join("tiles"), vec![3])
                .await
                .unwrap(),
        );
        let mut layers = HashMap::new();
        layers.insert(
            "test".to_string(),
            LayerDef::new("http://unused/{z}/{x}/{y}", "png", "test layer"),
        );
        let registry = Arc::new(LayerRegistry::new(layers));
        let svc = TileFetchService::new(Arc::clone(&store), registry);
        (dir, store, svc)
    }

    fn request(base: &str, coord: TileCoord, cache: bool, overwrite: bool) -> FetchRequest {
        FetchRequest {
            layer: "test".to_string(),
            coord,
            url: format!("{base}/{}/{}/{}.png", coord.z, coord.x, coord.y),
            cache,
            overwrite,
        }
    }

    #[tokio::test]
    async fn fetch_without_cache_leaves_store_untouched() {
        let base = spawn_server(|p| (200, format!("img{p}").into_bytes())).await;
        let (_dir, store, svc) = service().await;
        let coord = TileCoord::new(3, 1, 2);

        let data = svc.fetch(request(&base, coord, false, false)).await.unwrap();
        assert_eq!(data.as_deref(), Some(b"img/3/1/2.png".as_ref()));
        assert!(store.get("test", coord).await.unwrap().is_none());

        svc.shutdown().await;
    }

    #[tokio::test]
    async fn fetch_with_cache_persists_like_bulk_path() {
        let base = spawn_server(|p| (200, format!("img{p}").into_bytes())).await;
        let (_dir, store, svc) = service().await;
        let coord = TileCoord::new(4, 5, 6);

        let data = svc
            .fetch(request(&base, coord, true, false))
            .await
            .unwrap()
            .unwrap();
        let row = store.get("test", coord).await.unwrap().unwrap();
        assert_eq!(row.uuid, digest(Some(&data)));
        match store.get_data("test", coord, "png").await.unwrap() {
            TileData::Present(bytes) => assert_eq!(bytes, data),
            other => panic!("unexpected {other:?}"),
        }

        svc.shutdown().await;
    }

    #[tokio::test]
    async fn no_overwrite_skips_existing_row() {
        let hits = Arc::new(StdMutex::new(0u32));
        let hits_srv = Arc::clone(&hits);
        let base = spawn_server(move |p| {
            *hits_srv.lock().unwrap() += 1;
            (200, format!("new{p}").into_bytes())
        })
        .await;
        let (_dir, store, svc) = service().await;
        let coord = TileCoord::new(2, 1, 1);

        let old_uuid = store
            .save("test", coord, Some(b"old bytes"), "png")
            .await
            .unwrap();

        // overwrite unset: fetched data returned, row untouched
        let data = svc.fetch(request(&base, coord, true, false)).await.unwrap();
        assert!(data.is_some());
        let row = store.get("test", coord).await.unwrap().unwrap();
        assert_eq!(row.uuid, old_uuid);

        // overwrite set: row replaced
        let data = svc
            .fetch(request(&base, coord, true, true))
            .await
            .unwrap()
            .unwrap();
        let row = store.get("test", coord).await.unwrap().unwrap();
        assert_eq!(row.uuid, digest(Some(&data)));

        svc.shutdown().await;
    }

    #[tokio::test]
    async fn missing_tile_resolves_none_and_caches_sentinel() {
        let base = spawn_server(|_| (404, Vec::new())).await;
        let (_dir, store, svc) = service().await;
        let coord = TileCoord::new(5, 9, 9);

        let data = svc.fetch(request(&base, coord, true, false)).await.unwrap();
        assert!(data.is_none());
        let row = store.get("test", coord).await.unwrap().unwrap();
        assert!(row.is_missing());

        svc.shutdown().await;
    }

    #[tokio::test]
    async fn concurrent_fetches_all_resolve() {
        let base = spawn_server(|p| (200, format!("img{p}").into_bytes())).await;
        let (_dir, _store, svc) = service().await;
        let svc = Arc::new(svc);

        let mut joins = Vec::new();
        for i in 0..6u32 {
            let svc = Arc::clone(&svc);
            let base = base.clone();
            joins.push(tokio::spawn(async move {
                let coord = TileCoord::new(6, i, i);
                svc.fetch(request(&base, coord, false, false)).await.unwrap()
            }));
        }
        for (i, join) in joins.into_iter().enumerate() {
            let data = join.await.unwrap().unwrap();
            assert_eq!(data, format!("img/6/{i}/{i}.png").into_bytes());
        }
    }
}
