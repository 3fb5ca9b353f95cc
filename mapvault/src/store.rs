//! The tile store: content-addressed blobs on disk plus a SQLite index.
//!
//! Each cached tile is one row in `tiles`, keyed by `(layer, z, x, y)`,
//! holding the quadkey, the blob digest, and the fetch timestamp. Blob
//! files are named by digest, so identical images are stored once no
//! matter how many tiles reference them; when the last reference to a
//! digest is displaced, its blob is deleted.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use tokio::fs;

use crate::error::Result;
use crate::mercator::{to_quadkey, TileCoord};
use crate::region::Region;

/// Digest length in bytes (16 hex chars).
pub const HASH_LENGTH: usize = 8;

/// Sentinel digest recording a tile the server has no data for.
pub const NULL_DIGEST: &str = "0000000000000000";

/// Content digest for tile data; the null digest when there is none.
pub fn digest(data: Option<&[u8]>) -> String {
    match data {
        Some(d) => {
            let hash = blake3::hash(d);
            hash.to_hex()[..HASH_LENGTH * 2].to_string()
        }
        None => NULL_DIGEST.to_string(),
    }
}

/// Current wall-clock time in unix milliseconds.
pub fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as i64
}

/// One row of the tile index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileRow {
    pub layer: String,
    pub coord: TileCoord,
    pub qt: String,
    pub uuid: String,
    pub fetched_on: i64,
}

impl TileRow {
    /// Whether this row records a known-missing tile.
    pub fn is_missing(&self) -> bool {
        self.uuid == NULL_DIGEST
    }
}

/// Result of a point read from the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TileData {
    /// Cached bytes.
    Present(Vec<u8>),
    /// The server was asked and has no tile here.
    KnownMissing,
    /// Never fetched.
    Absent,
}

pub struct TileStore {
    pool: SqlitePool,
    root: PathBuf,
    buckets: Vec<usize>,
}

impl TileStore {
    /// Open (creating if needed) a store with the database at `db_path`
    /// and blobs under `tile_root`. `buckets` gives the directory fan-out
    /// prefix widths; `[3]` means `ab12f.../ab12f...cd.png`.
    pub async fn open(db_path: &Path, tile_root: &Path, buckets: Vec<usize>) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::create_dir_all(tile_root).await?;
        if !fs::try_exists(db_path).await.unwrap_or(false) {
            fs::write(db_path, b"").await?;
        }

        let pool = SqlitePool::connect(&format!("sqlite://{}", db_path.display())).await?;
        for stmt in [
            "PRAGMA journal_mode=WAL;",
            "PRAGMA synchronous=NORMAL;",
            "PRAGMA busy_timeout=5000;",
        ] {
            if let Err(err) = sqlx::query(stmt).execute(&pool).await {
                eprintln!("SQLite pragma failed ({stmt}): {err}");
            }
        }

        let store = Self {
            pool,
            root: tile_root.to_path_buf(),
            buckets,
        };
        store.create_tables().await?;
        Ok(store)
    }

    /// In-memory database (blobs still on disk); used by tests and
    /// throwaway runs.
    pub async fn open_memory(tile_root: &Path, buckets: Vec<usize>) -> Result<Self> {
        fs::create_dir_all(tile_root).await?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = Self {
            pool,
            root: tile_root.to_path_buf(),
            buckets,
        };
        store.create_tables().await?;
        Ok(store)
    }

    async fn create_tables(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tiles (
                layer      TEXT    NOT NULL,
                z          INTEGER NOT NULL CHECK (z >= 0),
                x          INTEGER NOT NULL,
                y          INTEGER NOT NULL,
                qt         TEXT    NOT NULL,
                uuid       TEXT    NOT NULL,
                fetched_on INTEGER NOT NULL,
                PRIMARY KEY (layer, z, x, y)
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS tiles_qt ON tiles (layer, qt);")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS tiles_uuid ON tiles (uuid);")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS regions (
                id       INTEGER PRIMARY KEY AUTOINCREMENT,
                name     TEXT NOT NULL UNIQUE,
                boundary TEXT NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Blob path for a digest: bucket directories from digest prefixes,
    /// then `<digest>.<ext>`.
    pub fn blob_path(&self, uuid: &str, ext: &str) -> PathBuf {
        let mut path = self.root.clone();
        for &width in &self.buckets {
            path.push(&uuid[..width.min(uuid.len())]);
        }
        path.push(format!("{uuid}.{ext}"));
        path
    }

    /// Persist a downloaded tile: write the blob (if any), upsert the
    /// index row, then reclaim the displaced blob if this was its last
    /// reference. Returns the new digest.
    pub async fn save(
        &self,
        layer: &str,
        coord: TileCoord,
        data: Option<&[u8]>,
        file_type: &str,
    ) -> Result<String> {
        let uuid = digest(data);

        if let Some(bytes) = data {
            let path = self.blob_path(&uuid, file_type);
            if !fs::try_exists(&path).await.unwrap_or(false) {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent).await?;
                }
                // write-then-rename keeps half-written blobs out of the tree
                let tmp = path.with_extension(format!("{file_type}.part"));
                fs::write(&tmp, bytes).await?;
                fs::rename(&tmp, &path).await?;
            }
        }

        let qt = to_quadkey(coord.z, coord.x, coord.y, None);
        let mut tx = self.pool.begin().await?;
        let old_uuid: Option<String> =
            sqlx::query("SELECT uuid FROM tiles WHERE layer = ? AND z = ? AND x = ? AND y = ?")
                .bind(layer)
                .bind(coord.z as i64)
                .bind(coord.x as i64)
                .bind(coord.y as i64)
                .fetch_optional(&mut *tx)
                .await?
                .map(|row| row.get::<String, _>("uuid"));

        sqlx::query(
            r#"
            INSERT INTO tiles (layer, z, x, y, qt, uuid, fetched_on)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (layer, z, x, y)
            DO UPDATE SET uuid = excluded.uuid, fetched_on = excluded.fetched_on
            "#,
        )
        .bind(layer)
        .bind(coord.z as i64)
        .bind(coord.x as i64)
        .bind(coord.y as i64)
        .bind(&qt)
        .bind(&uuid)
        .bind(now_ms())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        if let Some(old) = old_uuid {
            if old != uuid && old != NULL_DIGEST && !self.uuid_referenced(&old).await? {
                self.remove_blobs(&old).await?;
            }
        }
        Ok(uuid)
    }

    async fn uuid_referenced(&self, uuid: &str) -> Result<bool> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tiles WHERE uuid = ?")
            .bind(uuid)
            .fetch_one(&self.pool)
            .await?;
        Ok(count > 0)
    }

    /// Delete every blob file for a digest, whatever its extension.
    async fn remove_blobs(&self, uuid: &str) -> Result<()> {
        // extension unknown here: scan the bucket directory
        let dir = match self.blob_path(uuid, "x").parent() {
            Some(d) => d.to_path_buf(),
            None => return Ok(()),
        };
        let mut entries = match fs::read_dir(&dir).await {
            Ok(e) => e,
            Err(_) => return Ok(()),
        };
        let prefix = format!("{uuid}.");
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                if name.starts_with(&prefix) {
                    fs::remove_file(entry.path()).await?;
                }
            }
        }
        Ok(())
    }

    /// Fetch the index row for one tile.
    pub async fn get(&self, layer: &str, coord: TileCoord) -> Result<Option<TileRow>> {
        let row = sqlx::query(
            "SELECT qt, uuid, fetched_on FROM tiles WHERE layer = ? AND z = ? AND x = ? AND y = ?",
        )
        .bind(layer)
        .bind(coord.z as i64)
        .bind(coord.x as i64)
        .bind(coord.y as i64)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| TileRow {
            layer: layer.to_string(),
            coord,
            qt: row.get("qt"),
            uuid: row.get("uuid"),
            fetched_on: row.get("fetched_on"),
        }))
    }

    /// Point read: bytes, known-missing, or never fetched.
    pub async fn get_data(
        &self,
        layer: &str,
        coord: TileCoord,
        file_type: &str,
    ) -> Result<TileData> {
        match self.get(layer, coord).await? {
            None => Ok(TileData::Absent),
            Some(row) if row.is_missing() => Ok(TileData::KnownMissing),
            Some(row) => {
                let path = self.blob_path(&row.uuid, file_type);
                Ok(TileData::Present(fs::read(&path).await?))
            }
        }
    }

    /// Which of `chunk` already exist for `layer`, subject to freshness
    /// cutoffs (unix ms): rows with data must be fetched after `cutoff`,
    /// known-missing rows after `cutoff_missing`. With both cutoffs `None`
    /// any existing row counts.
    pub async fn existing_in(
        &self,
        layer: &str,
        chunk: &[TileCoord],
        cutoff: Option<i64>,
        cutoff_missing: Option<i64>,
    ) -> Result<HashSet<TileCoord>> {
        if chunk.is_empty() {
            return Ok(HashSet::new());
        }
        let mut sql = String::from(
            "SELECT z, x, y FROM tiles WHERE layer = ? AND (z, x, y) IN (VALUES ",
        );
        sql.push_str(&vec!["(?, ?, ?)"; chunk.len()].join(", "));
        sql.push(')');

        match (cutoff, cutoff_missing) {
            (None, None) => {}
            (Some(_), None) => sql.push_str(" AND (uuid != ? AND fetched_on > ?)"),
            (None, Some(_)) => sql.push_str(" AND (uuid = ? AND fetched_on > ?)"),
            (Some(_), Some(_)) => sql.push_str(
                " AND ((uuid != ? AND fetched_on > ?) OR (uuid = ? AND fetched_on > ?))",
            ),
        }

        let mut query = sqlx::query(&sql).bind(layer);
        for t in chunk {
            query = query
                .bind(t.z as i64)
                .bind(t.x as i64)
                .bind(t.y as i64);
        }
        if let Some(c) = cutoff {
            query = query.bind(NULL_DIGEST).bind(c);
        }
        if let Some(cm) = cutoff_missing {
            query = query.bind(NULL_DIGEST).bind(cm);
        }

        let rows = query.fetch_all(&self.pool).await?;
        Ok(rows
            .iter()
            .map(|row| {
                TileCoord::new(
                    row.get::<i64, _>("z") as u8,
                    row.get::<i64, _>("x") as u32,
                    row.get::<i64, _>("y") as u32,
                )
            })
            .collect())
    }

    /// All cached descendants of a tile, via the quadkey string range:
    /// a descendant's qt strictly extends the ancestor's, so it sorts
    /// after `qt` and before `qt + "4"`.
    pub async fn descendants(
        &self,
        layer: &str,
        coord: TileCoord,
        min_depth: Option<u8>,
        max_depth: Option<u8>,
    ) -> Result<Vec<TileRow>> {
        let qt = to_quadkey(coord.z, coord.x, coord.y, None);
        let upper = format!("{qt}4");

        let mut sql = String::from(
            "SELECT z, x, y, qt, uuid, fetched_on FROM tiles \
             WHERE layer = ? AND qt > ? AND qt < ?",
        );
        if min_depth.is_some() {
            sql.push_str(" AND z >= ?");
        }
        if max_depth.is_some() {
            sql.push_str(" AND z <= ?");
        }
        sql.push_str(" ORDER BY qt");

        let mut query = sqlx::query(&sql).bind(layer).bind(&qt).bind(&upper);
        if let Some(d) = min_depth {
            query = query.bind((coord.z + d) as i64);
        }
        if let Some(d) = max_depth {
            query = query.bind((coord.z + d) as i64);
        }

        let rows = query.fetch_all(&self.pool).await?;
        Ok(rows
            .iter()
            .map(|row| TileRow {
                layer: layer.to_string(),
                coord: TileCoord::new(
                    row.get::<i64, _>("z") as u8,
                    row.get::<i64, _>("x") as u32,
                    row.get::<i64, _>("y") as u32,
                ),
                qt: row.get("qt"),
                uuid: row.get("uuid"),
                fetched_on: row.get("fetched_on"),
            })
            .collect())
    }

    /// Rows for the ancestors of a tile, nearest first, up to `lookback`
    /// levels (stopping at the root). Entry `i` is the ancestor at
    /// `z - 1 - i`, None where nothing is cached.
    pub async fn ancestors(
        &self,
        layer: &str,
        coord: TileCoord,
        lookback: u8,
    ) -> Result<Vec<Option<TileRow>>> {
        let mut out = Vec::new();
        let mut cur = coord;
        for _ in 0..lookback {
            let Some(parent) = cur.parent() else {
                break;
            };
            out.push(self.get(layer, parent).await?);
            cur = parent;
        }
        Ok(out)
    }

    /// Look up a stored region by name.
    pub async fn find_region(&self, name: &str) -> Result<Option<Region>> {
        let row = sqlx::query("SELECT boundary FROM regions WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(Region::from_boundary(
                name,
                &row.get::<String, _>("boundary"),
            )?)),
            None => Ok(None),
        }
    }

    pub async fn insert_region(&self, region: &Region) -> Result<()> {
        sqlx::query("INSERT INTO regions (name, boundary) VALUES (?, ?)")
            .bind(region.name())
            .bind(region.boundary())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn update_region(&self, region: &Region) -> Result<()> {
        sqlx::query("UPDATE regions SET boundary = ? WHERE name = ?")
            .bind(region.boundary())
            .bind(region.name())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// All stored regions.
    pub async fn regions(&self) -> Result<Vec<Region>> {
        let rows = sqlx::query("SELECT name, boundary FROM regions ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                Region::from_boundary(
                    row.get::<String, _>("name"),
                    &row.get::<String, _>("boundary"),
                )
            })
            .collect()
    }
}
