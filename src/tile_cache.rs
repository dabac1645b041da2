use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::model::Basemap;

/// Identity of one cached tile image.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Hash)]
pub struct TileKey {
  pub basemap_id: String,
  pub z: u8,
  pub x: u32,
  pub y: u32,
}

impl TileKey {
  pub fn new(basemap_id: impl Into<String>, z: u8, x: u32, y: u32) -> TileKey {
    TileKey {
      basemap_id: basemap_id.into(),
      z,
      x,
      y,
    }
  }
}

impl std::fmt::Display for TileKey {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}/{}/{}/{}", self.basemap_id, self.z, self.x, self.y)
  }
}

#[derive(Debug, Clone)]
pub struct CachedTile {
  pub key: TileKey,
  pub bytes: Vec<u8>,
  pub size_bytes: u64,
  pub stored_at: DateTime<Utc>,
}

impl CachedTile {
  pub fn age(&self) -> Duration {
    (Utc::now() - self.stored_at).to_std().unwrap_or(Duration::ZERO)
  }
}

/// Per-basemap cache introspection, computed on demand from file metadata.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct CacheSummary {
  pub basemap_id: String,
  pub size_in_bytes: u64,
  pub tile_count: u64,
  pub last_modified: Option<DateTime<Utc>>,
}

/// Persistent tile store: `root/<basemap>/<z>/<x>/<y>.png`.
///
/// Staleness is a download-coordinator policy; the store never deletes
/// entries on its own.
pub struct TileCacheStore {
  root: PathBuf,
  tmp_seq: AtomicU64,
}

fn check_basemap_id(id: &str) -> Result<(), String> {
  if id.trim().is_empty() {
    return Err("basemap id is required".to_string());
  }
  if id.contains('/') || id.contains('\\') || id.contains("..") {
    return Err(format!("basemap id {:?} is not usable as a cache directory name", id));
  }
  Ok(())
}

impl TileCacheStore {
  pub fn new(root: impl Into<PathBuf>) -> Result<TileCacheStore, String> {
    let root = root.into();
    fs::create_dir_all(&root).map_err(|e| e.to_string())?;
    Ok(TileCacheStore {
      root,
      tmp_seq: AtomicU64::new(0),
    })
  }

  fn basemap_dir(&self, basemap_id: &str) -> Result<PathBuf, String> {
    check_basemap_id(basemap_id)?;
    Ok(self.root.join(basemap_id))
  }

  fn tile_path(&self, key: &TileKey) -> Result<PathBuf, String> {
    Ok(
      self
        .basemap_dir(&key.basemap_id)?
        .join(key.z.to_string())
        .join(key.x.to_string())
        .join(format!("{}.png", key.y)),
    )
  }

  /// Pure local read; `Ok(None)` on miss.
  pub fn get(&self, key: &TileKey) -> Result<Option<CachedTile>, String> {
    let path = self.tile_path(key)?;
    if !path.exists() {
      return Ok(None);
    }
    let meta = fs::metadata(&path).map_err(|e| e.to_string())?;
    let stored_at = meta
      .modified()
      .map(DateTime::<Utc>::from)
      .unwrap_or_else(|_| Utc::now());
    let bytes = fs::read(&path).map_err(|e| e.to_string())?;
    Ok(Some(CachedTile {
      key: key.clone(),
      size_bytes: bytes.len() as u64,
      bytes,
      stored_at,
    }))
  }

  /// Idempotent upsert. Written through a sibling temp file and renamed into
  /// place, so concurrent writers to the same key end with one writer's
  /// complete bytes and a reader never sees a torn tile.
  pub fn put(&self, key: &TileKey, bytes: &[u8]) -> Result<(), String> {
    let path = self.tile_path(key)?;
    if let Some(parent) = path.parent() {
      fs::create_dir_all(parent).map_err(|e| e.to_string())?;
    }
    let seq = self.tmp_seq.fetch_add(1, Ordering::Relaxed);
    let tmp = path.with_extension(format!("tmp{}", seq));
    fs::write(&tmp, bytes).map_err(|e| e.to_string())?;
    fs::rename(&tmp, &path).map_err(|e| e.to_string())
  }

  /// Size, count and newest write time for one basemap. Reads file metadata
  /// only; tile bytes are never loaded.
  pub fn summarize(&self, basemap_id: &str) -> Result<CacheSummary, String> {
    let dir = self.basemap_dir(basemap_id)?;
    let mut summary = CacheSummary {
      basemap_id: basemap_id.to_string(),
      ..Default::default()
    };
    if !dir.exists() {
      return Ok(summary);
    }
    for entry in WalkDir::new(&dir).into_iter().filter_map(Result::ok) {
      if !entry.file_type().is_file() {
        continue;
      }
      let meta = match entry.metadata() {
        Ok(m) => m,
        Err(_) => continue,
      };
      summary.size_in_bytes += meta.len();
      summary.tile_count += 1;
      if let Ok(modified) = meta.modified() {
        let modified = DateTime::<Utc>::from(modified);
        if summary.last_modified.map_or(true, |m| modified > m) {
          summary.last_modified = Some(modified);
        }
      }
    }
    Ok(summary)
  }

  /// Evict every tile of one basemap. Returns the number of tiles removed.
  pub fn clear(&self, basemap_id: &str) -> Result<u64, String> {
    let dir = self.basemap_dir(basemap_id)?;
    if !dir.exists() {
      return Ok(0);
    }
    let evicted = WalkDir::new(&dir)
      .into_iter()
      .filter_map(Result::ok)
      .filter(|e| e.file_type().is_file())
      .count() as u64;
    fs::remove_dir_all(&dir).map_err(|e| e.to_string())?;
    Ok(evicted)
  }

  /// Bulk eviction over every cached basemap whose id matches the predicate.
  pub fn clear_matching(&self, predicate: impl Fn(&str) -> bool) -> Result<u64, String> {
    let mut evicted = 0u64;
    for entry in fs::read_dir(&self.root).map_err(|e| e.to_string())?.filter_map(Result::ok) {
      let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
      if !is_dir {
        continue;
      }
      let name = entry.file_name().to_string_lossy().to_string();
      if predicate(&name) {
        evicted += self.clear(&name)?;
      }
    }
    Ok(evicted)
  }
}

/// Clear one basemap's cache, refusing basemaps whose tiles exist nowhere
/// else. Deleting a generated tileset is a delete-basemap workflow, not a
/// cache eviction.
pub fn clear_basemap(store: &TileCacheStore, basemap: &Basemap) -> Result<u64, String> {
  if basemap.kind.is_generated() {
    return Err(format!(
      "basemap {:?} is a generated tileset; its tiles exist only in this cache. Delete the basemap instead of clearing its cache.",
      basemap.name
    ));
  }
  store.clear(&basemap.id)
}

/// "Clear all map caches": evicts every cached basemap except the generated
/// ones, whose cache is their only copy.
pub fn clear_remote_caches(store: &TileCacheStore, basemaps: &[Basemap]) -> Result<u64, String> {
  let generated: Vec<&str> = basemaps
    .iter()
    .filter(|b| b.kind.is_generated())
    .map(|b| b.id.as_str())
    .collect();
  store.clear_matching(|id| !generated.contains(&id))
}
