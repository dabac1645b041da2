//! FieldAtlas core: the offline map-tile cache, tile download coordinator,
//! and bidirectional survey sync engine behind the field data-collection app.
//! The UI layer (map screens, forms, dialogs) lives elsewhere and talks to
//! this crate through [`Services`].

pub mod model;
pub mod photos;
pub mod store;
pub mod sync;
pub mod tile_cache;
pub mod tile_fetch;

use std::path::PathBuf;
use std::sync::Arc;

use crate::photos::{HttpObjectStore, PhotoTransformer};
use crate::store::LocalStore;
use crate::sync::{ApiAuth, HttpBackend, SyncEngine};
use crate::tile_cache::TileCacheStore;
use crate::tile_fetch::{HttpTileFetcher, TileDownloader, TileFetchConfig};

#[derive(Debug, Clone)]
pub struct AppConfig {
  pub data_dir: PathBuf,
  pub tile_cache_dir: PathBuf,
  pub api: ApiAuth,
  pub fetch: TileFetchConfig,
}

/// Process-wide service instances. The application shell builds one of these
/// at startup and hands references to the UI layer; tests build their own
/// with fake collaborators behind the same seams.
pub struct Services {
  pub store: Arc<LocalStore>,
  pub tiles: Arc<TileCacheStore>,
  pub downloader: TileDownloader,
  pub sync: SyncEngine,
}

impl Services {
  pub fn new(config: AppConfig) -> Result<Services, String> {
    if config.api.base_url.trim().is_empty() {
      return Err("api base_url is required".to_string());
    }

    let store = Arc::new(LocalStore::open(&config.data_dir)?);
    let tiles = Arc::new(TileCacheStore::new(config.tile_cache_dir.clone())?);

    let fetcher = Arc::new(HttpTileFetcher::new(config.fetch.timeout)?);
    let downloader = TileDownloader::new(tiles.clone(), fetcher, config.fetch.clone());

    let objects = Arc::new(HttpObjectStore::new(config.api.clone()));
    let photos = PhotoTransformer::new(objects, store.clone());
    let backend = Arc::new(HttpBackend::new(config.api.clone()));
    let sync = SyncEngine::new(backend, store.clone(), photos);

    Ok(Services {
      store,
      tiles,
      downloader,
      sync,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  #[test]
  fn test_services_wire_up() {
    let tmp = TempDir::new().unwrap();
    let config = AppConfig {
      data_dir: tmp.path().join("data"),
      tile_cache_dir: tmp.path().join("tiles"),
      api: ApiAuth {
        base_url: "https://api.fieldatlas.test".to_string(),
        access_token: "token".to_string(),
      },
      fetch: TileFetchConfig::default(),
    };
    let services = Services::new(config).unwrap();
    assert!(services.store.list_projects().unwrap().is_empty());
  }

  #[test]
  fn test_services_require_base_url() {
    let tmp = TempDir::new().unwrap();
    let config = AppConfig {
      data_dir: tmp.path().join("data"),
      tile_cache_dir: tmp.path().join("tiles"),
      api: ApiAuth {
        base_url: "  ".to_string(),
        access_token: "token".to_string(),
      },
      fetch: TileFetchConfig::default(),
    };
    assert!(Services::new(config).is_err());
  }
}
