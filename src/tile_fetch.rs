use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use tokio::sync::{broadcast, Mutex, Semaphore};

use crate::tile_cache::{TileCacheStore, TileKey};

/// 1x1 transparent PNG served whenever a real tile cannot be produced. A
/// complete, well-formed file, so any standard image pipeline decodes it.
pub const PLACEHOLDER_TILE_PNG: [u8; 68] = [
  0x89, 0x50, 0x4e, 0x47, 0x0d, 0x0a, 0x1a, 0x0a, 0x00, 0x00, 0x00, 0x0d, 0x49, 0x48, 0x44, 0x52,
  0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x06, 0x00, 0x00, 0x00, 0x1f, 0x15, 0xc4,
  0x89, 0x00, 0x00, 0x00, 0x0b, 0x49, 0x44, 0x41, 0x54, 0x78, 0xda, 0x63, 0x60, 0x00, 0x02, 0x00,
  0x00, 0x05, 0x00, 0x01, 0xe9, 0xfa, 0xdc, 0xd8, 0x00, 0x00, 0x00, 0x00, 0x49, 0x45, 0x4e, 0x44,
  0xae, 0x42, 0x60, 0x82,
];

static PLACEHOLDER: Lazy<Arc<Vec<u8>>> = Lazy::new(|| Arc::new(PLACEHOLDER_TILE_PNG.to_vec()));

pub fn placeholder_tile() -> Arc<Vec<u8>> {
  PLACEHOLDER.clone()
}

#[derive(Debug, Clone)]
pub enum FetchError {
  /// Worth retrying: timeout, connection failure, server-side error.
  Transient(String),
  /// Not worth retrying: missing tile, client error, malformed response.
  Fatal(String),
}

impl std::fmt::Display for FetchError {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      FetchError::Transient(e) => write!(f, "{}", e),
      FetchError::Fatal(e) => write!(f, "{}", e),
    }
  }
}

#[async_trait]
pub trait TileFetcher: Send + Sync {
  async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError>;
}

pub struct HttpTileFetcher {
  client: reqwest::Client,
}

impl HttpTileFetcher {
  pub fn new(timeout: Duration) -> Result<HttpTileFetcher, String> {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| e.to_string())?;
    Ok(HttpTileFetcher { client })
  }
}

#[async_trait]
impl TileFetcher for HttpTileFetcher {
  async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
    let res = self
      .client
      .get(url)
      .send()
      .await
      .map_err(|e| FetchError::Transient(e.to_string()))?;
    let status = res.status();
    if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
      return Err(FetchError::Transient(format!("tile fetch failed: HTTP {}", status)));
    }
    if !status.is_success() {
      return Err(FetchError::Fatal(format!("tile fetch failed: HTTP {}", status)));
    }
    match res.bytes().await {
      Ok(b) => Ok(b.to_vec()),
      Err(e) => Err(FetchError::Transient(e.to_string())),
    }
  }
}

#[derive(Debug, Clone)]
pub struct TileFetchConfig {
  /// Ceiling on simultaneous tile downloads across all callers.
  pub concurrency: usize,
  /// How many of those slots off-screen prefetch may occupy, so on-screen
  /// tiles always have headroom under load.
  pub prefetch_concurrency: usize,
  pub timeout: Duration,
  pub max_attempts: u32,
  pub retry_delay_ms: u64,
  /// Cached tiles older than this are refreshed on next access when the
  /// network cooperates, and served as-is when it does not.
  pub max_stale: Duration,
}

impl Default for TileFetchConfig {
  fn default() -> Self {
    TileFetchConfig {
      concurrency: 8,
      prefetch_concurrency: 2,
      timeout: Duration::from_secs(10),
      max_attempts: 3,
      retry_delay_ms: 500,
      max_stale: Duration::from_secs(30 * 24 * 60 * 60),
    }
  }
}

enum Role {
  Lead(broadcast::Sender<Arc<Vec<u8>>>),
  Wait(broadcast::Receiver<Arc<Vec<u8>>>),
}

struct Inner {
  cache: Arc<TileCacheStore>,
  fetcher: Arc<dyn TileFetcher>,
  config: TileFetchConfig,
  slots: Semaphore,
  prefetch_slots: Semaphore,
  inflight: Mutex<HashMap<TileKey, broadcast::Sender<Arc<Vec<u8>>>>>,
}

/// Resolves tile requests cache-first, deduplicates same-key fetches, bounds
/// download concurrency, and never fails: every request ends in displayable
/// bytes. Cheap to clone; clones share one fetch pipeline.
#[derive(Clone)]
pub struct TileDownloader {
  inner: Arc<Inner>,
}

impl TileDownloader {
  pub fn new(cache: Arc<TileCacheStore>, fetcher: Arc<dyn TileFetcher>, config: TileFetchConfig) -> TileDownloader {
    let slots = Semaphore::new(config.concurrency.max(1));
    let prefetch_slots = Semaphore::new(config.prefetch_concurrency.clamp(1, config.concurrency.max(1)));
    TileDownloader {
      inner: Arc::new(Inner {
        cache,
        fetcher,
        config,
        slots,
        prefetch_slots,
        inflight: Mutex::new(HashMap::new()),
      }),
    }
  }

  /// Expand a `{z}/{x}/{y}` URL template for one tile.
  pub fn tile_url(template: &str, key: &TileKey) -> String {
    template
      .replace("{z}", &key.z.to_string())
      .replace("{x}", &key.x.to_string())
      .replace("{y}", &key.y.to_string())
  }

  /// Resolve one tile to displayable bytes.
  ///
  /// Cache hits return without touching the network. A miss for a basemap
  /// with no source URL (generated tileset) means the tile is outside the
  /// generated extent, so the placeholder comes back immediately. Everything
  /// else fetches with retry, and a tile that cannot be fetched degrades to
  /// the stale cached copy if one exists, else the placeholder.
  pub async fn resolve(&self, key: &TileKey, source_url: &str, is_visible: bool) -> Arc<Vec<u8>> {
    let mut stale = None;
    match self.inner.cache.get(key) {
      Ok(Some(tile)) => {
        if source_url.is_empty() || tile.age() <= self.inner.config.max_stale {
          return Arc::new(tile.bytes);
        }
        // stale remote-backed tile: try to refresh, keep it as the fallback
        stale = Some(Arc::new(tile.bytes));
      }
      Ok(None) => {}
      Err(e) => log::warn!("tile cache read failed for {}: {}", key, e),
    }

    if source_url.is_empty() {
      return stale.unwrap_or_else(placeholder_tile);
    }

    let url = Self::tile_url(source_url, key);

    // Same-key requests share a single in-flight fetch.
    let role = {
      let mut inflight = self.inner.inflight.lock().await;
      match inflight.get(key) {
        Some(tx) => Role::Wait(tx.subscribe()),
        None => {
          let (tx, _rx) = broadcast::channel(1);
          inflight.insert(key.clone(), tx.clone());
          Role::Lead(tx)
        }
      }
    };

    let mut rx = match role {
      Role::Wait(rx) => rx,
      Role::Lead(tx) => {
        // The fetch runs detached: once started it completes (and lands in
        // the cache) even if every waiter goes away first.
        let rx = tx.subscribe();
        let inner = self.inner.clone();
        let key = key.clone();
        let stale = stale.clone();
        tokio::spawn(async move {
          let bytes = inner.fetch_with_retry(&key, &url, is_visible, stale).await;
          inner.inflight.lock().await.remove(&key);
          let _ = tx.send(bytes);
        });
        rx
      }
    };

    match rx.recv().await {
      Ok(bytes) => bytes,
      Err(_) => stale.unwrap_or_else(placeholder_tile),
    }
  }
}

impl Inner {
  async fn fetch_with_retry(
    &self,
    key: &TileKey,
    url: &str,
    is_visible: bool,
    stale: Option<Arc<Vec<u8>>>,
  ) -> Arc<Vec<u8>> {
    let _prefetch_permit = if is_visible {
      None
    } else {
      match self.prefetch_slots.acquire().await {
        Ok(p) => Some(p),
        Err(_) => return stale.unwrap_or_else(placeholder_tile),
      }
    };
    let _permit = match self.slots.acquire().await {
      Ok(p) => p,
      Err(_) => return stale.unwrap_or_else(placeholder_tile),
    };

    let mut attempt = 0u32;
    loop {
      attempt += 1;
      match self.fetcher.fetch(url).await {
        Ok(bytes) => {
          let bytes = Arc::new(bytes);
          if let Err(e) = self.cache.put(key, &bytes) {
            // a failed cache write must not fail the tile render
            log::warn!("tile cache write failed for {}: {}", key, e);
          }
          return bytes;
        }
        Err(FetchError::Transient(e)) if attempt < self.config.max_attempts => {
          let delay = self.config.retry_delay_ms * 2u64.pow(attempt - 1);
          log::debug!("tile {} attempt {} failed ({}), retrying in {}ms", key, attempt, e, delay);
          tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        Err(e) => {
          log::warn!("tile {} failed: {}", key, e);
          return stale.unwrap_or_else(placeholder_tile);
        }
      }
    }
  }
}
