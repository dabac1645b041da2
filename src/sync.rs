use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{GeoData, Project, Syncable};
use crate::photos::PhotoTransformer;
use crate::store::{now_iso, LocalStore, SyncEvent};

/// Bearer credential for the survey backend. Obtaining and refreshing the
/// token is the login layer's problem; the engine only attaches it.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ApiAuth {
  pub base_url: String,
  pub access_token: String,
}

impl ApiAuth {
  pub fn base(&self) -> String {
    self.base_url.trim_end_matches('/').to_string()
  }
}

#[derive(Debug, Clone)]
pub enum SyncError {
  /// The backend rejected the credential; nothing in the batch can proceed.
  Unauthorized,
  Failed(String),
}

impl std::fmt::Display for SyncError {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      SyncError::Unauthorized => write!(f, "authentication rejected"),
      SyncError::Failed(e) => write!(f, "{}", e),
    }
  }
}

#[async_trait]
pub trait SyncBackend: Send + Sync {
  async fn push_project(&self, project: &Project) -> Result<(), SyncError>;
  async fn push_geodata(&self, record: &GeoData) -> Result<(), SyncError>;
  async fn list_projects(&self, scope: Option<&str>) -> Result<Vec<Project>, SyncError>;
  async fn list_geodata(&self, project_id: Option<Uuid>) -> Result<Vec<GeoData>, SyncError>;
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
  #[serde(default)]
  message: String,
}

pub struct HttpBackend {
  client: reqwest::Client,
  auth: ApiAuth,
}

impl HttpBackend {
  pub fn new(auth: ApiAuth) -> HttpBackend {
    HttpBackend {
      client: reqwest::Client::new(),
      auth,
    }
  }

  fn bearer(&self) -> String {
    format!("Bearer {}", self.auth.access_token)
  }

  async fn check(res: reqwest::Response, what: &str) -> Result<reqwest::Response, SyncError> {
    if res.status() == reqwest::StatusCode::UNAUTHORIZED {
      return Err(SyncError::Unauthorized);
    }
    if !res.status().is_success() {
      let status = res.status();
      let message = res
        .json::<ApiMessage>()
        .await
        .map(|m| m.message)
        .unwrap_or_default();
      if message.is_empty() {
        return Err(SyncError::Failed(format!("{} failed: HTTP {}", what, status)));
      }
      return Err(SyncError::Failed(format!("{} failed: HTTP {}: {}", what, status, message)));
    }
    Ok(res)
  }
}

#[async_trait]
impl SyncBackend for HttpBackend {
  async fn push_project(&self, project: &Project) -> Result<(), SyncError> {
    let url = format!("{}/projects", self.auth.base());
    let res = self
      .client
      .post(url)
      .header("authorization", self.bearer())
      .json(project)
      .send()
      .await
      .map_err(|e| SyncError::Failed(e.to_string()))?;
    Self::check(res, "project push").await.map(|_| ())
  }

  async fn push_geodata(&self, record: &GeoData) -> Result<(), SyncError> {
    let url = format!("{}/geodata", self.auth.base());
    let res = self
      .client
      .post(url)
      .header("authorization", self.bearer())
      .json(record)
      .send()
      .await
      .map_err(|e| SyncError::Failed(e.to_string()))?;
    Self::check(res, "record push").await.map(|_| ())
  }

  async fn list_projects(&self, scope: Option<&str>) -> Result<Vec<Project>, SyncError> {
    let mut url = reqwest::Url::parse(&format!("{}/projects", self.auth.base()))
      .map_err(|e| SyncError::Failed(e.to_string()))?;
    if let Some(scope) = scope {
      url.query_pairs_mut().append_pair("scope", scope);
    }
    let res = self
      .client
      .get(url)
      .header("authorization", self.bearer())
      .send()
      .await
      .map_err(|e| SyncError::Failed(e.to_string()))?;
    let res = Self::check(res, "project list").await?;
    res.json::<Vec<Project>>().await.map_err(|e| SyncError::Failed(e.to_string()))
  }

  async fn list_geodata(&self, project_id: Option<Uuid>) -> Result<Vec<GeoData>, SyncError> {
    let mut url = reqwest::Url::parse(&format!("{}/geodata", self.auth.base()))
      .map_err(|e| SyncError::Failed(e.to_string()))?;
    if let Some(id) = project_id {
      url.query_pairs_mut().append_pair("project_id", &id.to_string());
    }
    let res = self
      .client
      .get(url)
      .header("authorization", self.bearer())
      .send()
      .await
      .map_err(|e| SyncError::Failed(e.to_string()))?;
    let res = Self::check(res, "record list").await?;
    res.json::<Vec<GeoData>>().await.map_err(|e| SyncError::Failed(e.to_string()))
  }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct SyncSummary {
  pub total: u32,
  pub success_count: u32,
  pub fail_count: u32,
  pub errors: Vec<String>,
}

impl SyncSummary {
  fn ok(&mut self) {
    self.success_count += 1;
  }

  fn fail(&mut self, err: String) {
    log::warn!("{}", err);
    self.fail_count += 1;
    self.errors.push(err);
  }

  fn fail_all(&mut self, errors: Vec<String>) {
    self.fail_count += 1;
    self.errors.extend(errors);
  }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct SyncReport {
  pub project_push: SyncSummary,
  pub project_pull: SyncSummary,
  pub geodata_push: SyncSummary,
  pub geodata_pull: SyncSummary,
}

/// Reconciles locally collected entities against the backend in both
/// directions. Conflicts resolve by last-modified timestamp: the newer copy
/// wins outright, the older one is dropped.
pub struct SyncEngine {
  backend: Arc<dyn SyncBackend>,
  store: Arc<LocalStore>,
  photos: PhotoTransformer,
}

impl SyncEngine {
  pub fn new(backend: Arc<dyn SyncBackend>, store: Arc<LocalStore>, photos: PhotoTransformer) -> SyncEngine {
    SyncEngine {
      backend,
      store,
      photos,
    }
  }

  /// Upload every locally created or modified project. One project's failure
  /// never aborts the batch; only an authentication rejection does.
  pub async fn push_projects(&self) -> Result<SyncSummary, String> {
    let pending = self.store.unsynced_projects()?;
    let mut summary = SyncSummary {
      total: pending.len() as u32,
      ..Default::default()
    };

    for mut project in pending {
      match self.backend.push_project(&project).await {
        Ok(()) => {
          project.mark_synced(Utc::now());
          match self.store.upsert_project(&project) {
            Ok(()) => summary.ok(),
            Err(e) => summary.fail(format!("project {}: pushed but local flag update failed: {}", project.id, e)),
          }
        }
        Err(SyncError::Unauthorized) => return Err(SyncError::Unauthorized.to_string()),
        Err(SyncError::Failed(e)) => summary.fail(format!("project {}: {}", project.id, e)),
      }
    }

    self.journal("push", "projects", &summary);
    Ok(summary)
  }

  /// Upload every locally created or modified record. Photo uploads run
  /// first so the wire payload carries remote locators; the transformed form
  /// data is persisted locally only after the backend accepts the record.
  pub async fn push_geodata(&self) -> Result<SyncSummary, String> {
    let pending = self.store.unsynced_geodata()?;
    let mut summary = SyncSummary {
      total: pending.len() as u32,
      ..Default::default()
    };

    for record in pending {
      let project = match self.store.get_project(&record.project_id) {
        Ok(p) => p,
        Err(e) => {
          log::warn!("project lookup for record {} failed: {}", record.id, e);
          None
        }
      };

      // transform a copy; the stored record stays untouched unless the push
      // goes through
      let mut outgoing = record.clone();
      let photos = self.photos.push_form_data(&mut outgoing, project.as_ref()).await;
      if !photos.errors.is_empty() {
        // a photo is still local-only, so this record stays unsynced and the
        // whole record is retried next pass
        summary.fail_all(photos.errors);
        continue;
      }

      match self.backend.push_geodata(&outgoing).await {
        Ok(()) => {
          outgoing.mark_synced(Utc::now());
          match self.store.upsert_geodata(&outgoing) {
            Ok(()) => summary.ok(),
            Err(e) => summary.fail(format!("record {}: pushed but local update failed: {}", outgoing.id, e)),
          }
        }
        Err(SyncError::Unauthorized) => return Err(SyncError::Unauthorized.to_string()),
        Err(SyncError::Failed(e)) => summary.fail(format!("record {}: {}", record.id, e)),
      }
    }

    self.journal("push", "records", &summary);
    Ok(summary)
  }

  /// Download remote projects. New ones are inserted; existing ones are
  /// overwritten only when the remote copy is strictly newer.
  pub async fn pull_projects(&self, scope: Option<&str>) -> Result<SyncSummary, String> {
    let remote = self.backend.list_projects(scope).await.map_err(|e| e.to_string())?;
    let mut summary = SyncSummary {
      total: remote.len() as u32,
      ..Default::default()
    };

    for mut incoming in remote {
      let keep = match self.store.get_project(&incoming.id) {
        Ok(Some(local)) => incoming.updated_at > local.updated_at,
        Ok(None) => true,
        Err(e) => {
          summary.fail(format!("project {}: local lookup failed: {}", incoming.id, e));
          continue;
        }
      };
      if !keep {
        // local copy is newer (or tied): the remote copy loses and is dropped
        log::debug!("project {}: local copy is newer, remote discarded", incoming.id);
        summary.ok();
        continue;
      }
      incoming.mark_synced(Utc::now());
      match self.store.upsert_project(&incoming) {
        Ok(()) => summary.ok(),
        Err(e) => summary.fail(format!("project {}: {}", incoming.id, e)),
      }
    }

    self.journal("pull", "projects", &summary);
    Ok(summary)
  }

  /// Download remote records, materializing their photos locally. Run after
  /// `pull_projects` so photo fields resolve against the owning project's
  /// field definitions; a missing project falls back to the name heuristic.
  pub async fn pull_geodata(&self, project_id: Option<Uuid>) -> Result<SyncSummary, String> {
    let remote = self.backend.list_geodata(project_id).await.map_err(|e| e.to_string())?;
    let mut summary = SyncSummary {
      total: remote.len() as u32,
      ..Default::default()
    };

    for mut incoming in remote {
      let keep = match self.store.get_geodata(&incoming.id) {
        Ok(Some(local)) => incoming.updated_at > local.updated_at,
        Ok(None) => true,
        Err(e) => {
          summary.fail(format!("record {}: local lookup failed: {}", incoming.id, e));
          continue;
        }
      };
      if !keep {
        log::debug!("record {}: local copy is newer, remote discarded", incoming.id);
        summary.ok();
        continue;
      }

      let project = match self.store.get_project(&incoming.project_id) {
        Ok(p) => p,
        Err(_) => None,
      };
      let photos = self.photos.pull_form_data(&mut incoming, project.as_ref()).await;
      // a failed photo download keeps its remote ref and is retried next
      // pull; the record itself still lands
      summary.errors.extend(photos.errors);

      incoming.mark_synced(Utc::now());
      match self.store.upsert_geodata(&incoming) {
        Ok(()) => summary.ok(),
        Err(e) => summary.fail(format!("record {}: {}", incoming.id, e)),
      }
    }

    self.journal("pull", "records", &summary);
    Ok(summary)
  }

  /// Full bidirectional pass. Projects move before records in both
  /// directions: record sync resolves photo fields through the owning
  /// project, and the backend expects a record's project to exist.
  pub async fn sync_all(&self, scope: Option<&str>) -> Result<SyncReport, String> {
    let project_push = self.push_projects().await?;
    let project_pull = self.pull_projects(scope).await?;
    let geodata_push = self.push_geodata().await?;
    let geodata_pull = self.pull_geodata(None).await?;
    Ok(SyncReport {
      project_push,
      project_pull,
      geodata_push,
      geodata_pull,
    })
  }

  fn journal(&self, kind: &str, what: &str, summary: &SyncSummary) {
    let _ = self.store.append_event(&SyncEvent {
      ts: now_iso(),
      kind: kind.to_string(),
      path: what.to_string(),
      detail: format!(
        "{}: {} of {} synced, {} failed",
        what, summary.success_count, summary.total, summary.fail_count
      ),
    });
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::model::{FieldKind, FormFieldDef, GeometryKind};
  use crate::photos::{ObjectStore, StoredObject};
  use chrono::{DateTime, Duration};
  use serde_json::json;
  use std::collections::{HashMap, HashSet};
  use std::fs;
  use std::sync::Mutex as StdMutex;
  use tempfile::TempDir;

  #[derive(Default)]
  struct FakeBackend {
    pushed_projects: StdMutex<Vec<Project>>,
    pushed_geodata: StdMutex<Vec<GeoData>>,
    remote_projects: StdMutex<Vec<Project>>,
    remote_geodata: StdMutex<Vec<GeoData>>,
    fail_ids: StdMutex<HashSet<Uuid>>,
    unauthorized: bool,
  }

  #[async_trait]
  impl SyncBackend for FakeBackend {
    async fn push_project(&self, project: &Project) -> Result<(), SyncError> {
      if self.unauthorized {
        return Err(SyncError::Unauthorized);
      }
      if self.fail_ids.lock().unwrap().contains(&project.id) {
        return Err(SyncError::Failed("project push failed: HTTP 500".to_string()));
      }
      self.pushed_projects.lock().unwrap().push(project.clone());
      Ok(())
    }

    async fn push_geodata(&self, record: &GeoData) -> Result<(), SyncError> {
      if self.unauthorized {
        return Err(SyncError::Unauthorized);
      }
      if self.fail_ids.lock().unwrap().contains(&record.id) {
        return Err(SyncError::Failed("record push failed: HTTP 500".to_string()));
      }
      self.pushed_geodata.lock().unwrap().push(record.clone());
      Ok(())
    }

    async fn list_projects(&self, _scope: Option<&str>) -> Result<Vec<Project>, SyncError> {
      if self.unauthorized {
        return Err(SyncError::Unauthorized);
      }
      Ok(self.remote_projects.lock().unwrap().clone())
    }

    async fn list_geodata(&self, _project_id: Option<Uuid>) -> Result<Vec<GeoData>, SyncError> {
      if self.unauthorized {
        return Err(SyncError::Unauthorized);
      }
      Ok(self.remote_geodata.lock().unwrap().clone())
    }
  }

  struct FakeObjects {
    blobs: StdMutex<HashMap<String, Vec<u8>>>,
  }

  #[async_trait]
  impl ObjectStore for FakeObjects {
    async fn upload(&self, key: &str, bytes: Vec<u8>) -> Result<StoredObject, String> {
      let url = format!("https://objects.test/{}", key);
      self.blobs.lock().unwrap().insert(url.clone(), bytes);
      Ok(StoredObject {
        url,
        key: key.to_string(),
      })
    }

    async fn download(&self, locator: &str) -> Result<Vec<u8>, String> {
      self
        .blobs
        .lock()
        .unwrap()
        .get(locator)
        .cloned()
        .ok_or_else(|| format!("no such object: {}", locator))
    }
  }

  fn engine(
    root: &std::path::Path,
    backend: Arc<FakeBackend>,
    objects: Arc<FakeObjects>,
  ) -> (Arc<LocalStore>, SyncEngine) {
    let store = Arc::new(LocalStore::open(root).unwrap());
    let photos = PhotoTransformer::new(objects, store.clone());
    (store.clone(), SyncEngine::new(backend, store, photos))
  }

  fn project_at(name: &str, updated_at: DateTime<Utc>) -> Project {
    Project {
      id: Uuid::new_v4(),
      name: name.to_string(),
      description: String::new(),
      geometry_kind: GeometryKind::Point,
      form_fields: vec![FormFieldDef {
        label: "site photo".to_string(),
        kind: FieldKind::Photo,
        required: false,
        options: vec![],
      }],
      created_at: updated_at,
      updated_at,
      created_by: None,
      is_synced: false,
      synced_at: None,
    }
  }

  fn record_for(project: &Project, updated_at: DateTime<Utc>) -> GeoData {
    GeoData {
      id: Uuid::new_v4(),
      project_id: project.id,
      form_data: serde_json::Map::new(),
      points: vec![],
      created_at: updated_at,
      updated_at,
      collected_by: None,
      is_synced: false,
      synced_at: None,
    }
  }

  fn fakes() -> (Arc<FakeBackend>, Arc<FakeObjects>) {
    (
      Arc::new(FakeBackend::default()),
      Arc::new(FakeObjects {
        blobs: StdMutex::new(HashMap::new()),
      }),
    )
  }

  #[tokio::test]
  async fn test_push_marks_synced_and_is_idempotent() {
    let tmp = TempDir::new().unwrap();
    let (backend, objects) = fakes();
    let (store, engine) = engine(tmp.path(), backend.clone(), objects);

    let p = project_at("A", Utc::now());
    store.upsert_project(&p).unwrap();

    let summary = engine.push_projects().await.unwrap();
    assert_eq!(summary.total, 1);
    assert_eq!(summary.success_count, 1);
    assert!(store.get_project(&p.id).unwrap().unwrap().is_synced);

    // an already-synced entity is not selected again
    let again = engine.push_projects().await.unwrap();
    assert_eq!(again.total, 0);
    assert_eq!(backend.pushed_projects.lock().unwrap().len(), 1);
  }

  #[tokio::test]
  async fn test_partial_batch_failure_reports_counts() {
    let tmp = TempDir::new().unwrap();
    let (backend, objects) = fakes();
    let (store, engine) = engine(tmp.path(), backend.clone(), objects);

    let project = project_at("P", Utc::now());
    store.upsert_project(&project).unwrap();
    let mut ids = Vec::new();
    for i in 0..5i64 {
      let r = record_for(&project, Utc::now() + Duration::seconds(i));
      ids.push(r.id);
      store.upsert_geodata(&r).unwrap();
    }
    backend.fail_ids.lock().unwrap().insert(ids[2]);

    let summary = engine.push_geodata().await.unwrap();
    assert_eq!(summary.total, 5);
    assert_eq!(summary.success_count, 4);
    assert_eq!(summary.fail_count, 1);
    assert_eq!(summary.errors.len(), 1);
    assert!(summary.errors[0].contains(&ids[2].to_string()));

    for (i, id) in ids.iter().enumerate() {
      let synced = store.get_geodata(id).unwrap().unwrap().is_synced;
      assert_eq!(synced, i != 2);
    }
  }

  #[tokio::test]
  async fn test_pull_inserts_new_and_applies_last_writer_wins() {
    let tmp = TempDir::new().unwrap();
    let (backend, objects) = fakes();
    let (store, engine) = engine(tmp.path(), backend.clone(), objects);

    let t1 = Utc::now();
    let t2 = t1 + Duration::minutes(5);

    // locally known project, stale remote copy
    let mut local_newer = project_at("Local name", t2);
    local_newer.is_synced = true;
    store.upsert_project(&local_newer).unwrap();
    let mut remote_stale = local_newer.clone();
    remote_stale.name = "Old remote name".to_string();
    remote_stale.updated_at = t1;

    // locally known project, fresher remote copy
    let mut local_older = project_at("Before edit", t1);
    local_older.is_synced = true;
    store.upsert_project(&local_older).unwrap();
    let mut remote_newer = local_older.clone();
    remote_newer.name = "After edit".to_string();
    remote_newer.updated_at = t2;

    // brand new on the remote
    let fresh = project_at("New remote", t1);

    *backend.remote_projects.lock().unwrap() = vec![remote_stale, remote_newer, fresh.clone()];

    let summary = engine.pull_projects(None).await.unwrap();
    assert_eq!(summary.total, 3);
    assert_eq!(summary.success_count, 3);
    assert_eq!(summary.fail_count, 0);

    // older remote discarded
    assert_eq!(store.get_project(&local_newer.id).unwrap().unwrap().name, "Local name");
    // newer remote overwrites
    assert_eq!(store.get_project(&local_older.id).unwrap().unwrap().name, "After edit");
    // new remote inserted as already-synced
    let inserted = store.get_project(&fresh.id).unwrap().unwrap();
    assert_eq!(inserted.name, "New remote");
    assert!(inserted.is_synced);
  }

  #[tokio::test]
  async fn test_pull_equal_timestamps_keep_local() {
    let tmp = TempDir::new().unwrap();
    let (backend, objects) = fakes();
    let (store, engine) = engine(tmp.path(), backend.clone(), objects);

    let t = Utc::now();
    let mut local = project_at("Local", t);
    local.is_synced = true;
    store.upsert_project(&local).unwrap();
    let mut remote = local.clone();
    remote.name = "Remote".to_string();
    *backend.remote_projects.lock().unwrap() = vec![remote];

    engine.pull_projects(None).await.unwrap();
    assert_eq!(store.get_project(&local.id).unwrap().unwrap().name, "Local");
  }

  #[tokio::test]
  async fn test_unauthorized_aborts_whole_operation() {
    let tmp = TempDir::new().unwrap();
    let mut backend = FakeBackend::default();
    backend.unauthorized = true;
    let objects = fakes().1;
    let (store, engine) = engine(tmp.path(), Arc::new(backend), objects);

    store.upsert_project(&project_at("A", Utc::now())).unwrap();
    store.upsert_project(&project_at("B", Utc::now())).unwrap();

    let err = engine.push_projects().await.unwrap_err();
    assert!(err.contains("authentication rejected"));
    assert_eq!(store.unsynced_projects().unwrap().len(), 2);
  }

  #[tokio::test]
  async fn test_photo_round_trip_reproduces_bytes() {
    let device_a = TempDir::new().unwrap();
    let device_b = TempDir::new().unwrap();
    let (backend, objects) = fakes();

    // device A: collect a record with a local photo and push it
    let (store_a, engine_a) = engine(device_a.path(), backend.clone(), objects.clone());
    let mut project = project_at("Trees", Utc::now());
    project.is_synced = true;
    store_a.upsert_project(&project).unwrap();

    let photo = device_a.path().join("bark.jpg");
    fs::write(&photo, b"original jpeg bytes").unwrap();
    let mut record = record_for(&project, Utc::now());
    record
      .form_data
      .insert("site photo".to_string(), json!(photo.to_string_lossy()));
    store_a.upsert_geodata(&record).unwrap();

    engine_a.push_geodata().await.unwrap();

    // the wire payload carried the remote locator, not just the local path
    let pushed = backend.pushed_geodata.lock().unwrap().clone();
    assert_eq!(pushed.len(), 1);
    let wire_refs = crate::photos::normalize_photo_value(&pushed[0].form_data["site photo"]);
    assert!(wire_refs[0].is_uploaded());

    // the transformed form data was persisted locally too
    let stored = store_a.get_geodata(&record.id).unwrap().unwrap();
    let refs = crate::photos::normalize_photo_value(&stored.form_data["site photo"]);
    assert!(refs[0].is_uploaded());

    // drop device A's copy so the pull below has to download the bytes
    fs::remove_file(&photo).unwrap();

    // device B: fresh store, pull the same record
    *backend.remote_projects.lock().unwrap() = vec![project.clone()];
    *backend.remote_geodata.lock().unwrap() = vec![stored.clone()];
    let (store_b, engine_b) = engine(device_b.path(), backend, objects);
    engine_b.pull_projects(None).await.unwrap();
    let summary = engine_b.pull_geodata(None).await.unwrap();
    assert_eq!(summary.success_count, 1);
    assert!(summary.errors.is_empty());

    let pulled = store_b.get_geodata(&record.id).unwrap().unwrap();
    assert!(pulled.is_synced);
    let refs = crate::photos::normalize_photo_value(&pulled.form_data["site photo"]);
    let local = refs[0].local_path.clone().unwrap();
    assert!(local.starts_with(&*device_b.path().to_string_lossy()));
    assert_eq!(fs::read(local).unwrap(), b"original jpeg bytes");
  }

  #[tokio::test]
  async fn test_sync_all_journals_batches() {
    let tmp = TempDir::new().unwrap();
    let (backend, objects) = fakes();
    let (store, engine) = engine(tmp.path(), backend, objects);
    store.upsert_project(&project_at("A", Utc::now())).unwrap();

    let report = engine.sync_all(Some("mine")).await.unwrap();
    assert_eq!(report.project_push.success_count, 1);

    let events = store.read_events(10).unwrap();
    assert_eq!(events.len(), 4);
    assert!(events.iter().any(|e| e.kind == "push" && e.path == "projects"));
    assert!(events.iter().any(|e| e.kind == "pull" && e.path == "records"));
  }
}
