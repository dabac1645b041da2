use std::fs;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::model::{FieldKind, GeoData, PhotoRef, Project};
use crate::store::{slug, LocalStore};
use crate::sync::ApiAuth;

fn sha256_hex(bytes: &[u8]) -> String {
  let mut hasher = Sha256::new();
  hasher.update(bytes);
  let out = hasher.finalize();
  format!("{:x}", out)
}

/// Field names that count as photo fields when the owning project's field
/// definitions are not available locally yet.
const PHOTO_FIELD_HINTS: [&str; 4] = ["photo", "image", "picture", "img"];

pub fn is_photo_field(project: Option<&Project>, label: &str) -> bool {
  if let Some(project) = project {
    if let Some(def) = project.form_fields.iter().find(|f| f.label == label) {
      return def.kind == FieldKind::Photo;
    }
  }
  let lower = label.to_lowercase();
  PHOTO_FIELD_HINTS.iter().any(|hint| lower.contains(hint))
}

/// Photo values arrive in legacy shapes: a bare string path or URL, a single
/// object, or a list of either. Normalize once on read; everything after
/// this sees only the structured list form.
pub fn normalize_photo_value(value: &Value) -> Vec<PhotoRef> {
  match value {
    Value::Array(items) => items.iter().filter_map(normalize_one).collect(),
    other => normalize_one(other).into_iter().collect(),
  }
}

fn normalize_one(value: &Value) -> Option<PhotoRef> {
  match value {
    Value::String(s) => {
      let s = s.trim();
      if s.is_empty() {
        return None;
      }
      if s.starts_with("http://") || s.starts_with("https://") {
        Some(PhotoRef::remote(s))
      } else {
        Some(PhotoRef::local(s))
      }
    }
    Value::Object(_) => serde_json::from_value(value.clone()).ok(),
    _ => None,
  }
}

pub fn photo_refs_to_value(refs: &[PhotoRef]) -> Value {
  Value::Array(
    refs
      .iter()
      .map(|r| serde_json::to_value(r).unwrap_or(Value::Null))
      .collect(),
  )
}

fn extension_of(path_or_url: &str) -> String {
  let trimmed = match path_or_url.split(|c| c == '?' || c == '#').next() {
    Some(t) => t,
    None => path_or_url,
  };
  match trimmed.rsplit_once('.') {
    Some((_, ext))
      if !ext.is_empty() && ext.len() <= 4 && ext.chars().all(|c| c.is_ascii_alphanumeric()) =>
    {
      ext.to_ascii_lowercase()
    }
    _ => "jpg".to_string(),
  }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StoredObject {
  pub url: String,
  pub key: String,
}

/// Remote object storage for photo bytes. An opaque collaborator: upload
/// yields a locator pair, download takes either the url or the bare key.
#[async_trait]
pub trait ObjectStore: Send + Sync {
  async fn upload(&self, key: &str, bytes: Vec<u8>) -> Result<StoredObject, String>;
  async fn download(&self, locator: &str) -> Result<Vec<u8>, String>;
}

pub struct HttpObjectStore {
  client: reqwest::Client,
  auth: ApiAuth,
}

impl HttpObjectStore {
  pub fn new(auth: ApiAuth) -> HttpObjectStore {
    HttpObjectStore {
      client: reqwest::Client::new(),
      auth,
    }
  }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
  async fn upload(&self, key: &str, bytes: Vec<u8>) -> Result<StoredObject, String> {
    let url = format!("{}/storage/{}", self.auth.base(), key);
    let res = self
      .client
      .post(url)
      .header("authorization", format!("Bearer {}", self.auth.access_token))
      .header("content-type", "application/octet-stream")
      .body(bytes)
      .send()
      .await
      .map_err(|e| e.to_string())?;
    if !res.status().is_success() {
      return Err(format!("photo upload failed: HTTP {}", res.status()));
    }
    res.json::<StoredObject>().await.map_err(|e| e.to_string())
  }

  async fn download(&self, locator: &str) -> Result<Vec<u8>, String> {
    let url = if locator.starts_with("http://") || locator.starts_with("https://") {
      locator.to_string()
    } else {
      format!("{}/storage/{}", self.auth.base(), locator)
    };
    let res = self
      .client
      .get(url)
      .header("authorization", format!("Bearer {}", self.auth.access_token))
      .send()
      .await
      .map_err(|e| e.to_string())?;
    if !res.status().is_success() {
      return Err(format!("photo download failed: HTTP {}", res.status()));
    }
    res.bytes().await.map(|b| b.to_vec()).map_err(|e| e.to_string())
  }
}

/// Result of transforming one record's photo fields. One error string per
/// failed photo; a failed photo keeps its pre-transform ref, so the presence
/// check picks it up again on the next pass.
#[derive(Debug, Clone, Default)]
pub struct PhotoOutcome {
  pub uploaded: u32,
  pub downloaded: u32,
  pub errors: Vec<String>,
}

/// Rewrites photo references inside a record's form data between local
/// filesystem paths and remote object-storage locators.
pub struct PhotoTransformer {
  objects: Arc<dyn ObjectStore>,
  store: Arc<LocalStore>,
}

impl PhotoTransformer {
  pub fn new(objects: Arc<dyn ObjectStore>, store: Arc<LocalStore>) -> PhotoTransformer {
    PhotoTransformer { objects, store }
  }

  /// Push mode: upload every photo that exists only locally and record its
  /// remote locator, keeping `local_path` so the device retains its copy.
  /// Refs that already carry a remote url are left untouched.
  pub async fn push_form_data(&self, record: &mut GeoData, project: Option<&Project>) -> PhotoOutcome {
    let mut outcome = PhotoOutcome::default();
    let labels: Vec<String> = record.form_data.keys().cloned().collect();

    for label in labels {
      if !is_photo_field(project, &label) {
        continue;
      }
      let value = match record.form_data.get(&label) {
        Some(v) => v.clone(),
        None => continue,
      };
      let mut refs = normalize_photo_value(&value);

      for (index, photo) in refs.iter_mut().enumerate() {
        if photo.is_uploaded() {
          continue;
        }
        let path = match &photo.local_path {
          Some(p) => p.clone(),
          None => continue,
        };
        if !Path::new(&path).exists() {
          outcome.fail(format!("photo {}/{}[{}]: local file {} is missing", record.id, label, index, path));
          continue;
        }
        let bytes = match fs::read(&path) {
          Ok(b) => b,
          Err(e) => {
            outcome.fail(format!("photo {}/{}[{}]: {}", record.id, label, index, e));
            continue;
          }
        };
        let digest = sha256_hex(&bytes);
        let key = format!("{}/{}/{}.{}", record.id, slug(&label), &digest[..16], extension_of(&path));
        match self.objects.upload(&key, bytes).await {
          Ok(obj) => {
            photo.remote_url = Some(obj.url);
            photo.remote_key = Some(obj.key);
            outcome.uploaded += 1;
          }
          // the ref stays local-only; the next push retries it
          Err(e) => outcome.fail(format!("photo {}/{}[{}]: {}", record.id, label, index, e)),
        }
      }

      record.form_data.insert(label, photo_refs_to_value(&refs));
    }
    outcome
  }

  /// Pull mode: download every remotely-referenced photo that has no local
  /// file yet, persisting it under the record's deterministic photo path.
  pub async fn pull_form_data(&self, record: &mut GeoData, project: Option<&Project>) -> PhotoOutcome {
    let mut outcome = PhotoOutcome::default();
    let labels: Vec<String> = record.form_data.keys().cloned().collect();

    for label in labels {
      if !is_photo_field(project, &label) {
        continue;
      }
      let value = match record.form_data.get(&label) {
        Some(v) => v.clone(),
        None => continue,
      };
      let mut refs = normalize_photo_value(&value);

      for (index, photo) in refs.iter_mut().enumerate() {
        let locator = match (&photo.remote_url, &photo.remote_key) {
          (Some(url), _) => url.clone(),
          (None, Some(key)) => key.clone(),
          (None, None) => continue,
        };
        if let Some(p) = &photo.local_path {
          if Path::new(p).exists() {
            continue;
          }
        }
        let dest = self.store.photo_path(&record.id, &label, index, &extension_of(&locator));
        if dest.exists() {
          // an earlier pull already materialized this photo
          photo.local_path = Some(dest.to_string_lossy().to_string());
          continue;
        }
        let bytes = match self.objects.download(&locator).await {
          Ok(b) => b,
          Err(e) => {
            outcome.fail(format!("photo {}/{}[{}]: {}", record.id, label, index, e));
            continue;
          }
        };
        if let Some(parent) = dest.parent() {
          if let Err(e) = fs::create_dir_all(parent) {
            outcome.fail(format!("photo {}/{}[{}]: {}", record.id, label, index, e));
            continue;
          }
        }
        match fs::write(&dest, &bytes) {
          Ok(()) => {
            photo.local_path = Some(dest.to_string_lossy().to_string());
            outcome.downloaded += 1;
          }
          Err(e) => outcome.fail(format!("photo {}/{}[{}]: {}", record.id, label, index, e)),
        }
      }

      record.form_data.insert(label, photo_refs_to_value(&refs));
    }
    outcome
  }
}

impl PhotoOutcome {
  fn fail(&mut self, err: String) {
    log::warn!("{}", err);
    self.errors.push(err);
  }
}
