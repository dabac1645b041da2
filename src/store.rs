use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::model::{GeoData, Project};

pub fn now_iso() -> String {
  Utc::now().to_rfc3339()
}

/// Reduce a form-field label to something safe as a directory name.
pub fn slug(label: &str) -> String {
  let mut out = String::with_capacity(label.len());
  for c in label.chars() {
    if c.is_ascii_alphanumeric() {
      out.push(c.to_ascii_lowercase());
    } else if !out.ends_with('-') {
      out.push('-');
    }
  }
  let trimmed = out.trim_matches('-');
  if trimmed.is_empty() {
    "field".to_string()
  } else {
    trimmed.to_string()
  }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SyncEvent {
  pub ts: String,
  pub kind: String,
  pub path: String,
  pub detail: String,
}

/// On-device survey data: one JSON document per entity, photos in a
/// per-record directory tree, and an append-only event journal.
///
/// The sync engine owns this store for the duration of a sync pass; the UI
/// must not mutate entities mid-sync (caller convention, not a lock).
pub struct LocalStore {
  root: PathBuf,
}

impl LocalStore {
  pub fn open(root: impl AsRef<Path>) -> Result<LocalStore, String> {
    let root = root.as_ref().to_path_buf();
    for sub in ["projects", "records", "photos"] {
      fs::create_dir_all(root.join(sub)).map_err(|e| e.to_string())?;
    }
    Ok(LocalStore { root })
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  fn projects_dir(&self) -> PathBuf {
    self.root.join("projects")
  }

  fn records_dir(&self) -> PathBuf {
    self.root.join("records")
  }

  fn photos_dir(&self) -> PathBuf {
    self.root.join("photos")
  }

  fn events_path(&self) -> PathBuf {
    self.root.join("events.jsonl")
  }

  fn project_path(&self, id: &Uuid) -> PathBuf {
    self.projects_dir().join(format!("{}.json", id))
  }

  fn record_path(&self, id: &Uuid) -> PathBuf {
    self.records_dir().join(format!("{}.json", id))
  }

  /// Where a pulled photo lands. Deterministic, so repeated pulls of the
  /// same record find the file already present and skip the download.
  pub fn photo_path(&self, record_id: &Uuid, field_label: &str, index: usize, ext: &str) -> PathBuf {
    self
      .photos_dir()
      .join(record_id.to_string())
      .join(slug(field_label))
      .join(format!("{}.{}", index, ext))
  }

  fn list_docs<T: DeserializeOwned>(&self, dir: PathBuf) -> Vec<T> {
    let mut out = Vec::new();
    for entry in WalkDir::new(&dir)
      .min_depth(1)
      .max_depth(1)
      .into_iter()
      .filter_map(Result::ok)
    {
      let p = entry.path();
      if p.extension().and_then(|e| e.to_str()) != Some("json") {
        continue;
      }
      let text = match fs::read_to_string(p) {
        Ok(t) => t,
        Err(e) => {
          log::warn!("skipping unreadable document {}: {}", p.display(), e);
          continue;
        }
      };
      match serde_json::from_str::<T>(&text) {
        Ok(doc) => out.push(doc),
        // a corrupt document never takes the whole listing down
        Err(e) => log::warn!("skipping malformed document {}: {}", p.display(), e),
      }
    }
    out
  }

  fn read_doc<T: DeserializeOwned>(&self, path: &Path) -> Result<Option<T>, String> {
    if !path.exists() {
      return Ok(None);
    }
    let text = fs::read_to_string(path).map_err(|e| e.to_string())?;
    let doc = serde_json::from_str(&text).map_err(|e| e.to_string())?;
    Ok(Some(doc))
  }

  fn write_doc<T: Serialize>(&self, path: &Path, doc: &T) -> Result<(), String> {
    let text = serde_json::to_string_pretty(doc).map_err(|e| e.to_string())?;
    fs::write(path, text).map_err(|e| e.to_string())
  }

  pub fn list_projects(&self) -> Result<Vec<Project>, String> {
    let mut projects: Vec<Project> = self.list_docs(self.projects_dir());
    projects.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
    Ok(projects)
  }

  pub fn list_geodata(&self) -> Result<Vec<GeoData>, String> {
    let mut records: Vec<GeoData> = self.list_docs(self.records_dir());
    records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
    Ok(records)
  }

  pub fn unsynced_projects(&self) -> Result<Vec<Project>, String> {
    Ok(self.list_projects()?.into_iter().filter(|p| !p.is_synced).collect())
  }

  pub fn unsynced_geodata(&self) -> Result<Vec<GeoData>, String> {
    Ok(self.list_geodata()?.into_iter().filter(|g| !g.is_synced).collect())
  }

  pub fn get_project(&self, id: &Uuid) -> Result<Option<Project>, String> {
    self.read_doc(&self.project_path(id))
  }

  pub fn get_geodata(&self, id: &Uuid) -> Result<Option<GeoData>, String> {
    self.read_doc(&self.record_path(id))
  }

  pub fn upsert_project(&self, project: &Project) -> Result<(), String> {
    self.write_doc(&self.project_path(&project.id), project)
  }

  pub fn upsert_geodata(&self, record: &GeoData) -> Result<(), String> {
    self.write_doc(&self.record_path(&record.id), record)
  }

  pub fn append_event(&self, ev: &SyncEvent) -> Result<(), String> {
    let mut f = OpenOptions::new()
      .create(true)
      .append(true)
      .open(self.events_path())
      .map_err(|e| e.to_string())?;
    let line = serde_json::to_string(ev).map_err(|e| e.to_string())?;
    writeln!(f, "{}", line).map_err(|e| e.to_string())
  }

  pub fn read_events(&self, limit: usize) -> Result<Vec<SyncEvent>, String> {
    let p = self.events_path();
    if !p.exists() {
      return Ok(vec![]);
    }
    let text = fs::read_to_string(&p).map_err(|e| e.to_string())?;
    let mut out: Vec<SyncEvent> = Vec::new();
    for line in text.lines().rev().take(limit) {
      if let Ok(ev) = serde_json::from_str::<SyncEvent>(line) {
        out.push(ev);
      }
    }
    out.reverse();
    Ok(out)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::model::GeometryKind;
  use chrono::{Duration, Utc};
  use tempfile::TempDir;

  fn project(name: &str, synced: bool, age_minutes: i64) -> Project {
    let t = Utc::now() - Duration::minutes(age_minutes);
    Project {
      id: Uuid::new_v4(),
      name: name.to_string(),
      description: String::new(),
      geometry_kind: GeometryKind::Point,
      form_fields: vec![],
      created_at: t,
      updated_at: t,
      created_by: None,
      is_synced: synced,
      synced_at: None,
    }
  }

  #[test]
  fn test_upsert_then_get_roundtrips() {
    let tmp = TempDir::new().unwrap();
    let store = LocalStore::open(tmp.path()).unwrap();
    let p = project("Hedgerows", false, 0);
    store.upsert_project(&p).unwrap();

    let back = store.get_project(&p.id).unwrap().unwrap();
    assert_eq!(back.name, "Hedgerows");
    assert!(store.get_project(&Uuid::new_v4()).unwrap().is_none());
  }

  #[test]
  fn test_unsynced_filter_and_ordering() {
    let tmp = TempDir::new().unwrap();
    let store = LocalStore::open(tmp.path()).unwrap();
    let older = project("Older", false, 60);
    let newer = project("Newer", false, 1);
    let synced = project("Done", true, 30);
    store.upsert_project(&newer).unwrap();
    store.upsert_project(&older).unwrap();
    store.upsert_project(&synced).unwrap();

    let unsynced = store.unsynced_projects().unwrap();
    let names: Vec<&str> = unsynced.iter().map(|p| p.name.as_str()).collect();
    assert_eq!(names, vec!["Older", "Newer"]);
  }

  #[test]
  fn test_malformed_document_is_skipped() {
    let tmp = TempDir::new().unwrap();
    let store = LocalStore::open(tmp.path()).unwrap();
    let p = project("Good", false, 0);
    store.upsert_project(&p).unwrap();
    fs::write(tmp.path().join("projects").join("broken.json"), "{not json").unwrap();

    let all = store.list_projects().unwrap();
    assert_eq!(all.len(), 1);
  }

  #[test]
  fn test_photo_path_is_deterministic_and_slugged() {
    let tmp = TempDir::new().unwrap();
    let store = LocalStore::open(tmp.path()).unwrap();
    let id = Uuid::new_v4();
    let a = store.photo_path(&id, "Site Photo #1", 0, "jpg");
    let b = store.photo_path(&id, "Site Photo #1", 0, "jpg");
    assert_eq!(a, b);
    assert!(a.to_string_lossy().contains("site-photo-1"));
  }

  #[test]
  fn test_event_journal_roundtrip_keeps_tail() {
    let tmp = TempDir::new().unwrap();
    let store = LocalStore::open(tmp.path()).unwrap();
    for i in 0..5 {
      store
        .append_event(&SyncEvent {
          ts: now_iso(),
          kind: "push".to_string(),
          path: "projects".to_string(),
          detail: format!("batch {}", i),
        })
        .unwrap();
    }
    let tail = store.read_events(2).unwrap();
    assert_eq!(tail.len(), 2);
    assert_eq!(tail[0].detail, "batch 3");
    assert_eq!(tail[1].detail, "batch 4");
  }

  #[test]
  fn test_slug() {
    assert_eq!(slug("Site Photo #1"), "site-photo-1");
    assert_eq!(slug("---"), "field");
    assert_eq!(slug("counts"), "counts");
  }
}
