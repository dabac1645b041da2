use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BasemapKind {
  Builtin,
  Tms,
  PdfTileset,
  PdfOverlay,
}

impl BasemapKind {
  /// Generated tilesets exist only in the tile cache; the cached copy is the
  /// authoritative one.
  pub fn is_generated(&self) -> bool {
    matches!(self, BasemapKind::PdfTileset | BasemapKind::PdfOverlay)
  }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
pub struct GeoBounds {
  pub min_lat: f64,
  pub min_lon: f64,
  pub max_lat: f64,
  pub max_lon: f64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Basemap {
  pub id: String,
  pub name: String,
  pub kind: BasemapKind,
  /// Tile URL template with `{z}/{x}/{y}` placeholders. Empty for generated
  /// tilesets, which are served from the cache alone.
  #[serde(default)]
  pub url_template: String,
  pub min_zoom: u8,
  pub max_zoom: u8,
  #[serde(default)]
  pub georef_bounds: Option<GeoBounds>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GeometryKind {
  Point,
  Line,
  Polygon,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
  Text,
  Number,
  Date,
  Choice,
  Photo,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct FormFieldDef {
  pub label: String,
  pub kind: FieldKind,
  #[serde(default)]
  pub required: bool,
  #[serde(default)]
  pub options: Vec<String>,
}

/// Capability shared by everything the sync engine moves: a stable id, a
/// last-modified timestamp for conflict resolution, and the local sync flags.
pub trait Syncable {
  fn id(&self) -> Uuid;
  fn updated_at(&self) -> DateTime<Utc>;
  fn is_synced(&self) -> bool;
  fn mark_synced(&mut self, at: DateTime<Utc>);
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Project {
  pub id: Uuid,
  pub name: String,
  #[serde(default)]
  pub description: String,
  pub geometry_kind: GeometryKind,
  #[serde(default)]
  pub form_fields: Vec<FormFieldDef>,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
  #[serde(default)]
  pub created_by: Option<String>,
  /// Local-only sync state; remote rows arrive without it.
  #[serde(default)]
  pub is_synced: bool,
  #[serde(default)]
  pub synced_at: Option<DateTime<Utc>>,
}

impl Syncable for Project {
  fn id(&self) -> Uuid {
    self.id
  }
  fn updated_at(&self) -> DateTime<Utc> {
    self.updated_at
  }
  fn is_synced(&self) -> bool {
    self.is_synced
  }
  fn mark_synced(&mut self, at: DateTime<Utc>) {
    self.is_synced = true;
    self.synced_at = Some(at);
  }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct TrackPoint {
  pub lat: f64,
  pub lon: f64,
  #[serde(default)]
  pub altitude: Option<f64>,
  #[serde(default)]
  pub accuracy: Option<f64>,
  pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GeoData {
  pub id: Uuid,
  /// Owning project. Projects are synced before their records, so by sync
  /// time this id resolves locally in the common case.
  pub project_id: Uuid,
  /// Field label -> collected value, in form order.
  #[serde(default)]
  pub form_data: serde_json::Map<String, serde_json::Value>,
  #[serde(default)]
  pub points: Vec<TrackPoint>,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
  #[serde(default)]
  pub collected_by: Option<String>,
  #[serde(default)]
  pub is_synced: bool,
  #[serde(default)]
  pub synced_at: Option<DateTime<Utc>>,
}

impl Syncable for GeoData {
  fn id(&self) -> Uuid {
    self.id
  }
  fn updated_at(&self) -> DateTime<Utc> {
    self.updated_at
  }
  fn is_synced(&self) -> bool {
    self.is_synced
  }
  fn mark_synced(&mut self, at: DateTime<Utc>) {
    self.is_synced = true;
    self.synced_at = Some(at);
  }
}

/// One photo attachment. `local_path` and `remote_url` may both be set after
/// a successful round trip; which one is authoritative depends on the sync
/// direction in progress.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct PhotoRef {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub local_path: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub remote_url: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub remote_key: Option<String>,
}

impl PhotoRef {
  pub fn local(path: impl Into<String>) -> PhotoRef {
    PhotoRef {
      local_path: Some(path.into()),
      ..Default::default()
    }
  }

  pub fn remote(url: impl Into<String>) -> PhotoRef {
    PhotoRef {
      remote_url: Some(url.into()),
      ..Default::default()
    }
  }

  pub fn is_uploaded(&self) -> bool {
    self.remote_url.is_some()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_generated_kinds() {
    assert!(BasemapKind::PdfTileset.is_generated());
    assert!(BasemapKind::PdfOverlay.is_generated());
    assert!(!BasemapKind::Tms.is_generated());
    assert!(!BasemapKind::Builtin.is_generated());
  }

  #[test]
  fn test_remote_project_row_defaults_to_unsynced() {
    // A remote row carries no local sync flags.
    let json = r#"{
      "id": "0e2f1cdd-6b5c-4f7e-9f57-2f8d53a3d2aa",
      "name": "Wetland survey",
      "geometry_kind": "polygon",
      "created_at": "2026-03-01T10:00:00Z",
      "updated_at": "2026-03-02T10:00:00Z"
    }"#;
    let p: Project = serde_json::from_str(json).unwrap();
    assert!(!p.is_synced);
    assert!(p.synced_at.is_none());
    assert!(p.form_fields.is_empty());
  }

  #[test]
  fn test_mark_synced_flips_flags() {
    let json = r#"{
      "id": "0e2f1cdd-6b5c-4f7e-9f57-2f8d53a3d2aa",
      "name": "Wetland survey",
      "geometry_kind": "point",
      "created_at": "2026-03-01T10:00:00Z",
      "updated_at": "2026-03-02T10:00:00Z"
    }"#;
    let mut p: Project = serde_json::from_str(json).unwrap();
    let now = Utc::now();
    p.mark_synced(now);
    assert!(p.is_synced);
    assert_eq!(p.synced_at, Some(now));
  }

  #[test]
  fn test_photo_ref_skips_absent_fields() {
    let r = PhotoRef::local("/data/photos/a.jpg");
    let json = serde_json::to_string(&r).unwrap();
    assert!(!json.contains("remote_url"));
    let back: PhotoRef = serde_json::from_str(&json).unwrap();
    assert_eq!(back, r);
    assert!(!back.is_uploaded());
  }

  #[test]
  fn test_form_data_preserves_field_order() {
    let json = r#"{"species": "alder", "count": 4, "site photo": []}"#;
    let m: serde_json::Map<String, serde_json::Value> = serde_json::from_str(json).unwrap();
    let labels: Vec<&str> = m.keys().map(|k| k.as_str()).collect();
    assert_eq!(labels, vec!["species", "count", "site photo"]);
  }
}
