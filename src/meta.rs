//! Registry of imported, read-only database copies.

use std::fs;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, StoreError};
use crate::model::{value_text, ID_MAX};
use crate::util::{clamp_string, now_string, write_text_file};

pub const META_FILE: &str = "meta.json";
pub const IMPORTED_DIR: &str = "dbs";
pub const CURRENT_SOURCE: &str = "current";

const NAME_MAX: usize = 200;
const FILENAME_MAX: usize = 256;
const DEFAULT_IMPORT_NAME: &str = "Imported Database";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DatabaseEntry {
    pub id: String,
    pub filename: String,
    pub name: String,
    pub imported_at: String,
}

impl DatabaseEntry {
    fn from_value(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        let text = |key: &str| obj.get(key).map(value_text).unwrap_or_default();
        let id = clamp_string(&text("id"), ID_MAX, true);
        if id.is_empty() {
            return None;
        }
        Some(Self {
            id,
            filename: text("filename"),
            name: text("name"),
            imported_at: text("imported_at"),
        })
    }

    pub fn display_name(&self) -> String {
        [self.name.as_str(), self.filename.as_str()]
            .into_iter()
            .map(|raw| clamp_string(raw, NAME_MAX, true))
            .find(|name| !name.is_empty())
            .unwrap_or_else(|| DEFAULT_IMPORT_NAME.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Metadata {
    pub databases: Vec<DatabaseEntry>,
    pub active_db: String,
}

impl Default for Metadata {
    fn default() -> Self {
        Self {
            databases: Vec::new(),
            active_db: CURRENT_SOURCE.to_string(),
        }
    }
}

/// One entry of the database picker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Source {
    pub id: String,
    pub name: String,
    pub readonly: bool,
}

impl Metadata {
    /// Coerces any JSON into a metadata record, dropping entries it cannot use.
    pub fn from_value(value: &Value) -> Self {
        let databases = value
            .get("databases")
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(DatabaseEntry::from_value).collect())
            .unwrap_or_default();
        let active_db = value
            .get("active_db")
            .and_then(Value::as_str)
            .unwrap_or(CURRENT_SOURCE)
            .to_string();
        Self {
            databases,
            active_db,
        }
    }

    pub fn read(dir: &Path) -> Result<Self> {
        let path = dir.join(META_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path)?;
        let value = serde_json::from_str::<Value>(&raw).unwrap_or_else(|_| {
            tracing::warn!("metadata file is not valid json, starting fresh");
            Value::Null
        });
        Ok(Self::from_value(&value))
    }

    pub fn write(&self, dir: &Path, atomic: bool) -> Result<()> {
        let content = serde_json::to_string(self)?;
        write_text_file(&dir.join(META_FILE), &content, atomic)?;
        Ok(())
    }

    pub fn entry(&self, id: &str) -> Option<&DatabaseEntry> {
        self.databases.iter().find(|entry| entry.id == id)
    }

    /// The live database first, then every imported copy.
    pub fn sources(&self) -> Vec<Source> {
        let mut out = vec![Source {
            id: CURRENT_SOURCE.to_string(),
            name: "Current Database".to_string(),
            readonly: false,
        }];
        out.extend(self.databases.iter().map(|entry| Source {
            id: entry.id.clone(),
            name: entry.display_name(),
            readonly: true,
        }));
        out
    }

    /// The stored active id if it still names a source, else `current`.
    pub fn active_source(&self) -> String {
        let requested = clamp_string(&self.active_db, ID_MAX, true);
        if requested == CURRENT_SOURCE || self.entry(&requested).is_some() {
            requested
        } else {
            CURRENT_SOURCE.to_string()
        }
    }

    /// Records `id` as active, falling back to `current` for unknown ids.
    pub fn set_active(&mut self, id: &str) -> String {
        let requested = clamp_string(id, ID_MAX, true);
        self.active_db = if self.entry(&requested).is_some() {
            requested
        } else {
            CURRENT_SOURCE.to_string()
        };
        self.active_db.clone()
    }

    /// Registers a new imported copy and returns its entry.
    pub fn register(&mut self, file_name: &str) -> DatabaseEntry {
        let id = crate::util::new_id();
        let name = clamp_string(file_name, NAME_MAX, true);
        let entry = DatabaseEntry {
            filename: db_filename(&id),
            id,
            name: if name.is_empty() {
                DEFAULT_IMPORT_NAME.to_string()
            } else {
                name
            },
            imported_at: now_string(),
        };
        self.databases.push(entry.clone());
        entry
    }
}

/// `<id>.enc` with anything outside `[A-Za-z0-9_-]` replaced by `_`.
pub fn db_filename(id: &str) -> String {
    let normalized: String = clamp_string(id, ID_MAX, true)
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect();
    let normalized = normalized.trim_matches('_');
    if normalized.is_empty() {
        format!("imported-{}.enc", now_string())
    } else {
        format!("{normalized}.enc")
    }
}

/// Path of an imported copy under `dbs/`. Refuses anything that would step
/// outside that directory.
pub fn imported_path(dir: &Path, filename: &str) -> Result<PathBuf> {
    let safe = clamp_string(filename, FILENAME_MAX, true);
    let mut components = Path::new(&safe).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(name)), None) => Ok(dir.join(IMPORTED_DIR).join(name)),
        _ => Err(StoreError::InvalidInput(
            "Invalid database filename.".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn repairs_any_shape() {
        assert_eq!(Metadata::from_value(&json!(null)), Metadata::default());
        let meta = Metadata::from_value(&json!({
            "databases": [
                { "id": "a", "filename": "a.enc", "name": "", "imported_at": 17 },
                { "id": "" },
                "junk",
            ],
            "active_db": 4,
        }));
        assert_eq!(meta.databases.len(), 1);
        assert_eq!(meta.databases[0].imported_at, "17");
        assert_eq!(meta.active_db, CURRENT_SOURCE);
    }

    #[test]
    fn sources_list_current_then_imports() {
        let mut meta = Metadata::default();
        let entry = meta.register("  backup.json ");
        let sources = meta.sources();
        assert_eq!(sources.len(), 2);
        assert_eq!(sources[0].id, CURRENT_SOURCE);
        assert!(!sources[0].readonly);
        assert_eq!(sources[1].name, "backup.json");
        assert!(sources[1].readonly);
        assert_eq!(entry.filename, format!("{}.enc", entry.id));
    }

    #[test]
    fn active_source_falls_back_to_current() {
        let mut meta = Metadata::default();
        let entry = meta.register("");
        assert_eq!(entry.name, DEFAULT_IMPORT_NAME);
        assert_eq!(meta.set_active(&entry.id), entry.id);
        assert_eq!(meta.active_source(), entry.id);
        assert_eq!(meta.set_active("ghost"), CURRENT_SOURCE);
        meta.active_db = "ghost".to_string();
        assert_eq!(meta.active_source(), CURRENT_SOURCE);
    }

    #[test]
    fn filenames_are_sanitized() {
        assert_eq!(db_filename("id-1-abc"), "id-1-abc.enc");
        assert_eq!(db_filename("../../etc/passwd"), "etc_passwd.enc");
        assert!(db_filename("///").starts_with("imported-"));
    }

    #[test]
    fn imported_paths_stay_inside_dbs() {
        let dir = Path::new("/data");
        assert_eq!(
            imported_path(dir, "x.enc").unwrap(),
            PathBuf::from("/data/dbs/x.enc")
        );
        assert!(imported_path(dir, "../x.enc").is_err());
        assert!(imported_path(dir, "a/b.enc").is_err());
        assert!(imported_path(dir, "/etc/passwd").is_err());
        assert!(imported_path(dir, "").is_err());
    }

    #[test]
    fn read_write_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(Metadata::read(dir.path()).unwrap(), Metadata::default());
        let mut meta = Metadata::default();
        meta.register("one");
        meta.write(dir.path(), true).unwrap();
        assert_eq!(Metadata::read(dir.path()).unwrap(), meta);
        std::fs::write(dir.path().join(META_FILE), "not json").unwrap();
        assert_eq!(Metadata::read(dir.path()).unwrap(), Metadata::default());
    }
}
