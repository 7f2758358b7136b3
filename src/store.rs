//! Config store (spec §4.A): the per-service pool of named upstream configs,
//! persisted as `~/.clp/<service>.json`, reloaded by an (mtime, size)
//! signature check rather than a background watcher (spec §9, "File-based
//! signalling"). Grounded on `original_source/src/config/config_manager.py`
//! and `cached_config_manager.py`.

use std::{
    collections::BTreeMap,
    fs,
    io::Write as _,
    path::{Path, PathBuf},
    sync::Mutex,
};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One named upstream entry. Unknown fields round-trip via `extra` (spec
/// §4.A: "Unknown fields are preserved on write" — the original Python's
/// `_save_configs` does not actually honor this, but spec.md's text is
/// explicit and not silent here, so it governs; see DESIGN.md).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpstreamEntry {
    pub base_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default)]
    pub weight: f64,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl UpstreamEntry {
    /// A raw entry is only a valid config if it has both `base_url` and
    /// `auth_token` (`config_manager.py::_load_configs`).
    fn is_well_formed(raw: &Value) -> bool {
        raw.get("base_url").and_then(Value::as_str).is_some()
            && raw.get("auth_token").and_then(Value::as_str).is_some()
    }
}

type Signature = (i64, u64);

const NO_SIGNATURE: Signature = (0, 0);

struct Cache {
    signature: Signature,
    all: BTreeMap<String, UpstreamEntry>,
}

pub struct ConfigStore {
    path: PathBuf,
    cache: Mutex<Cache>,
}

impl ConfigStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            cache: Mutex::new(Cache {
                signature: NO_SIGNATURE,
                all: BTreeMap::new(),
            }),
        }
    }

    fn signature(&self) -> Signature {
        match fs::metadata(&self.path) {
            Ok(meta) => {
                let mtime_ns = meta
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                    .map(|d| d.as_nanos() as i64)
                    .unwrap_or(0);
                (mtime_ns, meta.len())
            }
            Err(_) => NO_SIGNATURE,
        }
    }

    /// Reload the file if its (mtime, size) signature changed since last
    /// read. On parse failure, fail soft: replace the file with an empty
    /// object (spec §4.A, §7 "Config parse failure").
    fn ensure_fresh(&self) {
        let current = self.signature();
        let mut cache = self.cache.lock().expect("config store cache poisoned");
        if cache.signature == current {
            return;
        }

        match fs::read_to_string(&self.path) {
            Err(_) => {
                cache.all = BTreeMap::new();
                cache.signature = current;
            }
            Ok(content) => match serde_json::from_str::<Map<String, Value>>(&content) {
                Ok(raw_map) => {
                    let mut all = BTreeMap::new();
                    for (name, raw) in raw_map {
                        if !UpstreamEntry::is_well_formed(&raw) {
                            continue;
                        }
                        if let Ok(entry) = serde_json::from_value::<UpstreamEntry>(raw) {
                            all.insert(name, entry);
                        }
                    }
                    cache.all = all;
                    cache.signature = current;
                }
                Err(e) => {
                    tracing::warn!(
                        path = %self.path.display(),
                        error = %e,
                        "config store: parse failure, replacing file with empty object"
                    );
                    let _ = Self::write_empty(&self.path);
                    cache.all = BTreeMap::new();
                    cache.signature = self.signature();
                }
            },
        }
    }

    fn write_empty(path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, "{}\n")
    }

    /// `AllConfigs(service)`: every entry including `deleted = true`.
    pub fn all_configs(&self) -> BTreeMap<String, UpstreamEntry> {
        self.ensure_fresh();
        self.cache.lock().expect("config store cache poisoned").all.clone()
    }

    /// `Configs(service)`: visible (non-deleted) entries only.
    pub fn configs(&self) -> BTreeMap<String, UpstreamEntry> {
        self.all_configs()
            .into_iter()
            .filter(|(_, e)| !e.deleted)
            .collect()
    }

    /// `ActiveConfig(service)`: the unique visible `active = true` entry, or
    /// the lexically first visible entry if none is marked active, or `None`
    /// if there are no visible entries. Per spec.md §4.A's explicit text
    /// ("the lexically first visible entry"), not the original Python's
    /// insertion-order fallback (DESIGN.md Open Question A).
    pub fn active_config(&self) -> Option<(String, UpstreamEntry)> {
        let visible = self.configs();
        if let Some((name, entry)) = visible.iter().find(|(_, e)| e.active) {
            return Some((name.clone(), entry.clone()));
        }
        // `BTreeMap` iterates in key order already, so `.next()` is the
        // lexically first visible entry.
        visible.into_iter().next()
    }

    /// `SetActive(service, name)`: flips `active` so exactly `name` is
    /// active among non-deleted entries. Fails if `name` is absent or
    /// deleted.
    pub fn set_active(&self, name: &str) -> Result<(), StoreError> {
        let mut all = self.all_configs();
        match all.get(name) {
            None => return Err(StoreError::NotFound),
            Some(entry) if entry.deleted => return Err(StoreError::Deleted),
            Some(_) => {}
        }
        for (entry_name, entry) in all.iter_mut() {
            entry.active = entry_name == name && !entry.deleted;
        }
        self.persist(&all)
    }

    fn persist(&self, all: &BTreeMap<String, UpstreamEntry>) -> Result<(), StoreError> {
        let map: Map<String, Value> = all
            .iter()
            .map(|(name, entry)| {
                (
                    name.clone(),
                    serde_json::to_value(entry).unwrap_or(Value::Null),
                )
            })
            .collect();
        let text = serde_json::to_string_pretty(&Value::Object(map)).map_err(StoreError::Encode)?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(StoreError::Io)?;
        }
        let mut file = fs::File::create(&self.path).map_err(StoreError::Io)?;
        file.write_all(text.as_bytes()).map_err(StoreError::Io)?;
        file.write_all(b"\n").map_err(StoreError::Io)?;

        let mut cache = self.cache.lock().expect("config store cache poisoned");
        cache.all = all.clone();
        cache.signature = self.signature();
        Ok(())
    }
}

#[derive(Debug)]
pub enum StoreError {
    NotFound,
    Deleted,
    Io(std::io::Error),
    Encode(serde_json::Error),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::NotFound => write!(f, "config not found"),
            StoreError::Deleted => write!(f, "config is deleted"),
            StoreError::Io(e) => write!(f, "io error: {e}"),
            StoreError::Encode(e) => write!(f, "encode error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}
