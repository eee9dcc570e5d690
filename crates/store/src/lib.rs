//! Keyed get/put of structured records in named collections.
//! Keep code tiny and predictable; callers bring their own record types.

#![forbid(unsafe_code)]

use metrics::{counter, histogram};
use serde::{de::DeserializeOwned, Serialize};
use stevedore_core::{ProvisionError, ProvisionResult};

/// Collection names shared with the rest of the control plane.
pub mod collections {
    pub const COMPONENTS: &str = "components";
    pub const IP_INDEX: &str = "ip-index";
    pub const PREDEF_CLOUDS: &str = "predefined-clouds";
    pub const CLOUD_ACCESS_KEYS: &str = "cloud-access-keys";
    pub const CLOUD_KEYS: &str = "cloud-keys";
}

/// Object-safe store surface. Typed access goes through [`fetch`]/[`save`].
pub trait Store: Send + Sync {
    fn fetch_raw(&self, collection: &str, key: &str) -> ProvisionResult<Option<serde_json::Value>>;
    fn save_raw(&self, collection: &str, key: &str, value: serde_json::Value) -> ProvisionResult<()>;
}

pub fn fetch<T: DeserializeOwned>(
    store: &dyn Store,
    collection: &str,
    key: &str,
) -> ProvisionResult<Option<T>> {
    match store.fetch_raw(collection, key)? {
        Some(v) => serde_json::from_value(v)
            .map(Some)
            .map_err(|e| ProvisionError::Persistence(format!("decoding {collection}/{key}: {e}"))),
        None => Ok(None),
    }
}

pub fn save<T: Serialize>(
    store: &dyn Store,
    collection: &str,
    key: &str,
    value: &T,
) -> ProvisionResult<()> {
    let v = serde_json::to_value(value)
        .map_err(|e| ProvisionError::Persistence(format!("encoding {collection}/{key}: {e}")))?;
    store.save_raw(collection, key, v)
}

/// SQLite-backed store. Simple, synchronous; none of the callers are latency
/// sensitive here.
pub struct SqliteStore {
    db: std::sync::Mutex<rusqlite::Connection>,
}

impl SqliteStore {
    pub fn open_default() -> ProvisionResult<Self> {
        let path = std::env::var("STEVEDORE_DB_PATH").unwrap_or_else(|_| default_db_path());
        Self::open(&path)
    }

    pub fn open(path: &str) -> ProvisionResult<Self> {
        let started = std::time::Instant::now();
        let db = rusqlite::Connection::open(path)
            .map_err(|e| ProvisionError::Persistence(format!("opening sqlite db at {path}: {e}")))?;
        db.pragma_update(None, "journal_mode", &"WAL").ok();
        db.pragma_update(None, "synchronous", &"NORMAL").ok();
        db.execute(
            "CREATE TABLE IF NOT EXISTS records (
                collection TEXT NOT NULL,
                key        TEXT NOT NULL,
                body       TEXT NOT NULL,
                PRIMARY KEY (collection, key)
            )",
            [],
        )
        .map_err(|e| ProvisionError::Persistence(format!("creating records table: {e}")))?;
        let me = Self { db: std::sync::Mutex::new(db) };
        histogram!("store_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        tracing::info!(path = %path, "record store opened");
        Ok(me)
    }

    fn lock(&self) -> ProvisionResult<std::sync::MutexGuard<'_, rusqlite::Connection>> {
        self.db
            .lock()
            .map_err(|_| ProvisionError::Persistence("store mutex poisoned".to_string()))
    }
}

impl Store for SqliteStore {
    fn fetch_raw(&self, collection: &str, key: &str) -> ProvisionResult<Option<serde_json::Value>> {
        let started = std::time::Instant::now();
        let db = self.lock()?;
        let mut stmt = db
            .prepare("SELECT body FROM records WHERE collection = ?1 AND key = ?2")
            .map_err(|e| ProvisionError::Persistence(e.to_string()))?;
        let mut rows = stmt
            .query((collection, key))
            .map_err(|e| ProvisionError::Persistence(e.to_string()))?;
        let out = match rows.next().map_err(|e| ProvisionError::Persistence(e.to_string()))? {
            Some(row) => {
                let body: String = row.get(0).map_err(|e| ProvisionError::Persistence(e.to_string()))?;
                let v = serde_json::from_str(&body)
                    .map_err(|e| ProvisionError::Persistence(format!("corrupt record {collection}/{key}: {e}")))?;
                Some(v)
            }
            None => None,
        };
        histogram!("store_get_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(out)
    }

    fn save_raw(&self, collection: &str, key: &str, value: serde_json::Value) -> ProvisionResult<()> {
        let started = std::time::Instant::now();
        let db = self.lock()?;
        db.execute(
            "INSERT INTO records (collection, key, body) VALUES (?1, ?2, ?3)
             ON CONFLICT (collection, key) DO UPDATE SET body = excluded.body",
            (collection, key, value.to_string()),
        )
        .map_err(|e| ProvisionError::Persistence(e.to_string()))?;
        histogram!("store_put_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("store_put_total", 1u64);
        Ok(())
    }
}

/// In-memory store for tests and local experiments.
#[derive(Default)]
pub struct MemStore {
    map: std::sync::Mutex<std::collections::HashMap<(String, String), serde_json::Value>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemStore {
    fn fetch_raw(&self, collection: &str, key: &str) -> ProvisionResult<Option<serde_json::Value>> {
        let map = self
            .map
            .lock()
            .map_err(|_| ProvisionError::Persistence("memstore mutex poisoned".to_string()))?;
        Ok(map.get(&(collection.to_string(), key.to_string())).cloned())
    }

    fn save_raw(&self, collection: &str, key: &str, value: serde_json::Value) -> ProvisionResult<()> {
        let mut map = self
            .map
            .lock()
            .map_err(|_| ProvisionError::Persistence("memstore mutex poisoned".to_string()))?;
        map.insert((collection.to_string(), key.to_string()), value);
        Ok(())
    }
}

fn default_db_path() -> String {
    if let Some(home) = std::env::var_os("HOME") {
        let mut p = std::path::PathBuf::from(home);
        p.push(".stevedore");
        let _ = std::fs::create_dir_all(&p);
        p.push("stevedore.db");
        return p.to_string_lossy().to_string();
    }
    "stevedore.db".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use stevedore_core::{IpIndex, IP_INDEX_KEY};

    fn temp_db() -> String {
        let dir = std::env::temp_dir();
        let f = format!(
            "stevedore-test-{}.db",
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        );
        dir.join(f).to_string_lossy().to_string()
    }

    #[test]
    fn put_get_overwrite() {
        let s = SqliteStore::open(&temp_db()).unwrap();
        let idx = IpIndex { ip: "10.0.0.4".into(), subnet: "10.0.0.0/24".into(), index: 4 };
        save(&s, collections::IP_INDEX, IP_INDEX_KEY, &idx).unwrap();
        let got: IpIndex = fetch(&s, collections::IP_INDEX, IP_INDEX_KEY).unwrap().unwrap();
        assert_eq!(got, idx);

        let idx2 = IpIndex { ip: "10.0.0.5".into(), index: 5, ..idx };
        save(&s, collections::IP_INDEX, IP_INDEX_KEY, &idx2).unwrap();
        let got: IpIndex = fetch(&s, collections::IP_INDEX, IP_INDEX_KEY).unwrap().unwrap();
        assert_eq!(got.index, 5);
    }

    #[test]
    fn missing_key_is_none_not_error() {
        let s = SqliteStore::open(&temp_db()).unwrap();
        let got: Option<IpIndex> = fetch(&s, collections::IP_INDEX, "nope").unwrap();
        assert!(got.is_none());
    }

    #[test]
    fn collections_are_isolated() {
        let s = MemStore::new();
        s.save_raw("a", "k", serde_json::json!({"v": 1})).unwrap();
        assert!(s.fetch_raw("b", "k").unwrap().is_none());
        assert!(s.fetch_raw("a", "k").unwrap().is_some());
    }
}
