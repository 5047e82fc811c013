//! Durable storage for tasks, execution state, credentials and one-time codes.
//!
//! A [`Store`] is constructed once per process and hands out typed
//! [`Collection`]s. Each collection is a JSON file on disk mirrored in an
//! in-memory map. Writes go to disk first and only then replace the cached
//! map, so the cache never holds state the file does not.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Storage errors.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Failed to read collection {collection}: {message}")]
    Read {
        collection: String,
        message: String,
    },
    #[error("Failed to write collection {collection}: {message}")]
    Write {
        collection: String,
        message: String,
    },
    #[error("Corrupt collection {collection}: {message}")]
    Corrupt {
        collection: String,
        message: String,
    },
}

/// Process-wide store handle.
#[derive(Debug, Clone)]
pub struct Store {
    dir: Option<PathBuf>,
}

impl Store {
    /// Open a store rooted at `dir`, creating the directory if needed.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| StoreError::Write {
            collection: dir.display().to_string(),
            message: format!("failed to create data directory: {}", e),
        })?;
        tracing::info!(path = %dir.display(), "opened durable store");
        Ok(Self { dir: Some(dir) })
    }

    /// A store that keeps everything in memory (tests, dry runs).
    pub fn in_memory() -> Self {
        Self { dir: None }
    }

    /// Data directory, if durable.
    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    /// Open a named collection.
    pub fn collection<V>(&self, name: &str) -> Result<Collection<V>, StoreError>
    where
        V: Clone + Serialize + DeserializeOwned + Send + Sync,
    {
        match &self.dir {
            Some(dir) => Collection::open(name, dir.join(format!("{}.json", name))),
            None => Ok(Collection::in_memory(name)),
        }
    }
}

/// A keyed collection of records persisted as one JSON document.
#[derive(Debug)]
pub struct Collection<V> {
    name: String,
    path: Option<PathBuf>,
    cache: RwLock<HashMap<String, V>>,
    /// Bumped on every published update.
    generation: AtomicU64,
}

impl<V> Collection<V>
where
    V: Clone + Serialize + DeserializeOwned + Send + Sync,
{
    /// Create a memory-only collection.
    pub fn in_memory(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: None,
            cache: RwLock::new(HashMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    /// Open a collection backed by `path`. A missing file is an empty collection.
    pub fn open(name: impl Into<String>, path: PathBuf) -> Result<Self, StoreError> {
        let name = name.into();
        let records = parse_records(&name, read_initial(&name, &path)?)?;
        tracing::debug!(collection = %name, records = records.len(), "loaded collection");
        Ok(Self {
            name,
            path: Some(path),
            cache: RwLock::new(records),
            generation: AtomicU64::new(0),
        })
    }

    /// Collection name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get a record. A cache miss re-reads the durable file and caches the
    /// record if another handle wrote it.
    pub async fn get(&self, key: &str) -> Result<Option<V>, StoreError> {
        if let Some(value) = self.cache.read().await.get(key) {
            return Ok(Some(value.clone()));
        }
        let Some(path) = &self.path else {
            return Ok(None);
        };

        let generation = self.generation.load(Ordering::SeqCst);
        let Some(found) = load_file::<V>(&self.name, path).await?.remove(key) else {
            return Ok(None);
        };

        let mut cache = self.cache.write().await;
        // A local update since the read wins over what was on disk
        if self.generation.load(Ordering::SeqCst) != generation {
            return Ok(cache.get(key).cloned());
        }
        cache.entry(key.to_string()).or_insert_with(|| found.clone());
        Ok(Some(found))
    }

    /// Snapshot of all records.
    pub async fn values(&self) -> Vec<V> {
        self.cache.read().await.values().cloned().collect()
    }

    /// Insert or replace a record.
    pub async fn put(&self, key: impl Into<String>, value: V) -> Result<(), StoreError> {
        let key = key.into();
        self.update(move |records| {
            records.insert(key, value);
            Ok::<_, StoreError>(())
        })
        .await
    }

    /// Remove a record, returning it if present.
    pub async fn remove(&self, key: &str) -> Result<Option<V>, StoreError> {
        self.update(|records| Ok::<_, StoreError>(records.remove(key)))
            .await
    }

    /// Apply `f` to a copy of the records, persist it, then publish it.
    ///
    /// The write lock is held for the whole operation, so updates are
    /// serialized and `f` can implement test-and-set semantics.
    pub async fn update<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut HashMap<String, V>) -> Result<T, E>,
        E: From<StoreError>,
    {
        let mut cache = self.cache.write().await;
        let mut next = cache.clone();
        let out = f(&mut next)?;
        self.persist(&next).await?;
        *cache = next;
        self.generation.fetch_add(1, Ordering::SeqCst);
        Ok(out)
    }

    async fn persist(&self, records: &HashMap<String, V>) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let write_err = |message: String| StoreError::Write {
            collection: self.name.clone(),
            message,
        };

        let payload = serde_json::to_vec_pretty(records).map_err(|e| StoreError::Corrupt {
            collection: self.name.clone(),
            message: e.to_string(),
        })?;

        let temp_path = path.with_extension(format!("{}.tmp", Uuid::new_v4().simple()));
        tokio::fs::write(&temp_path, payload)
            .await
            .map_err(|e| write_err(format!("failed to write payload: {}", e)))?;
        tokio::fs::rename(&temp_path, path)
            .await
            .map_err(|e| write_err(format!("failed to finalize payload: {}", e)))?;
        Ok(())
    }
}

/// Read at construction time, before any runtime is needed.
fn read_initial(name: &str, path: &Path) -> Result<Option<String>, StoreError> {
    match std::fs::read_to_string(path) {
        Ok(raw) => Ok(Some(raw)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(read_error(name, e)),
    }
}

async fn load_file<V: DeserializeOwned>(name: &str, path: &Path) -> Result<HashMap<String, V>, StoreError> {
    let raw = match tokio::fs::read_to_string(path).await {
        Ok(raw) => Some(raw),
        Err(e) if e.kind() == ErrorKind::NotFound => None,
        Err(e) => return Err(read_error(name, e)),
    };
    parse_records(name, raw)
}

fn read_error(name: &str, e: std::io::Error) -> StoreError {
    StoreError::Read {
        collection: name.to_string(),
        message: e.to_string(),
    }
}

fn parse_records<V: DeserializeOwned>(name: &str, raw: Option<String>) -> Result<HashMap<String, V>, StoreError> {
    let Some(raw) = raw.filter(|raw| !raw.trim().is_empty()) else {
        return Ok(HashMap::new());
    };
    serde_json::from_str(&raw).map_err(|e| StoreError::Corrupt {
        collection: name.to_string(),
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_put_get_remove() {
        let store = Store::in_memory();
        let notes: Collection<String> = store.collection("notes").unwrap();

        notes.put("a", "first".to_string()).await.unwrap();
        assert_eq!(notes.get("a").await.unwrap().as_deref(), Some("first"));
        assert_eq!(notes.remove("a").await.unwrap().as_deref(), Some("first"));
        assert!(notes.get("a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = Store::open(dir.path()).unwrap();
            let notes: Collection<u32> = store.collection("numbers").unwrap();
            notes.put("x", 7).await.unwrap();
        }

        let store = Store::open(dir.path()).unwrap();
        let notes: Collection<u32> = store.collection("numbers").unwrap();
        assert_eq!(notes.get("x").await.unwrap(), Some(7));
    }

    #[tokio::test]
    async fn test_cache_miss_reads_through() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let reader: Collection<u32> = store.collection("shared").unwrap();
        let writer: Collection<u32> = store.collection("shared").unwrap();

        writer.put("late", 42).await.unwrap();
        assert_eq!(reader.get("late").await.unwrap(), Some(42));
    }

    #[tokio::test]
    async fn test_cache_miss_for_absent_key_keeps_cache() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let reader: Collection<u32> = store.collection("shared").unwrap();
        let writer: Collection<u32> = store.collection("shared").unwrap();

        reader.put("mine", 1).await.unwrap();
        writer.put("theirs", 2).await.unwrap();

        assert_eq!(reader.get("absent").await.unwrap(), None);
        assert_eq!(reader.values().await, vec![1]);
        assert_eq!(reader.get("mine").await.unwrap(), Some(1));
        assert_eq!(reader.get("theirs").await.unwrap(), Some(2));
        assert_eq!(reader.values().await.len(), 2);
    }

    #[tokio::test]
    async fn test_failed_update_leaves_cache_untouched() {
        let notes: Collection<u32> = Collection::in_memory("numbers");
        notes.put("x", 1).await.unwrap();

        let result: Result<(), StoreError> = notes
            .update(|records| {
                records.insert("x".to_string(), 2);
                Err(StoreError::Corrupt {
                    collection: "numbers".to_string(),
                    message: "rejected".to_string(),
                })
            })
            .await;

        assert!(result.is_err());
        assert_eq!(notes.get("x").await.unwrap(), Some(1));
    }
}
