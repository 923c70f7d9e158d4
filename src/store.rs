//! Flat key-value persistence: one pretty-printed JSON file per `(collection, key)`.
//!
//! Files live at `<root>/<collection>/<encoded key>.json`. Writes go to a
//! sibling `.tmp` file that is renamed over the target, so readers never see a
//! half-written blob. Every value read or written is memoized; the same lock
//! guards cache and disk, which makes [`JsonStore::update`] an atomic
//! read-modify-write for a key.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::debug;
use tracing::instrument;

const EXTENSION: &str = "json";

#[derive(Debug, Error)]
pub enum StoreError {
  #[error("invalid name {0:?}")]
  InvalidName(String),
  #[error("io error at {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
  #[error("corrupt record at {path}: {source}")]
  Corrupt {
    path: PathBuf,
    #[source]
    source: serde_json::Error,
  },
  #[error("failed to encode record: {0}")]
  Encode(#[source] serde_json::Error),
}

type CacheKey = (String, String);

#[derive(Clone)]
pub struct JsonStore {
  inner: Arc<Inner>,
}

struct Inner {
  root: PathBuf,
  cache: Mutex<HashMap<CacheKey, Value>>,
}

impl JsonStore {
  #[instrument]
  pub async fn open(root: &Path) -> Result<Self, StoreError> {
    fs::create_dir_all(root).await.map_err(|source| StoreError::Io {
      path: root.to_path_buf(),
      source,
    })?;
    Ok(Self {
      inner: Arc::new(Inner {
        root: root.to_path_buf(),
        cache: Mutex::new(HashMap::new()),
      }),
    })
  }

  pub async fn get<T: DeserializeOwned>(&self, collection: &str, key: &str) -> Result<Option<T>, StoreError> {
    let path = self.path_for(collection, key)?;
    let mut cache = self.inner.cache.lock().await;
    let Some(value) = load_cached(&mut cache, &path, collection, key).await? else {
      return Ok(None);
    };
    decode(&path, value).map(Some)
  }

  pub async fn put<T: Serialize>(&self, collection: &str, key: &str, record: &T) -> Result<(), StoreError> {
    let path = self.path_for(collection, key)?;
    let value = serde_json::to_value(record).map_err(StoreError::Encode)?;
    let mut cache = self.inner.cache.lock().await;
    write_atomic(&path, &value).await?;
    cache.insert((collection.to_string(), key.to_string()), value);
    Ok(())
  }

  /// Returns whether a record existed.
  pub async fn delete(&self, collection: &str, key: &str) -> Result<bool, StoreError> {
    let path = self.path_for(collection, key)?;
    let mut cache = self.inner.cache.lock().await;
    cache.remove(&(collection.to_string(), key.to_string()));
    remove_file(&path).await
  }

  /// Read-modify-write under the store lock. `None` after `apply` deletes the record.
  pub async fn update<T, R, F>(&self, collection: &str, key: &str, apply: F) -> Result<R, StoreError>
  where
    T: Serialize + DeserializeOwned,
    F: FnOnce(&mut Option<T>) -> R,
  {
    let path = self.path_for(collection, key)?;
    let mut cache = self.inner.cache.lock().await;
    let mut record: Option<T> = match load_cached(&mut cache, &path, collection, key).await? {
      Some(value) => Some(decode(&path, value)?),
      None => None,
    };
    let existed = record.is_some();
    let result = apply(&mut record);
    let cache_key = (collection.to_string(), key.to_string());
    match record {
      Some(record) => {
        let value = serde_json::to_value(&record).map_err(StoreError::Encode)?;
        write_atomic(&path, &value).await?;
        cache.insert(cache_key, value);
      },
      None if existed => {
        cache.remove(&cache_key);
        remove_file(&path).await?;
      },
      None => {},
    }
    Ok(result)
  }

  /// Keys of a collection in lexical order.
  pub async fn keys(&self, collection: &str) -> Result<Vec<String>, StoreError> {
    validate_collection(collection)?;
    let _guard = self.inner.cache.lock().await;
    let dir = self.inner.root.join(collection);
    let mut entries = match fs::read_dir(&dir).await {
      Ok(entries) => entries,
      Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
      Err(source) => return Err(StoreError::Io { path: dir, source }),
    };
    let mut keys = Vec::new();
    loop {
      let entry = entries.next_entry().await.map_err(|source| StoreError::Io {
        path: dir.clone(),
        source,
      })?;
      let Some(entry) = entry else { break };
      let file_name = entry.file_name();
      let Some(name) = file_name.to_str() else { continue };
      let Some(stem) = name.strip_suffix(".json") else {
        continue;
      };
      if let Some(key) = decode_key(stem) {
        keys.push(key);
      }
    }
    keys.sort();
    Ok(keys)
  }

  pub async fn list_prefix<T: DeserializeOwned>(
    &self,
    collection: &str,
    prefix: &str,
  ) -> Result<Vec<(String, T)>, StoreError> {
    let keys = self.keys(collection).await?;
    let mut records = Vec::new();
    for key in keys.into_iter().filter(|key| key.starts_with(prefix)) {
      if let Some(record) = self.get(collection, &key).await? {
        records.push((key, record));
      }
    }
    Ok(records)
  }

  fn path_for(&self, collection: &str, key: &str) -> Result<PathBuf, StoreError> {
    validate_collection(collection)?;
    if key.is_empty() {
      return Err(StoreError::InvalidName(key.to_string()));
    }
    Ok(
      self
        .inner
        .root
        .join(collection)
        .join(format!("{}.{EXTENSION}", encode_key(key))),
    )
  }
}

async fn load_cached(
  cache: &mut HashMap<CacheKey, Value>,
  path: &Path,
  collection: &str,
  key: &str,
) -> Result<Option<Value>, StoreError> {
  let cache_key = (collection.to_string(), key.to_string());
  if let Some(value) = cache.get(&cache_key) {
    return Ok(Some(value.clone()));
  }
  let bytes = match fs::read(path).await {
    Ok(bytes) => bytes,
    Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
    Err(source) => {
      return Err(StoreError::Io {
        path: path.to_path_buf(),
        source,
      });
    },
  };
  let value: Value = serde_json::from_slice(&bytes).map_err(|source| StoreError::Corrupt {
    path: path.to_path_buf(),
    source,
  })?;
  debug!(collection, key, "loaded record from disk");
  cache.insert(cache_key, value.clone());
  Ok(Some(value))
}

fn decode<T: DeserializeOwned>(path: &Path, value: Value) -> Result<T, StoreError> {
  serde_json::from_value(value).map_err(|source| StoreError::Corrupt {
    path: path.to_path_buf(),
    source,
  })
}

async fn write_atomic(path: &Path, value: &Value) -> Result<(), StoreError> {
  let io_err = |source| StoreError::Io {
    path: path.to_path_buf(),
    source,
  };
  if let Some(parent) = path.parent() {
    fs::create_dir_all(parent).await.map_err(io_err)?;
  }
  let bytes = serde_json::to_vec_pretty(value).map_err(StoreError::Encode)?;
  let tmp = path.with_extension(format!("{EXTENSION}.tmp"));
  fs::write(&tmp, bytes).await.map_err(io_err)?;
  fs::rename(&tmp, path).await.map_err(io_err)?;
  Ok(())
}

async fn remove_file(path: &Path) -> Result<bool, StoreError> {
  match fs::remove_file(path).await {
    Ok(()) => Ok(true),
    Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
    Err(source) => Err(StoreError::Io {
      path: path.to_path_buf(),
      source,
    }),
  }
}

fn validate_collection(collection: &str) -> Result<(), StoreError> {
  let valid = !collection.is_empty()
    && collection
      .bytes()
      .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_');
  if valid {
    Ok(())
  } else {
    Err(StoreError::InvalidName(collection.to_string()))
  }
}

fn encode_key(key: &str) -> String {
  let mut encoded = String::with_capacity(key.len());
  for byte in key.bytes() {
    if byte.is_ascii_alphanumeric() || byte == b'_' || byte == b'-' {
      encoded.push(byte as char);
    } else {
      encoded.push_str(&format!("~{byte:02x}"));
    }
  }
  encoded
}

fn decode_key(encoded: &str) -> Option<String> {
  let bytes = encoded.as_bytes();
  let mut out = Vec::with_capacity(bytes.len());
  let mut idx = 0;
  while idx < bytes.len() {
    if bytes[idx] == b'~' {
      let hex = encoded.get(idx + 1 .. idx + 3)?;
      out.push(u8::from_str_radix(hex, 16).ok()?);
      idx += 3;
    } else {
      out.push(bytes[idx]);
      idx += 1;
    }
  }
  String::from_utf8(out).ok()
}

#[cfg(test)]
mod tests {
  use serde::Deserialize;
  use serde::Serialize;

  use super::JsonStore;
  use super::StoreError;
  use super::decode_key;
  use super::encode_key;

  #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
  struct Counter {
    value: i64,
  }

  #[test]
  fn key_encoding_is_reversible_and_safe() {
    for key in ["plain", "12:34", "a/b\\c", "émoji 🎉", "~tilde"] {
      let encoded = encode_key(key);
      assert!(encoded.bytes().all(|b| b.is_ascii_alphanumeric() || b"_-~".contains(&b)));
      assert_eq!(decode_key(&encoded).as_deref(), Some(key));
    }
    assert_ne!(encode_key("a:b"), encode_key("a_b"));
  }

  #[tokio::test]
  async fn put_then_get_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let store = JsonStore::open(dir.path()).await.unwrap();
    store.put("counters", "7:1", &Counter { value: 3 }).await.unwrap();
    assert!(dir.path().join("counters").join("7~3a1.json").exists());

    let reopened = JsonStore::open(dir.path()).await.unwrap();
    let loaded: Option<Counter> = reopened.get("counters", "7:1").await.unwrap();
    assert_eq!(loaded, Some(Counter { value: 3 }));
    let missing: Option<Counter> = reopened.get("counters", "nope").await.unwrap();
    assert!(missing.is_none());
  }

  #[tokio::test]
  async fn update_writes_and_deletes() {
    let dir = tempfile::tempdir().unwrap();
    let store = JsonStore::open(dir.path()).await.unwrap();
    let created = store
      .update("counters", "a", |record: &mut Option<Counter>| {
        let counter = record.get_or_insert(Counter { value: 0 });
        counter.value += 5;
        counter.value
      })
      .await
      .unwrap();
    assert_eq!(created, 5);

    store
      .update("counters", "a", |record: &mut Option<Counter>| {
        *record = None;
      })
      .await
      .unwrap();
    assert!(store.get::<Counter>("counters", "a").await.unwrap().is_none());
    assert!(!store.delete("counters", "a").await.unwrap());
  }

  #[tokio::test]
  async fn concurrent_updates_do_not_lose_writes() {
    let dir = tempfile::tempdir().unwrap();
    let store = JsonStore::open(dir.path()).await.unwrap();
    let mut tasks = Vec::new();
    for _ in 0 .. 20 {
      let store = store.clone();
      tasks.push(tokio::spawn(async move {
        store
          .update("counters", "shared", |record: &mut Option<Counter>| {
            record.get_or_insert(Counter { value: 0 }).value += 1;
          })
          .await
          .unwrap();
      }));
    }
    for task in tasks {
      task.await.unwrap();
    }
    let total: Counter = store.get("counters", "shared").await.unwrap().unwrap();
    assert_eq!(total.value, 20);
  }

  #[tokio::test]
  async fn lists_by_prefix_in_key_order() {
    let dir = tempfile::tempdir().unwrap();
    let store = JsonStore::open(dir.path()).await.unwrap();
    for (key, value) in [("1:b", 2), ("1:a", 1), ("2:a", 3)] {
      store.put("counters", key, &Counter { value }).await.unwrap();
    }
    let listed: Vec<(String, Counter)> = store.list_prefix("counters", "1:").await.unwrap();
    let keys: Vec<&str> = listed.iter().map(|(key, _)| key.as_str()).collect();
    assert_eq!(keys, vec!["1:a", "1:b"]);
    assert!(store.keys("empty").await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn reports_corrupt_files() {
    let dir = tempfile::tempdir().unwrap();
    let store = JsonStore::open(dir.path()).await.unwrap();
    std::fs::create_dir_all(dir.path().join("counters")).unwrap();
    std::fs::write(dir.path().join("counters").join("bad.json"), b"{not json").unwrap();
    let result = store.get::<Counter>("counters", "bad").await;
    assert!(matches!(result, Err(StoreError::Corrupt { .. })));
  }

  #[tokio::test]
  async fn rejects_invalid_collection_names() {
    let dir = tempfile::tempdir().unwrap();
    let store = JsonStore::open(dir.path()).await.unwrap();
    let result = store.put("../escape", "k", &Counter { value: 1 }).await;
    assert!(matches!(result, Err(StoreError::InvalidName(_))));
  }
}
