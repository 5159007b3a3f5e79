//! Content-addressed persistent store backing change detection.
//!
//! The cache has two tiers, both keyed by the sha256 hex digest of a caller
//! key string: small *entries* collected into a single `cache.yaml` document,
//! and *blob files* written one per key. Between runs the whole store lives
//! as one gzip-compressed tar archive; opening extracts it into a private
//! temporary directory, closing re-archives atomically and removes the
//! directory. Blob files (never the entries document) are sealed with
//! AES-GCM when an encryption key is configured.
//!
//! An in-memory variant (no path) backs `--test` runs: fully functional,
//! nothing persisted.

mod codec;
mod error;

use std::fs;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use indexmap::IndexMap;
use sha2::{Digest, Sha256};
use tempfile::TempDir;

pub use codec::BlobCodec;
pub use error::{CacheError, CacheResult};

use crate::value::Value;

const ENTRIES_FILE: &str = "cache.yaml";

pub struct Cache {
    path: Option<PathBuf>,
    dir: Option<TempDir>,
    entries: IndexMap<String, Value>,
    codec: BlobCodec,
}

impl Cache {
    /// Open a cache, extracting the archive at `path` if one exists.
    pub fn open(path: Option<&Path>, encryption_key: Option<&str>) -> CacheResult<Self> {
        let dir = TempDir::new()?;
        let mut entries = IndexMap::new();

        if let Some(path) = path {
            if path.is_file() {
                let file = fs::File::open(path)?;
                let mut archive = tar::Archive::new(GzDecoder::new(file));
                archive
                    .unpack(dir.path())
                    .map_err(|e| CacheError::Extract(e.to_string()))?;

                let entries_path = dir.path().join(ENTRIES_FILE);
                if entries_path.is_file() {
                    let text = fs::read_to_string(&entries_path)?;
                    let doc: serde_yaml::Value = serde_yaml::from_str(&text)?;
                    if let serde_yaml::Value::Mapping(map) = doc {
                        for (k, v) in &map {
                            if let serde_yaml::Value::String(key) = k {
                                entries.insert(key.clone(), Value::from_yaml_entry(v));
                            }
                        }
                    }
                }
            }
        }

        Ok(Self {
            path: path.map(Path::to_path_buf),
            dir: Some(dir),
            entries,
            codec: BlobCodec::new(encryption_key),
        })
    }

    /// Ephemeral cache for test runs; nothing survives `close`.
    pub fn ephemeral() -> CacheResult<Self> {
        Self::open(None, None)
    }

    fn dir(&self) -> CacheResult<&Path> {
        self.dir
            .as_ref()
            .map(TempDir::path)
            .ok_or(CacheError::Closed)
    }

    pub fn has_entry(&self, key: &str) -> CacheResult<bool> {
        self.dir()?;
        Ok(self.entries.contains_key(&digest_key(key)))
    }

    pub fn get_entry(&self, key: &str) -> CacheResult<Option<Value>> {
        self.dir()?;
        Ok(self.entries.get(&digest_key(key)).cloned())
    }

    pub fn entry_or(&self, key: &str, default: Value) -> CacheResult<Value> {
        Ok(self.get_entry(key)?.unwrap_or(default))
    }

    pub fn put_entry(&mut self, key: &str, value: Value) -> CacheResult<()> {
        self.dir()?;
        self.entries.insert(digest_key(key), value);
        Ok(())
    }

    pub fn has_file(&self, key: &str) -> CacheResult<bool> {
        Ok(self.dir()?.join(digest_key(key)).is_file())
    }

    pub fn get_file(&self, key: &str) -> CacheResult<Option<Value>> {
        let path = self.dir()?.join(digest_key(key));
        if !path.is_file() {
            return Ok(None);
        }
        let data = fs::read(path)?;
        Ok(Some(self.codec.decode(&data)?))
    }

    pub fn file_or(&self, key: &str, default: Value) -> CacheResult<Value> {
        Ok(self.get_file(key)?.unwrap_or(default))
    }

    pub fn put_file(&mut self, key: &str, value: &Value) -> CacheResult<()> {
        let path = self.dir()?.join(digest_key(key));
        let data = self.codec.encode(value)?;
        fs::write(path, data)?;
        Ok(())
    }

    /// Diagnostic read of both tiers for a key.
    pub fn inspect(&self, key: &str) -> CacheResult<(Option<Value>, Option<Value>)> {
        Ok((self.get_entry(key)?, self.get_file(key)?))
    }

    /// Write the entries document and re-archive to the configured path.
    ///
    /// Idempotent: a second call is a no-op. Any other operation after close
    /// fails with [`CacheError::Closed`].
    pub fn close(&mut self) -> CacheResult<()> {
        let dir = match self.dir.take() {
            None => return Ok(()),
            Some(dir) => dir,
        };

        let mut doc = serde_yaml::Mapping::new();
        for (k, v) in &self.entries {
            doc.insert(serde_yaml::Value::String(k.clone()), v.to_yaml());
        }
        let text = serde_yaml::to_string(&serde_yaml::Value::Mapping(doc))?;
        fs::write(dir.path().join(ENTRIES_FILE), text)?;

        if let Some(path) = &self.path {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    fs::create_dir_all(parent)?;
                }
            }
            // Archive to a sibling first so a crash mid-write never leaves a
            // truncated cache at the destination.
            let staging = path.with_extension("tmp");
            let file = fs::File::create(&staging)?;
            let encoder = GzEncoder::new(file, Compression::default());
            let mut builder = tar::Builder::new(encoder);
            builder
                .append_dir_all(".", dir.path())
                .map_err(|e| CacheError::Compress(e.to_string()))?;
            let encoder = builder
                .into_inner()
                .map_err(|e| CacheError::Compress(e.to_string()))?;
            encoder
                .finish()
                .map_err(|e| CacheError::Compress(e.to_string()))?;
            fs::rename(&staging, path)?;
        }

        drop(dir);
        Ok(())
    }
}

fn digest_key(key: &str) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_round_trip_across_reopen() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("cache.tar.gz");

        let mut cache = Cache::open(Some(&archive), None).unwrap();
        cache.put_entry("watch-executed", Value::Int(170)).unwrap();
        cache
            .put_entry("marker", Value::Bytes(vec![1, 2, 3]))
            .unwrap();
        cache.close().unwrap();
        assert!(archive.is_file());

        let cache = Cache::open(Some(&archive), None).unwrap();
        assert_eq!(cache.get_entry("watch-executed").unwrap(), Some(Value::Int(170)));
        assert_eq!(
            cache.get_entry("marker").unwrap(),
            Some(Value::Bytes(vec![1, 2, 3]))
        );
        assert_eq!(cache.get_entry("absent").unwrap(), None);
    }

    #[test]
    fn test_file_round_trip_across_reopen() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("cache.tar.gz");

        let blob = Value::List(vec![Value::Bytes(vec![0, 255]), Value::from("x")]);
        let mut cache = Cache::open(Some(&archive), None).unwrap();
        cache.put_file("seen-set", &blob).unwrap();
        cache.close().unwrap();

        let cache = Cache::open(Some(&archive), None).unwrap();
        assert_eq!(cache.get_file("seen-set").unwrap(), Some(blob));
        assert!(!cache.has_file("other").unwrap());
    }

    #[test]
    fn test_entries_and_files_are_disjoint() {
        let mut cache = Cache::ephemeral().unwrap();
        cache.put_entry("key", Value::from("entry")).unwrap();
        cache.put_file("key", &Value::from("blob")).unwrap();
        let (entry, file) = cache.inspect("key").unwrap();
        assert_eq!(entry, Some(Value::from("entry")));
        assert_eq!(file, Some(Value::from("blob")));
    }

    #[test]
    fn test_encrypted_blob_opaque_on_disk() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("cache.tar.gz");
        let value = Value::from("visible secret");
        let encoded = serde_json::to_vec(&value.to_json()).unwrap();

        let mut cache = Cache::open(Some(&archive), Some("hunter2")).unwrap();
        cache.put_file("secret", &value).unwrap();
        let blob_path = cache.dir().unwrap().join(digest_key("secret"));
        let on_disk = fs::read(&blob_path).unwrap();
        assert_ne!(on_disk, encoded);
        assert_eq!(cache.get_file("secret").unwrap(), Some(value.clone()));
        cache.close().unwrap();

        let cache = Cache::open(Some(&archive), Some("hunter2")).unwrap();
        assert_eq!(cache.get_file("secret").unwrap(), Some(value));
    }

    #[test]
    fn test_wrong_key_is_error() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("cache.tar.gz");
        let mut cache = Cache::open(Some(&archive), Some("right")).unwrap();
        cache.put_file("secret", &Value::from("x")).unwrap();
        cache.close().unwrap();

        let cache = Cache::open(Some(&archive), Some("wrong")).unwrap();
        assert!(matches!(cache.get_file("secret"), Err(CacheError::Decrypt)));
    }

    #[test]
    fn test_close_idempotent_and_blocking() {
        let mut cache = Cache::ephemeral().unwrap();
        cache.put_entry("k", Value::Int(1)).unwrap();
        cache.close().unwrap();
        cache.close().unwrap();
        assert!(matches!(cache.get_entry("k"), Err(CacheError::Closed)));
        assert!(matches!(
            cache.put_entry("k", Value::Int(2)),
            Err(CacheError::Closed)
        ));
        assert!(matches!(cache.has_file("k"), Err(CacheError::Closed)));
    }

    #[test]
    fn test_open_missing_archive_is_empty() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("never-written.tar.gz");
        let cache = Cache::open(Some(&archive), None).unwrap();
        assert!(!cache.has_entry("anything").unwrap());
    }
}
