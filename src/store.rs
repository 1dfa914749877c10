use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs;
use std::future::Future;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::cache_key::derive_file_name;
use crate::config::Config;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// The producer returned nothing. Caching it would make "fetch failed"
    /// indistinguishable from a genuinely empty result on every later run.
    #[error("producer for cache key {key:?} returned no data")]
    EmptyResult { key: String },
}

/// A persisted entry, as reported by `list_entries`.
#[derive(Debug, Clone)]
pub struct EntryInfo {
    pub file_name: String,
    pub size: u64,
    pub modified: Option<std::time::SystemTime>,
}

/// Memoizes remote fetch results as one JSON document per key.
///
/// An entry on disk is ground truth: it is never revalidated, expired or
/// evicted. The directory is scratch space and can be deleted wholesale.
pub struct Store {
    root: PathBuf,
}

impl Store {
    pub fn open(config: &Config) -> Result<Self> {
        Self::open_at(config.cache_dir.clone())
    }

    pub fn open_at(root: PathBuf) -> Result<Self> {
        fs::create_dir_all(&root)
            .with_context(|| format!("creating cache directory {}", root.display()))?;
        Ok(Store { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// File holding the entry for a logical key.
    pub fn entry_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.json", derive_file_name(key)))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entry_path(key).is_file()
    }

    /// Load a cached value, if present.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let path = self.entry_path(key);
        if !path.is_file() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("reading cache entry {}", path.display()))?;
        let value = serde_json::from_str(&content)
            .with_context(|| format!("parsing cache entry {}", path.display()))?;
        Ok(Some(value))
    }

    /// Persist a value under `key`. Writes go through a temp file and a rename
    /// so an interrupted run never leaves a torn entry behind.
    pub fn put<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let path = self.entry_path(key);
        let json = serde_json::to_string_pretty(value).context("serializing cache entry")?;

        let mut tmp =
            tempfile::NamedTempFile::new_in(&self.root).context("creating temp cache file")?;
        tmp.write_all(json.as_bytes())
            .context("writing temp cache file")?;
        tmp.persist(&path)
            .with_context(|| format!("persisting cache entry {}", path.display()))?;
        Ok(())
    }

    /// Return the cached value for `key`, or run `producer`, persist its
    /// result and return it.
    ///
    /// Producer errors propagate untouched (callers downcast to tell an
    /// expired artifact from other failures). A producer result that
    /// serializes to `null` is rejected with [`CacheError::EmptyResult`] and
    /// is not written.
    pub async fn get_or_compute<T, F, Fut>(&self, key: &str, producer: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if let Some(cached) = self.get(key)? {
            tracing::debug!("cache hit for {}", key);
            return Ok(cached);
        }

        tracing::debug!("cache miss for {}", key);
        let value = producer().await?;

        let is_null = serde_json::to_value(&value)
            .context("serializing producer result")?
            .is_null();
        if is_null {
            return Err(CacheError::EmptyResult {
                key: key.to_string(),
            }
            .into());
        }

        self.put(key, &value)?;
        Ok(value)
    }

    /// All entries, sorted by file name.
    pub fn list_entries(&self) -> Result<Vec<EntryInfo>> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(&self.root).context("reading cache directory")? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_file() || path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            let meta = entry.metadata()?;
            entries.push(EntryInfo {
                file_name: entry.file_name().to_string_lossy().into_owned(),
                size: meta.len(),
                modified: meta.modified().ok(),
            });
        }
        entries.sort_by(|a, b| a.file_name.cmp(&b.file_name));
        Ok(entries)
    }

    pub fn total_size(&self) -> Result<u64> {
        Ok(self.list_entries()?.iter().map(|e| e.size).sum())
    }

    /// Remove every entry. Returns how many were removed.
    pub fn purge(&self) -> Result<usize> {
        let entries = self.list_entries()?;
        for entry in &entries {
            let path = self.root.join(&entry.file_name);
            fs::remove_file(&path).with_context(|| format!("removing {}", path.display()))?;
        }
        Ok(entries.len())
    }
}
