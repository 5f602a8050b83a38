//! 前処理済みデータセットとクラスタリング結果のアーティファクトキャッシュ。
//!
//! Entries live in memory for the duration of a run (one computation per key)
//! and, when the save flag is set, as JSON files under the cache directory.

use std::any::{Any, TypeId};
use std::collections::BTreeMap;
use std::fmt::Display;
use std::fs;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use xxhash_rust::xxh3::xxh3_64;

use crate::util::sanitize_component;

type Slot = Arc<dyn Any + Send + Sync>;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("failed to create cache directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write cache entry {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode cache entry {path}: {source}")]
    Encode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to remove cache entry {path}: {source}")]
    Remove {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// キャッシュキー。名前空間・データセット名・パラメータから構成される。
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    namespace: String,
    dataset: String,
    params: BTreeMap<String, String>,
}

impl CacheKey {
    #[must_use]
    pub fn new(namespace: impl Into<String>, dataset: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            dataset: dataset.into(),
            params: BTreeMap::new(),
        }
    }

    /// Adds a key input; changing any of them yields a different entry.
    #[must_use]
    pub fn param(mut self, name: impl Into<String>, value: impl Display) -> Self {
        self.params.insert(name.into(), value.to_string());
        self
    }

    /// Canonical textual form; parameters are ordered by name.
    #[must_use]
    pub fn canonical(&self) -> String {
        let params: Vec<String> = self
            .params
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect();
        format!("{}/{}?{}", self.namespace, self.dataset, params.join("&"))
    }

    #[must_use]
    pub fn fingerprint(&self) -> u64 {
        xxh3_64(self.canonical().as_bytes())
    }

    #[must_use]
    pub fn file_name(&self) -> String {
        format!(
            "{}-{}-{:016x}.json",
            sanitize_component(&self.namespace),
            sanitize_component(&self.dataset),
            self.fingerprint()
        )
    }
}

/// `--regenerate-*-cache` / `--save-*-cache` の組み合わせ。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachePolicy {
    /// Ignore any persisted entry and recompute.
    pub regenerate: bool,
    /// Persist freshly computed entries.
    pub save: bool,
}

impl CachePolicy {
    #[must_use]
    pub fn new(regenerate: bool, save: bool) -> Self {
        Self { regenerate, save }
    }

    /// Memory-only: never reads or writes files.
    #[must_use]
    pub fn ephemeral() -> Self {
        Self::new(true, false)
    }
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self::new(false, true)
    }
}

#[derive(Serialize)]
struct EnvelopeRef<'a, T> {
    key: &'a str,
    created_at: DateTime<Utc>,
    payload: &'a T,
}

#[derive(Deserialize)]
struct Envelope<T> {
    key: String,
    payload: T,
}

/// アーティファクトキャッシュ本体。
pub struct ArtifactCache {
    root: PathBuf,
    slots: Mutex<FxHashMap<(String, TypeId), Slot>>,
}

impl std::fmt::Debug for ArtifactCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactCache")
            .field("root", &self.root)
            .field("entries", &self.slots.lock().len())
            .finish()
    }
}

impl ArtifactCache {
    /// The directory is created lazily on the first save.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            slots: Mutex::new(FxHashMap::default()),
        }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn entry_path(&self, key: &CacheKey) -> PathBuf {
        self.root.join(key.file_name())
    }

    /// Returns the cached value for `key`, computing it at most once per run.
    ///
    /// Unless `policy.regenerate` is set, a persisted entry is tried first; an
    /// unreadable or mismatching file is treated as a miss. Freshly computed
    /// values are written back when `policy.save` is set; a failed write is
    /// logged and does not fail the call.
    ///
    /// # Errors
    /// Returns whatever `compute` returns.
    pub fn get_or_compute<T, E, F>(
        &self,
        key: &CacheKey,
        policy: CachePolicy,
        compute: F,
    ) -> Result<Arc<T>, E>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
        F: FnOnce() -> Result<T, E>,
    {
        let canonical = key.canonical();
        let slot: Arc<OnceCell<Arc<T>>> = {
            let mut slots = self.slots.lock();
            let entry = slots
                .entry((canonical.clone(), TypeId::of::<T>()))
                .or_insert_with(|| -> Slot { Arc::new(OnceCell::<Arc<T>>::new()) });
            Arc::clone(entry)
                .downcast::<OnceCell<Arc<T>>>()
                .unwrap_or_else(|_| Arc::new(OnceCell::new()))
        };

        let value = slot.get_or_try_init(|| {
            self.load_or_compute(key, &canonical, policy, compute)
                .map(Arc::new)
        })?;
        Ok(Arc::clone(value))
    }

    fn load_or_compute<T, E>(
        &self,
        key: &CacheKey,
        canonical: &str,
        policy: CachePolicy,
        compute: impl FnOnce() -> Result<T, E>,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
    {
        let path = self.entry_path(key);
        if !policy.regenerate {
            if let Some(value) = self.read::<T>(&path, canonical) {
                info!(key = %canonical, path = %path.display(), "cache hit");
                return Ok(value);
            }
            debug!(key = %canonical, "cache miss");
        } else {
            info!(key = %canonical, "regenerating cache entry");
        }

        let value = compute()?;
        if policy.save {
            match self.write(&path, canonical, &value) {
                Ok(()) => info!(key = %canonical, path = %path.display(), "cache entry saved"),
                Err(error) => warn!(key = %canonical, error = %error, "failed to save cache entry"),
            }
        }
        Ok(value)
    }

    fn read<T: DeserializeOwned>(&self, path: &Path, canonical: &str) -> Option<T> {
        let file = match fs::File::open(path) {
            Ok(file) => file,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return None,
            Err(error) => {
                warn!(path = %path.display(), error = %error, "failed to open cache entry");
                return None;
            }
        };
        match serde_json::from_reader::<_, Envelope<T>>(BufReader::new(file)) {
            Ok(envelope) if envelope.key == canonical => Some(envelope.payload),
            Ok(envelope) => {
                warn!(
                    path = %path.display(),
                    expected = canonical,
                    found = %envelope.key,
                    "cache entry key mismatch"
                );
                None
            }
            Err(error) => {
                warn!(path = %path.display(), error = %error, "failed to decode cache entry");
                None
            }
        }
    }

    fn write<T: Serialize>(&self, path: &Path, canonical: &str, value: &T) -> Result<(), CacheError> {
        fs::create_dir_all(&self.root).map_err(|source| CacheError::CreateDir {
            path: self.root.clone(),
            source,
        })?;

        let tmp_path = path.with_extension("json.tmp");
        {
            let file = fs::File::create(&tmp_path).map_err(|source| CacheError::Write {
                path: tmp_path.clone(),
                source,
            })?;
            let mut writer = BufWriter::new(file);
            let envelope = EnvelopeRef {
                key: canonical,
                created_at: Utc::now(),
                payload: value,
            };
            serde_json::to_writer(&mut writer, &envelope).map_err(|source| CacheError::Encode {
                path: tmp_path.clone(),
                source,
            })?;
            writer.flush().map_err(|source| CacheError::Write {
                path: tmp_path.clone(),
                source,
            })?;
        }
        fs::rename(&tmp_path, path).map_err(|source| CacheError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Drops the in-memory value and the persisted file for `key`.
    ///
    /// Returns `true` when a file was removed.
    ///
    /// # Errors
    /// Returns [`CacheError::Remove`] when the file exists but cannot be deleted.
    pub fn invalidate(&self, key: &CacheKey) -> Result<bool, CacheError> {
        let canonical = key.canonical();
        self.slots.lock().retain(|(entry, _), _| *entry != canonical);
        let path = self.entry_path(key);
        match fs::remove_file(&path) {
            Ok(()) => {
                info!(key = %canonical, "cache entry invalidated");
                Ok(true)
            }
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(CacheError::Remove { path, source }),
        }
    }
}
