//! Durable token → display name map.
//!
//! The identity token is a truncated hash, so this file is the only way back
//! from a ghost to the name the phone knows. Layout on disk is a single JSON
//! object, rewritten in full after every insertion:
//!
//! ```json
//! { "0f1e2d3c4b5a": "Alice Example", "a1b2c3d4e5f6": "山田 太郎" }
//! ```
//!
//! All access goes through one `RwLock`. `put` holds the write lock across
//! the disk write so saves land in mutation order.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use cona_types::IdentityToken;
use cona_utils::{AtomicFile, PersistMode};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TitleStoreError {
    #[error("failed to encode title map: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("failed to write title map {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug)]
pub struct TitleStore {
    file: AtomicFile,
    entries: RwLock<BTreeMap<IdentityToken, String>>,
}

impl TitleStore {
    /// An empty store that will persist to `path`. Nothing is read.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            // Sender names are personal data.
            file: AtomicFile::new(path).with_mode(PersistMode::OwnerOnly),
            entries: RwLock::new(BTreeMap::new()),
        }
    }

    /// Create a store for `path` and load whatever is already there.
    #[must_use]
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let store = Self::new(path);
        store.load();
        store
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Replace the in-memory map with the persisted one.
    ///
    /// A missing file is the normal first-run state. An unreadable or corrupt
    /// file is logged and treated as empty; the next `put` overwrites it.
    pub fn load(&self) {
        let path = self.path();
        let loaded = match self.file.read() {
            Ok(Some(bytes)) => decode(path, &bytes),
            Ok(None) => {
                tracing::info!(path = %path.display(), "No title map yet, starting empty");
                BTreeMap::new()
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "Title map unreadable, starting empty"
                );
                BTreeMap::new()
            }
        };

        tracing::info!(path = %path.display(), entries = loaded.len(), "Loaded title map");
        *self.entries.write().unwrap_or_else(PoisonError::into_inner) = loaded;
    }

    #[must_use]
    pub fn get(&self, token: &IdentityToken) -> Option<String> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(token)
            .cloned()
    }

    /// Insert or overwrite `token`, then persist the whole map.
    ///
    /// The in-memory entry is kept even if the write fails, so lookups stay
    /// correct for the rest of this process.
    pub fn put(
        &self,
        token: IdentityToken,
        name: impl Into<String>,
    ) -> Result<(), TitleStoreError> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.insert(token, name.into());
        self.persist(&entries)
    }

    /// Persist the current map, overwriting the file atomically.
    pub fn save(&self) -> Result<(), TitleStoreError> {
        // Write lock, not read: two concurrent saves must not interleave.
        let entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        self.persist(&entries)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn persist(&self, entries: &BTreeMap<IdentityToken, String>) -> Result<(), TitleStoreError> {
        let bytes = serde_json::to_vec_pretty(entries)?;
        self.file
            .replace(&bytes)
            .map_err(|source| TitleStoreError::Write {
                path: self.path().to_path_buf(),
                source,
            })
    }
}

fn decode(path: &Path, bytes: &[u8]) -> BTreeMap<IdentityToken, String> {
    let raw: BTreeMap<String, String> = match serde_json::from_slice(bytes) {
        Ok(raw) => raw,
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "Title map is not a JSON object of strings, starting empty"
            );
            return BTreeMap::new();
        }
    };

    raw.into_iter()
        .filter_map(|(key, name)| match IdentityToken::parse(&key) {
            Ok(token) => Some((token, name)),
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Dropping title map entry with bad key");
                None
            }
        })
        .collect()
}
