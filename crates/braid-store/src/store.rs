//! Single-writer, file-backed document store.
//!
//! The document is loaded once at open, mutated in memory, and persisted
//! with a replace-then-rename atomic write on every successful update. At
//! most one write is in flight at any instant; snapshots are deep copies
//! taken under a read lock, so a reader observes either the pre-state or
//! the fully-written post-state -- never a torn document.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex as StdMutex;

use thiserror::Error;
use tokio::sync::RwLock;

use crate::models::Data;

const DOCUMENT_FILE: &str = "braid.json";

/// Errors from the store. `Unavailable` is the only fatal class: callers
/// surface it to the request surface and do not retry.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing directory cannot be created or written.
    #[error("store unavailable at {path}: {source}")]
    Unavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The persisted document exists but cannot be parsed.
    #[error("corrupt document at {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// The document store. Owns the only handle to disk state.
#[derive(Debug)]
pub struct Store {
    data_dir: PathBuf,
    document_path: PathBuf,
    state: RwLock<Data>,
    counters: StdMutex<HashMap<String, u64>>,
}

impl Store {
    /// Open (or create) the store in `data_dir`.
    ///
    /// Loads the existing document if present, seeds the per-prefix id
    /// counters from the maximum numeric suffix in it, and probes
    /// writability so an unwritable directory fails here rather than on
    /// the first mutation.
    pub fn open(data_dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let data_dir = data_dir.into();
        std::fs::create_dir_all(&data_dir).map_err(|source| StoreError::Unavailable {
            path: data_dir.clone(),
            source,
        })?;

        let document_path = data_dir.join(DOCUMENT_FILE);
        let data = match std::fs::read(&document_path) {
            Ok(bytes) => {
                serde_json::from_slice(&bytes).map_err(|source| StoreError::Corrupt {
                    path: document_path.clone(),
                    source,
                })?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Data::default(),
            Err(source) => {
                return Err(StoreError::Unavailable {
                    path: document_path,
                    source,
                });
            }
        };

        tracing::debug!(
            path = %document_path.display(),
            strands = data.strands.len(),
            goals = data.goals.len(),
            "document loaded"
        );

        let counters = StdMutex::new(seed_counters(&data));
        let store = Self {
            data_dir,
            document_path,
            state: RwLock::new(data),
            counters,
        };

        // Writability probe: persist the loaded document once.
        {
            let guard = store.state.try_read().expect("fresh store lock");
            store.persist(&guard)?;
        }

        Ok(store)
    }

    /// The directory the store persists into (also hosts the event log).
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Return a deep-copied, consistent snapshot of the document.
    pub async fn snapshot(&self) -> Data {
        self.state.read().await.clone()
    }

    /// Apply a mutation to the document and persist it atomically.
    ///
    /// The closure runs against a working copy; if it returns an error the
    /// in-memory and on-disk state are left untouched. On success the new
    /// document is written to a temp file and renamed over the old one
    /// before the write lock is released.
    pub async fn update<T>(
        &self,
        f: impl FnOnce(&mut Data) -> anyhow::Result<T>,
    ) -> anyhow::Result<T> {
        let mut guard = self.state.write().await;
        let mut next = guard.clone();
        let out = f(&mut next)?;

        #[cfg(debug_assertions)]
        if let Err(violation) = next.check_invariants() {
            debug_assert!(false, "document invariant violated: {violation}");
        }

        self.persist(&next)?;
        *guard = next;
        Ok(out)
    }

    /// Mint a new id: `<prefix>_<n>`, monotonic per process per prefix.
    pub fn new_id(&self, prefix: &str) -> String {
        let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        let counter = counters.entry(prefix.to_owned()).or_insert(0);
        *counter += 1;
        format!("{prefix}_{counter}")
    }

    fn persist(&self, data: &Data) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(data).expect("document serializes");
        let tmp_path = self.document_path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &bytes).map_err(|source| StoreError::Unavailable {
            path: tmp_path.clone(),
            source,
        })?;
        std::fs::rename(&tmp_path, &self.document_path).map_err(|source| {
            StoreError::Unavailable {
                path: self.document_path.clone(),
                source,
            }
        })?;
        Ok(())
    }
}

/// Seed per-prefix counters from the maximum numeric suffix present in the
/// document, so ids stay monotonic across restarts.
fn seed_counters(data: &Data) -> HashMap<String, u64> {
    let mut counters: HashMap<String, u64> = HashMap::new();
    let mut record = |id: &str| {
        if let Some((prefix, suffix)) = id.rsplit_once('_') {
            if let Ok(n) = suffix.parse::<u64>() {
                let entry = counters.entry(prefix.to_owned()).or_insert(0);
                *entry = (*entry).max(n);
            }
        }
    };

    for strand in &data.strands {
        record(&strand.id);
    }
    for goal in &data.goals {
        record(&goal.id);
        for task in &goal.tasks {
            record(&task.id);
        }
    }
    counters
}
