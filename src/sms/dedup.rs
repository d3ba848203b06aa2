//! Durable record of SMS identifiers that were already processed.
//!
//! The in-memory view is authoritative for the process lifetime. Every
//! append hands the full id sequence to a background writer that rewrites
//! the JSON file (temp file, then rename). Bursts of appends collapse into
//! one write of the newest snapshot, so the poll loop never waits on disk.
//! `flush()` closes the durability gap on shutdown.

use std::collections::HashSet;
use std::ffi::OsString;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::fs;
use tokio::sync::{Mutex, watch};
use tracing::{debug, error, info};

use crate::error::StoreError;

/// Ordered, append-only set of seen message identifiers backed by a file.
pub struct DedupStore {
    path: Arc<PathBuf>,
    ids: Vec<i64>,
    index: HashSet<i64>,
    snapshot_tx: watch::Sender<Vec<i64>>,
    /// Held for the duration of every file write.
    write_lock: Arc<Mutex<()>>,
}

impl DedupStore {
    /// Load the store from `path` and start its background writer.
    ///
    /// A missing file yields an empty store. Any other read failure, or a
    /// file that is not a JSON array of integers, is an error.
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let ids = read_ids(&path).await?;
        let index: HashSet<i64> = ids.iter().copied().collect();

        info!(path = %path.display(), count = ids.len(), "Loaded dedup store");

        let (snapshot_tx, snapshot_rx) = watch::channel(ids.clone());
        let path = Arc::new(path);
        let write_lock = Arc::new(Mutex::new(()));

        tokio::spawn(run_writer(
            Arc::clone(&path),
            snapshot_rx,
            Arc::clone(&write_lock),
        ));

        Ok(Self {
            path,
            ids,
            index,
            snapshot_tx,
            write_lock,
        })
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn contains(&self, id: i64) -> bool {
        self.index.contains(&id)
    }

    /// Record `id` and schedule a write. Returns `false` if it was already known.
    pub fn append(&mut self, id: i64) -> bool {
        if !self.index.insert(id) {
            return false;
        }
        self.ids.push(id);
        self.snapshot_tx.send_replace(self.ids.clone());
        true
    }

    /// Identifiers in insertion order.
    pub fn ids(&self) -> &[i64] {
        &self.ids
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Write the current snapshot now, waiting for any in-flight write first.
    pub async fn flush(&self) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        write_atomic(&self.path, &self.ids).await?;
        debug!(count = self.ids.len(), "Flushed dedup store");
        Ok(())
    }
}

async fn read_ids(path: &Path) -> Result<Vec<i64>, StoreError> {
    let raw = match fs::read(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            info!(path = %path.display(), "Dedup file not found, starting empty");
            return Ok(Vec::new());
        }
        Err(source) => {
            return Err(StoreError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };

    // A literal `null` is accepted as an empty list.
    let ids: Option<Vec<i64>> =
        serde_json::from_slice(&raw).map_err(|source| StoreError::Corrupt {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(ids.unwrap_or_default())
}

/// Persist snapshots until the owning store is dropped.
async fn run_writer(
    path: Arc<PathBuf>,
    mut snapshot_rx: watch::Receiver<Vec<i64>>,
    write_lock: Arc<Mutex<()>>,
) {
    while snapshot_rx.changed().await.is_ok() {
        let _guard = write_lock.lock().await;
        // Read after taking the lock so a concurrent flush is never undone.
        let ids = snapshot_rx.borrow_and_update().clone();

        match write_atomic(&path, &ids).await {
            Ok(()) => debug!(count = ids.len(), "Persisted dedup snapshot"),
            Err(e) => error!("Failed to persist dedup snapshot: {e}"),
        }
    }
    debug!(path = %path.display(), "Dedup writer stopped");
}

async fn write_atomic(path: &Path, ids: &[i64]) -> Result<(), StoreError> {
    let encoded = serde_json::to_vec(ids)?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .await
            .map_err(|source| StoreError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
    }

    let tmp = tmp_path(path);
    fs::write(&tmp, &encoded)
        .await
        .map_err(|source| StoreError::Io {
            path: tmp.clone(),
            source,
        })?;
    fs::rename(&tmp, path)
        .await
        .map_err(|source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(())
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| OsString::from("last_sms"));
    name.push(".tmp");
    path.with_file_name(name)
}
