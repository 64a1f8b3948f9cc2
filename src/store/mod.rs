//! On-disk content-addressed store
//!
//! Each cached artifact lives at `<root>/<reference>`, so presence is a path
//! existence test. Writes land in `<root>/.partial/` first and are promoted
//! with an atomic rename, so a reader never observes a half-written artifact
//! and a crash never leaves one visible under its final name.
//!
//! Last-access times are kept in an in-memory index, seeded from file
//! modification times when the store is opened over a pre-existing
//! directory. Only the cache maintainer deletes entries.

use crate::types::ArtifactReference;
use dashmap::DashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Directory under the store root holding in-progress writes
const PARTIAL_DIR: &str = ".partial";

/// Record of one locally stored artifact
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub reference: ArtifactReference,
    pub path: PathBuf,
    pub size: u64,
    pub last_access: SystemTime,
}

/// Durable local store of artifact bytes, keyed by reference
#[derive(Debug)]
pub struct ContentStore {
    root: PathBuf,
    partial_dir: PathBuf,
    last_access: DashMap<ArtifactReference, SystemTime>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ContentStore {
    /// Open a store rooted at `root`, creating it if necessary
    ///
    /// Pre-existing artifacts are registered as cache entries with their
    /// file modification time as last access. Leftover partial writes from
    /// a previous crash are discarded.
    pub fn open(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        let partial_dir = root.join(PARTIAL_DIR);
        std::fs::create_dir_all(&partial_dir)?;

        let store = Self {
            root,
            partial_dir,
            last_access: DashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        };
        store.discard_partial_writes()?;
        store.scan_existing()?;
        Ok(store)
    }

    fn discard_partial_writes(&self) -> io::Result<()> {
        for entry in std::fs::read_dir(&self.partial_dir)? {
            let entry = entry?;
            warn!("discarding leftover partial write {:?}", entry.file_name());
            std::fs::remove_file(entry.path())?;
        }
        Ok(())
    }

    fn scan_existing(&self) -> io::Result<()> {
        let mut discovered = 0usize;
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                warn!("ignoring non-UTF8 file name in store: {:?}", name);
                continue;
            };
            let Ok(reference) = ArtifactReference::new(name) else {
                warn!("ignoring file with invalid reference name: {}", name);
                continue;
            };
            let modified = entry
                .metadata()?
                .modified()
                .unwrap_or_else(|_| SystemTime::now());
            self.last_access.insert(reference, modified);
            discovered += 1;
        }
        if discovered > 0 {
            info!("discovered {} pre-existing artifacts in store", discovered);
        }
        Ok(())
    }

    /// Root directory of the store
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Deterministic on-disk path for a reference
    #[must_use]
    pub fn path_for(&self, reference: &ArtifactReference) -> PathBuf {
        self.root.join(reference.as_str())
    }

    /// Check presence by path existence
    #[must_use]
    pub fn contains(&self, reference: &ArtifactReference) -> bool {
        self.path_for(reference).is_file()
    }

    /// Read an artifact, refreshing its last-access time on hit
    pub async fn read(&self, reference: &ArtifactReference) -> io::Result<Option<Vec<u8>>> {
        match tokio::fs::read(self.path_for(reference)).await {
            Ok(bytes) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                self.refresh_last_access(reference);
                Ok(Some(bytes))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Persist artifact bytes under their final name, atomically
    ///
    /// The payload is written to the partial directory and promoted with a
    /// rename, which is atomic within one filesystem.
    pub async fn commit(&self, reference: &ArtifactReference, bytes: &[u8]) -> io::Result<()> {
        let tmp_path = self
            .partial_dir
            .join(format!("{}.{}", reference.as_str(), Uuid::new_v4()));
        let final_path = self.path_for(reference);

        tokio::fs::write(&tmp_path, bytes).await?;
        if let Err(e) = tokio::fs::rename(&tmp_path, &final_path).await {
            // Leave no droppings behind on a failed promote
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(e);
        }

        self.last_access.insert(reference.clone(), SystemTime::now());
        debug!("committed artifact '{}' ({} bytes)", reference, bytes.len());
        Ok(())
    }

    /// Delete an artifact; returns whether it existed
    ///
    /// Reserved for the cache maintainer.
    pub async fn remove(&self, reference: &ArtifactReference) -> io::Result<bool> {
        let existed = match tokio::fs::remove_file(self.path_for(reference)).await {
            Ok(()) => true,
            Err(e) if e.kind() == io::ErrorKind::NotFound => false,
            Err(e) => return Err(e),
        };
        self.last_access.remove(reference);
        Ok(existed)
    }

    /// Bump the last-access time of a reference to now
    pub fn refresh_last_access(&self, reference: &ArtifactReference) {
        self.last_access
            .insert(reference.clone(), SystemTime::now());
    }

    /// Last-access time of a reference, if tracked
    #[must_use]
    pub fn last_access(&self, reference: &ArtifactReference) -> Option<SystemTime> {
        self.last_access.get(reference).map(|t| *t)
    }

    /// References currently cached
    #[must_use]
    pub fn references(&self) -> Vec<ArtifactReference> {
        self.last_access.iter().map(|e| e.key().clone()).collect()
    }

    /// Snapshot of all cache entries with sizes and last-access times
    pub fn entries(&self) -> Vec<CacheEntry> {
        self.last_access
            .iter()
            .filter_map(|item| {
                let path = self.path_for(item.key());
                let size = std::fs::metadata(&path).ok()?.len();
                Some(CacheEntry {
                    reference: item.key().clone(),
                    path,
                    size,
                    last_access: *item.value(),
                })
            })
            .collect()
    }

    /// Number of tracked entries
    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.last_access.len()
    }

    /// Cache hit rate as a percentage (0.0 to 100.0)
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            0.0
        } else {
            (hits as f64 / total as f64) * 100.0
        }
    }
}
