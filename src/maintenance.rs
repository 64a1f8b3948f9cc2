//! Periodic cache maintenance
//!
//! A background task that reclaims store space from artifacts no longer
//! referenced by any active configuration generation. Each pass reads the
//! externally supplied active set, walks the store, and deletes what is
//! cached but not active, with two safety rails:
//!
//! - entries accessed within the retention grace period are kept, so an
//!   artifact that finished downloading moments before the active set was
//!   refreshed survives the pass
//! - entries whose reference has an in-flight download in the registry are
//!   deferred to a later pass
//!
//! Deletion is per-artifact: one failed or deferred entry never blocks
//! progress on the rest.

use crate::config::MaintenanceConfig;
use crate::downloader::DownloadRegistry;
use crate::store::ContentStore;
use crate::types::ArtifactReference;
use async_trait::async_trait;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Oracle for the set of references required cluster-wide
///
/// Owned by the configuration-generation owner, not by this subsystem; the
/// maintainer treats it as read-only ground truth.
#[async_trait]
pub trait ActiveReferences: Send + Sync {
    async fn active_references(&self) -> HashSet<ArtifactReference>;
}

/// Active set read from a file, one reference per line
///
/// Lines that fail reference validation are skipped with a warning. A
/// missing file means an empty active set.
#[derive(Debug)]
pub struct FileActiveReferences {
    path: PathBuf,
}

impl FileActiveReferences {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ActiveReferences for FileActiveReferences {
    async fn active_references(&self) -> HashSet<ArtifactReference> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return HashSet::new(),
            Err(e) => {
                warn!("could not read active references from {:?}: {}", self.path, e);
                return HashSet::new();
            }
        };

        content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .filter_map(|line| match ArtifactReference::new(line) {
                Ok(reference) => Some(reference),
                Err(e) => {
                    warn!("skipping invalid active reference: {}", e);
                    None
                }
            })
            .collect()
    }
}

/// Mutable in-memory active set, for embedding and tests
#[derive(Debug, Default)]
pub struct InMemoryActiveReferences {
    references: std::sync::RwLock<HashSet<ArtifactReference>>,
}

impl InMemoryActiveReferences {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the active set
    pub fn set(&self, references: impl IntoIterator<Item = ArtifactReference>) {
        let mut guard = self
            .references
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = references.into_iter().collect();
    }
}

#[async_trait]
impl ActiveReferences for InMemoryActiveReferences {
    async fn active_references(&self) -> HashSet<ArtifactReference> {
        self.references
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

/// Outcome counters of one maintenance pass
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MaintenancePass {
    pub examined: usize,
    pub deleted: usize,
    pub kept_active: usize,
    pub kept_recent: usize,
    pub deferred_in_flight: usize,
}

/// Background task reclaiming stale cache entries
pub struct CachedFilesMaintainer {
    store: Arc<ContentStore>,
    registry: Arc<DownloadRegistry>,
    oracle: Arc<dyn ActiveReferences>,
    config: MaintenanceConfig,
}

impl CachedFilesMaintainer {
    pub fn new(
        store: Arc<ContentStore>,
        registry: Arc<DownloadRegistry>,
        oracle: Arc<dyn ActiveReferences>,
        config: MaintenanceConfig,
    ) -> Self {
        Self {
            store,
            registry,
            oracle,
            config,
        }
    }

    /// One maintenance pass over the whole store
    pub async fn run_once(&self) -> MaintenancePass {
        let active = self.oracle.active_references().await;
        let grace = self.config.retention_grace();
        let mut pass = MaintenancePass::default();

        for entry in self.store.entries() {
            pass.examined += 1;

            if active.contains(&entry.reference) {
                pass.kept_active += 1;
                continue;
            }

            // A clock skewed into the future reads as "just accessed"
            let idle = entry.last_access.elapsed().unwrap_or_default();
            if idle < grace {
                pass.kept_recent += 1;
                continue;
            }

            // Deletion decision point: never delete under an in-flight
            // download; the next pass will see it again
            if self.registry.contains(&entry.reference) {
                debug!(
                    "deferring deletion of '{}': download in flight",
                    entry.reference
                );
                pass.deferred_in_flight += 1;
                continue;
            }

            match self.store.remove(&entry.reference).await {
                Ok(true) => {
                    info!(
                        "deleted stale artifact '{}' ({} bytes, idle {:?})",
                        entry.reference, entry.size, idle
                    );
                    pass.deleted += 1;
                }
                Ok(false) => {}
                Err(e) => {
                    warn!("failed to delete '{}': {}", entry.reference, e);
                }
            }
        }

        debug!(
            "maintenance pass: {} examined, {} deleted, {} active, {} recent, {} deferred",
            pass.examined, pass.deleted, pass.kept_active, pass.kept_recent, pass.deferred_in_flight
        );
        pass
    }

    /// Run passes on the configured interval until signalled to stop
    ///
    /// The first pass runs one full interval after startup, matching a
    /// fixed-rate schedule with an initial delay.
    pub fn spawn(self) -> (JoinHandle<()>, watch::Sender<bool>) {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let period = self.config.interval();

        let join = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut ticker = tokio::time::interval_at(start, period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.run_once().await;
                    }
                    _ = shutdown_rx.changed() => {
                        info!("cache maintainer stopping");
                        break;
                    }
                }
            }
        });

        (join, shutdown_tx)
    }
}
