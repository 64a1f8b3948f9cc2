//! Active-download registry
//!
//! The registry is the single serialization point of the coordinator: at
//! most one [`Download`] exists per reference, enforced by an atomic
//! get-or-create keyed on the reference. The cache maintainer consults the
//! same structure before deleting anything, which closes the
//! delete-during-fetch race.

use crate::download_error::DownloadError;
use crate::types::ArtifactReference;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;
use tokio::sync::watch;

/// Terminal outcome of one download, fanned out to every waiter
pub type DownloadOutcome = Result<Arc<Vec<u8>>, DownloadError>;

/// One in-flight fetch for a single reference
///
/// Waiters subscribe to the outcome channel; the driver task publishes the
/// terminal outcome exactly once. A waiter that times out merely drops its
/// receiver; the fetch itself is never cancelled by a waiter.
#[derive(Debug)]
pub struct Download {
    reference: ArtifactReference,
    started: Instant,
    attempts: AtomicU32,
    outcome_tx: watch::Sender<Option<DownloadOutcome>>,
}

impl Download {
    fn new(reference: ArtifactReference) -> Self {
        let (outcome_tx, _) = watch::channel(None);
        Self {
            reference,
            started: Instant::now(),
            attempts: AtomicU32::new(0),
            outcome_tx,
        }
    }

    /// The reference this download is fetching
    #[must_use]
    pub fn reference(&self) -> &ArtifactReference {
        &self.reference
    }

    /// When the download was created
    #[must_use]
    pub fn started(&self) -> Instant {
        self.started
    }

    /// Network attempts made so far
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::Relaxed)
    }

    /// Count one network attempt
    pub fn record_attempt(&self) {
        self.attempts.fetch_add(1, Ordering::Relaxed);
    }

    /// Register as a waiter on this download's outcome
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Option<DownloadOutcome>> {
        self.outcome_tx.subscribe()
    }

    /// Publish the terminal outcome to all current and future waiters
    ///
    /// Called exactly once, by the driving task.
    pub fn publish(&self, outcome: DownloadOutcome) {
        self.outcome_tx.send_replace(Some(outcome));
    }
}

/// Registry of all in-flight downloads, keyed by reference
#[derive(Debug, Default)]
pub struct DownloadRegistry {
    downloads: DashMap<ArtifactReference, Arc<Download>>,
}

impl DownloadRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically look up or create the download for a reference
    ///
    /// Returns the download and whether this call created it. The caller
    /// that created it is responsible for driving the fetch.
    pub fn get_or_create(&self, reference: &ArtifactReference) -> (Arc<Download>, bool) {
        match self.downloads.entry(reference.clone()) {
            Entry::Occupied(entry) => (Arc::clone(entry.get()), false),
            Entry::Vacant(entry) => {
                let download = Arc::new(Download::new(reference.clone()));
                entry.insert(Arc::clone(&download));
                (download, true)
            }
        }
    }

    /// The in-flight download for a reference, if any
    #[must_use]
    pub fn get(&self, reference: &ArtifactReference) -> Option<Arc<Download>> {
        self.downloads.get(reference).map(|d| Arc::clone(&d))
    }

    /// Whether a download for the reference is in flight
    ///
    /// Consulted by the cache maintainer before any deletion decision.
    #[must_use]
    pub fn contains(&self, reference: &ArtifactReference) -> bool {
        self.downloads.contains_key(reference)
    }

    /// Remove a download from the registry once it reached a terminal state
    pub fn remove(&self, reference: &ArtifactReference) -> Option<Arc<Download>> {
        self.downloads.remove(reference).map(|(_, d)| d)
    }

    /// Number of in-flight downloads
    #[must_use]
    pub fn len(&self) -> usize {
        self.downloads.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.downloads.is_empty()
    }
}
