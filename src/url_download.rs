//! URL download sibling path
//!
//! The same dedup-and-fetch shape as the download coordinator, keyed by URL
//! string instead of artifact reference and fetching through a generic
//! outbound transfer instead of peer RPC. Only the interface lives here;
//! the transfer itself is supplied by the embedder.

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Terminal failure of a URL download
#[derive(Debug, Clone)]
pub enum UrlDownloadError {
    /// The outbound transfer failed
    Transfer { url: String, reason: String },
    /// This caller's own wait timed out; the shared transfer continues
    Timeout { url: String },
}

impl fmt::Display for UrlDownloadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transfer { url, reason } => {
                write!(f, "transfer of '{}' failed: {}", url, reason)
            }
            Self::Timeout { url } => write!(f, "timed out waiting for '{}'", url),
        }
    }
}

impl std::error::Error for UrlDownloadError {}

/// Outcome fanned out to every waiter of one URL
pub type UrlOutcome = Result<Arc<Vec<u8>>, UrlDownloadError>;

/// Generic outbound transfer, supplied by the embedder
#[async_trait]
pub trait UrlFetcher: Send + Sync {
    async fn fetch_url(&self, url: &str) -> Result<Vec<u8>, String>;
}

struct UrlDownload {
    outcome_tx: watch::Sender<Option<UrlOutcome>>,
}

/// Deduplicating front-end over a [`UrlFetcher`]
///
/// For N concurrent callers of the same URL, exactly one transfer runs;
/// every caller that does not time out sees the shared outcome.
pub struct UrlDownloadServer {
    fetcher: Arc<dyn UrlFetcher>,
    inflight: Arc<DashMap<String, Arc<UrlDownload>>>,
}

impl UrlDownloadServer {
    pub fn new(fetcher: Arc<dyn UrlFetcher>) -> Self {
        Self {
            fetcher,
            inflight: Arc::new(DashMap::new()),
        }
    }

    /// Number of transfers currently in flight
    #[must_use]
    pub fn inflight_count(&self) -> usize {
        self.inflight.len()
    }

    /// Fetch a URL, waiting at most `timeout`, joining any transfer already
    /// in flight for the same URL
    pub async fn download(&self, url: &str, timeout: Duration) -> UrlOutcome {
        let (download, created) = match self.inflight.entry(url.to_string()) {
            Entry::Occupied(entry) => (Arc::clone(entry.get()), false),
            Entry::Vacant(entry) => {
                let (outcome_tx, _) = watch::channel(None);
                let download = Arc::new(UrlDownload { outcome_tx });
                entry.insert(Arc::clone(&download));
                (download, true)
            }
        };
        let mut outcome_rx = download.outcome_tx.subscribe();

        if created {
            debug!("starting transfer of '{}'", url);
            let fetcher = Arc::clone(&self.fetcher);
            let inflight = Arc::clone(&self.inflight);
            let url = url.to_string();
            tokio::spawn(async move {
                let outcome = match fetcher.fetch_url(&url).await {
                    Ok(bytes) => Ok(Arc::new(bytes)),
                    Err(reason) => {
                        warn!("transfer of '{}' failed: {}", url, reason);
                        Err(UrlDownloadError::Transfer {
                            url: url.clone(),
                            reason,
                        })
                    }
                };
                // Retire the entry before waiters observe the outcome
                inflight.remove(&url);
                download.outcome_tx.send_replace(Some(outcome));
            });
        }

        let wait = async {
            match outcome_rx.wait_for(|outcome| outcome.is_some()).await {
                Ok(guard) => guard.clone(),
                Err(_) => None,
            }
        };
        match tokio::time::timeout(timeout, wait).await {
            Ok(Some(outcome)) => outcome,
            Ok(None) | Err(_) => Err(UrlDownloadError::Timeout {
                url: url.to_string(),
            }),
        }
    }
}
