//! Download coordinator
//!
//! The coordinator is the heart of the distribution daemon. It answers
//! `fetch(reference, timeout)` for any number of concurrent local callers
//! while guaranteeing at most one network fetch per reference: the first
//! caller to miss the cache creates the download and drives it; everyone
//! else joins as a waiter on the shared outcome.
//!
//! The driving task rotates through candidate sources with bounded
//! exponential backoff, commits the fetched bytes to the content store
//! atomically, and publishes one terminal outcome. A caller whose own
//! timeout fires drops out alone; the shared fetch keeps running so the
//! cache still gets populated for later callers.

mod availability;
mod registry;

pub use availability::SourceAvailability;
pub use registry::{Download, DownloadOutcome, DownloadRegistry};

use crate::config::RetryPolicy;
use crate::download_error::DownloadError;
use crate::pool::ConnectionPool;
use crate::protocol::{Request, Response, ServeFileResult};
use crate::store::ContentStore;
use crate::types::{ArtifactReference, SourceId};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Coordinates artifact fetches across local callers, the connection pool
/// and the content store
///
/// Cheap to clone; clones share all state.
#[derive(Debug, Clone)]
pub struct FileDownloader {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    store: Arc<ContentStore>,
    pool: Arc<ConnectionPool>,
    registry: Arc<DownloadRegistry>,
    retry: RetryPolicy,
    verify_content: bool,
    shutting_down: AtomicBool,
}

impl FileDownloader {
    pub fn new(
        store: Arc<ContentStore>,
        pool: Arc<ConnectionPool>,
        retry: RetryPolicy,
        verify_content: bool,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                pool,
                registry: Arc::new(DownloadRegistry::new()),
                retry,
                verify_content,
                shutting_down: AtomicBool::new(false),
            }),
        }
    }

    /// The shared download registry, also consulted by the maintainer and
    /// the RPC server
    #[must_use]
    pub fn registry(&self) -> &Arc<DownloadRegistry> {
        &self.inner.registry
    }

    /// The content store this coordinator populates
    #[must_use]
    pub fn store(&self) -> &Arc<ContentStore> {
        &self.inner.store
    }

    /// Check whether an artifact is already cached locally
    #[must_use]
    pub fn is_cached(&self, reference: &ArtifactReference) -> bool {
        self.inner.store.contains(reference)
    }

    /// Refuse new fetches from now on; in-flight downloads keep running
    pub fn begin_shutdown(&self) {
        self.inner.shutting_down.store(true, Ordering::SeqCst);
    }

    /// Whether shutdown has begun
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::SeqCst)
    }

    /// Fetch an artifact, waiting at most `timeout` for the result
    ///
    /// Cache hits return immediately with a last-access refresh and no
    /// registry entry. On a miss the caller either starts the shared fetch
    /// or joins the one already in flight; all waiters of one download see
    /// the same terminal outcome. A timeout here abandons only this
    /// caller's wait.
    pub async fn fetch(
        &self,
        reference: &ArtifactReference,
        timeout: Duration,
    ) -> DownloadOutcome {
        if self.is_shutting_down() {
            return Err(DownloadError::ShuttingDown);
        }

        match self.inner.store.read(reference).await {
            Ok(Some(bytes)) => return Ok(Arc::new(bytes)),
            Ok(None) => {}
            Err(e) => return Err(DownloadError::storage(reference.clone(), e)),
        }

        let (download, created) = self.inner.registry.get_or_create(reference);
        let mut outcome_rx = download.subscribe();

        if created {
            debug!("starting download of '{}'", reference);
            let inner = Arc::clone(&self.inner);
            let download = Arc::clone(&download);
            tokio::spawn(async move { inner.drive(download).await });
        } else {
            debug!("joining in-flight download of '{}'", reference);
        }

        let started = Instant::now();
        let wait = async {
            match outcome_rx.wait_for(|outcome| outcome.is_some()).await {
                Ok(guard) => guard.clone(),
                // Driver vanished without publishing; only happens when the
                // runtime is torn down around us
                Err(_) => None,
            }
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(Some(outcome)) => outcome,
            Ok(None) => Err(DownloadError::ShuttingDown),
            Err(_) => Err(DownloadError::Timeout {
                reference: reference.clone(),
                waited: started.elapsed(),
            }),
        }
    }
}

impl Inner {
    fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Drive one download to its terminal outcome and retire it
    ///
    /// The registry entry is removed before the outcome is published, so by
    /// the time any waiter observes the result the reference is no longer
    /// marked in-flight. A successful outcome is already committed to the
    /// store at that point, so late callers take the cache-hit path.
    async fn drive(&self, download: Arc<Download>) {
        let outcome = self.run_attempts(&download).await;
        match &outcome {
            Ok(bytes) => info!(
                "downloaded '{}' ({} bytes, {} attempts)",
                download.reference(),
                bytes.len(),
                download.attempts().max(1)
            ),
            Err(e) => warn!("download of '{}' failed: {}", download.reference(), e),
        }
        self.registry.remove(download.reference());
        download.publish(outcome);
    }

    /// Source rotation for one attempt: configured order, rotated by the
    /// attempt number, skipping sources that answered not-found
    fn rotation(
        &self,
        attempts: u32,
        availability: &SourceAvailability,
        source_count: usize,
    ) -> Vec<SourceId> {
        let mut candidates: Vec<SourceId> = availability.candidates(source_count).collect();
        if !candidates.is_empty() {
            let shift = attempts as usize % candidates.len();
            candidates.rotate_left(shift);
        }
        candidates
    }

    async fn run_attempts(&self, download: &Download) -> DownloadOutcome {
        let reference = download.reference();

        // A fetch racing against a completed download may create a fresh
        // registry entry just after the artifact landed in the store
        match self.store.read(reference).await {
            Ok(Some(bytes)) => return Ok(Arc::new(bytes)),
            Ok(None) => {}
            Err(e) => return Err(DownloadError::storage(reference.clone(), e)),
        }

        let source_count = self.pool.source_count();
        let mut availability = SourceAvailability::new();
        let mut attempts: u32 = 0;

        loop {
            if self.is_shutting_down() {
                return Err(DownloadError::ShuttingDown);
            }
            if availability.all_exhausted(source_count) {
                return Err(DownloadError::NotFound {
                    reference: reference.clone(),
                });
            }
            if attempts >= self.retry.max_attempts {
                return Err(DownloadError::SourcesExhausted {
                    reference: reference.clone(),
                    attempts,
                });
            }

            let candidates = self.rotation(attempts, &availability, source_count);
            let mut conn = match self
                .pool
                .acquire(&candidates, self.retry.request_timeout())
                .await
            {
                Ok(conn) => conn,
                Err(e) => {
                    attempts += 1;
                    download.record_attempt();
                    warn!(
                        "attempt {}/{} for '{}': no connection: {}",
                        attempts, self.retry.max_attempts, reference, e
                    );
                    tokio::time::sleep(self.retry.backoff_for(attempts)).await;
                    continue;
                }
            };

            let source_id = conn.source_id();
            let source_name = conn.source_name().to_string();
            let request = Request::ServeFile {
                reference: reference.clone(),
            };

            match conn.request(&request, self.retry.request_timeout()).await {
                Ok(Response::ServeFile {
                    result: ServeFileResult::Found { payload },
                }) => {
                    self.pool.release(conn, true);

                    if self.verify_content && !reference.matches_content(&payload) {
                        warn!(
                            "source '{}' served a payload that does not hash to '{}'",
                            source_name, reference
                        );
                        availability.record_missing(source_id);
                        continue;
                    }

                    return match self.store.commit(reference, &payload).await {
                        Ok(()) => Ok(Arc::new(payload)),
                        Err(e) => Err(DownloadError::storage(reference.clone(), e)),
                    };
                }
                Ok(Response::ServeFile {
                    result: ServeFileResult::NotFound { reason },
                }) => {
                    self.pool.release(conn, true);
                    debug!(
                        "source '{}' does not have '{}': {}",
                        source_name, reference, reason
                    );
                    // Source-specific miss: rotate on without backoff
                    availability.record_missing(source_id);
                }
                Ok(other) => {
                    self.pool.release(conn, false);
                    attempts += 1;
                    download.record_attempt();
                    warn!(
                        "source '{}' answered '{}' to serve_file for '{}'",
                        source_name,
                        other.kind(),
                        reference
                    );
                    tokio::time::sleep(self.retry.backoff_for(attempts)).await;
                }
                Err(e) => {
                    self.pool.release(conn, false);
                    attempts += 1;
                    download.record_attempt();
                    warn!(
                        "attempt {}/{} for '{}' against '{}' failed: {}",
                        attempts, self.retry.max_attempts, reference, source_name, e
                    );
                    tokio::time::sleep(self.retry.backoff_for(attempts)).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SourceConfig;
    use crate::protocol::{read_frame, write_frame};
    use std::sync::atomic::AtomicUsize;
    use tempfile::tempdir;
    use tokio::net::TcpListener;

    fn test_ref(s: &str) -> ArtifactReference {
        ArtifactReference::new(s).unwrap()
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
            request_timeout_ms: 2_000,
        }
    }

    /// Source that serves one artifact and counts serve_file requests
    async fn spawn_source(
        payload: Option<Vec<u8>>,
        serve_count: Arc<AtomicUsize>,
    ) -> SourceConfig {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let payload = payload.clone();
                let serve_count = Arc::clone(&serve_count);
                tokio::spawn(async move {
                    while let Ok(Some(request)) = read_frame::<_, Request>(&mut stream).await {
                        let response = match request {
                            Request::ServeFile { .. } => {
                                serve_count.fetch_add(1, Ordering::SeqCst);
                                let result = match &payload {
                                    Some(bytes) => ServeFileResult::Found {
                                        payload: bytes.clone(),
                                    },
                                    None => ServeFileResult::NotFound {
                                        reason: "no such artifact".to_string(),
                                    },
                                };
                                Response::ServeFile { result }
                            }
                            Request::Ping => Response::Pong,
                            _ => Response::Error {
                                reason: "unsupported".to_string(),
                            },
                        };
                        if write_frame(&mut stream, &response).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        SourceConfig {
            host: "127.0.0.1".to_string(),
            port,
            name: format!("mock-{}", port),
            max_connections: 4,
        }
    }

    fn downloader(
        store_dir: &std::path::Path,
        sources: Vec<SourceConfig>,
        retry: RetryPolicy,
    ) -> FileDownloader {
        let store = Arc::new(ContentStore::open(store_dir).unwrap());
        let pool = Arc::new(ConnectionPool::new(sources).unwrap());
        FileDownloader::new(store, pool, retry, false)
    }

    #[tokio::test]
    async fn test_fetch_downloads_and_caches() {
        let dir = tempdir().unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let source = spawn_source(Some(b"payload".to_vec()), Arc::clone(&count)).await;
        let dl = downloader(dir.path(), vec![source], fast_retry());

        let r = test_ref("artifact1");
        let bytes = dl.fetch(&r, Duration::from_secs(2)).await.unwrap();
        assert_eq!(*bytes, b"payload".to_vec());
        assert!(dl.is_cached(&r));
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // Registry entry is retired after completion
        assert!(dl.registry().is_empty());
    }

    #[tokio::test]
    async fn test_cache_hit_issues_no_rpc() {
        let dir = tempdir().unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let source = spawn_source(Some(b"payload".to_vec()), Arc::clone(&count)).await;
        let dl = downloader(dir.path(), vec![source], fast_retry());

        let r = test_ref("artifact1");
        dl.fetch(&r, Duration::from_secs(2)).await.unwrap();
        for _ in 0..5 {
            dl.fetch(&r, Duration::from_secs(2)).await.unwrap();
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_not_found_everywhere_is_terminal() {
        let dir = tempdir().unwrap();
        let c0 = Arc::new(AtomicUsize::new(0));
        let c1 = Arc::new(AtomicUsize::new(0));
        let s0 = spawn_source(None, Arc::clone(&c0)).await;
        let s1 = spawn_source(None, Arc::clone(&c1)).await;
        let dl = downloader(dir.path(), vec![s0, s1], fast_retry());

        let result = dl.fetch(&test_ref("missing"), Duration::from_secs(2)).await;
        assert!(matches!(result, Err(DownloadError::NotFound { .. })));
        // Each source asked exactly once
        assert_eq!(c0.load(Ordering::SeqCst), 1);
        assert_eq!(c1.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fetch_after_shutdown_fails_fast() {
        let dir = tempdir().unwrap();
        let source = spawn_source(Some(b"x".to_vec()), Arc::new(AtomicUsize::new(0))).await;
        let dl = downloader(dir.path(), vec![source], fast_retry());

        dl.begin_shutdown();
        let result = dl.fetch(&test_ref("r"), Duration::from_secs(1)).await;
        assert!(matches!(result, Err(DownloadError::ShuttingDown)));
    }

    #[tokio::test]
    async fn test_verification_rejects_corrupt_payload() {
        let dir = tempdir().unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let source = spawn_source(Some(b"not the right bytes".to_vec()), Arc::clone(&count)).await;

        let store = Arc::new(ContentStore::open(dir.path()).unwrap());
        let pool = Arc::new(ConnectionPool::new(vec![source]).unwrap());
        let dl = FileDownloader::new(store, pool, fast_retry(), true);

        // Reference derived from different content: the served payload can
        // never hash to it
        let r = ArtifactReference::from_content(b"expected content");
        let result = dl.fetch(&r, Duration::from_secs(2)).await;
        assert!(matches!(result, Err(DownloadError::NotFound { .. })));
        assert!(!dl.is_cached(&r));
    }

    #[tokio::test]
    async fn test_verification_accepts_matching_payload() {
        let dir = tempdir().unwrap();
        let payload = b"verified content".to_vec();
        let r = ArtifactReference::from_content(&payload);
        let source = spawn_source(Some(payload.clone()), Arc::new(AtomicUsize::new(0))).await;

        let store = Arc::new(ContentStore::open(dir.path()).unwrap());
        let pool = Arc::new(ConnectionPool::new(vec![source]).unwrap());
        let dl = FileDownloader::new(store, pool, fast_retry(), true);

        let bytes = dl.fetch(&r, Duration::from_secs(2)).await.unwrap();
        assert_eq!(*bytes, payload);
    }

    #[test]
    fn test_rotation_starts_at_attempt_offset() {
        let dir = tempdir().unwrap();
        let sources = vec![
            SourceConfig {
                host: "a".into(),
                port: 1,
                name: "a".into(),
                max_connections: 1,
            },
            SourceConfig {
                host: "b".into(),
                port: 1,
                name: "b".into(),
                max_connections: 1,
            },
            SourceConfig {
                host: "c".into(),
                port: 1,
                name: "c".into(),
                max_connections: 1,
            },
        ];
        let dl = downloader(dir.path(), sources, RetryPolicy::default());

        let avail = SourceAvailability::new();
        assert_eq!(
            dl.inner.rotation(0, &avail, 3),
            vec![
                SourceId::from_index(0),
                SourceId::from_index(1),
                SourceId::from_index(2)
            ]
        );
        assert_eq!(
            dl.inner.rotation(1, &avail, 3),
            vec![
                SourceId::from_index(1),
                SourceId::from_index(2),
                SourceId::from_index(0)
            ]
        );

        let mut avail = SourceAvailability::new();
        avail.record_missing(SourceId::from_index(1));
        assert_eq!(
            dl.inner.rotation(0, &avail, 3),
            vec![SourceId::from_index(0), SourceId::from_index(2)]
        );
    }
}
