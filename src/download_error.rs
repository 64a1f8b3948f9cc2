//! Terminal error taxonomy for the download coordinator
//!
//! Every waiter on a download observes exactly one of these outcomes. The
//! enum is `Clone` because a single terminal error fans out to all waiters
//! of the shared fetch; the storage variant keeps its `io::Error` behind an
//! `Arc` for that reason.

use crate::types::ArtifactReference;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Terminal outcome of a failed fetch, as seen by callers
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum DownloadError {
    /// Every candidate source reported it does not have the artifact
    NotFound { reference: ArtifactReference },

    /// The attempt limit was reached without any source delivering
    SourcesExhausted {
        reference: ArtifactReference,
        attempts: u32,
    },

    /// Writing the fetched artifact to local storage failed
    ///
    /// Never retried: a local disk fault will not be fixed by re-fetching.
    Storage {
        reference: ArtifactReference,
        source: Arc<std::io::Error>,
    },

    /// This caller's own wait timed out; the shared fetch continues
    Timeout {
        reference: ArtifactReference,
        waited: Duration,
    },

    /// The coordinator has begun shutdown; no new fetches are started
    ShuttingDown,
}

impl DownloadError {
    /// Storage failure wrapping an `io::Error`
    pub fn storage(reference: ArtifactReference, err: std::io::Error) -> Self {
        Self::Storage {
            reference,
            source: Arc::new(err),
        }
    }

    /// The reference this error concerns, if it concerns one
    #[must_use]
    pub fn reference(&self) -> Option<&ArtifactReference> {
        match self {
            Self::NotFound { reference }
            | Self::SourcesExhausted { reference, .. }
            | Self::Storage { reference, .. }
            | Self::Timeout { reference, .. } => Some(reference),
            Self::ShuttingDown => None,
        }
    }

    /// Check if this is the caller-local timeout outcome
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

impl fmt::Display for DownloadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { reference } => {
                write!(f, "artifact '{}' not found on any source", reference)
            }
            Self::SourcesExhausted {
                reference,
                attempts,
            } => {
                write!(
                    f,
                    "gave up fetching '{}' after {} attempts",
                    reference, attempts
                )
            }
            Self::Storage { reference, source } => {
                write!(f, "failed to store artifact '{}': {}", reference, source)
            }
            Self::Timeout { reference, waited } => {
                write!(
                    f,
                    "timed out waiting {:?} for artifact '{}'",
                    waited, reference
                )
            }
            Self::ShuttingDown => write!(f, "download coordinator is shutting down"),
        }
    }
}

impl std::error::Error for DownloadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Storage { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }
}
