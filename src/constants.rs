//! Constants used throughout the distribution daemon
//!
//! This module centralizes magic numbers and default values so that policy
//! knobs live in one place and the config defaults stay in sync with them.

/// Wire frame limits
pub mod frame {
    /// Length prefix size in bytes (u32, big endian)
    pub const LEN_PREFIX: usize = 4;

    /// Maximum accepted frame size (256MB)
    ///
    /// Artifacts are transferred as single frames; anything above this is
    /// treated as a corrupt or hostile peer and the connection is dropped.
    pub const MAX_FRAME: usize = 256 * 1024 * 1024;
}

/// Connection pool defaults
pub mod pool {
    /// Default maximum concurrent connections per source node
    pub const DEFAULT_MAX_CONNECTIONS: u32 = 4;

    /// Maximum number of configured source nodes
    ///
    /// The per-download source availability bitset is a u8; config
    /// validation enforces this limit.
    pub const MAX_SOURCES: usize = 8;

    /// TCP connect timeout in milliseconds
    pub const CONNECT_TIMEOUT_MS: u64 = 5_000;
}

/// Retry and backoff defaults
pub mod retry {
    /// Default maximum fetch attempts before giving up
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

    /// Default initial backoff between attempts in milliseconds
    pub const DEFAULT_INITIAL_BACKOFF_MS: u64 = 100;

    /// Default backoff ceiling in milliseconds
    pub const DEFAULT_MAX_BACKOFF_MS: u64 = 10_000;

    /// Default per-attempt request timeout in milliseconds
    pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;
}

/// Cache maintenance defaults
pub mod maintenance {
    /// Default interval between maintenance passes in seconds
    pub const DEFAULT_INTERVAL_SECS: u64 = 60;

    /// Default retention grace period in seconds
    ///
    /// An artifact is never deleted before it has been idle this long, so a
    /// download that completed moments before the active set was refreshed
    /// survives the next pass.
    pub const DEFAULT_GRACE_SECS: u64 = 300;
}

/// Service lifecycle defaults
pub mod shutdown {
    /// Grace period for draining in-flight downloads on close, in seconds
    pub const DRAIN_GRACE_SECS: u64 = 10;
}
