//! Content-addressed artifact distribution daemon
//!
//! Distributes configuration bundles, images and model files from a small
//! set of source nodes to many cluster nodes on demand, caching results in
//! a local content-addressed store and reclaiming space for artifacts no
//! longer referenced by any active configuration generation.
//!
//! The core pieces:
//! - [`downloader::FileDownloader`]: deduplicates concurrent fetches per
//!   reference, rotates over sources with bounded backoff, commits bytes
//!   atomically
//! - [`pool::ConnectionPool`]: bounded per-source RPC connection slots
//! - [`server::DistributionServer`]: serves cached artifacts to peers
//! - [`maintenance::CachedFilesMaintainer`]: periodic reclamation guarded
//!   by the download registry and a retention grace period
//! - [`service::FileDistributionService`]: wiring plus ordered shutdown

pub mod config;
pub mod connection_error;
pub mod constants;
pub mod download_error;
pub mod downloader;
pub mod logging;
pub mod maintenance;
pub mod pool;
pub mod protocol;
pub mod server;
pub mod service;
pub mod store;
pub mod types;
pub mod url_download;

pub use config::{Config, MaintenanceConfig, RetryPolicy, SourceConfig, load_config};
pub use connection_error::ConnectionError;
pub use download_error::DownloadError;
pub use downloader::{DownloadRegistry, FileDownloader};
pub use maintenance::{ActiveReferences, CachedFilesMaintainer};
pub use pool::ConnectionPool;
pub use server::DistributionServer;
pub use service::FileDistributionService;
pub use store::ContentStore;
pub use types::{ArtifactReference, SourceId};
